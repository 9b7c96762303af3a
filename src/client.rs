//! High-level Modbus master
//!
//! [`ModbusMaster`] wraps a [`ModbusTransaction`] and turns the standard
//! functions into typed calls. Every call is one transaction: the executor
//! applies the retry and reconnect policy, the transport the framing.
//!
//! A slave that rejects a request is not an error here. The reply comes back
//! as [`SlaveReply::Exception`] carrying the exception code, while transport
//! failures (timeouts, broken links, exhausted retries) are returned as `Err`.

use std::time::Duration;

use crate::config::{SerialConfig, TcpConfig, TransactionConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusAddress, ModbusFunction, ModbusRequest, ModbusResponse, ModbusValue, SlaveId};
use crate::transaction::ModbusTransaction;
use crate::transport::{
    AsciiTransport, ModbusTransport, RtuTransport, SerialConnector, TcpConnector, TcpTransport,
    TransportStats, UdpConnector, UdpTransport,
};
use crate::utils::PerformanceMetrics;

/// Outcome of a call the slave answered
#[derive(Debug, Clone, PartialEq)]
pub enum SlaveReply<V> {
    /// Regular response
    Data(V),
    /// The slave rejected the request with this exception code
    Exception(u8),
}

impl<V> SlaveReply<V> {
    /// `0` for a regular response, otherwise the slave's exception code
    pub fn code(&self) -> u8 {
        match self {
            SlaveReply::Data(_) => 0,
            SlaveReply::Exception(code) => *code,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, SlaveReply::Exception(_))
    }

    pub fn data(self) -> Option<V> {
        match self {
            SlaveReply::Data(value) => Some(value),
            SlaveReply::Exception(_) => None,
        }
    }

    /// Turn an exception reply into [`ModbusError::Exception`] for `function`
    pub fn into_result(self, function: ModbusFunction) -> ModbusResult<V> {
        match self {
            SlaveReply::Data(value) => Ok(value),
            SlaveReply::Exception(code) => Err(ModbusError::exception(function.to_u8(), code)),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> SlaveReply<U> {
        match self {
            SlaveReply::Data(value) => SlaveReply::Data(f(value)),
            SlaveReply::Exception(code) => SlaveReply::Exception(code),
        }
    }
}

/// Modbus master working over any transport
///
/// # Example
///
/// ```rust,no_run
/// use modbus_master::{ModbusMaster, TcpConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut master = ModbusMaster::tcp(TcpConfig::new("192.168.1.10"))?;
///     master.connect().await?;
///
///     let reply = master.read_multiple_registers(1, 0, 4).await?;
///     match reply.code() {
///         0 => println!("Registers: {:?}", reply.data()),
///         code => println!("Slave exception 0x{:02X}", code),
///     }
///
///     master.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct ModbusMaster<T: ModbusTransport> {
    transaction: ModbusTransaction<T>,
    logger: CallbackLogger,
}

impl ModbusMaster<TcpTransport> {
    /// Modbus TCP master; the connection is opened on [`connect`](Self::connect)
    /// or lazily by the first request
    pub fn tcp(config: TcpConfig) -> ModbusResult<Self> {
        config.validate()?;
        let read_timeout = config.read_timeout();
        Ok(Self::new(TcpTransport::new(TcpConnector::new(config), read_timeout)))
    }
}

impl ModbusMaster<UdpTransport> {
    /// Modbus UDP master
    pub fn udp(config: TcpConfig) -> ModbusResult<Self> {
        config.validate()?;
        let read_timeout = config.read_timeout();
        Ok(Self::new(UdpTransport::new(UdpConnector::new(config), read_timeout)))
    }
}

impl ModbusMaster<RtuTransport> {
    /// Modbus RTU master on a serial port
    pub fn rtu(config: SerialConfig) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self::new(RtuTransport::new(SerialConnector::new(config.clone()), config)))
    }
}

impl ModbusMaster<AsciiTransport> {
    /// Modbus ASCII master on a serial port
    pub fn ascii(config: SerialConfig) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self::new(AsciiTransport::new(SerialConnector::new(config.clone()), config)))
    }
}

impl<T: ModbusTransport> ModbusMaster<T> {
    /// Master with the default transaction policy
    pub fn new(transport: T) -> Self {
        Self {
            transaction: ModbusTransaction::new(transport),
            logger: CallbackLogger::disabled(),
        }
    }

    /// Master with a custom transaction policy
    pub fn with_config(transport: T, config: TransactionConfig) -> ModbusResult<Self> {
        Ok(Self {
            transaction: ModbusTransaction::with_config(transport, config)?,
            logger: CallbackLogger::disabled(),
        })
    }

    /// Report requests and responses to `logger`
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub async fn connect(&mut self) -> ModbusResult<()> {
        self.transaction.connect().await
    }

    pub async fn disconnect(&mut self) -> ModbusResult<()> {
        self.transaction.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.transaction.is_connected()
    }

    /// Close and reopen the link between failed attempts
    pub fn set_reconnecting(&mut self, reconnecting: bool) {
        self.transaction.set_reconnecting(reconnecting);
    }

    pub fn is_reconnecting(&self) -> bool {
        self.transaction.is_reconnecting()
    }

    /// Remove the local echo of half-duplex serial lines
    pub fn set_echo(&mut self, echo: bool) {
        self.transaction.set_echo(echo);
    }

    pub fn set_retries(&mut self, retries: u32) -> ModbusResult<()> {
        self.transaction.set_retries(retries)
    }

    pub fn set_response_timeout(&mut self, response_timeout: Duration) {
        self.transaction.set_response_timeout(response_timeout);
    }

    /// Enable or disable packet logging on the transport
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.transaction.transport_mut().set_packet_logging(enabled);
    }

    pub fn transaction(&self) -> &ModbusTransaction<T> {
        &self.transaction
    }

    pub fn transaction_mut(&mut self) -> &mut ModbusTransaction<T> {
        &mut self.transaction
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        self.transaction.metrics()
    }

    /// Get transport statistics
    pub fn get_stats(&self) -> TransportStats {
        self.transaction.transport().get_stats()
    }

    /// Execute a raw request
    ///
    /// Exception replies come back as `Ok` with
    /// [`ModbusResponse::exception_code`] set.
    pub async fn execute(&mut self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        self.logger.log_request(&request);
        match self.transaction.execute(request.clone()).await {
            Ok(response) => {
                self.logger.log_response(&response);
                Ok(response)
            }
            Err(error) => {
                self.logger.log_failure(&request, &error);
                Err(error)
            }
        }
    }

    async fn call<V>(
        &mut self,
        request: ModbusRequest,
        decode: impl FnOnce(&ModbusResponse) -> ModbusResult<V>,
    ) -> ModbusResult<SlaveReply<V>> {
        request.validate()?;
        self.transaction.transport().check_unit_id(request.slave_id)?;
        let response = self.execute(request).await?;
        match response.exception_code() {
            Some(code) => Ok(SlaveReply::Exception(code)),
            None => decode(&response).map(SlaveReply::Data),
        }
    }

    async fn read_bits(
        &mut self,
        function: ModbusFunction,
        unit: SlaveId,
        address: ModbusAddress,
        quantity: u16,
    ) -> ModbusResult<SlaveReply<Vec<bool>>> {
        let request = ModbusRequest::new_read(unit, function, address, quantity);
        self.call(request, |response| {
            let mut bits = response.parse_bits()?;
            if bits.len() < quantity as usize {
                return Err(ModbusError::frame(format!(
                    "Expected {} bits, slave returned {}",
                    quantity,
                    bits.len()
                )));
            }
            bits.truncate(quantity as usize);
            Ok(bits)
        })
        .await
    }

    async fn read_registers(
        &mut self,
        function: ModbusFunction,
        unit: SlaveId,
        address: ModbusAddress,
        quantity: u16,
    ) -> ModbusResult<SlaveReply<Vec<u16>>> {
        let request = ModbusRequest::new_read(unit, function, address, quantity);
        self.call(request, |response| {
            let registers = response.parse_registers()?;
            if registers.len() != quantity as usize {
                return Err(ModbusError::frame(format!(
                    "Expected {} registers, slave returned {}",
                    quantity,
                    registers.len()
                )));
            }
            Ok(registers)
        })
        .await
    }

    /// Read coils (function code 0x01)
    pub async fn read_coils(
        &mut self,
        unit: SlaveId,
        address: ModbusAddress,
        quantity: u16,
    ) -> ModbusResult<SlaveReply<Vec<bool>>> {
        self.read_bits(ModbusFunction::ReadCoils, unit, address, quantity).await
    }

    /// Read discrete inputs (function code 0x02)
    pub async fn read_input_discretes(
        &mut self,
        unit: SlaveId,
        address: ModbusAddress,
        quantity: u16,
    ) -> ModbusResult<SlaveReply<Vec<bool>>> {
        self.read_bits(ModbusFunction::ReadDiscreteInputs, unit, address, quantity).await
    }

    /// Read input registers (function code 0x04)
    pub async fn read_input_registers(
        &mut self,
        unit: SlaveId,
        address: ModbusAddress,
        quantity: u16,
    ) -> ModbusResult<SlaveReply<Vec<u16>>> {
        self.read_registers(ModbusFunction::ReadInputRegisters, unit, address, quantity).await
    }

    /// Read holding registers (function code 0x03)
    pub async fn read_multiple_registers(
        &mut self,
        unit: SlaveId,
        address: ModbusAddress,
        quantity: u16,
    ) -> ModbusResult<SlaveReply<Vec<u16>>> {
        self.read_registers(ModbusFunction::ReadHoldingRegisters, unit, address, quantity).await
    }

    /// Write single coil (function code 0x05)
    ///
    /// Returns the coil state echoed by the slave.
    pub async fn write_coil(
        &mut self,
        unit: SlaveId,
        address: ModbusAddress,
        value: bool,
    ) -> ModbusResult<SlaveReply<bool>> {
        let request = ModbusRequest::write_single_coil(unit, address, value);
        self.call(request, |response| match response.data.get(2..4) {
            Some([hi, lo]) => Ok(u16::from_be_bytes([*hi, *lo]) == 0xFF00),
            _ => Err(ModbusError::frame("Write coil response too short")),
        })
        .await
    }

    /// Write multiple coils (function code 0x0F)
    pub async fn write_multiple_coils(
        &mut self,
        unit: SlaveId,
        address: ModbusAddress,
        values: &[bool],
    ) -> ModbusResult<SlaveReply<()>> {
        if values.is_empty() || values.len() > crate::MAX_COILS_PER_WRITE as usize {
            return Err(ModbusError::invalid_data(format!(
                "Cannot write {} coils in one request",
                values.len()
            )));
        }
        let request = ModbusRequest::write_multiple_coils(unit, address, values);
        self.call(request, |_| Ok(())).await
    }

    /// Write single register (function code 0x06)
    pub async fn write_single_register(
        &mut self,
        unit: SlaveId,
        address: ModbusAddress,
        value: ModbusValue,
    ) -> ModbusResult<SlaveReply<()>> {
        let request = ModbusRequest::write_single_register(unit, address, value);
        self.call(request, |_| Ok(())).await
    }

    /// Write multiple registers (function code 0x10)
    pub async fn write_multiple_registers(
        &mut self,
        unit: SlaveId,
        address: ModbusAddress,
        values: &[ModbusValue],
    ) -> ModbusResult<SlaveReply<()>> {
        if values.is_empty() || values.len() > crate::MAX_REGISTERS_PER_WRITE as usize {
            return Err(ModbusError::invalid_data(format!(
                "Cannot write {} registers in one request",
                values.len()
            )));
        }
        let request = ModbusRequest::write_multiple_registers(unit, address, values);
        self.call(request, |_| Ok(())).await
    }
}
