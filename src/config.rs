//! # Configuration
//!
//! Serde-loadable settings for transports and the transaction executor.
//! Every struct implements `Default` with the usual Modbus values, so a JSON
//! document only needs the fields it wants to change:
//!
//! ```rust
//! use modbus_master::config::SerialConfig;
//!
//! let config = SerialConfig::from_json_str(r#"{ "port": "/dev/ttyUSB0", "echo": true }"#).unwrap();
//! assert_eq!(config.baud_rate, 9600);
//! assert!(config.echo);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// Standard Modbus TCP port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Retry and timing policy of one [`ModbusTransaction`](crate::ModbusTransaction)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Total number of attempts per transaction, at least 1
    pub retries: u32,
    /// Close and reopen the link before each retry
    pub reconnecting: bool,
    /// Upper bound on waiting for a matching response after a write
    pub response_timeout_ms: u64,
    /// Pause between a failed attempt and the next one
    pub retry_delay_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            reconnecting: false,
            response_timeout_ms: 3000,
            retry_delay_ms: 0,
        }
    }
}

impl TransactionConfig {
    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.retries == 0 {
            return Err(ModbusError::configuration("retries must be at least 1"));
        }
        if self.response_timeout_ms == 0 {
            return Err(ModbusError::configuration("response timeout must be non-zero"));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Serial line settings shared by RTU and ASCII
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Per-byte read timeout
    pub read_timeout_ms: u64,
    /// Half-duplex line where the master hears its own transmission
    pub echo: bool,
    /// Time allowed for the local echo to come back
    pub echo_timeout_ms: u64,
    /// Most stale bytes dropped before a write
    pub flush_max_bytes: usize,
    /// How long to keep dropping stale bytes before a write
    pub flush_window_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            read_timeout_ms: 500,
            echo: false,
            echo_timeout_ms: 1000,
            flush_max_bytes: 4096,
            flush_window_ms: 0,
        }
    }
}

impl SerialConfig {
    /// Default settings for `port`
    pub fn new<S: Into<String>>(port: S) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.port.is_empty() {
            return Err(ModbusError::configuration("serial port name is empty"));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::configuration("baud rate must be non-zero"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ModbusError::configuration(format!(
                "data bits must be 5..=8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ModbusError::configuration(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.read_timeout_ms == 0 {
            return Err(ModbusError::configuration("read timeout must be non-zero"));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    pub fn flush_window(&self) -> Duration {
        Duration::from_millis(self.flush_window_ms)
    }

    pub(crate) fn tokio_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    pub(crate) fn tokio_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// Modbus TCP / UDP endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// `host:port`; a bare host gets port 502
    pub address: String,
    pub connect_timeout_ms: u64,
    /// Per-read timeout on the socket
    pub read_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", DEFAULT_TCP_PORT),
            connect_timeout_ms: 3000,
            read_timeout_ms: 3000,
        }
    }
}

impl TcpConfig {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.address.is_empty() {
            return Err(ModbusError::configuration("address is empty"));
        }
        if self.read_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ModbusError::configuration("timeouts must be non-zero"));
        }
        Ok(())
    }

    /// Address with the default Modbus port filled in
    pub fn socket_address(&self) -> String {
        let has_port = self
            .address
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);

        if has_port {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, DEFAULT_TCP_PORT)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_defaults() {
        let config = TransactionConfig::default();
        assert_eq!(config.retries, 3);
        assert!(!config.reconnecting);
        assert!(config.validate().is_ok());
        assert_eq!(config.response_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_transaction_rejects_zero_retries() {
        let err = TransactionConfig::from_json_str(r#"{ "retries": 0 }"#).unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }

    #[test]
    fn test_serial_from_json() {
        let config = SerialConfig::from_json_str(
            r#"{ "port": "/dev/ttyS1", "baud_rate": 19200, "parity": "even", "stop_bits": 2 }"#,
        )
        .unwrap();
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.read_timeout(), Duration::from_millis(500));
        assert_eq!(config.echo_timeout(), Duration::from_millis(1000));
        assert_eq!(config.tokio_stop_bits(), tokio_serial::StopBits::Two);
    }

    #[test]
    fn test_serial_validation() {
        assert!(SerialConfig::default().validate().is_err());

        let mut config = SerialConfig::new("/dev/ttyUSB0");
        assert!(config.validate().is_ok());

        config.data_bits = 9;
        assert!(config.validate().is_err());

        config.data_bits = 7;
        config.baud_rate = 0;
        assert!(config.validate().is_err());

        assert!(SerialConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_tcp_socket_address() {
        assert_eq!(TcpConfig::new("10.0.0.5").socket_address(), "10.0.0.5:502");
        assert_eq!(TcpConfig::new("10.0.0.5:1502").socket_address(), "10.0.0.5:1502");
        assert_eq!(TcpConfig::default().socket_address(), "127.0.0.1:502");
    }
}
