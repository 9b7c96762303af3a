//! # Modbus Transport Layer
//!
//! Frame codecs for the master side of every supported flavor, behind one
//! [`ModbusTransport`] interface.
//!
//! ## Supported Transports
//!
//! ### Modbus TCP (`TcpTransport`)
//! - MBAP header framing over a byte stream
//! - Transaction ID echo used for request/response correlation
//!
//! ### Modbus UDP (`UdpTransport`)
//! - Same MBAP framing, one frame per datagram
//!
//! ### Modbus RTU (`RtuTransport`)
//! - Binary frames checked with CRC-16, no delimiters
//! - Frame length inferred from the function code of the reply
//! - Stale input flushed before each request, optional half-duplex echo removal
//!
//! ### Modbus ASCII (`AsciiTransport`)
//! - `:` + hex characters + `CR LF` frames checked with LRC
//! - Corrupted frames are skipped and the reader resynchronises on the next `:`
//!
//! ## Links and connectors
//!
//! A transport does not open sockets or ports itself. It asks its
//! [`Connector`] for a link whenever it needs to (re)connect, which lets the
//! transaction executor tear down and re-establish a connection between
//! retries. [`TcpConnector`], [`UdpConnector`] and [`SerialConnector`] open
//! real links; tests hand out in-memory pipes instead.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use modbus_master::config::TcpConfig;
//! use modbus_master::protocol::{ModbusFunction, ModbusRequest};
//! use modbus_master::transport::{ModbusTransport, TcpConnector, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TcpConfig::new("127.0.0.1:502");
//!     let mut transport = TcpTransport::new(TcpConnector::new(config.clone()), config.read_timeout());
//!     transport.connect().await?;
//!
//!     let mut request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 10);
//!     transport.write_request(&mut request).await?;
//!     let response = transport.read_response().await?;
//!     println!("Registers: {:?}", response.parse_registers()?);
//!
//!     let stats = transport.get_stats();
//!     println!("Requests sent: {}", stats.requests_sent);
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

mod ascii;
mod rtu;
mod tcp;
mod udp;

pub use ascii::AsciiTransport;
pub use rtu::RtuTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::info;

use crate::config::{SerialConfig, TcpConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusRequest, ModbusResponse};

/// Maximum frame size for Modbus TCP (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum frame size for Modbus RTU
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Maximum decoded payload of a Modbus ASCII frame (unit + PDU + LRC)
pub const MAX_ASCII_PAYLOAD_SIZE: usize = 256;

/// Format raw bytes as hex string for packet logging
pub(crate) fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and format
pub(crate) fn log_packet(direction: &str, data: &[u8], protocol: &str, slave_id: Option<u8>) {
    let hex_string = format_hex_packet(data);
    match slave_id {
        Some(id) => info!("[MODBUS-{}] {} slave:{} {}", protocol, direction, id, hex_string),
        None => info!("[MODBUS-{}] {} {}", protocol, direction, hex_string),
    }
}

/// Serial lines address units 1..=247; 0 is broadcast and gets no reply
pub(crate) fn check_serial_unit(unit_id: u8) -> ModbusResult<()> {
    if unit_id == 0 || unit_id > 247 {
        return Err(ModbusError::invalid_data(format!("Invalid slave ID: {}", unit_id)));
    }
    Ok(())
}

/// Frame codec abstraction used by the transaction executor
///
/// One call to [`write_request`](Self::write_request) followed by one or more
/// calls to [`read_response`](Self::read_response) make up an exchange. The
/// executor owns the transport exclusively (`&mut self`), so at most one
/// exchange is ever in flight on a link.
///
/// ## Error Handling
///
/// Readers swallow resynchronisable problems (an ASCII frame with a bad LRC,
/// a serial frame addressed to another unit) and keep scanning. Everything
/// else is returned as a `ModbusError` and classified by
/// [`ModbusError::is_transient`] for the retry policy.
///
/// ## Usage Example
///
/// ```rust,no_run
/// use modbus_master::transport::ModbusTransport;
/// use modbus_master::protocol::{ModbusRequest, ModbusFunction};
///
/// async fn read_once(transport: &mut impl ModbusTransport) -> Result<Vec<u16>, Box<dyn std::error::Error>> {
///     let mut request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 10);
///     transport.write_request(&mut request).await?;
///     let response = transport.read_response().await?;
///     Ok(response.parse_registers()?)
/// }
/// ```
#[async_trait]
pub trait ModbusTransport: Send {
    /// Short protocol name used in logs (`TCP`, `UDP`, `RTU`, `ASCII`)
    fn protocol(&self) -> &'static str;

    /// Open (or reopen) the underlying link
    async fn connect(&mut self) -> ModbusResult<()>;

    /// Close the link; a closed transport can be connected again
    async fn close(&mut self) -> ModbusResult<()>;

    /// Check if the transport holds an open link
    ///
    /// This is a local check and does not verify that the remote device is
    /// responsive.
    fn is_connected(&self) -> bool;

    /// Serialize and transmit one request
    ///
    /// The transport sets the request's headless flag to match its framing.
    async fn write_request(&mut self, request: &mut ModbusRequest) -> ModbusResult<()>;

    /// Read the next complete response frame
    ///
    /// Each byte read is bounded by the transport's read timeout. The overall
    /// wait is bounded by the caller.
    async fn read_response(&mut self) -> ModbusResult<ModbusResponse>;

    /// Reject unit ids the framing cannot address
    ///
    /// MBAP framings accept the full 0..=255 range.
    fn check_unit_id(&self, _unit_id: u8) -> ModbusResult<()> {
        Ok(())
    }

    /// True when responses echo the request's transaction id
    fn correlates_transactions(&self) -> bool {
        false
    }

    /// Bring the link back to a state where the next exchange can start
    ///
    /// Called after a failed attempt. Byte streams that may hold the rest of
    /// an unread frame drop the link here.
    async fn recover(&mut self) -> ModbusResult<()> {
        Ok(())
    }

    /// Enable removal of the local echo on half-duplex lines
    fn set_echo(&mut self, _echo: bool) {}

    fn is_echo(&self) -> bool {
        false
    }

    /// Enable or disable hex dumps of every frame
    fn set_packet_logging(&mut self, enabled: bool);

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Frames dropped while resynchronising (bad LRC, foreign unit id)
    pub discarded_frames: u64,
}

impl TransportStats {
    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.requests_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_received(&mut self, bytes: usize) {
        self.responses_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub(crate) fn record_error(&mut self, error: &ModbusError) {
        self.errors += 1;
        if error.is_timeout() {
            self.timeouts += 1;
        }
    }
}

/// Source of links for a transport
///
/// Called on the first connect and again on every reconnect.
#[async_trait]
pub trait Connector: Send {
    type Link: Send;

    async fn connect(&mut self) -> ModbusResult<Self::Link>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

/// Opens Modbus TCP connections
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Link = TcpStream;

    async fn connect(&mut self) -> ModbusResult<TcpStream> {
        let address = self.config.socket_address();
        let connect_timeout = self.config.connect_timeout();

        let stream = timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                ModbusError::timeout(
                    format!("connect to {}", address),
                    connect_timeout.as_millis() as u64,
                )
            })?
            .map_err(|e| ModbusError::connection(format!("Failed to connect to {}: {}", address, e)))?;

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn endpoint(&self) -> String {
        self.config.socket_address()
    }
}

/// One-datagram-per-frame link
#[async_trait]
pub trait DatagramLink: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> ModbusResult<()>;

    /// Receive one whole datagram
    async fn recv_frame(&mut self) -> ModbusResult<Vec<u8>>;
}

#[async_trait]
impl DatagramLink for UdpSocket {
    async fn send_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let sent = self.send(frame).await?;
        if sent != frame.len() {
            return Err(ModbusError::io(format!(
                "Datagram truncated: sent {} of {} bytes",
                sent,
                frame.len()
            )));
        }
        Ok(())
    }

    async fn recv_frame(&mut self) -> ModbusResult<Vec<u8>> {
        let mut buf = vec![0u8; MAX_TCP_FRAME_SIZE];
        let len = self.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }
}

/// Opens connected UDP sockets towards a Modbus UDP slave
#[derive(Debug, Clone)]
pub struct UdpConnector {
    config: TcpConfig,
}

impl UdpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    type Link = UdpSocket;

    async fn connect(&mut self) -> ModbusResult<UdpSocket> {
        let address = self.config.socket_address();
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(&address)
            .await
            .map_err(|e| ModbusError::connection(format!("Failed to connect to {}: {}", address, e)))?;
        Ok(socket)
    }

    fn endpoint(&self) -> String {
        self.config.socket_address()
    }
}

/// Opens serial ports for RTU and ASCII
#[derive(Debug, Clone)]
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Link = tokio_serial::SerialStream;

    async fn connect(&mut self) -> ModbusResult<tokio_serial::SerialStream> {
        self.config.validate()?;

        let builder = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(self.config.tokio_data_bits())
            .stop_bits(self.config.tokio_stop_bits())
            .parity(self.config.parity.into())
            .timeout(self.config.read_timeout());

        tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!(
                "Failed to open serial port {}: {}",
                self.config.port, e
            ))
        })
    }

    fn endpoint(&self) -> String {
        self.config.port.clone()
    }
}
