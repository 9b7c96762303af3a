//! # Modbus Master - transport and transaction core
//!
//! Async Modbus master for Tokio covering the four common framings:
//!
//! - **TCP**: MBAP header over a byte stream, transaction id correlation
//! - **UDP**: the same MBAP frame in one datagram
//! - **RTU**: binary frames with CRC-16, length inferred from the function code
//! - **ASCII**: `:`-delimited hex frames with LRC and resynchronisation
//!
//! On top of the frame codecs sits a transaction executor with a retry
//! policy (optionally reconnecting between attempts), response timeouts and
//! stale-reply filtering, and a small master facade for the standard
//! read/write functions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_master::{ModbusMaster, ModbusResult, SerialConfig};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut master = ModbusMaster::rtu(SerialConfig::new("/dev/ttyUSB0"))?;
//!     master.set_reconnecting(true);
//!
//!     let reply = master.read_multiple_registers(1, 0, 10).await?;
//!     if reply.code() == 0 {
//!         println!("Registers: {:?}", reply.data());
//!     }
//!
//!     master.write_single_register(1, 100, 0x1234).await?;
//!     master.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │    ModbusMaster     │  typed function calls, SlaveReply
//! └─────────────────────┘
//!           │
//! ┌─────────────────────┐
//! │  ModbusTransaction  │  retries, reconnect, timeout, tid correlation
//! └─────────────────────┘
//!           │
//! ┌─────────────────────┐
//! │   ModbusTransport   │  TCP / UDP / RTU / ASCII framing
//! └─────────────────────┘
//!           │
//! ┌─────────────────────┐
//! │ TimedStream/Ascii   │  timed byte I/O, hex tokens
//! └─────────────────────┘
//!           │
//! ┌─────────────────────┐
//! │      Connector      │  TcpStream, UdpSocket, SerialStream
//! └─────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// CRC-16 and LRC checksums
pub mod checksum;

/// Timed byte streams and the ASCII hex adapter
pub mod stream;

/// Serde-backed configuration structs
pub mod config;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Frame codecs for TCP, UDP, RTU and ASCII
pub mod transport;

/// Retrying transaction executor
pub mod transaction;

/// Modbus master facade
pub mod client;

/// Performance monitoring
pub mod utils;

/// Callback logging for applications
pub mod logging;

// Re-export main types for convenience
pub use client::{ModbusMaster, SlaveReply};
pub use config::{Parity, SerialConfig, TcpConfig, TransactionConfig};
pub use error::{ModbusError, ModbusResult};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use protocol::{
    MessageRegistry, ModbusException, ModbusFunction, ModbusMessage, ModbusRequest, ModbusResponse,
};
pub use transaction::ModbusTransaction;
pub use transport::{
    AsciiTransport, Connector, DatagramLink, ModbusTransport, RtuTransport, SerialConnector,
    TcpConnector, TcpTransport, TransportStats, UdpConnector, UdpTransport,
};
pub use utils::{OperationTimer, PerformanceMetrics};

/// Maximum number of coils that can be read in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils that can be written in a single request
pub const MAX_COILS_PER_WRITE: u16 = 1968;

/// Maximum number of registers that can be written in a single request
pub const MAX_REGISTERS_PER_WRITE: u16 = 123;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
