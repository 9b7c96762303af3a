//! # Modbus Master Error Handling
//!
//! Error taxonomy for the master-side transport and transaction core.
//!
//! ## Error Categories
//!
//! ### Transient errors
//! Failures that may go away on the next attempt. The transaction executor
//! retries these up to its configured limit:
//! - **I/O Errors**: socket or serial port read/write failures
//! - **Connection Errors**: link refused, reset or closed by the peer
//! - **Timeout Errors**: no byte (or no complete frame) within the deadline
//! - **Frame / CRC Errors**: a frame that could not be delimited or verified
//!
//! ### Terminal errors
//! - **Retries Exhausted**: every attempt failed with a transient error
//! - **Configuration / Invalid Data**: the request or configuration is wrong
//!   and retrying cannot help
//!
//! ### Slave exceptions
//! A slave exception is a valid, fully decoded reply. The executor returns it
//! as a [`ModbusResponse`](crate::protocol::ModbusResponse) carrying an
//! exception code, never as an error. [`ModbusError::Exception`] exists for
//! callers that prefer to turn such a reply into an `Err`.
//!
//! ## Usage Example
//!
//! ```rust
//! use modbus_master::{ModbusError, ModbusResult};
//!
//! fn describe(result: ModbusResult<Vec<u16>>) -> String {
//!     match result {
//!         Ok(values) => format!("{} registers", values.len()),
//!         Err(ModbusError::RetriesExhausted { attempts, message }) => {
//!             format!("gave up after {} attempts: {}", attempts, message)
//!         }
//!         Err(error) if error.is_transient() => format!("transient: {}", error),
//!         Err(error) => format!("fatal: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus master error types
///
/// Each variant carries enough context to log a useful message. All variants
/// are `Clone` so a failure can be recorded in statistics and still returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or loss
    ///
    /// # Examples
    /// - Connection refused by remote host
    /// - Peer closed the stream in the middle of a frame
    /// - Transport used before `connect()`
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An operation exceeded its deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Function code with no registered message type
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request or response payload with invalid content
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// RTU checksum mismatch
    ///
    /// `expected` is the CRC re-derived from the payload, `actual` is the CRC
    /// read from the wire. Both are in wire order (low byte first).
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Slave exception reply turned into an error
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame could not be delimited, decoded or bounded
    ///
    /// # Examples
    /// - Non-hex character inside an ASCII frame
    /// - RTU function code missing from the length table
    /// - MBAP length field larger than any legal frame
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Invalid client configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Device never answered
    #[error("Device {slave_id} not responding")]
    DeviceNotResponding { slave_id: u8 },

    /// Every attempt of a transaction failed with a transient error
    #[error("Transaction failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Maps standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a device not responding error
    pub fn device_not_responding(slave_id: u8) -> Self {
        Self::DeviceNotResponding { slave_id }
    }

    /// Create a terminal failure after `attempts` failed attempts
    ///
    /// `last` is the error of the final attempt; its message is preserved.
    pub fn retries_exhausted(attempts: u32, last: &ModbusError) -> Self {
        Self::RetriesExhausted {
            attempts,
            message: last.to_string(),
        }
    }

    /// Check if the error should trigger the retry policy
    ///
    /// Transient errors are transport or framing failures: the same request
    /// sent again may succeed. Slave exceptions never reach this check, and
    /// configuration or data errors are not transient.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_master::ModbusError;
    ///
    /// assert!(ModbusError::timeout("read byte", 500).is_transient());
    /// assert!(ModbusError::crc_mismatch(0x0BC4, 0x0BC5).is_transient());
    /// assert!(!ModbusError::invalid_data("quantity is zero").is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
                | Self::InvalidFunction { .. }
                | Self::DeviceNotResponding { .. }
        )
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }

    /// Check if the error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Convert from std::io::Error
///
/// An unexpected end of stream means the peer closed the link, which is a
/// connection error rather than a plain I/O failure.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
///
/// The elapsed error does not carry the deadline; call sites that know it
/// build the timeout error themselves.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors (configuration loading)
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port error: {}", err))
    }
}
