//! Callback-based request/response logging for applications.
//!
//! Internal diagnostics of the crate go through `tracing`. This logger is the
//! application-facing side: the master facade reports every request, response
//! and failure to a user callback, either decoded (`Interpreted`), as a hex
//! dump of the PDU (`Raw`) or both.

use std::sync::Arc;

use bytes::BytesMut;

use crate::error::ModbusError;
use crate::protocol::{ModbusFunction, ModbusMessage, ModbusRequest, ModbusResponse};
use crate::transport::format_hex_packet;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw packet data only
    Raw,
    /// Show interpreted packet data with field descriptions
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Check if a message at the given level should be logged
    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log an outgoing request
    pub fn log_request(&self, request: &ModbusRequest) {
        if !self.should_log(LogLevel::Info) {
            return;
        }

        let interpreted = format!(
            "Modbus Request -> Slave: {}, Function: {}, {}",
            request.slave_id,
            function_name(request.function_code),
            interpret_request(request)
        );
        self.emit(&interpreted, || format!("Modbus Request -> Raw: {}", raw_pdu(request)));
    }

    /// Log a decoded response, exception replies included
    pub fn log_response(&self, response: &ModbusResponse) {
        if !self.should_log(LogLevel::Info) {
            return;
        }

        let detail = match response.exception() {
            Some(exception) => exception.to_string(),
            None => match response.exception_code() {
                Some(code) => format!("Exception code 0x{:02X}", code),
                None => interpret_response(response),
            },
        };
        let interpreted = format!(
            "Modbus Response <- Slave: {}, Function: {}, {}",
            response.slave_id,
            function_name(response.function_code),
            detail
        );
        self.emit(&interpreted, || format!("Modbus Response <- Raw: {}", raw_pdu(response)));
    }

    /// Log a transaction that ended without a response
    pub fn log_failure(&self, request: &ModbusRequest, error: &ModbusError) {
        self.error(&format!(
            "Modbus Request to slave {} ({}) failed: {}",
            request.slave_id,
            function_name(request.function_code),
            error
        ));
    }

    fn emit(&self, interpreted: &str, raw: impl FnOnce() -> String) {
        match self.mode {
            LoggingMode::Raw => self.info(&raw()),
            LoggingMode::Interpreted => self.info(interpreted),
            LoggingMode::Both => {
                self.info(interpreted);
                self.debug(&raw());
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

fn function_name(function_code: u8) -> String {
    match ModbusFunction::from_u8(function_code) {
        Ok(function) => function.to_string(),
        Err(_) => format!("Unknown Function (0x{:02X})", function_code),
    }
}

/// Unit id, function code and body as hex
fn raw_pdu<M: ModbusMessage>(message: &M) -> String {
    let mut out = BytesMut::new();
    out.extend_from_slice(&[message.unit_id(), message.function_code()]);
    message.write_body(&mut out);
    format_hex_packet(&out)
}

fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
}

fn interpret_request(request: &ModbusRequest) -> String {
    let data = &request.data;
    match (be_u16(data, 0), be_u16(data, 2)) {
        (Some(address), Some(value)) => match request.function() {
            Some(ModbusFunction::WriteSingleCoil) => format!(
                "Address: {}, Value: {}",
                address,
                if value == 0xFF00 { "ON" } else { "OFF" }
            ),
            Some(ModbusFunction::WriteSingleRegister) => {
                format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
            }
            Some(function) if function.is_read_function() || function.is_write_function() => {
                format!("Address: {}, Quantity: {}", address, value)
            }
            _ => format!("Data: {}", hex::encode(data)),
        },
        _ => format!("Data: {}", hex::encode(data)),
    }
}

fn interpret_response(response: &ModbusResponse) -> String {
    let data = &response.data;
    if data.is_empty() {
        return "No data".to_string();
    }

    match response.function_code {
        0x01 | 0x02 => match response.parse_bits() {
            Ok(bits) => format!("Byte count: {}, Coils: {:?}", data[0], &bits[..bits.len().min(16)]),
            Err(_) => format!("Data: {}", hex::encode(data)),
        },
        0x03 | 0x04 => match response.parse_registers() {
            Ok(registers) => format!(
                "Byte count: {}, Registers: {:?}",
                data[0],
                &registers[..registers.len().min(8)]
            ),
            Err(_) => format!("Data: {}", hex::encode(data)),
        },
        0x05 | 0x06 | 0x0F | 0x10 => match (be_u16(data, 0), be_u16(data, 2)) {
            (Some(address), Some(value)) => format!("Address: {}, Value/Quantity: {}", address, value),
            _ => format!("Data: {}", hex::encode(data)),
        },
        _ => format!("Data: {}", hex::encode(data)),
    }
}
