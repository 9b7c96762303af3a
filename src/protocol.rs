//! Modbus protocol definitions and data structures
//!
//! This module contains the message layer consumed by the frame codecs:
//! function codes, exception codes, the [`ModbusMessage`] capability, the
//! generic-body [`ModbusRequest`] / [`ModbusResponse`] pair and the
//! [`MessageRegistry`] that maps a function code read off the wire to a
//! message instance able to decode it.

use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Size of the MBAP header used by TCP and UDP framing
pub const MBAP_HEADER_SIZE: usize = 6;

/// Largest legal MBAP length field (unit id + 253 byte PDU)
pub const MAX_MBAP_LENGTH: usize = 254;

/// Bit that marks a function code as an exception reply
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Read Exception Status (0x07, serial line only)
    ReadExceptionStatus = 0x07,
    /// Diagnostics (0x08, serial line only)
    Diagnostics = 0x08,
    /// Get Comm Event Counter (0x0B, serial line only)
    GetCommEventCounter = 0x0B,
    /// Get Comm Event Log (0x0C, serial line only)
    GetCommEventLog = 0x0C,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Report Slave ID (0x11, serial line only)
    ReportSlaveId = 0x11,
    /// Read File Record (0x14)
    ReadFileRecord = 0x14,
    /// Write File Record (0x15)
    WriteFileRecord = 0x15,
    /// Mask Write Register (0x16)
    MaskWriteRegister = 0x16,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
    /// Read FIFO Queue (0x18)
    ReadFifoQueue = 0x18,
}

impl ModbusFunction {
    /// Every function code known to the message layer
    pub const ALL: [ModbusFunction; 18] = [
        ModbusFunction::ReadCoils,
        ModbusFunction::ReadDiscreteInputs,
        ModbusFunction::ReadHoldingRegisters,
        ModbusFunction::ReadInputRegisters,
        ModbusFunction::WriteSingleCoil,
        ModbusFunction::WriteSingleRegister,
        ModbusFunction::ReadExceptionStatus,
        ModbusFunction::Diagnostics,
        ModbusFunction::GetCommEventCounter,
        ModbusFunction::GetCommEventLog,
        ModbusFunction::WriteMultipleCoils,
        ModbusFunction::WriteMultipleRegisters,
        ModbusFunction::ReportSlaveId,
        ModbusFunction::ReadFileRecord,
        ModbusFunction::WriteFileRecord,
        ModbusFunction::MaskWriteRegister,
        ModbusFunction::ReadWriteMultipleRegisters,
        ModbusFunction::ReadFifoQueue,
    ];

    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|function| function.to_u8() == value)
            .ok_or_else(|| ModbusError::invalid_function(value))
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteSingleRegister
                | ModbusFunction::WriteMultipleCoils
                | ModbusFunction::WriteMultipleRegisters
        )
    }

    /// Shape of the response body that follows the function code
    pub fn response_shape(self) -> BodyShape {
        match self {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters
            | ModbusFunction::GetCommEventLog
            | ModbusFunction::ReportSlaveId
            | ModbusFunction::ReadFileRecord
            | ModbusFunction::WriteFileRecord
            | ModbusFunction::ReadWriteMultipleRegisters => BodyShape::ByteCount,
            // The diagnostics echo is a 2-byte sub-function plus 2 data bytes
            ModbusFunction::Diagnostics => BodyShape::Fixed(4),
            ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::GetCommEventCounter
            | ModbusFunction::WriteMultipleCoils
            | ModbusFunction::WriteMultipleRegisters => BodyShape::Fixed(4),
            ModbusFunction::ReadExceptionStatus => BodyShape::Fixed(1),
            ModbusFunction::MaskWriteRegister => BodyShape::Fixed(6),
            ModbusFunction::ReadFifoQueue => BodyShape::WordByteCount,
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::ReadExceptionStatus => "Read Exception Status",
            ModbusFunction::Diagnostics => "Diagnostics",
            ModbusFunction::GetCommEventCounter => "Get Comm Event Counter",
            ModbusFunction::GetCommEventLog => "Get Comm Event Log",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::ReportSlaveId => "Report Slave ID",
            ModbusFunction::ReadFileRecord => "Read File Record",
            ModbusFunction::WriteFileRecord => "Write File Record",
            ModbusFunction::MaskWriteRegister => "Mask Write Register",
            ModbusFunction::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
            ModbusFunction::ReadFifoQueue => "Read FIFO Queue",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// How the length of a response body is determined
///
/// The body is everything after the function code, excluding any checksum.
/// Framings without delimiters (RTU) rely on this to know where a frame ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyShape {
    /// One byte-count byte followed by that many bytes
    ByteCount,
    /// A big-endian 16-bit byte count followed by that many bytes
    WordByteCount,
    /// A fixed number of bytes
    Fixed(usize),
}

impl BodyShape {
    /// Number of leading bytes that must be read before the length is known
    pub fn prefix_len(self) -> usize {
        match self {
            BodyShape::ByteCount => 1,
            BodyShape::WordByteCount => 2,
            BodyShape::Fixed(_) => 0,
        }
    }

    /// Total body length given its first [`prefix_len`](Self::prefix_len) bytes
    pub fn body_len(self, prefix: &[u8]) -> ModbusResult<usize> {
        match self {
            BodyShape::ByteCount => prefix
                .first()
                .map(|&count| 1 + count as usize)
                .ok_or_else(|| ModbusError::frame("Missing byte count")),
            BodyShape::WordByteCount => match prefix {
                [hi, lo, ..] => Ok(2 + u16::from_be_bytes([*hi, *lo]) as usize),
                _ => Err(ModbusError::frame("Missing word byte count")),
            },
            BodyShape::Fixed(len) => Ok(len),
        }
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Capability shared by requests and responses
///
/// A message knows its own function code and body. The addressing envelope
/// (MBAP header, unit id) is written and read by the provided methods, and
/// left out of the wire form entirely for the checksum fields that codecs add.
///
/// A *headless* message starts at the unit id. A non-headless message carries
/// the 6-byte MBAP header (transaction id, protocol id 0, length) in front.
pub trait ModbusMessage {
    /// Function code as it appears on the wire
    fn function_code(&self) -> u8;

    fn unit_id(&self) -> u8;

    fn set_unit_id(&mut self, unit_id: u8);

    fn transaction_id(&self) -> u16;

    fn set_transaction_id(&mut self, transaction_id: u16);

    fn is_headless(&self) -> bool;

    fn set_headless(&mut self, headless: bool);

    /// Append the body (everything after the function code)
    fn write_body(&self, out: &mut BytesMut);

    /// Decode the body from `src`, consuming exactly the bytes it occupies
    fn read_body(&mut self, src: &mut &[u8]) -> ModbusResult<()>;

    /// Serialize the message, including the MBAP header unless headless
    fn write_to(&self, out: &mut BytesMut) {
        let start = out.len();
        if !self.is_headless() {
            out.put_u16(self.transaction_id());
            out.put_u16(0);
            out.put_u16(0);
        }
        out.put_u8(self.unit_id());
        out.put_u8(self.function_code());
        self.write_body(out);

        if !self.is_headless() {
            let length = (out.len() - start - MBAP_HEADER_SIZE) as u16;
            out[start + 4..start + 6].copy_from_slice(&length.to_be_bytes());
        }
    }

    /// Deserialize the message from `src`
    ///
    /// `src` must hold exactly one message. The function code found on the
    /// wire must be the one this instance was created for.
    fn read_from(&mut self, src: &mut &[u8]) -> ModbusResult<()> {
        if !self.is_headless() {
            if src.remaining() < MBAP_HEADER_SIZE {
                return Err(ModbusError::frame("Truncated MBAP header"));
            }
            let transaction_id = src.get_u16();
            let protocol_id = src.get_u16();
            let length = src.get_u16() as usize;
            if protocol_id != 0 {
                return Err(ModbusError::frame(format!(
                    "Invalid protocol ID: {}",
                    protocol_id
                )));
            }
            if length != src.remaining() {
                return Err(ModbusError::frame(format!(
                    "MBAP length {} does not match {} bytes of payload",
                    length,
                    src.remaining()
                )));
            }
            self.set_transaction_id(transaction_id);
        }

        if src.remaining() < 2 {
            return Err(ModbusError::frame("Message shorter than unit id and function code"));
        }
        let unit_id = src.get_u8();
        let function_code = src.get_u8();
        if function_code != self.function_code() {
            return Err(ModbusError::frame(format!(
                "Function code 0x{:02X} does not match expected 0x{:02X}",
                function_code,
                self.function_code()
            )));
        }
        self.set_unit_id(unit_id);
        self.read_body(src)?;

        if src.has_remaining() {
            return Err(ModbusError::frame(format!(
                "{} trailing bytes after message body",
                src.remaining()
            )));
        }
        Ok(())
    }

    /// Size of the serialized form
    fn wire_len(&self) -> usize {
        let mut out = BytesMut::new();
        self.write_to(&mut out);
        out.len()
    }
}

/// Modbus request structure
///
/// The body is kept as raw bytes; the builders below lay it out for each
/// standard function.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub transaction_id: u16,
    pub slave_id: SlaveId,
    pub function_code: u8,
    pub data: Vec<u8>,
    pub headless: bool,
}

impl ModbusRequest {
    /// Create a request with an arbitrary body
    pub fn new(slave_id: SlaveId, function_code: u8, data: Vec<u8>) -> Self {
        Self {
            transaction_id: 0,
            slave_id,
            function_code,
            data,
            headless: false,
        }
    }

    /// Empty request for `function_code`, filled in by [`ModbusMessage::read_from`]
    pub fn empty(function_code: u8) -> Self {
        Self::new(0, function_code, Vec::new())
    }

    /// Create a new read request
    pub fn new_read(
        slave_id: SlaveId,
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
    ) -> Self {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&quantity.to_be_bytes());
        Self::new(slave_id, function.to_u8(), data)
    }

    /// Write Single Coil (0x05)
    pub fn write_single_coil(slave_id: SlaveId, address: ModbusAddress, value: bool) -> Self {
        let coil: u16 = if value { 0xFF00 } else { 0x0000 };
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&coil.to_be_bytes());
        Self::new(slave_id, ModbusFunction::WriteSingleCoil.to_u8(), data)
    }

    /// Write Single Register (0x06)
    pub fn write_single_register(slave_id: SlaveId, address: ModbusAddress, value: ModbusValue) -> Self {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&value.to_be_bytes());
        Self::new(slave_id, ModbusFunction::WriteSingleRegister.to_u8(), data)
    }

    /// Write Multiple Coils (0x0F)
    pub fn write_multiple_coils(slave_id: SlaveId, address: ModbusAddress, values: &[bool]) -> Self {
        let packed = data_utils::pack_bits(values);
        let mut data = Vec::with_capacity(5 + packed.len());
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&(values.len() as u16).to_be_bytes());
        data.push(packed.len() as u8);
        data.extend_from_slice(&packed);
        Self::new(slave_id, ModbusFunction::WriteMultipleCoils.to_u8(), data)
    }

    /// Write Multiple Registers (0x10)
    pub fn write_multiple_registers(
        slave_id: SlaveId,
        address: ModbusAddress,
        values: &[ModbusValue],
    ) -> Self {
        let bytes = data_utils::registers_to_bytes(values);
        let mut data = Vec::with_capacity(5 + bytes.len());
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&(values.len() as u16).to_be_bytes());
        data.push(bytes.len() as u8);
        data.extend_from_slice(&bytes);
        Self::new(slave_id, ModbusFunction::WriteMultipleRegisters.to_u8(), data)
    }

    /// Known function, if any
    pub fn function(&self) -> Option<ModbusFunction> {
        ModbusFunction::from_u8(self.function_code).ok()
    }

    /// Quantity field of read and multiple-write requests
    pub fn quantity(&self) -> Option<u16> {
        match self.data.get(2..4) {
            Some(&[hi, lo]) => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }

    /// Validate the request
    ///
    /// Unit id ranges depend on the framing and are checked by the transport.
    pub fn validate(&self) -> ModbusResult<()> {
        let limit = match self.function() {
            Some(ModbusFunction::ReadCoils) | Some(ModbusFunction::ReadDiscreteInputs) => {
                crate::MAX_COILS_PER_REQUEST
            }
            Some(ModbusFunction::ReadHoldingRegisters)
            | Some(ModbusFunction::ReadInputRegisters) => crate::MAX_REGISTERS_PER_REQUEST,
            Some(ModbusFunction::WriteMultipleCoils) => crate::MAX_COILS_PER_WRITE,
            Some(ModbusFunction::WriteMultipleRegisters) => crate::MAX_REGISTERS_PER_WRITE,
            _ => return Ok(()),
        };

        let quantity = self
            .quantity()
            .ok_or_else(|| ModbusError::invalid_data("Request body too short"))?;
        if quantity == 0 {
            return Err(ModbusError::invalid_data("Quantity cannot be zero"));
        }
        if quantity > limit {
            return Err(ModbusError::invalid_data(format!(
                "Quantity {} exceeds limit {}",
                quantity, limit
            )));
        }
        Ok(())
    }
}

impl ModbusMessage for ModbusRequest {
    fn function_code(&self) -> u8 {
        self.function_code
    }

    fn unit_id(&self) -> u8 {
        self.slave_id
    }

    fn set_unit_id(&mut self, unit_id: u8) {
        self.slave_id = unit_id;
    }

    fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    fn set_transaction_id(&mut self, transaction_id: u16) {
        self.transaction_id = transaction_id;
    }

    fn is_headless(&self) -> bool {
        self.headless
    }

    fn set_headless(&mut self, headless: bool) {
        self.headless = headless;
    }

    fn write_body(&self, out: &mut BytesMut) {
        out.extend_from_slice(&self.data);
    }

    fn read_body(&mut self, src: &mut &[u8]) -> ModbusResult<()> {
        self.data = src.to_vec();
        src.advance(src.len());
        Ok(())
    }
}

/// Modbus response structure
///
/// `function_code` is always the base function; an exception reply sets
/// `exception` and goes on the wire as `function_code | 0x80`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub transaction_id: u16,
    pub slave_id: SlaveId,
    pub function_code: u8,
    pub data: Vec<u8>,
    pub exception: Option<u8>,
    pub headless: bool,
    shape: BodyShape,
}

impl ModbusResponse {
    /// Empty response for a known or custom function with the given body shape
    pub fn with_shape(function_code: u8, shape: BodyShape) -> Self {
        Self {
            transaction_id: 0,
            slave_id: 0,
            function_code: function_code & !EXCEPTION_FLAG,
            data: Vec::new(),
            exception: None,
            headless: false,
            shape,
        }
    }

    /// Empty response for one of the standard functions
    pub fn for_function(function: ModbusFunction) -> Self {
        Self::with_shape(function.to_u8(), function.response_shape())
    }

    /// Create a successful response
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        let mut response = Self::for_function(function);
        response.slave_id = slave_id;
        response.data = data;
        response
    }

    /// Create an exception response
    pub fn new_exception(slave_id: SlaveId, function_code: u8, exception_code: u8) -> Self {
        let mut response = Self::with_shape(function_code, BodyShape::Fixed(1));
        response.slave_id = slave_id;
        response.exception = Some(exception_code);
        response
    }

    /// Turn an empty response into the exception form of the same function
    pub fn into_exception_form(mut self) -> Self {
        self.shape = BodyShape::Fixed(1);
        self.exception = Some(0);
        self
    }

    /// Shape of the body still to be read
    pub fn body_shape(&self) -> BodyShape {
        self.shape
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Exception code sent by the slave, if this is an exception reply
    pub fn exception_code(&self) -> Option<u8> {
        self.exception
    }

    /// Standard exception, if the code is one
    pub fn exception(&self) -> Option<ModbusException> {
        self.exception.and_then(ModbusException::from_u8)
    }

    /// Get exception error if present
    pub fn get_exception(&self) -> Option<ModbusError> {
        self.exception
            .map(|code| ModbusError::exception(self.function_code, code))
    }

    /// Convert an exception reply into [`ModbusError::Exception`]
    pub fn into_result(self) -> ModbusResult<Self> {
        match self.get_exception() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    fn counted_payload(&self, what: &str) -> ModbusResult<&[u8]> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }

        let (&byte_count, rest) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty response data"))?;
        rest.get(..byte_count as usize)
            .ok_or_else(|| ModbusError::frame(format!("Incomplete {} data", what)))
    }

    /// Parse response data as registers (u16 values)
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        let payload = self.counted_payload("register")?;
        if payload.len() % 2 != 0 {
            return Err(ModbusError::frame("Invalid register data length"));
        }
        data_utils::bytes_to_registers(payload)
    }

    /// Parse response data as bits (bool values), LSB first
    ///
    /// The result is padded to a multiple of 8; callers truncate to the
    /// quantity they asked for.
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        let payload = self.counted_payload("bit")?;
        Ok(data_utils::unpack_bits(payload, payload.len() * 8))
    }
}

impl ModbusMessage for ModbusResponse {
    fn function_code(&self) -> u8 {
        if self.exception.is_some() {
            self.function_code | EXCEPTION_FLAG
        } else {
            self.function_code
        }
    }

    fn unit_id(&self) -> u8 {
        self.slave_id
    }

    fn set_unit_id(&mut self, unit_id: u8) {
        self.slave_id = unit_id;
    }

    fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    fn set_transaction_id(&mut self, transaction_id: u16) {
        self.transaction_id = transaction_id;
    }

    fn is_headless(&self) -> bool {
        self.headless
    }

    fn set_headless(&mut self, headless: bool) {
        self.headless = headless;
    }

    fn write_body(&self, out: &mut BytesMut) {
        match self.exception {
            Some(code) => out.put_u8(code),
            None => out.extend_from_slice(&self.data),
        }
    }

    fn read_body(&mut self, src: &mut &[u8]) -> ModbusResult<()> {
        let prefix = src.get(..self.shape.prefix_len()).unwrap_or(&[]);
        let len = self.shape.body_len(prefix)?;
        if src.remaining() < len {
            return Err(ModbusError::frame(format!(
                "Response body for function 0x{:02X} needs {} bytes, got {}",
                self.function_code,
                len,
                src.remaining()
            )));
        }

        if self.exception.is_some() {
            self.exception = Some(src.get_u8());
            self.data.clear();
        } else {
            self.data = src[..len].to_vec();
            src.advance(len);
        }
        Ok(())
    }
}

/// Factory producing an empty request for a function code
pub type RequestFactory = fn(u8) -> ModbusRequest;

/// Factory producing an empty response for a function code
pub type ResponseFactory = fn(u8) -> ModbusResponse;

fn standard_response(function_code: u8) -> ModbusResponse {
    match ModbusFunction::from_u8(function_code) {
        Ok(function) => ModbusResponse::for_function(function),
        Err(_) => ModbusResponse::with_shape(function_code, BodyShape::Fixed(0)),
    }
}

/// Function code to message constructor table
///
/// Codecs look up the function code read off the wire here to get a message
/// that knows how to decode the rest of the frame. `MessageRegistry::default()`
/// knows every [`ModbusFunction`]; custom codes can be added with
/// [`register_response`](Self::register_response).
///
/// ```rust
/// use modbus_master::protocol::{BodyShape, MessageRegistry, ModbusResponse};
///
/// let mut registry = MessageRegistry::default();
/// registry.register_response(0x41, |fc| ModbusResponse::with_shape(fc, BodyShape::Fixed(2)));
///
/// assert!(registry.create_response(0x41).is_ok());
/// assert!(registry.create_response(0xC1).unwrap().is_exception());
/// assert!(registry.create_response(0x42).is_err());
/// ```
#[derive(Clone)]
pub struct MessageRegistry {
    requests: HashMap<u8, RequestFactory>,
    responses: HashMap<u8, ResponseFactory>,
}

impl MessageRegistry {
    /// Registry without any function codes
    pub fn empty() -> Self {
        Self {
            requests: HashMap::new(),
            responses: HashMap::new(),
        }
    }

    pub fn register_request(&mut self, function_code: u8, factory: RequestFactory) {
        self.requests.insert(function_code, factory);
    }

    pub fn register_response(&mut self, function_code: u8, factory: ResponseFactory) {
        self.responses.insert(function_code, factory);
    }

    pub fn is_registered(&self, function_code: u8) -> bool {
        self.responses.contains_key(&(function_code & !EXCEPTION_FLAG))
    }

    /// Instantiate the request type for `function_code`
    pub fn create_request(&self, function_code: u8) -> ModbusResult<ModbusRequest> {
        self.requests
            .get(&function_code)
            .map(|factory| factory(function_code))
            .ok_or_else(|| ModbusError::invalid_function(function_code))
    }

    /// Instantiate the response type for `function_code`
    ///
    /// Exception codes (`fc | 0x80`) resolve to the exception form of their
    /// base function.
    pub fn create_response(&self, function_code: u8) -> ModbusResult<ModbusResponse> {
        let base = function_code & !EXCEPTION_FLAG;
        let factory = self
            .responses
            .get(&base)
            .ok_or_else(|| ModbusError::invalid_function(function_code))?;
        let response = factory(base);

        if function_code & EXCEPTION_FLAG != 0 {
            Ok(response.into_exception_form())
        } else {
            Ok(response)
        }
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for function in ModbusFunction::ALL {
            registry.register_request(function.to_u8(), ModbusRequest::empty);
            registry.register_response(function.to_u8(), standard_response);
        }
        registry
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<u8> = self.responses.keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("response_codes", &codes)
            .field("request_codes", &self.requests.len())
            .finish()
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|byte| byte & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }
}
