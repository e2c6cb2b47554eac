//! Modbus protocol vocabulary and PDU handling.
//!
//! Function codes, exception codes, request/response structures, and the
//! build/parse routines for every supported PDU shape. The frame layer in
//! [`crate::frame`] wraps these PDUs in MBAP headers; this module knows
//! nothing about transports or transaction ids.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::{
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

/// Modbus slave/unit identifier.
pub type UnitId = u8;

/// Wire value for a coil switched ON in a single-coil write.
pub const COIL_ON: u16 = 0xFF00;

/// Wire value for a coil switched OFF in a single-coil write.
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes supported by the core.
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
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::frame(format!(
                "unsupported function code: 0x{value:02X}"
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Read functions carry start+quantity and answer with a byte-counted
    /// payload.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
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
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailedToRespond = 0x0B,
}

impl ExceptionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::ServerDeviceFailure),
            0x05 => Some(ExceptionCode::Acknowledge),
            0x06 => Some(ExceptionCode::ServerDeviceBusy),
            0x08 => Some(ExceptionCode::MemoryParityError),
            0x0A => Some(ExceptionCode::GatewayPathUnavailable),
            0x0B => Some(ExceptionCode::GatewayTargetFailedToRespond),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "function code not supported by the server",
            ExceptionCode::IllegalDataAddress => "data address not allowable for the server",
            ExceptionCode::IllegalDataValue => "value in the request is not allowable",
            ExceptionCode::ServerDeviceFailure => "unrecoverable error while servicing the request",
            ExceptionCode::Acknowledge => "request accepted, long-running processing started",
            ExceptionCode::ServerDeviceBusy => "server busy with a long-duration command",
            ExceptionCode::MemoryParityError => "parity error in extended memory",
            ExceptionCode::GatewayPathUnavailable => "gateway could not allocate a path",
            ExceptionCode::GatewayTargetFailedToRespond => "no response from the target device",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.to_u8(), self.description())
    }
}

/// A Modbus request PDU plus its addressing context.
///
/// Immutable once constructed; the client engine owns it until the matching
/// response arrives or the transaction expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
    /// Function-specific payload: value bytes for single writes, packed
    /// coil/register data for multiple writes, empty for reads.
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Build a read request (0x01/0x02/0x03/0x04).
    pub fn new_read(
        unit_id: UnitId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Reject protocol-maxima violations before anything hits the wire.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.quantity == 0 {
            return Err(ModbusError::invalid_request("quantity cannot be zero"));
        }
        let limit = match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => MAX_READ_COILS,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                MAX_READ_REGISTERS
            }
            ModbusFunction::WriteMultipleCoils => MAX_WRITE_COILS,
            ModbusFunction::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
        };
        if self.quantity > limit {
            return Err(ModbusError::invalid_request(format!(
                "quantity {} exceeds limit {} for {}",
                self.quantity, limit, self.function
            )));
        }
        Ok(())
    }

    /// Serialize the PDU: function byte followed by the function-specific
    /// body.
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5 + self.data.len() + 1);
        pdu.push(self.function.to_u8());
        pdu.extend_from_slice(&self.address.to_be_bytes());
        match self.function {
            f if f.is_read() => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                pdu.extend_from_slice(&self.data);
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                pdu.push(self.data.len() as u8);
                pdu.extend_from_slice(&self.data);
            }
            _ => unreachable!("all function codes covered"),
        }
        pdu
    }

    /// Parse a request PDU as a server receives it.
    pub fn decode_pdu(unit_id: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        if pdu.is_empty() {
            return Err(ModbusError::frame("empty request PDU"));
        }
        let function = ModbusFunction::from_u8(pdu[0])?;
        let body = &pdu[1..];
        match function {
            f if f.is_read() => {
                if body.len() != 4 {
                    return Err(ModbusError::frame(format!(
                        "read request body must be 4 bytes, got {}",
                        body.len()
                    )));
                }
                let address = u16::from_be_bytes([body[0], body[1]]);
                let quantity = u16::from_be_bytes([body[2], body[3]]);
                Ok(Self::new_read(unit_id, function, address, quantity))
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                if body.len() != 4 {
                    return Err(ModbusError::frame(format!(
                        "single write body must be 4 bytes, got {}",
                        body.len()
                    )));
                }
                let address = u16::from_be_bytes([body[0], body[1]]);
                Ok(Self {
                    unit_id,
                    function,
                    address,
                    quantity: 1,
                    data: body[2..4].to_vec(),
                })
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                if body.len() < 5 {
                    return Err(ModbusError::frame("multiple write body too short"));
                }
                let address = u16::from_be_bytes([body[0], body[1]]);
                let quantity = u16::from_be_bytes([body[2], body[3]]);
                let byte_count = body[4] as usize;
                if body.len() != 5 + byte_count {
                    return Err(ModbusError::frame(format!(
                        "write body declares {} data bytes but carries {}",
                        byte_count,
                        body.len() - 5
                    )));
                }
                let expected = match function {
                    ModbusFunction::WriteMultipleCoils => (quantity as usize + 7) / 8,
                    _ => quantity as usize * 2,
                };
                if byte_count != expected {
                    return Err(ModbusError::frame(format!(
                        "byte count {byte_count} does not match quantity {quantity}"
                    )));
                }
                Ok(Self {
                    unit_id,
                    function,
                    address,
                    quantity,
                    data: body[5..].to_vec(),
                })
            }
            _ => unreachable!("all function codes covered"),
        }
    }
}

/// A decoded Modbus response PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    /// Raw response body after the function byte. For reads this starts
    /// with the byte count; for writes it echoes address and value/quantity.
    pub data: Vec<u8>,
    pub exception: Option<ExceptionCode>,
}

impl ModbusResponse {
    pub fn new_success(unit_id: UnitId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            unit_id,
            function,
            data,
            exception: None,
        }
    }

    pub fn new_exception(unit_id: UnitId, function: ModbusFunction, code: ExceptionCode) -> Self {
        Self {
            unit_id,
            function,
            data: Vec::new(),
            exception: Some(code),
        }
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Serialize the response PDU, setting the 0x80 flag for exceptions.
    pub fn encode_pdu(&self) -> Vec<u8> {
        match self.exception {
            Some(code) => vec![self.function.to_u8() | 0x80, code.to_u8()],
            None => {
                let mut pdu = Vec::with_capacity(1 + self.data.len());
                pdu.push(self.function.to_u8());
                pdu.extend_from_slice(&self.data);
                pdu
            }
        }
    }

    /// Parse a response PDU as a client receives it. A function byte with
    /// the high bit set decodes as an exception response.
    pub fn decode_pdu(unit_id: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        if pdu.is_empty() {
            return Err(ModbusError::frame("empty response PDU"));
        }
        if pdu[0] & 0x80 != 0 {
            if pdu.len() != 2 {
                return Err(ModbusError::frame(format!(
                    "exception response must be 2 bytes, got {}",
                    pdu.len()
                )));
            }
            let function = ModbusFunction::from_u8(pdu[0] & 0x7F)?;
            let code = ExceptionCode::from_u8(pdu[1]).ok_or_else(|| {
                ModbusError::frame(format!("unknown exception code 0x{:02X}", pdu[1]))
            })?;
            return Ok(Self::new_exception(unit_id, function, code));
        }
        let function = ModbusFunction::from_u8(pdu[0])?;
        let data = pdu[1..].to_vec();
        // Byte-counted read bodies must be internally consistent.
        if function.is_read() {
            if data.is_empty() {
                return Err(ModbusError::frame("read response missing byte count"));
            }
            let byte_count = data[0] as usize;
            if data.len() != 1 + byte_count {
                return Err(ModbusError::frame(format!(
                    "read response declares {} data bytes but carries {}",
                    byte_count,
                    data.len() - 1
                )));
            }
        } else if data.len() != 4 {
            return Err(ModbusError::frame(format!(
                "write response body must be 4 bytes, got {}",
                data.len()
            )));
        }
        Ok(Self::new_success(unit_id, function, data))
    }

    /// Unpack a byte-counted register payload into `u16` values.
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        if let Some(code) = self.exception {
            return Err(ModbusError::Exception(code));
        }
        if self.data.is_empty() {
            return Err(ModbusError::frame("empty register response"));
        }
        let byte_count = self.data[0] as usize;
        if byte_count % 2 != 0 || self.data.len() != 1 + byte_count {
            return Err(ModbusError::frame("inconsistent register response length"));
        }
        Ok(self.data[1..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// Unpack a byte-counted coil payload into exactly `count` booleans.
    pub fn parse_bits(&self, count: u16) -> ModbusResult<Vec<bool>> {
        if let Some(code) = self.exception {
            return Err(ModbusError::Exception(code));
        }
        if self.data.is_empty() {
            return Err(ModbusError::frame("empty bit response"));
        }
        let byte_count = self.data[0] as usize;
        if self.data.len() != 1 + byte_count || byte_count < (count as usize + 7) / 8 {
            return Err(ModbusError::frame("inconsistent bit response length"));
        }
        Ok(data_utils::unpack_bits(&self.data[1..], count as usize))
    }

    /// The echoed (address, value-or-quantity) pair of a write response.
    pub fn parse_write_echo(&self) -> ModbusResult<(u16, u16)> {
        if let Some(code) = self.exception {
            return Err(ModbusError::Exception(code));
        }
        if self.data.len() != 4 {
            return Err(ModbusError::frame("write echo must be 4 bytes"));
        }
        let address = u16::from_be_bytes([self.data[0], self.data[1]]);
        let value = u16::from_be_bytes([self.data[2], self.data[3]]);
        Ok((address, value))
    }
}

/// Bit and register packing helpers shared by client and server engines.
pub mod data_utils {
    /// Pack booleans LSB-first into bytes, as coil payloads travel on the
    /// wire.
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack `bit_count` booleans from LSB-first packed bytes.
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|b| b & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Serialize registers big-endian.
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Deserialize big-endian register bytes; length must be even.
    pub fn bytes_to_registers(bytes: &[u8]) -> Option<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
        )
    }
}
