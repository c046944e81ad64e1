
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::utils::error::TelemetryError;

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

pub const MAX_READ_QUANTITY: u16 = 125;
pub const MAX_WRITE_QUANTITY: u16 = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Other(u8),
}

impl ExceptionCode {
    pub fn code(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            other => ExceptionCode::Other(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::IllegalFunction => write!(f, "illegal function (0x01)"),
            ExceptionCode::IllegalDataAddress => write!(f, "illegal data address (0x02)"),
            ExceptionCode::IllegalDataValue => write!(f, "illegal data value (0x03)"),
            ExceptionCode::ServerDeviceFailure => write!(f, "server device failure (0x04)"),
            ExceptionCode::Other(code) => write!(f, "exception 0x{:02X}", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadHoldingRegisters { start: u16, quantity: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { start: u16, values: Vec<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    ReadHoldingRegisters(Vec<u16>),
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { start: u16, quantity: u16 },
    Exception { function: u8, code: ExceptionCode },
}

/// Why a request PDU could not be decoded; the server answers with the
/// matching exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRejection {
    pub function: u8,
    pub code: ExceptionCode,
}

impl ModbusRequest {
    pub fn function_code(&self) -> u8 {
        match self {
            ModbusRequest::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            ModbusRequest::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            ModbusRequest::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function_code());
        match self {
            ModbusRequest::ReadHoldingRegisters { start, quantity } => {
                buf.put_u16(*start);
                buf.put_u16(*quantity);
            }
            ModbusRequest::WriteSingleRegister { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            ModbusRequest::WriteMultipleRegisters { start, values } => {
                buf.put_u16(*start);
                buf.put_u16(values.len() as u16);
                buf.put_u8((values.len() * 2) as u8);
                for value in values {
                    buf.put_u16(*value);
                }
            }
        }
    }

    pub fn decode(mut pdu: Bytes) -> Result<Self, RequestRejection> {
        if pdu.is_empty() {
            return Err(RequestRejection {
                function: 0,
                code: ExceptionCode::IllegalFunction,
            });
        }
        let function = pdu.get_u8();
        let invalid = RequestRejection {
            function,
            code: ExceptionCode::IllegalDataValue,
        };

        match function {
            FC_READ_HOLDING_REGISTERS => {
                if pdu.remaining() != 4 {
                    return Err(invalid);
                }
                let start = pdu.get_u16();
                let quantity = pdu.get_u16();
                if quantity == 0 || quantity > MAX_READ_QUANTITY {
                    return Err(invalid);
                }
                Ok(ModbusRequest::ReadHoldingRegisters { start, quantity })
            }
            FC_WRITE_SINGLE_REGISTER => {
                if pdu.remaining() != 4 {
                    return Err(invalid);
                }
                Ok(ModbusRequest::WriteSingleRegister {
                    address: pdu.get_u16(),
                    value: pdu.get_u16(),
                })
            }
            FC_WRITE_MULTIPLE_REGISTERS => {
                if pdu.remaining() < 5 {
                    return Err(invalid);
                }
                let start = pdu.get_u16();
                let quantity = pdu.get_u16();
                let byte_count = pdu.get_u8() as usize;
                if quantity == 0
                    || quantity > MAX_WRITE_QUANTITY
                    || byte_count != quantity as usize * 2
                    || pdu.remaining() != byte_count
                {
                    return Err(invalid);
                }
                let values = (0..quantity).map(|_| pdu.get_u16()).collect();
                Ok(ModbusRequest::WriteMultipleRegisters { start, values })
            }
            _ => Err(RequestRejection {
                function,
                code: ExceptionCode::IllegalFunction,
            }),
        }
    }
}

impl ModbusResponse {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ModbusResponse::ReadHoldingRegisters(values) => {
                buf.put_u8(FC_READ_HOLDING_REGISTERS);
                buf.put_u8((values.len() * 2) as u8);
                for value in values {
                    buf.put_u16(*value);
                }
            }
            ModbusResponse::WriteSingleRegister { address, value } => {
                buf.put_u8(FC_WRITE_SINGLE_REGISTER);
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            ModbusResponse::WriteMultipleRegisters { start, quantity } => {
                buf.put_u8(FC_WRITE_MULTIPLE_REGISTERS);
                buf.put_u16(*start);
                buf.put_u16(*quantity);
            }
            ModbusResponse::Exception { function, code } => {
                buf.put_u8(function | 0x80);
                buf.put_u8(code.code());
            }
        }
    }

    pub fn decode(mut pdu: Bytes, request: &ModbusRequest) -> Result<Self, TelemetryError> {
        if pdu.len() < 2 {
            return Err(TelemetryError::ConnectionError(format!(
                "Response PDU too short: {} bytes",
                pdu.len()
            )));
        }
        let function = pdu.get_u8();
        let expected = request.function_code();

        if function == expected | 0x80 {
            return Ok(ModbusResponse::Exception {
                function: expected,
                code: ExceptionCode::from_code(pdu.get_u8()),
            });
        }
        if function != expected {
            return Err(TelemetryError::ConnectionError(format!(
                "Unexpected function code 0x{:02X}, expected 0x{:02X}",
                function, expected
            )));
        }

        match request {
            ModbusRequest::ReadHoldingRegisters { quantity, .. } => {
                let byte_count = pdu.get_u8() as usize;
                if byte_count != *quantity as usize * 2 || pdu.remaining() != byte_count {
                    return Err(TelemetryError::ConnectionError(format!(
                        "Read response carries {} bytes, expected {}",
                        pdu.remaining(),
                        *quantity as usize * 2
                    )));
                }
                Ok(ModbusResponse::ReadHoldingRegisters(
                    (0..*quantity).map(|_| pdu.get_u16()).collect(),
                ))
            }
            ModbusRequest::WriteSingleRegister { .. } => {
                if pdu.remaining() != 4 {
                    return Err(TelemetryError::ConnectionError(
                        "Write single register echo has wrong length".to_string(),
                    ));
                }
                Ok(ModbusResponse::WriteSingleRegister {
                    address: pdu.get_u16(),
                    value: pdu.get_u16(),
                })
            }
            ModbusRequest::WriteMultipleRegisters { .. } => {
                if pdu.remaining() != 4 {
                    return Err(TelemetryError::ConnectionError(
                        "Write multiple registers echo has wrong length".to_string(),
                    ));
                }
                Ok(ModbusResponse::WriteMultipleRegisters {
                    start: pdu.get_u16(),
                    quantity: pdu.get_u16(),
                })
            }
        }
    }
}
