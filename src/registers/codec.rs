
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::error::TelemetryError;

pub const REGISTERS_PER_VALUE: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingKind {
    Float32,
    Int32,
    Bool32,
}

impl EncodingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingKind::Float32 => "float32",
            EncodingKind::Int32 => "int32",
            EncodingKind::Bool32 => "bool32",
        }
    }
}

impl fmt::Display for EncodingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncodingKind {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float32" | "float" | "real" => Ok(EncodingKind::Float32),
            "int32" | "int" | "integer" => Ok(EncodingKind::Int32),
            "bool32" | "bool" | "boolean" => Ok(EncodingKind::Bool32),
            _ => Err(TelemetryError::UnsupportedKind(s.to_string())),
        }
    }
}

/// Word order is low word first: `registers[0]` holds the low 16 bits.
/// Integers truncate toward zero and any non-zero boolean encodes as 1.
pub fn encode(value: f64, kind: EncodingKind) -> Result<[u16; 2], TelemetryError> {
    let bits = match kind {
        EncodingKind::Float32 => (value as f32).to_bits(),
        EncodingKind::Int32 => {
            let truncated = value.trunc();
            if !truncated.is_finite()
                || truncated < i32::MIN as f64
                || truncated > i32::MAX as f64
            {
                return Err(TelemetryError::InvalidData(format!(
                    "{} does not fit a 32-bit integer register pair",
                    value
                )));
            }
            truncated as i32 as u32
        }
        EncodingKind::Bool32 => {
            if value.is_nan() {
                return Err(TelemetryError::InvalidData(
                    "NaN is not a boolean".to_string(),
                ));
            }
            u32::from(value != 0.0)
        }
    };
    Ok(split_words(bits))
}

pub fn decode(registers: [u16; 2], kind: EncodingKind) -> f64 {
    let bits = join_words(registers);
    match kind {
        EncodingKind::Float32 => f32::from_bits(bits) as f64,
        EncodingKind::Int32 => bits as i32 as f64,
        EncodingKind::Bool32 => {
            if bits as i32 != 0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

pub fn decode_slice(registers: &[u16], kind: EncodingKind) -> Result<f64, TelemetryError> {
    let pair: [u16; 2] = registers.try_into().map_err(|_| {
        TelemetryError::InvalidData(format!(
            "Expected {} registers, got {}",
            REGISTERS_PER_VALUE,
            registers.len()
        ))
    })?;
    Ok(decode(pair, kind))
}

fn split_words(bits: u32) -> [u16; 2] {
    let high = (bits >> 16) as u16;
    let low = (bits & 0xFFFF) as u16;
    [low, high]
}

fn join_words(registers: [u16; 2]) -> u32 {
    let [low, high] = registers;
    ((high as u32) << 16) | low as u32
}
