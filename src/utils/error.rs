use thiserror::Error;

use crate::modbus::protocol::ExceptionCode;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("Register map is empty: no active parameter mappings")]
    EmptyMap,

    #[error("Register overlap at address {address}: {first} and {second}")]
    RegisterOverlap {
        address: u16,
        first: String,
        second: String,
    },

    #[error("Modbus exception: {0}")]
    Exception(ExceptionCode),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unsupported encoding kind: {0}")]
    UnsupportedKind(String),

    #[error("Timestamp invariant violated: {0}")]
    TimestampInvariantViolation(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for TelemetryError {
    fn from(err: sqlx::Error) -> Self {
        TelemetryError::StorageError(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        TelemetryError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for TelemetryError {
    fn from(err: std::io::Error) -> Self {
        TelemetryError::ConnectionError(format!("IO error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for TelemetryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TelemetryError::Timeout
    }
}

impl From<toml::de::Error> for TelemetryError {
    fn from(err: toml::de::Error) -> Self {
        TelemetryError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for TelemetryError {
    fn from(err: toml::ser::Error) -> Self {
        TelemetryError::ConfigError(format!("TOML write error: {}", err))
    }
}
