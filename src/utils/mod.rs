pub mod error;

pub use error::TelemetryError;
