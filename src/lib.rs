pub mod catalog;
pub mod cli;
pub mod config;
pub mod modbus;
pub mod registers;
pub mod services;
pub mod storage;
pub mod telemetry;
pub mod utils;

// Re-export commonly used types
pub use catalog::{standard_catalog, Parameter};
pub use config::Config;
pub use modbus::{ModbusTcpClient, ModbusTcpServer, RegisterStore};
pub use registers::{EncodingKind, RegisterMap, SharedRegisterMap};
pub use services::{GatewayRelay, IngestionPipeline, ReconnectPolicy};
pub use storage::{ReadingBatch, SqliteManager};
pub use telemetry::{TelemetryFrame, TelemetrySource};
pub use utils::error::TelemetryError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
