pub mod client;
pub mod frame;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::{ModbusClientTrait, ModbusTcpClient, TcpConnector, TransportConnector};
pub use protocol::{ExceptionCode, ModbusRequest, ModbusResponse};
pub use server::ModbusTcpServer;
pub use store::RegisterStore;
