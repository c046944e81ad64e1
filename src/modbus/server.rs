use bytes::{Bytes, BytesMut};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::frame::{read_adu, Adu};
use super::protocol::{ModbusRequest, ModbusResponse};
use super::store::RegisterStore;
use crate::utils::error::TelemetryError;

// Every unit id is answered from the same store.
#[derive(Clone)]
pub struct ModbusTcpServer {
    store: Arc<RegisterStore>,
}

impl ModbusTcpServer {
    pub fn new(store: Arc<RegisterStore>) -> Self {
        Self { store }
    }

    pub async fn bind(address: &str) -> Result<TcpListener, TelemetryError> {
        TcpListener::bind(address).await.map_err(|e| {
            TelemetryError::ConnectionError(format!("Failed to bind Modbus server on {}: {}", address, e))
        })
    }

    pub async fn serve(self, listener: TcpListener, token: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("📡 Modbus TCP server listening on {}", addr),
            Err(e) => warn!("Modbus TCP server listening on unknown address: {}", e),
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("🛑 Modbus TCP server stopped");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("🔗 Modbus client connected: {}", peer);
                        let server = self.clone();
                        let token = token.child_token();
                        tokio::spawn(async move {
                            server.handle_client(stream, peer, token).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept Modbus connection: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr, token: CancellationToken) {
        loop {
            let adu = tokio::select! {
                _ = token.cancelled() => break,
                adu = read_adu(&mut stream) => adu,
            };

            let request = match adu {
                Ok(Some(request)) => request,
                Ok(None) => {
                    info!("Modbus client disconnected: {}", peer);
                    break;
                }
                Err(e) => {
                    warn!("Dropping Modbus client {}: {}", peer, e);
                    break;
                }
            };

            let reply = Adu::new(request.header, self.respond(request.pdu));
            if let Err(e) = stream.write_all(&reply.to_bytes()).await {
                warn!("Failed to answer Modbus client {}: {}", peer, e);
                break;
            }
        }
    }

    fn respond(&self, pdu: Bytes) -> Bytes {
        let response = match ModbusRequest::decode(pdu) {
            Ok(request) => self.execute(request),
            Err(rejection) => ModbusResponse::Exception {
                function: rejection.function,
                code: rejection.code,
            },
        };

        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        buf.freeze()
    }

    pub(crate) fn execute(&self, request: ModbusRequest) -> ModbusResponse {
        let function = request.function_code();
        let result = match request {
            ModbusRequest::ReadHoldingRegisters { start, quantity } => self
                .store
                .read(start, quantity)
                .map(ModbusResponse::ReadHoldingRegisters),
            ModbusRequest::WriteSingleRegister { address, value } => self
                .store
                .write(address, &[value])
                .map(|_| ModbusResponse::WriteSingleRegister { address, value }),
            ModbusRequest::WriteMultipleRegisters { start, values } => self
                .store
                .write(start, &values)
                .map(|_| ModbusResponse::WriteMultipleRegisters {
                    start,
                    quantity: values.len() as u16,
                }),
        };

        result.unwrap_or_else(|code| ModbusResponse::Exception { function, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::protocol::{ExceptionCode, FC_READ_HOLDING_REGISTERS};

    #[test]
    fn test_execute_reads_and_writes_store() {
        let store = Arc::new(RegisterStore::new(20));
        let server = ModbusTcpServer::new(Arc::clone(&store));

        let written = server.execute(ModbusRequest::WriteSingleRegister { address: 3, value: 7 });
        assert_eq!(written, ModbusResponse::WriteSingleRegister { address: 3, value: 7 });

        let read = server.execute(ModbusRequest::ReadHoldingRegisters { start: 2, quantity: 2 });
        assert_eq!(read, ModbusResponse::ReadHoldingRegisters(vec![0, 7]));
    }

    #[test]
    fn test_execute_out_of_range_is_exception() {
        let server = ModbusTcpServer::new(Arc::new(RegisterStore::new(20)));
        let response = server.execute(ModbusRequest::ReadHoldingRegisters { start: 19, quantity: 2 });
        assert_eq!(
            response,
            ModbusResponse::Exception {
                function: FC_READ_HOLDING_REGISTERS,
                code: ExceptionCode::IllegalDataAddress
            }
        );
    }

    #[test]
    fn test_unknown_function_answers_illegal_function() {
        let server = ModbusTcpServer::new(Arc::new(RegisterStore::new(20)));
        let reply = server.respond(Bytes::from_static(&[0x01, 0x00, 0x00, 0x00, 0x08]));
        assert_eq!(&reply[..], &[0x81, 0x01]);
    }
}
