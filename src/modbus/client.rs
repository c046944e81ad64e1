use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, info, trace};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::frame::{read_adu, Adu, MbapHeader};
use super::protocol::{ModbusRequest, ModbusResponse, MAX_READ_QUANTITY, MAX_WRITE_QUANTITY};
use crate::utils::error::TelemetryError;

#[async_trait]
pub trait ModbusClientTrait: Send + Sync {
    async fn read_holding_registers(
        &self,
        start_addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, TelemetryError>;

    async fn write_multiple_registers(
        &self,
        start_addr: u16,
        values: &[u16],
    ) -> Result<(), TelemetryError>;

    async fn close(&self) {}
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    type Client: ModbusClientTrait;

    async fn connect(&self) -> Result<Self::Client, TelemetryError>;
}

pub struct ModbusTcpClient {
    stream: Mutex<Option<TcpStream>>,
    address: String,
    unit_id: u8,
    timeout: Duration,
    transaction_id: AtomicU16,
}

impl ModbusTcpClient {
    pub async fn connect(
        address: &str,
        unit_id: u8,
        request_timeout: Duration,
    ) -> Result<Self, TelemetryError> {
        debug!("Connecting to Modbus TCP server at {}", address);

        let stream = match timeout(request_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TelemetryError::ConnectionError(format!(
                    "Failed to connect to {}: {}",
                    address, e
                )))
            }
            Err(_) => {
                return Err(TelemetryError::ConnectionError(format!(
                    "Connection to {} timed out after {} ms",
                    address,
                    request_timeout.as_millis()
                )))
            }
        };
        stream.set_nodelay(true)?;

        info!("🔌 Connected to Modbus TCP server at {}", address);
        Ok(Self {
            stream: Mutex::new(Some(stream)),
            address: address.to_string(),
            unit_id,
            timeout: request_timeout,
            transaction_id: AtomicU16::new(0),
        })
    }

    async fn transact(&self, request: ModbusRequest) -> Result<ModbusResponse, TelemetryError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| {
            TelemetryError::ConnectionError(format!("Connection to {} is closed", self.address))
        })?;

        let transaction_id = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        let mut pdu = BytesMut::new();
        request.encode(&mut pdu);
        let adu = Adu::new(
            MbapHeader {
                transaction_id,
                unit_id: self.unit_id,
            },
            pdu.freeze(),
        );
        let wire = adu.to_bytes();
        trace!("Modbus TX [{}] {}", transaction_id, hex::encode(&wire));

        let reply = timeout(self.timeout, async {
            stream.write_all(&wire).await?;
            read_adu(stream).await
        })
        .await??;

        let reply = reply.ok_or_else(|| {
            TelemetryError::ConnectionError(format!("Connection closed by {}", self.address))
        })?;

        if reply.header.transaction_id != transaction_id {
            return Err(TelemetryError::ConnectionError(format!(
                "Transaction id mismatch: sent {}, received {}",
                transaction_id, reply.header.transaction_id
            )));
        }

        match ModbusResponse::decode(reply.pdu, &request)? {
            ModbusResponse::Exception { code, .. } => Err(TelemetryError::Exception(code)),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl ModbusClientTrait for ModbusTcpClient {
    async fn read_holding_registers(
        &self,
        start_addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, TelemetryError> {
        if count == 0 || count > MAX_READ_QUANTITY {
            return Err(TelemetryError::InvalidData(format!(
                "Cannot read {} registers in one request",
                count
            )));
        }

        match self
            .transact(ModbusRequest::ReadHoldingRegisters {
                start: start_addr,
                quantity: count,
            })
            .await?
        {
            ModbusResponse::ReadHoldingRegisters(values) => Ok(values),
            other => Err(TelemetryError::Transport(format!(
                "Unexpected response to read request: {:?}",
                other
            ))),
        }
    }

    async fn write_multiple_registers(
        &self,
        start_addr: u16,
        values: &[u16],
    ) -> Result<(), TelemetryError> {
        if values.is_empty() || values.len() > MAX_WRITE_QUANTITY as usize {
            return Err(TelemetryError::InvalidData(format!(
                "Cannot write {} registers in one request",
                values.len()
            )));
        }

        match self
            .transact(ModbusRequest::WriteMultipleRegisters {
                start: start_addr,
                values: values.to_vec(),
            })
            .await?
        {
            ModbusResponse::WriteMultipleRegisters { start, quantity }
                if start == start_addr && quantity as usize == values.len() =>
            {
                Ok(())
            }
            other => Err(TelemetryError::Transport(format!(
                "Unexpected response to write request: {:?}",
                other
            ))),
        }
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
            debug!("Disconnected from Modbus TCP server at {}", self.address);
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub address: String,
    pub unit_id: u8,
    pub request_timeout: Duration,
}

#[async_trait]
impl TransportConnector for TcpConnector {
    type Client = ModbusTcpClient;

    async fn connect(&self) -> Result<Self::Client, TelemetryError> {
        ModbusTcpClient::connect(&self.address, self.unit_id, self.request_timeout).await
    }
}
