
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::utils::error::TelemetryError;

pub const MBAP_HEADER_LEN: usize = 7;
const MODBUS_PROTOCOL_ID: u16 = 0;
const MAX_PDU_LEN: usize = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub unit_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    pub header: MbapHeader,
    pub pdu: Bytes,
}

impl Adu {
    pub fn new(header: MbapHeader, pdu: Bytes) -> Self {
        Self { header, pdu }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + self.pdu.len());
        buf.put_u16(self.header.transaction_id);
        buf.put_u16(MODBUS_PROTOCOL_ID);
        buf.put_u16((self.pdu.len() + 1) as u16);
        buf.put_u8(self.header.unit_id);
        buf.put_slice(&self.pdu);
        buf.freeze()
    }
}

/// Reads one ADU. Returns `Ok(None)` when the peer closed the connection
/// cleanly before the next header.
pub async fn read_adu<R>(reader: &mut R) -> Result<Option<Adu>, TelemetryError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; MBAP_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut head = &header[..];
    let transaction_id = head.get_u16();
    let protocol_id = head.get_u16();
    let length = head.get_u16() as usize;
    let unit_id = head.get_u8();

    if protocol_id != MODBUS_PROTOCOL_ID {
        return Err(TelemetryError::ConnectionError(format!(
            "Unexpected protocol id {} in MBAP header",
            protocol_id
        )));
    }
    if length < 2 || length - 1 > MAX_PDU_LEN {
        return Err(TelemetryError::ConnectionError(format!(
            "Invalid MBAP length field: {}",
            length
        )));
    }

    let mut pdu = vec![0u8; length - 1];
    reader.read_exact(&mut pdu).await?;

    if log::log_enabled!(log::Level::Trace) {
        trace!("Modbus RX [{}] {}{}", transaction_id, hex::encode(header), hex::encode(&pdu));
    }

    Ok(Some(Adu::new(
        MbapHeader {
            transaction_id,
            unit_id,
        },
        Bytes::from(pdu),
    )))
}
