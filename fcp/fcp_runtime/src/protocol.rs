use crate::error::FcpError;
use crate::schema::{DynamicUiPacket, EventPayload, LayoutUpdate, StateUpdate, UnknownCatalogError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;

pub const CLIENT_TO_SERVER_CAP: usize = 65_536;
pub const SERVER_TO_CLIENT_CAP: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "camelCase")]
pub enum ClientEnvelope {
    Ready {
        sid: String,
        capabilities: Value,
    },
    Event {
        sid: String,
        id: u64,
        payload: EventPayload,
    },
    Ack {
        sid: String,
        rev: u64,
    },
    #[serde(rename_all = "camelCase")]
    Rejected {
        sid: String,
        rev: u64,
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op_index: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "camelCase")]
pub enum ServerEnvelope {
    Packet {
        sid: String,
        rev: u64,
        packet: DynamicUiPacket,
    },
    StateUpdate {
        sid: String,
        rev: u64,
        update: StateUpdate,
    },
    LayoutUpdate {
        sid: String,
        rev: u64,
        update: LayoutUpdate,
    },
    UnknownCatalog {
        sid: String,
        error: UnknownCatalogError,
    },
    Error {
        sid: String,
        #[serde(default)]
        rev: Option<u64>,
        code: String,
        message: String,
    },
}

impl ServerEnvelope {
    pub fn sid(&self) -> &str {
        match self {
            Self::Packet { sid, .. }
            | Self::StateUpdate { sid, .. }
            | Self::LayoutUpdate { sid, .. }
            | Self::UnknownCatalog { sid, .. }
            | Self::Error { sid, .. } => sid,
        }
    }

    pub fn rev(&self) -> Option<u64> {
        match self {
            Self::Packet { rev, .. }
            | Self::StateUpdate { rev, .. }
            | Self::LayoutUpdate { rev, .. } => Some(*rev),
            Self::Error { rev, .. } => *rev,
            Self::UnknownCatalog { .. } => None,
        }
    }
}

pub fn ready_envelope(sid: String) -> ClientEnvelope {
    ClientEnvelope::Ready {
        sid,
        capabilities: serde_json::json!({
            "formatVersion": crate::schema::FORMAT_VERSION,
            "transport": "stdio-packet-4"
        }),
    }
}

pub fn event_envelope(sid: String, id: u64, payload: EventPayload) -> ClientEnvelope {
    ClientEnvelope::Event { sid, id, payload }
}

pub fn ack_envelope(sid: String, rev: u64) -> ClientEnvelope {
    ClientEnvelope::Ack { sid, rev }
}

pub fn rejected_envelope(sid: String, rev: u64, err: &FcpError) -> ClientEnvelope {
    let op_index = match err {
        FcpError::Update(update) => update.op_index(),
        _ => None,
    };
    ClientEnvelope::Rejected {
        sid,
        rev,
        code: err.code().to_string(),
        message: err.to_string(),
        op_index,
    }
}

pub fn writer_loop<W: Write>(mut writer: W, rx: Receiver<ClientEnvelope>) -> io::Result<()> {
    for envelope in rx {
        let payload = encode_client_envelope(&envelope)?;
        write_frame(&mut writer, &payload, CLIENT_TO_SERVER_CAP)?;
        writer.flush()?;
    }

    Ok(())
}

/// Read server frames until EOF. Frames that do not decode are handed to the
/// callback as errors so the caller can discard them and keep reading.
pub fn reader_loop<R, F>(mut reader: R, mut on_envelope: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(Result<ServerEnvelope, FcpError>),
{
    loop {
        match read_frame(&mut reader, SERVER_TO_CLIENT_CAP) {
            Ok(payload) => on_envelope(decode_server_envelope(&payload)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

pub fn encode_client_envelope(envelope: &ClientEnvelope) -> io::Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(json_error)
}

pub fn decode_server_envelope(payload: &[u8]) -> Result<ServerEnvelope, FcpError> {
    Ok(serde_json::from_slice(payload)?)
}

pub fn read_frame(reader: &mut impl Read, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} > {max_payload}"),
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    if payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", payload.len(), max_payload),
        ));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32"))?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

fn json_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
