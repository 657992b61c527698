//! HTTP bodies for the generation server and the JSONL chunk stream it returns.
//!
//! Each streamed line is one [`GenerationChunk`]. A chunk carries tool requests
//! in the order the model issued them; consumers turn each surface write into
//! one ordered message for the update queue.

use crate::error::{FcpError, FcpResult};
use crate::protocol::ServerEnvelope;
use crate::schema::{CatalogAdditions, CatalogReference, EventPayload, WidgetCatalog};
use crate::session::ServerResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const START_SESSION_PATH: &str = "/startSession";
pub const GENERATE_UI_PATH: &str = "/generateUi";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_reference: Option<CatalogReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_additions: Option<CatalogAdditions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_catalog: Option<WidgetCatalog>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessagePart {
    Text { text: String },
    UiEvent { event: EventPayload },
    #[serde(rename_all = "camelCase")]
    Ui { surface_id: String, definition: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateUiRequest {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolName {
    AddOrUpdateSurface,
    DeleteSurface,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub name: ToolName,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GenerationChunk {
    #[serde(rename_all = "camelCase")]
    ToolRequest { tool_requests: Vec<ToolRequest> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceAction {
    AddOrUpdate {
        surface_id: String,
        definition: ServerResponse,
    },
    Delete {
        surface_id: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddOrUpdateInput {
    surface_id: String,
    definition: ServerResponse,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteInput {
    surface_id: String,
}

impl ToolRequest {
    pub fn action(&self) -> FcpResult<SurfaceAction> {
        Ok(match self.name {
            ToolName::AddOrUpdateSurface => {
                let input = AddOrUpdateInput::deserialize(&self.input)?;
                SurfaceAction::AddOrUpdate {
                    surface_id: input.surface_id,
                    definition: input.definition,
                }
            }
            ToolName::DeleteSurface => {
                let input = DeleteInput::deserialize(&self.input)?;
                SurfaceAction::Delete {
                    surface_id: input.surface_id,
                }
            }
        })
    }
}

/// Splits a byte stream into JSONL chunks. Bytes may arrive in arbitrary
/// pieces; a chunk is emitted once its terminating newline has been seen.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<FcpResult<GenerationChunk>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(chunk) = decode_line(&line[..pos]) {
                out.push(chunk);
            }
        }
        out
    }

    /// Decode whatever remains after the stream closed without a final newline.
    pub fn finish(mut self) -> Option<FcpResult<GenerationChunk>> {
        let rest = std::mem::take(&mut self.buf);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<FcpResult<GenerationChunk>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(serde_json::from_slice(line).map_err(FcpError::from))
}

/// Numbers surface writes for the client update queue.
#[derive(Debug, Clone)]
pub struct SurfaceSequencer {
    sid: String,
    next_rev: u64,
}

impl SurfaceSequencer {
    pub fn new(sid: impl Into<String>, first_rev: u64) -> Self {
        Self {
            sid: sid.into(),
            next_rev: first_rev,
        }
    }

    /// Envelopes for every surface write in `chunk`, in request order.
    /// Deletions carry no envelope and are only logged.
    pub fn envelopes(&mut self, chunk: &GenerationChunk) -> FcpResult<Vec<ServerEnvelope>> {
        let GenerationChunk::ToolRequest { tool_requests } = chunk;
        let mut out = Vec::with_capacity(tool_requests.len());
        for request in tool_requests {
            match request.action()? {
                SurfaceAction::AddOrUpdate { surface_id, definition } => {
                    tracing::debug!(%surface_id, rev = self.next_rev, "surface write");
                    out.push(self.envelope(definition));
                }
                SurfaceAction::Delete { surface_id } => {
                    tracing::info!(%surface_id, "surface deleted");
                }
            }
        }
        Ok(out)
    }

    fn envelope(&mut self, definition: ServerResponse) -> ServerEnvelope {
        let sid = self.sid.clone();
        match definition {
            ServerResponse::Packet(packet) => ServerEnvelope::Packet {
                sid,
                rev: self.bump(),
                packet,
            },
            ServerResponse::StateUpdate(update) => ServerEnvelope::StateUpdate {
                sid,
                rev: self.bump(),
                update,
            },
            ServerResponse::LayoutUpdate(update) => ServerEnvelope::LayoutUpdate {
                sid,
                rev: self.bump(),
                update,
            },
            ServerResponse::UnknownCatalog(error) => ServerEnvelope::UnknownCatalog { sid, error },
        }
    }

    fn bump(&mut self) -> u64 {
        let rev = self.next_rev;
        self.next_rev += 1;
        rev
    }
}
