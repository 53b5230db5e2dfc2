//! Upload control-channel protocol.
//!
//! Every WebSocket frame is a MessagePack map whose `command` field names the
//! variant. Payload bytes travel as MessagePack `bin`, never as integer
//! arrays, which is what browser msgpack encoders emit for `Uint8Array`.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Announce a new object and hand over its encryption header.
    AddHeader {
        container: String,
        object: String,
        /// Project name used as the key-management namespace.
        #[serde(default)]
        name: String,
        total: u64,
        #[serde(default)]
        data: Option<ByteBuf>,
        #[serde(default)]
        owner: Option<String>,
        #[serde(default)]
        owner_name: Option<String>,
    },
    AddChunk {
        container: String,
        object: String,
        order: u64,
        data: ByteBuf,
    },
    AddChunks {
        container: String,
        object: String,
        chunks: Vec<ChunkPayload>,
    },
    Finish {
        container: String,
        object: String,
    },
    Cancel {
        container: String,
        object: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChunkPayload {
    pub order: u64,
    pub data: ByteBuf,
}

impl ClientCommand {
    /// `(container, object)` the command refers to.
    pub fn target(&self) -> (&str, &str) {
        match self {
            Self::AddHeader {
                container, object, ..
            }
            | Self::AddChunk {
                container, object, ..
            }
            | Self::AddChunks {
                container, object, ..
            }
            | Self::Finish { container, object }
            | Self::Cancel { container, object } => (container, object),
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Containers and header are in place; the client may stream chunks.
    StartUpload { container: String, object: String },
    /// The server has room for another chunk.
    Next { container: String, object: String },
    /// Chunk `order` has not arrived in time; send it again.
    RetryChunk {
        container: String,
        object: String,
        order: u64,
    },
    /// Every segment has been written; the client may send `finish`.
    Success { container: String, object: String },
    /// The manifest is written and the object is committed.
    Done { container: String, object: String },
    /// The upload failed or was cancelled.
    Abort {
        container: String,
        object: String,
        reason: String,
    },
}

impl ServerEvent {
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

impl ClientCommand {
    pub fn decode(frame: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(frame)
    }
}
