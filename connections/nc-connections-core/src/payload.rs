//! Payload data model (spec §3 "Payload", §4.7).

use bytes::Bytes;
use nc_codec::frame::PayloadType;
use std::path::PathBuf;

/// Client-generated, globally unique per direction per endpoint (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId(pub i64);

/// The body a payload carries; `id`/`type` are mirrored onto the wire
/// header, `body` is resolved locally.
pub enum PayloadBody {
    Bytes(Bytes),
    Stream(Box<dyn std::io::Read + Send>),
    File { path: PathBuf, total_size: i64 },
}

impl std::fmt::Debug for PayloadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            PayloadBody::Stream(_) => f.write_str("Stream(..)"),
            PayloadBody::File { path, total_size } => f
                .debug_struct("File")
                .field("path", path)
                .field("total_size", total_size)
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct Payload {
    pub id: PayloadId,
    pub r#type: PayloadType,
    pub body: PayloadBody,
}

impl Payload {
    pub fn bytes(id: PayloadId, data: Bytes) -> Self {
        Self {
            id,
            r#type: PayloadType::Bytes,
            body: PayloadBody::Bytes(data),
        }
    }

    pub fn file(id: PayloadId, path: PathBuf, total_size: i64) -> Self {
        Self {
            id,
            r#type: PayloadType::File,
            body: PayloadBody::File { path, total_size },
        }
    }

    pub fn stream(id: PayloadId, reader: Box<dyn std::io::Read + Send>) -> Self {
        Self {
            id,
            r#type: PayloadType::Stream,
            body: PayloadBody::Stream(reader),
        }
    }
}

/// Observable lifecycle of a payload transfer (spec §4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadState {
    InProgress,
    Success,
    Failure,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadProgress {
    pub payload_id: PayloadId,
    pub status: PayloadState,
    pub bytes_transferred: i64,
    pub total: i64,
}
