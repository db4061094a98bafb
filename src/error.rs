use std::path::PathBuf;

use thiserror::Error;

use crate::types::EntityId;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("edge stream header invalid: {reason}")]
    InvalidStreamHeader { reason: String },

    #[error("entity index invalid: {reason}")]
    InvalidEntityIndex { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("checkpoint {path:?} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("checkpoint does not match configuration: {reason}")]
    CheckpointMismatch { reason: String },

    #[error("spool {path:?} is corrupt at offset {offset}: {reason}")]
    SpoolCorrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("txId {tx_id} of entity {entity} exceeds max temporal key {max}")]
    TemporalKeyOverflow {
        entity: EntityId,
        tx_id: u64,
        max: u64,
    },

    #[error("sequence artifact {path:?} invalid: {reason}")]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("workspace lock unavailable: {0}")]
    Lock(String),

    #[error("encode failed: {source}")]
    Encode {
        #[from]
        source: bincode::error::EncodeError,
    },

    #[error("decode failed: {source}")]
    Decode {
        #[from]
        source: bincode::error::DecodeError,
    },

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("zip error: {source}")]
    Zip {
        #[from]
        source: zip::result::ZipError,
    },
}

impl PipelineError {
    /// Whether the error must abort the run rather than being counted against one entity.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::SpoolCorrupt { .. } | Self::TemporalKeyOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
