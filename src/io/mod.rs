//! On-disk formats: the edge stream, spools, checkpoints, sequence bundles and
//! the workspace lock.

pub mod artifact;
pub mod checkpoint;
pub mod lock;
pub mod spool;
pub mod stream;

pub use artifact::bundle_path;
pub use checkpoint::{
    CadencedCheckpoint, CheckpointFile, CheckpointManager, CheckpointPayload,
    SequenceCheckpointManager,
};
pub use lock::WorkspaceLock;
pub use spool::{FlushStats, SpoolRead, SpoolStore};
pub use stream::{EdgeChunk, StreamScanner, StreamSchema};
