//! Atomically replaced checkpoint files for both pipeline phases.
//!
//! Each file is a checksummed envelope around a bincode payload:
//!
//! ```text
//! [magic 4][version u16][kind u8][reserved u8][payload_len u64][blake3 32][payload]
//! ```
//!
//! Files are written through `atomic-write-file`, so a crash mid-save leaves the
//! previous checkpoint intact. A file that exists but fails validation is never
//! guessed at: loading it is a fatal [`PipelineError::CheckpointCorrupt`].

use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use atomic_write_file::AtomicWriteFile;
use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::constants::{
    CHECKPOINT_MAGIC, CHECKPOINT_VERSION, SCAN_CHECKPOINT_FILE, SEQUENCE_CHECKPOINT_FILE,
};
use crate::error::{PipelineError, Result};
use crate::types::{ScanCheckpoint, SequenceCheckpoint};

// [magic: 4][version: 2][kind: 1][reserved: 1][payload_len: 8][checksum: 32]
const ENVELOPE_HEADER_SIZE: usize = 48;

fn checkpoint_config() -> impl Config {
    config::standard()
        .with_fixed_int_encoding()
        .with_little_endian()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// A value that can be stored in a [`CheckpointFile`].
pub trait CheckpointPayload: Serialize + DeserializeOwned + Default {
    /// Distinguishes payload types so one checkpoint is never read as the other.
    const KIND: u8;
    const NAME: &'static str;
    /// File name inside the checkpoint directory.
    const FILE_NAME: &'static str;

    fn stamp(&mut self, unix_secs: u64);

    /// Units of work the checkpoint covers, for logging.
    fn progress(&self) -> u64;

    fn is_complete(&self) -> bool;
}

impl CheckpointPayload for ScanCheckpoint {
    const KIND: u8 = 1;
    const NAME: &'static str = "scan";
    const FILE_NAME: &'static str = SCAN_CHECKPOINT_FILE;

    fn stamp(&mut self, unix_secs: u64) {
        self.updated_at = unix_secs;
    }

    fn progress(&self) -> u64 {
        self.last_chunk_index
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

impl CheckpointPayload for SequenceCheckpoint {
    const KIND: u8 = 2;
    const NAME: &'static str = "sequence";
    const FILE_NAME: &'static str = SEQUENCE_CHECKPOINT_FILE;

    fn stamp(&mut self, unix_secs: u64) {
        self.updated_at = unix_secs;
    }

    fn progress(&self) -> u64 {
        self.processed.len() as u64
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointFile<T> {
    path: PathBuf,
    _payload: PhantomData<T>,
}

impl<T: CheckpointPayload> CheckpointFile<T> {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _payload: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no checkpoint has ever been saved.
    pub fn load(&self) -> Result<Option<T>> {
        let bytes = match fs_err::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        self.decode(&bytes).map(Some)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        let corrupt = |reason: String| PipelineError::CheckpointCorrupt {
            path: self.path.clone(),
            reason,
        };
        if bytes.len() < ENVELOPE_HEADER_SIZE {
            return Err(corrupt(format!("{} bytes is shorter than the envelope", bytes.len())));
        }
        let (header, payload) = bytes.split_at(ENVELOPE_HEADER_SIZE);
        if header[..4] != CHECKPOINT_MAGIC {
            return Err(corrupt("bad magic".into()));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != CHECKPOINT_VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        if header[6] != T::KIND {
            return Err(corrupt(format!("not a {} checkpoint", T::NAME)));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&header[8..16]);
        let declared = u64::from_le_bytes(len);
        if declared != payload.len() as u64 {
            return Err(corrupt(format!(
                "payload length {} differs from declared {declared}",
                payload.len()
            )));
        }
        if blake3::hash(payload).as_bytes()[..] != header[16..48] {
            return Err(corrupt("checksum mismatch".into()));
        }
        let (value, consumed) = decode_from_slice(payload, checkpoint_config())
            .map_err(|err| corrupt(format!("payload decode failed: {err}")))?;
        if consumed != payload.len() {
            return Err(corrupt("trailing bytes after payload".into()));
        }
        Ok(value)
    }

    /// Replace the checkpoint atomically and durably.
    pub fn save(&self, value: &T) -> Result<()> {
        let payload = encode_to_vec(value, checkpoint_config())?;
        let digest = blake3::hash(&payload);
        let mut header = [0u8; ENVELOPE_HEADER_SIZE];
        header[..4].copy_from_slice(&CHECKPOINT_MAGIC);
        header[4..6].copy_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        header[6] = T::KIND;
        header[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        header[16..48].copy_from_slice(digest.as_bytes());

        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut file = AtomicWriteFile::options().open(&self.path)?;
        file.write_all(&header)?;
        file.write_all(&payload)?;
        file.commit()?;
        Ok(())
    }
}

/// Phase progress persisted every `every` recorded units (chunks or entities).
#[derive(Debug)]
pub struct CadencedCheckpoint<T> {
    file: CheckpointFile<T>,
    every: u64,
    since_save: u64,
}

/// Extraction progress, saved every `every` chunks.
pub type CheckpointManager = CadencedCheckpoint<ScanCheckpoint>;

/// Windowing progress, saved every `every` finalized entities.
pub type SequenceCheckpointManager = CadencedCheckpoint<SequenceCheckpoint>;

impl<T: CheckpointPayload> CadencedCheckpoint<T> {
    pub fn new(dir: &Path, every: u64) -> Self {
        Self {
            file: CheckpointFile::new(dir.join(T::FILE_NAME)),
            every: every.max(1),
            since_save: 0,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The last durable checkpoint, or the zero-state sentinel when none exists.
    pub fn load(&self) -> Result<T> {
        let checkpoint = self.file.load()?;
        if let Some(found) = &checkpoint {
            tracing::info!(
                target: "edgeseq::checkpoint",
                kind = T::NAME,
                progress = found.progress(),
                complete = found.is_complete(),
                "checkpoint loaded"
            );
        }
        Ok(checkpoint.unwrap_or_default())
    }

    /// Persist `checkpoint`. Data it claims must already be durable.
    pub fn save(&mut self, checkpoint: &mut T) -> Result<()> {
        checkpoint.stamp(unix_now());
        self.file.save(checkpoint)?;
        self.since_save = 0;
        tracing::debug!(
            target: "edgeseq::checkpoint",
            kind = T::NAME,
            progress = checkpoint.progress(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Count one finished unit; returns `true` when a save is due.
    pub fn record(&mut self) -> bool {
        self.since_save += 1;
        self.is_due()
    }

    #[must_use]
    pub fn is_due(&self) -> bool {
        self.since_save >= self.every
    }

    pub fn has_unsaved(&self) -> bool {
        self.since_save > 0
    }
}
