//! Per-entity, per-direction append-only spool files.
//!
//! Layout of every spool:
//!
//! ```text
//! [magic 4][version u16][direction u8][reserved u8][feature_width u32][entity u64]
//! [ordinal u64][tx_id u64][feature f32 * W][checksum 8]   repeated
//! ```
//!
//! All integers are little-endian. The checksum is the first eight bytes of the
//! blake3 digest of the record payload. Records are fixed-size, so a torn tail
//! left by a crash is detected by length and truncated before the next append.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;

use crate::constants::{
    SPOOL_HEADER_SIZE, SPOOL_MAGIC, SPOOL_RECORD_CHECKSUM_LEN, SPOOL_SHARDS, SPOOL_VERSION,
};
use crate::error::{PipelineError, Result};
use crate::types::{Direction, EntityId, EntityIndex, SpoolEntry};

// [ordinal: u64][tx_id: u64]
const RECORD_PREFIX_SIZE: usize = 16;

/// Bytes per spool record for a given feature width.
#[must_use]
pub fn record_size(feature_width: usize) -> usize {
    RECORD_PREFIX_SIZE + feature_width * 4 + SPOOL_RECORD_CHECKSUM_LEN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SpoolHeader {
    direction: Direction,
    feature_width: u32,
    entity: EntityId,
}

impl SpoolHeader {
    fn encode(&self) -> [u8; SPOOL_HEADER_SIZE] {
        let mut bytes = [0u8; SPOOL_HEADER_SIZE];
        bytes[..4].copy_from_slice(&SPOOL_MAGIC);
        bytes[4..6].copy_from_slice(&SPOOL_VERSION.to_le_bytes());
        bytes[6] = self.direction.code();
        bytes[8..12].copy_from_slice(&self.feature_width.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.entity.0.to_le_bytes());
        bytes
    }

    fn verify(&self, bytes: &[u8], path: &Path) -> Result<()> {
        let corrupt = |reason: String| PipelineError::SpoolCorrupt {
            path: path.to_path_buf(),
            offset: 0,
            reason,
        };
        if bytes.len() < SPOOL_HEADER_SIZE {
            return Err(corrupt(format!("header truncated to {} bytes", bytes.len())));
        }
        let expected = self.encode();
        if bytes[..4] != SPOOL_MAGIC {
            return Err(corrupt("bad magic".into()));
        }
        if bytes[4..6] != expected[4..6] {
            return Err(corrupt("unsupported spool version".into()));
        }
        if bytes[6] != expected[6] {
            return Err(corrupt("direction does not match file location".into()));
        }
        if bytes[8..12] != expected[8..12] {
            return Err(corrupt(format!(
                "feature width differs from configured {}",
                self.feature_width
            )));
        }
        if bytes[12..20] != expected[12..20] {
            return Err(corrupt("entity does not match file name".into()));
        }
        Ok(())
    }
}

/// Outcome of one [`SpoolStore::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub spools_touched: u64,
    pub records_written: u64,
    pub bytes_written: u64,
    /// Spools whose torn tail or header was repaired before appending.
    pub tails_repaired: u64,
}

/// Entries recovered from one spool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpoolRead {
    /// Unique records in file order.
    pub entries: Vec<SpoolEntry>,
    /// Records dropped because their stream ordinal was already seen.
    pub duplicates: u64,
    /// Records dropped because of a checksum mismatch or a torn tail.
    pub corrupt: u64,
    pub exists: bool,
}

impl SpoolRead {
    #[must_use]
    pub fn max_tx_id(&self) -> Option<u64> {
        self.entries.iter().map(|entry| entry.tx_id).max()
    }
}

/// Owns the spool directory tree and buffers appends between flushes.
#[derive(Debug)]
pub struct SpoolStore {
    root: PathBuf,
    feature_width: usize,
    record_size: usize,
    sync: bool,
    pending: BTreeMap<(EntityId, Direction), Vec<u8>>,
    pending_records: u64,
    /// Spools written since the last [`SpoolStore::sync`].
    unsynced: BTreeSet<(EntityId, Direction)>,
}

impl SpoolStore {
    pub fn open(root: &Path, feature_width: usize, sync: bool) -> Result<Self> {
        if feature_width == 0 || u32::try_from(feature_width).is_err() {
            return Err(PipelineError::InvalidConfig {
                reason: format!("spool feature width {feature_width} out of range"),
            });
        }
        for direction in Direction::ALL {
            fs_err::create_dir_all(root.join(direction.label()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            feature_width,
            record_size: record_size(feature_width),
            sync,
            pending: BTreeMap::new(),
            pending_records: 0,
            unsynced: BTreeSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn feature_width(&self) -> usize {
        self.feature_width
    }

    #[must_use]
    pub fn spool_path(&self, entity: EntityId, direction: Direction) -> PathBuf {
        let shard = entity.0 % SPOOL_SHARDS;
        self.root
            .join(direction.label())
            .join(format!("{shard:03}"))
            .join(format!("entity_{entity}.spool"))
    }

    fn header_for(&self, entity: EntityId, direction: Direction) -> SpoolHeader {
        SpoolHeader {
            direction,
            // open() checked the width fits in u32
            feature_width: self.feature_width as u32,
            entity,
        }
    }

    /// Create an empty spool for every entity and direction that lacks one.
    /// Existing spools are never truncated. Returns the number created.
    pub fn initialize(&self, index: &EntityIndex) -> Result<u64> {
        let mut created = 0u64;
        for (_, entity) in index.iter() {
            for direction in Direction::ALL {
                let path = self.spool_path(entity, direction);
                if path.exists() {
                    continue;
                }
                if let Some(parent) = path.parent() {
                    fs_err::create_dir_all(parent)?;
                }
                let mut file = AtomicWriteFile::options().open(&path)?;
                file.write_all(&self.header_for(entity, direction).encode())?;
                file.commit()?;
                created += 1;
            }
        }
        tracing::info!(
            target: "edgeseq::spool",
            entities = index.len(),
            created,
            "spools initialized"
        );
        Ok(created)
    }

    /// Buffer one entry; nothing reaches disk until [`flush`](Self::flush).
    pub fn append(&mut self, entity: EntityId, direction: Direction, entry: &SpoolEntry) -> Result<()> {
        if entry.features.len() != self.feature_width {
            return Err(PipelineError::InvalidConfig {
                reason: format!(
                    "entry has {} features, spools hold {}",
                    entry.features.len(),
                    self.feature_width
                ),
            });
        }
        let buffer = self.pending.entry((entity, direction)).or_default();
        let start = buffer.len();
        buffer.extend_from_slice(&entry.ordinal.to_le_bytes());
        buffer.extend_from_slice(&entry.tx_id.to_le_bytes());
        for value in &entry.features {
            buffer.extend_from_slice(&value.to_le_bytes());
        }
        let digest = blake3::hash(&buffer[start..]);
        buffer.extend_from_slice(&digest.as_bytes()[..SPOOL_RECORD_CHECKSUM_LEN]);
        self.pending_records += 1;
        Ok(())
    }

    pub fn pending_records(&self) -> u64 {
        self.pending_records
    }

    /// Append every buffered record to its spool. On error the buffer is dropped;
    /// the caller must not checkpoint past the chunk that produced it.
    pub fn flush(&mut self) -> Result<FlushStats> {
        let pending = std::mem::take(&mut self.pending);
        self.pending_records = 0;
        let mut stats = FlushStats::default();
        for ((entity, direction), bytes) in pending {
            let path = self.spool_path(entity, direction);
            if self.append_to_spool(entity, direction, &path, &bytes)? {
                stats.tails_repaired += 1;
            }
            stats.spools_touched += 1;
            stats.records_written += (bytes.len() / self.record_size) as u64;
            stats.bytes_written += bytes.len() as u64;
            if self.sync {
                self.unsynced.insert((entity, direction));
            }
        }
        if stats.spools_touched > 0 {
            tracing::trace!(
                target: "edgeseq::spool",
                spools = stats.spools_touched,
                records = stats.records_written,
                bytes = stats.bytes_written,
                "spools flushed"
            );
        }
        Ok(stats)
    }

    fn append_to_spool(
        &self,
        entity: EntityId,
        direction: Direction,
        path: &Path,
        bytes: &[u8],
    ) -> Result<bool> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let header = self.header_for(entity, direction);
        let len = file.metadata()?.len();
        let mut repaired = false;

        if len < SPOOL_HEADER_SIZE as u64 {
            if len > 0 {
                tracing::warn!(
                    target: "edgeseq::spool",
                    path = %path.display(),
                    len,
                    "rewriting torn spool header"
                );
                repaired = true;
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.encode())?;
        } else {
            let mut existing = [0u8; SPOOL_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            std::io::Read::read_exact(&mut file, &mut existing)?;
            header.verify(&existing, path)?;

            let torn = (len - SPOOL_HEADER_SIZE as u64) % self.record_size as u64;
            if torn != 0 {
                tracing::warn!(
                    target: "edgeseq::spool",
                    path = %path.display(),
                    torn_bytes = torn,
                    "truncating torn spool tail"
                );
                file.set_len(len - torn)?;
                repaired = true;
            }
        }

        file.seek(SeekFrom::End(0))?;
        file.write_all(bytes)?;
        Ok(repaired)
    }

    /// fsync every spool written since the previous call. Must complete before a
    /// checkpoint that covers those writes is saved. A no-op when durability is
    /// disabled. Returns the number of spools synced.
    pub fn sync(&mut self) -> Result<u64> {
        let unsynced = std::mem::take(&mut self.unsynced);
        for (entity, direction) in &unsynced {
            let file = fs_err::OpenOptions::new()
                .write(true)
                .open(self.spool_path(*entity, *direction))?;
            file.sync_data()?;
        }
        Ok(unsynced.len() as u64)
    }

    /// Read every intact record of a spool, dropping replays and corrupt records.
    ///
    /// A missing spool reads as empty. A spool whose header is unreadable or
    /// belongs to another entity yields [`PipelineError::SpoolCorrupt`].
    pub fn read(&self, entity: EntityId, direction: Direction) -> Result<SpoolRead> {
        let path = self.spool_path(entity, direction);
        let bytes = match fs_err::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SpoolRead::default());
            }
            Err(err) => return Err(err.into()),
        };
        self.header_for(entity, direction).verify(&bytes, &path)?;

        let body = &bytes[SPOOL_HEADER_SIZE..];
        let records = body.chunks_exact(self.record_size);
        let torn = !records.remainder().is_empty();
        let payload_len = self.record_size - SPOOL_RECORD_CHECKSUM_LEN;

        let mut read = SpoolRead {
            exists: true,
            ..SpoolRead::default()
        };
        let mut seen = HashSet::new();
        for (position, record) in records.enumerate() {
            let (payload, checksum) = record.split_at(payload_len);
            if blake3::hash(payload).as_bytes()[..SPOOL_RECORD_CHECKSUM_LEN] != *checksum {
                tracing::warn!(
                    target: "edgeseq::spool",
                    path = %path.display(),
                    offset = (SPOOL_HEADER_SIZE + position * self.record_size) as u64,
                    "spool record checksum mismatch"
                );
                read.corrupt += 1;
                continue;
            }
            let entry = decode_payload(payload);
            if !seen.insert(entry.ordinal) {
                read.duplicates += 1;
                continue;
            }
            read.entries.push(entry);
        }
        if torn {
            tracing::warn!(
                target: "edgeseq::spool",
                path = %path.display(),
                torn_bytes = body.len() % self.record_size,
                "ignoring torn spool tail"
            );
            read.corrupt += 1;
        }
        Ok(read)
    }

    /// Delete both spools of an entity. Returns how many files were removed.
    pub fn remove(&self, entity: EntityId) -> Result<u64> {
        let mut removed = 0;
        for direction in Direction::ALL {
            match fs_err::remove_file(self.spool_path(entity, direction)) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }
}

fn decode_payload(payload: &[u8]) -> SpoolEntry {
    let (ordinal, rest) = payload.split_at(8);
    let (tx_id, features) = rest.split_at(8);
    let word = |bytes: &[u8]| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        u64::from_le_bytes(buf)
    };
    SpoolEntry {
        ordinal: word(ordinal),
        tx_id: word(tx_id),
        features: features
            .chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect(),
    }
}
