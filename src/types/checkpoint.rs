//! Durable progress records for both pipeline phases.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::report::{SequenceReport, SkipCounts};

/// Extraction progress.
///
/// If present, every chunk with index `<= last_chunk_index` has been routed to
/// spools and flushed; resume starts at `last_chunk_index + 1`. Chunk indices are
/// 1-based so the zero value means "nothing routed yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    pub last_chunk_index: u64,
    pub total_records_routed: u64,
    /// Data rows consumed through `last_chunk_index`, including skipped rows.
    pub rows_consumed: u64,
    pub rows_irrelevant: u64,
    /// Byte offset in the stream just past `last_chunk_index`.
    pub stream_offset: u64,
    pub rows_skipped: SkipCounts,
    pub max_tx_id_routed: Option<u64>,
    /// Chunk size and feature width the offsets above were produced with.
    pub chunk_size: u64,
    pub feature_width: u32,
    pub spools_initialized: bool,
    pub spools_created: u64,
    pub complete: bool,
    pub run_id: Option<Uuid>,
    pub updated_at: u64,
}

impl ScanCheckpoint {
    /// True for the sentinel returned when no checkpoint exists.
    #[must_use]
    pub fn is_zero_state(&self) -> bool {
        self.last_chunk_index == 0 && !self.spools_initialized && !self.complete
    }

    #[must_use]
    pub fn next_chunk_index(&self) -> u64 {
        self.last_chunk_index + 1
    }

    pub(crate) fn note_routed_tx(&mut self, tx_id: u64) {
        self.max_tx_id_routed = Some(self.max_tx_id_routed.map_or(tx_id, |max| max.max(tx_id)));
    }
}

/// Fixed-capacity set of dense entity indices, stored as a bitmap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedSet {
    words: Vec<u64>,
    len: u64,
}

impl ProcessedSet {
    #[must_use]
    pub fn with_capacity(entities: usize) -> Self {
        Self {
            words: vec![0; entities.div_ceil(64)],
            len: 0,
        }
    }

    /// Returns `true` when `index` was not yet present.
    pub fn insert(&mut self, index: u32) -> bool {
        let (word, bit) = Self::slot(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.len += 1;
        true
    }

    #[must_use]
    pub fn contains(&self, index: u32) -> bool {
        let (word, bit) = Self::slot(index);
        self.words
            .get(word)
            .is_some_and(|value| value & (1u64 << bit) != 0)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(word, value)| {
            (0..64u32)
                .filter(move |bit| value & (1u64 << bit) != 0)
                .map(move |bit| word as u32 * 64 + bit)
        })
    }

    fn slot(index: u32) -> (usize, u32) {
        ((index / 64) as usize, index % 64)
    }
}

/// Windowing progress: which entities already have a finalized artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCheckpoint {
    pub last_entity_index: Option<u32>,
    pub processed: ProcessedSet,
    /// Normalisation bound fixed on first use and reused on resume.
    pub max_temporal_key: Option<u64>,
    pub window_len: u32,
    pub feature_width: u32,
    /// Counters for the entities in `processed`.
    pub report: SequenceReport,
    pub complete: bool,
    pub updated_at: u64,
}

impl SequenceCheckpoint {
    #[must_use]
    pub fn is_zero_state(&self) -> bool {
        self.max_temporal_key.is_none() && self.processed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_set_grows_on_demand() {
        let mut set = ProcessedSet::with_capacity(10);
        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.insert(130));
        assert!(set.contains(3));
        assert!(set.contains(130));
        assert!(!set.contains(4));
        assert!(!set.contains(10_000));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 130]);
    }

    #[test]
    fn zero_state_sentinel() {
        let mut scan = ScanCheckpoint::default();
        assert!(scan.is_zero_state());
        assert_eq!(scan.next_chunk_index(), 1);
        scan.spools_initialized = true;
        assert!(!scan.is_zero_state());

        scan.note_routed_tx(40);
        scan.note_routed_tx(12);
        assert_eq!(scan.max_tx_id_routed, Some(40));
    }
}
