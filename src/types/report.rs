//! Counters surfaced at the end of each phase for data-quality auditing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::edge::SkipReason;

/// Malformed stream rows, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub blank: u64,
    pub invalid_utf8: u64,
    pub field_count: u64,
    pub invalid_entity_id: u64,
    pub invalid_tx_id: u64,
    pub invalid_feature: u64,
    pub non_finite_feature: u64,
}

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        let slot = match reason {
            SkipReason::Blank => &mut self.blank,
            SkipReason::InvalidUtf8 => &mut self.invalid_utf8,
            SkipReason::FieldCount { .. } => &mut self.field_count,
            SkipReason::InvalidEntityId => &mut self.invalid_entity_id,
            SkipReason::InvalidTxId => &mut self.invalid_tx_id,
            SkipReason::InvalidFeature { .. } => &mut self.invalid_feature,
            SkipReason::NonFiniteFeature { .. } => &mut self.non_finite_feature,
        };
        *slot += 1;
    }

    pub fn merge(&mut self, other: &Self) {
        self.blank += other.blank;
        self.invalid_utf8 += other.invalid_utf8;
        self.field_count += other.field_count;
        self.invalid_entity_id += other.invalid_entity_id;
        self.invalid_tx_id += other.invalid_tx_id;
        self.invalid_feature += other.invalid_feature;
        self.non_finite_feature += other.non_finite_feature;
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.blank
            + self.invalid_utf8
            + self.field_count
            + self.invalid_entity_id
            + self.invalid_tx_id
            + self.invalid_feature
            + self.non_finite_feature
    }
}

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Completed,
    /// Stopped at a chunk or entity boundary; the checkpoint reflects all finished work.
    Cancelled,
}

/// Extraction totals. Counters are cumulative across resumed runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub last_chunk_index: u64,
    /// Chunks processed by this run only.
    pub chunks_this_run: u64,
    pub rows_consumed: u64,
    pub rows_irrelevant: u64,
    pub records_routed: u64,
    pub rows_skipped: SkipCounts,
    pub max_tx_id_routed: Option<u64>,
    /// Chunk index this run resumed after, if it resumed.
    pub resumed_after: Option<u64>,
    pub spools_created: u64,
    pub complete: bool,
    pub elapsed_ms: u64,
}

/// Windowing totals. `failed` and `overflow_rejected` cover this run only, since
/// failed entities are retried on the next run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReport {
    pub total_entities: u64,
    pub processed: u64,
    /// Entities skipped by this run because an earlier run finalized them.
    pub already_done: u64,
    pub failed: u64,
    pub overflow_rejected: u64,
    pub empty_in: u64,
    pub empty_out: u64,
    pub labels_defaulted: u64,
    pub proxy_clamped: u64,
    pub spool_read_errors: u64,
    pub duplicates_dropped: u64,
    pub corrupt_records: u64,
    pub max_temporal_key: u64,
    pub complete: bool,
    pub elapsed_ms: u64,
}

/// End-of-run report, written to `summary.json` in the work directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub run_id: Uuid,
    pub outcome: PhaseOutcome,
    pub extraction: ExtractionReport,
    /// `None` when the run was cancelled before windowing started.
    pub sequences: Option<SequenceReport>,
}
