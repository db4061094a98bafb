//! Public types exposed by the `edgeseq-core` crate.

pub mod checkpoint;
pub mod edge;
pub mod index;
pub mod options;
pub mod report;
pub mod sequence;

pub use checkpoint::{ProcessedSet, ScanCheckpoint, SequenceCheckpoint};
pub use edge::{Direction, EdgeRecord, EntityId, RowOutcome, SkipReason, SpoolEntry, StreamRow};
pub use index::{EntityIndex, Label};
pub use options::{OverflowPolicy, PipelineConfig, PipelineConfigBuilder, TemporalKeyStrategy};
pub use report::{ExtractionReport, PhaseOutcome, PipelineSummary, SequenceReport, SkipCounts};
pub use sequence::{SequenceBundle, SequenceMatrix};
