#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(
    test,
    allow(
        clippy::useless_vec,
        clippy::uninlined_format_args,
        clippy::cast_possible_truncation,
        clippy::float_cmp,
        clippy::cast_precision_loss
    )
)]
#![allow(clippy::module_name_repetitions)]
//
// Project-wide lint exceptions.
//
// Docs: error and panic sections are omitted where the Result type says enough.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Casts: counters, offsets and dense indices are bounded by file sizes and the
// u32 entity range checked when the index is built.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
//
// Style: phase drivers are long, and n_in/n_out, in_flow/out_flow read best as pairs.
#![allow(clippy::too_many_lines)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::similar_names)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)] // PipelineConfig carries several switches
#![allow(clippy::default_trait_access)]
#![allow(clippy::field_reassign_with_default)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::incompatible_msrv)]
#![allow(clippy::unnecessary_wraps)]

//! Resumable extraction of per-entity edge histories and their conversion into
//! fixed-shape temporal sequences.
//!
//! The pipeline has two phases over one work directory:
//!
//! 1. **Extraction** ([`ExtractionPhase`]) scans the edge stream in chunks and
//!    appends every record touching a target entity to that entity's inbound or
//!    outbound spool, checkpointing progress every few chunks.
//! 2. **Windowing** ([`SequencePhase`]) turns each entity's spools into a pair of
//!    `K x (F + 1)` matrices and writes one `.npz` bundle per entity,
//!    checkpointing which entities are done.
//!
//! Both phases resume from their checkpoints after a crash or cancellation and
//! produce the same artifacts as an uninterrupted run.

/// The edgeseq-core crate version (matches `Cargo.toml`).
pub const EDGESEQ_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod constants;
pub mod error;
pub mod extract;
pub mod io;
pub mod pipeline;
pub mod sequence;
pub mod temporal;
pub mod types;
pub mod window;

pub use error::{PipelineError, Result};
pub use extract::{ChunkSummary, ExtractionPhase, routes};
pub use io::{
    CadencedCheckpoint, CheckpointManager, EdgeChunk, FlushStats, SequenceCheckpointManager,
    SpoolRead, SpoolStore, StreamScanner, WorkspaceLock, bundle_path,
};
pub use pipeline::{CancelFlag, Pipeline, PipelineStatus, WorkspaceLayout};
pub use sequence::{EntityOutcome, EntityStatus, SequencePhase};
pub use temporal::{apply_margin, resolve_max_temporal_key};
pub use types::{
    Direction, EdgeRecord, EntityId, EntityIndex, ExtractionReport, Label, OverflowPolicy,
    PhaseOutcome, PipelineConfig, PipelineConfigBuilder, PipelineSummary, ProcessedSet,
    RowOutcome, ScanCheckpoint, SequenceBundle, SequenceCheckpoint, SequenceMatrix,
    SequenceReport, SkipCounts, SkipReason, SpoolEntry, StreamRow, TemporalKeyStrategy,
};
pub use window::{BuildStats, BuiltSequence, SequenceBuilder, Window, WindowSpec, build_window};
