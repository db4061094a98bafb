//! Extraction phase: scan the edge stream, route qualifying records into spools
//! and checkpoint progress.
//!
//! Ordering per chunk is route, flush, then update in-memory progress. When a
//! checkpoint is due the touched spools are synced before the checkpoint file is
//! replaced, so a durable checkpoint never claims data that is not on disk.

use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::instrument;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::io::{CheckpointManager, SpoolStore, StreamScanner};
use crate::pipeline::{CancelFlag, WorkspaceLayout};
use crate::types::{
    Direction, EdgeRecord, EntityId, EntityIndex, ExtractionReport, PhaseOutcome,
    PipelineConfig, ScanCheckpoint, SpoolEntry,
};

/// Spools a record is routed to: inbound for a targeted `dst`, outbound for a
/// targeted `src`. A self-loop on a target yields both.
#[must_use]
pub fn routes(record: &EdgeRecord, targets: &EntityIndex) -> SmallVec<[(EntityId, Direction); 2]> {
    let mut routes = SmallVec::new();
    if targets.contains(record.dst) {
        routes.push((record.dst, Direction::Inbound));
    }
    if targets.contains(record.src) {
        routes.push((record.src, Direction::Outbound));
    }
    routes
}

/// What one call to [`ExtractionPhase::next_chunk`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSummary {
    pub index: u64,
    pub rows_read: u64,
    pub records_routed: u64,
    pub rows_skipped: u64,
    /// Whether a scan checkpoint was saved after this chunk.
    pub checkpointed: bool,
}

#[derive(Debug)]
pub struct ExtractionPhase {
    /// `None` once the stream is known to be fully extracted.
    scanner: Option<StreamScanner>,
    spools: SpoolStore,
    checkpoints: CheckpointManager,
    targets: Arc<EntityIndex>,
    state: ScanCheckpoint,
    progress_every: u64,
    chunks_this_run: u64,
    resumed_after: Option<u64>,
    started: Instant,
}

impl ExtractionPhase {
    /// Load the scan checkpoint, position the stream after the last checkpointed
    /// chunk and make sure every target entity has its spools.
    #[instrument(
        target = "edgeseq::scan",
        skip_all,
        fields(stream = %config.stream_path.display(), entities = targets.len())
    )]
    pub fn open(
        config: &PipelineConfig,
        targets: Arc<EntityIndex>,
        layout: &WorkspaceLayout,
        run_id: Uuid,
    ) -> Result<Self> {
        let mut checkpoints =
            CheckpointManager::new(&layout.checkpoint_dir(), config.scan_checkpoint_every);
        let mut state = checkpoints.load()?;
        if state.is_zero_state() {
            state.chunk_size = config.chunk_size as u64;
            state.feature_width = config.feature_width as u32;
        } else {
            check_compatible(&state, config)?;
        }
        let spools = SpoolStore::open(&layout.spool_dir(), config.feature_width, config.sync_spools)?;

        let mut resumed_after = None;
        let scanner = if state.complete {
            tracing::info!(
                target: "edgeseq::scan",
                chunks = state.last_chunk_index,
                routed = state.total_records_routed,
                "extraction already complete; skipping scan"
            );
            None
        } else {
            let mut scanner = StreamScanner::open(
                &config.stream_path,
                config.chunk_size,
                config.feature_width,
                Arc::clone(&targets),
            )?;
            if state.last_chunk_index > 0 {
                scanner.resume_at(
                    state.stream_offset,
                    state.next_chunk_index(),
                    state.rows_consumed,
                )?;
                resumed_after = Some(state.last_chunk_index);
                tracing::info!(
                    target: "edgeseq::scan",
                    resume_chunk = state.next_chunk_index(),
                    offset = state.stream_offset,
                    "resuming extraction"
                );
            }
            Some(scanner)
        };

        if !state.spools_initialized {
            state.spools_created += spools.initialize(&targets)?;
            state.spools_initialized = true;
            state.run_id = Some(run_id);
            checkpoints.save(&mut state)?;
        }

        Ok(Self {
            scanner,
            spools,
            checkpoints,
            targets,
            state,
            progress_every: config.progress_every_chunks.max(1),
            chunks_this_run: 0,
            resumed_after,
            started: Instant::now(),
        })
    }

    /// In-memory progress; ahead of the durable checkpoint between saves.
    pub fn state(&self) -> &ScanCheckpoint {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state.complete
    }

    /// Route one chunk. Returns `None` once the stream is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<ChunkSummary>> {
        let Some(scanner) = self.scanner.as_mut() else {
            return Ok(None);
        };
        let Some(chunk) = scanner.next_chunk()? else {
            return Ok(None);
        };

        let mut routed = 0u64;
        for row in chunk.records {
            let targets = routes(&row.record, &self.targets);
            let entry = SpoolEntry::from_row(row);
            for (entity, direction) in targets {
                self.spools.append(entity, direction, &entry)?;
                routed += 1;
            }
            self.state.note_routed_tx(entry.tx_id);
        }
        self.spools.flush()?;

        self.state.last_chunk_index = chunk.index;
        self.state.total_records_routed += routed;
        self.state.rows_consumed += chunk.rows_read;
        self.state.rows_irrelevant += chunk.rows_irrelevant;
        self.state.rows_skipped.merge(&chunk.skipped);
        self.state.stream_offset = chunk.end_offset;
        self.chunks_this_run += 1;

        let checkpointed = self.checkpoints.record();
        if checkpointed {
            self.persist()?;
        }
        if self.chunks_this_run % self.progress_every == 0 {
            tracing::info!(
                target: "edgeseq::scan",
                chunk = chunk.index,
                rows = self.state.rows_consumed,
                routed = self.state.total_records_routed,
                skipped = self.state.rows_skipped.total(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "extraction progress"
            );
        }

        Ok(Some(ChunkSummary {
            index: chunk.index,
            rows_read: chunk.rows_read,
            records_routed: routed,
            rows_skipped: chunk.skipped.total(),
            checkpointed,
        }))
    }

    /// Save progress through the last routed chunk, whatever the cadence.
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.checkpoints.has_unsaved() {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        self.spools.flush()?;
        self.spools.sync()?;
        self.checkpoints.save(&mut self.state)
    }

    /// Mark extraction complete. Only valid once [`next_chunk`](Self::next_chunk)
    /// has returned `None`.
    pub fn finish(&mut self) -> Result<ExtractionReport> {
        if !self.state.complete {
            self.state.complete = true;
            self.persist()?;
            self.scanner = None;
            tracing::info!(
                target: "edgeseq::scan",
                chunks = self.state.last_chunk_index,
                rows = self.state.rows_consumed,
                routed = self.state.total_records_routed,
                irrelevant = self.state.rows_irrelevant,
                skipped = self.state.rows_skipped.total(),
                max_tx_id = ?self.state.max_tx_id_routed,
                "extraction complete"
            );
        }
        Ok(self.report())
    }

    /// Drive the phase to the end of the stream, stopping early between chunks
    /// when `cancel` is raised.
    pub fn run(&mut self, cancel: &CancelFlag) -> Result<(PhaseOutcome, ExtractionReport)> {
        loop {
            if cancel.is_cancelled() {
                self.checkpoint()?;
                tracing::warn!(
                    target: "edgeseq::scan",
                    last_chunk = self.state.last_chunk_index,
                    "extraction cancelled"
                );
                return Ok((PhaseOutcome::Cancelled, self.report()));
            }
            if self.next_chunk()?.is_none() {
                break;
            }
        }
        let report = self.finish()?;
        Ok((PhaseOutcome::Completed, report))
    }

    #[must_use]
    pub fn report(&self) -> ExtractionReport {
        ExtractionReport {
            last_chunk_index: self.state.last_chunk_index,
            chunks_this_run: self.chunks_this_run,
            rows_consumed: self.state.rows_consumed,
            rows_irrelevant: self.state.rows_irrelevant,
            records_routed: self.state.total_records_routed,
            rows_skipped: self.state.rows_skipped,
            max_tx_id_routed: self.state.max_tx_id_routed,
            resumed_after: self.resumed_after,
            spools_created: self.state.spools_created,
            complete: self.state.complete,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

fn check_compatible(state: &ScanCheckpoint, config: &PipelineConfig) -> Result<()> {
    if state.chunk_size != config.chunk_size as u64 {
        return Err(PipelineError::CheckpointMismatch {
            reason: format!(
                "scan checkpoint was written with chunk_size {}, configured {}",
                state.chunk_size, config.chunk_size
            ),
        });
    }
    if state.feature_width as usize != config.feature_width {
        return Err(PipelineError::CheckpointMismatch {
            reason: format!(
                "scan checkpoint was written with feature_width {}, configured {}",
                state.feature_width, config.feature_width
            ),
        });
    }
    Ok(())
}
