//! Windowing phase: build one bundle per entity in dense index order, skipping
//! entities an earlier run already finalized.
//!
//! An entity counts as finalized once its bundle is written and a sequence
//! checkpoint naming it is durable. Bundles are written atomically, so an entity
//! redone after a crash simply replaces an identical file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::instrument;

use crate::error::{PipelineError, Result};
use crate::io::{SequenceCheckpointManager, SpoolStore, bundle_path};
use crate::pipeline::{CancelFlag, WorkspaceLayout};
use crate::temporal::resolve_max_temporal_key;
use crate::types::{
    EntityId, EntityIndex, PhaseOutcome, PipelineConfig, ScanCheckpoint, SequenceCheckpoint,
    SequenceReport,
};
use crate::window::{BuiltSequence, SequenceBuilder, WindowSpec};

#[cfg(feature = "parallel")]
const RUN_BATCH: usize = 256;
#[cfg(not(feature = "parallel"))]
const RUN_BATCH: usize = 1;

/// Result of windowing one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityStatus {
    Finalized,
    /// Not marked processed; retried by the next run.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOutcome {
    pub dense: u32,
    pub entity: EntityId,
    pub status: EntityStatus,
}

#[derive(Debug)]
pub struct SequencePhase {
    spools: SpoolStore,
    index: Arc<EntityIndex>,
    checkpoints: SequenceCheckpointManager,
    state: SequenceCheckpoint,
    spec: WindowSpec,
    sequence_dir: PathBuf,
    retain_spools: bool,
    /// Finalized entities whose spools go once a checkpoint covers them.
    retiring: Vec<EntityId>,
    cursor: u32,
    progress_every: u64,
    finalized_this_run: u64,
    started: Instant,
}

impl SequencePhase {
    /// Load the sequence checkpoint and fix `maxTemporalKey` for the run. The
    /// extraction phase must be complete.
    #[instrument(target = "edgeseq::window", skip_all, fields(entities = index.len()))]
    pub fn open(
        config: &PipelineConfig,
        index: Arc<EntityIndex>,
        layout: &WorkspaceLayout,
        scan: &ScanCheckpoint,
    ) -> Result<Self> {
        if !scan.complete {
            return Err(PipelineError::CheckpointMismatch {
                reason: "windowing requires a completed extraction".into(),
            });
        }
        let mut checkpoints = SequenceCheckpointManager::new(
            &layout.checkpoint_dir(),
            config.sequence_checkpoint_every,
        );
        let mut state = checkpoints.load()?;
        if !state.is_zero_state() {
            check_compatible(&state, config, &index)?;
        }
        let spools = SpoolStore::open(&layout.spool_dir(), config.feature_width, false)?;

        let max_temporal_key = if let Some(max) = state.max_temporal_key {
            tracing::info!(
                target: "edgeseq::window",
                max_temporal_key = max,
                already_done = state.processed.len(),
                "resuming windowing with persisted max temporal key"
            );
            max
        } else {
            let max = resolve_max_temporal_key(&config.temporal_key, scan, &spools, &index);
            state.max_temporal_key = Some(max);
            state.window_len = config.window_len as u32;
            state.feature_width = config.feature_width as u32;
            checkpoints.save(&mut state)?;
            max
        };

        state.report.total_entities = index.len() as u64;
        state.report.already_done = state.processed.len();
        state.report.max_temporal_key = max_temporal_key;
        state.report.failed = 0;
        state.report.overflow_rejected = 0;

        Ok(Self {
            spools,
            index,
            checkpoints,
            state,
            spec: WindowSpec {
                window_len: config.window_len,
                feature_width: config.feature_width,
                max_temporal_key,
                overflow: config.overflow_policy,
            },
            sequence_dir: layout.sequence_dir(),
            retain_spools: config.retain_spools,
            retiring: Vec::new(),
            cursor: 0,
            progress_every: config.progress_every_entities.max(1),
            finalized_this_run: 0,
            started: Instant::now(),
        })
    }

    pub fn spec(&self) -> &WindowSpec {
        &self.spec
    }

    pub fn state(&self) -> &SequenceCheckpoint {
        &self.state
    }

    fn builder(&self) -> SequenceBuilder<'_> {
        SequenceBuilder::new(&self.spools, &self.index, self.spec)
    }

    /// Next `(dense, entity)` pairs not yet finalized, advancing the cursor.
    fn claim(&mut self, limit: usize) -> Vec<(u32, EntityId)> {
        let mut claimed = Vec::with_capacity(limit.min(self.index.len()));
        while claimed.len() < limit {
            let Some(entity) = self.index.entity_at(self.cursor) else {
                break;
            };
            let dense = self.cursor;
            self.cursor += 1;
            if !self.state.processed.contains(dense) {
                claimed.push((dense, entity));
            }
        }
        claimed
    }

    /// Window the next unprocessed entity. Returns `None` when every entity has
    /// been visited by this run.
    pub fn next_entity(&mut self) -> Result<Option<EntityOutcome>> {
        let Some((dense, entity)) = self.claim(1).pop() else {
            return Ok(None);
        };
        let built = self.builder().build(entity, dense);
        self.commit(dense, entity, built).map(Some)
    }

    /// Window up to `limit` entities. Bundles are computed concurrently when the
    /// `parallel` feature is enabled; they are always written and checkpointed in
    /// dense index order.
    pub fn next_batch(&mut self, limit: usize) -> Result<Vec<EntityOutcome>> {
        let claimed = self.claim(limit.max(1));
        let builder = self.builder();

        #[cfg(feature = "parallel")]
        let built: Vec<Result<BuiltSequence>> = {
            use rayon::prelude::*;
            claimed
                .par_iter()
                .map(|(dense, entity)| builder.build(*entity, *dense))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let built: Vec<Result<BuiltSequence>> = claimed
            .iter()
            .map(|(dense, entity)| builder.build(*entity, *dense))
            .collect();

        claimed
            .into_iter()
            .zip(built)
            .map(|((dense, entity), result)| self.commit(dense, entity, result))
            .collect()
    }

    fn commit(
        &mut self,
        dense: u32,
        entity: EntityId,
        built: Result<BuiltSequence>,
    ) -> Result<EntityOutcome> {
        let built = match built {
            Ok(built) => built,
            Err(err) if !err.is_fatal() => {
                self.state.report.failed += 1;
                if matches!(err, PipelineError::TemporalKeyOverflow { .. }) {
                    self.state.report.overflow_rejected += 1;
                }
                tracing::warn!(
                    target: "edgeseq::window",
                    entity = %entity,
                    dense,
                    error = %err,
                    "entity failed; it will be retried on the next run"
                );
                return Ok(EntityOutcome {
                    dense,
                    entity,
                    status: EntityStatus::Failed {
                        reason: err.to_string(),
                    },
                });
            }
            Err(err) => return Err(err),
        };

        built
            .bundle
            .write_npz(&bundle_path(&self.sequence_dir, dense))?;

        let report = &mut self.state.report;
        report.processed += 1;
        report.empty_in += u64::from(built.bundle.n_in == 0);
        report.empty_out += u64::from(built.bundle.n_out == 0);
        report.labels_defaulted += u64::from(built.stats.label_defaulted);
        report.proxy_clamped += built.stats.clamped;
        report.spool_read_errors += built.stats.read_errors;
        report.duplicates_dropped += built.stats.duplicates;
        report.corrupt_records += built.stats.corrupt;
        self.state.processed.insert(dense);
        self.state.last_entity_index = Some(dense);
        self.finalized_this_run += 1;
        if !self.retain_spools {
            self.retiring.push(entity);
        }

        if self.checkpoints.record() {
            self.persist()?;
        }
        if self.finalized_this_run % self.progress_every == 0 {
            tracing::info!(
                target: "edgeseq::window",
                processed = self.state.report.processed,
                total = self.state.report.total_entities,
                failed = self.state.report.failed,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "windowing progress"
            );
        }

        Ok(EntityOutcome {
            dense,
            entity,
            status: EntityStatus::Finalized,
        })
    }

    /// Save progress for every entity finalized so far, whatever the cadence.
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.checkpoints.has_unsaved() {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        self.state.report.elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.checkpoints.save(&mut self.state)?;
        for entity in self.retiring.drain(..) {
            if let Err(err) = self.spools.remove(entity) {
                tracing::warn!(
                    target: "edgeseq::window",
                    entity = %entity,
                    error = %err,
                    "failed to remove finalized spools"
                );
            }
        }
        Ok(())
    }

    /// Close the phase. The phase is complete only when every entity has a
    /// finalized bundle; failed entities keep it incomplete.
    pub fn finish(&mut self) -> Result<SequenceReport> {
        let complete = self.state.processed.len() == self.index.len() as u64;
        self.state.complete = complete;
        self.state.report.complete = complete;
        self.persist()?;

        let report = self.report();
        if report.failed > 0 {
            tracing::warn!(
                target: "edgeseq::window",
                failed = report.failed,
                overflow_rejected = report.overflow_rejected,
                "windowing finished with failed entities"
            );
        }
        tracing::info!(
            target: "edgeseq::window",
            processed = report.processed,
            total = report.total_entities,
            already_done = report.already_done,
            empty_in = report.empty_in,
            empty_out = report.empty_out,
            labels_defaulted = report.labels_defaulted,
            spool_read_errors = report.spool_read_errors,
            duplicates_dropped = report.duplicates_dropped,
            complete,
            "windowing finished"
        );
        Ok(report)
    }

    /// Window every remaining entity, stopping between entities when `cancel` is
    /// raised.
    pub fn run(&mut self, cancel: &CancelFlag) -> Result<(PhaseOutcome, SequenceReport)> {
        loop {
            if cancel.is_cancelled() {
                self.checkpoint()?;
                tracing::warn!(
                    target: "edgeseq::window",
                    processed = self.state.report.processed,
                    "windowing cancelled"
                );
                return Ok((PhaseOutcome::Cancelled, self.report()));
            }
            if self.next_batch(RUN_BATCH)?.is_empty() {
                break;
            }
        }
        let report = self.finish()?;
        Ok((PhaseOutcome::Completed, report))
    }

    #[must_use]
    pub fn report(&self) -> SequenceReport {
        SequenceReport {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            ..self.state.report.clone()
        }
    }
}

fn check_compatible(
    state: &SequenceCheckpoint,
    config: &PipelineConfig,
    index: &EntityIndex,
) -> Result<()> {
    if state.window_len as usize != config.window_len
        || state.feature_width as usize != config.feature_width
    {
        return Err(PipelineError::CheckpointMismatch {
            reason: format!(
                "sequence checkpoint was written for K={} F={}, configured K={} F={}",
                state.window_len, state.feature_width, config.window_len, config.feature_width
            ),
        });
    }
    if let Some(beyond) = state.processed.iter().find(|dense| *dense as usize >= index.len()) {
        return Err(PipelineError::CheckpointMismatch {
            reason: format!(
                "sequence checkpoint marks entity {beyond} processed but the index has {}",
                index.len()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Label, OverflowPolicy, SequenceBundle, SpoolEntry, TemporalKeyStrategy};
    use std::path::Path;

    fn index() -> Arc<EntityIndex> {
        Arc::new(
            EntityIndex::from_entries([
                (EntityId(10), Some(Label::Licit)),
                (EntityId(20), Some(Label::Suspicious)),
                (EntityId(30), None),
            ])
            .unwrap(),
        )
    }

    fn config(dir: &Path) -> PipelineConfig {
        PipelineConfig::builder(dir.join("edges.csv"), dir.join("work"))
            .window_len(2)
            .feature_width(1)
            .sequence_checkpoint_every(1)
            .temporal_key(TemporalKeyStrategy::Fixed { max: 100 })
            .build()
    }

    /// Spools as extraction would leave them: entity 20 has one inbound record
    /// beyond the temporal bound.
    fn seed(layout: &WorkspaceLayout, index: &EntityIndex) -> ScanCheckpoint {
        let mut spools = SpoolStore::open(&layout.spool_dir(), 1, false).unwrap();
        spools.initialize(index).unwrap();
        let rows = [
            (10, Direction::Inbound, 0, 40),
            (10, Direction::Inbound, 1, 20),
            (10, Direction::Outbound, 2, 60),
            (20, Direction::Inbound, 3, 150),
            (30, Direction::Outbound, 4, 90),
        ];
        for (entity, direction, ordinal, tx_id) in rows {
            let entry = SpoolEntry {
                ordinal,
                tx_id,
                features: vec![tx_id as f32],
            };
            spools.append(EntityId(entity), direction, &entry).unwrap();
        }
        spools.flush().unwrap();
        ScanCheckpoint {
            complete: true,
            max_tx_id_routed: Some(150),
            ..ScanCheckpoint::default()
        }
    }

    #[test]
    fn requires_completed_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let layout = WorkspaceLayout::new(&config.work_dir);
        let err = SequencePhase::open(&config, index(), &layout, &ScanCheckpoint::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::CheckpointMismatch { .. }));
    }

    #[test]
    fn overflow_fails_entity_and_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let layout = WorkspaceLayout::new(&config.work_dir);
        let index = index();
        let scan = seed(&layout, &index);

        let mut phase = SequencePhase::open(&config, Arc::clone(&index), &layout, &scan).unwrap();
        let (outcome, report) = phase.run(&CancelFlag::new()).unwrap();
        assert_eq!(outcome, PhaseOutcome::Completed);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.overflow_rejected, 1);
        assert_eq!(report.labels_defaulted, 1);
        assert_eq!(report.empty_in, 1);
        assert_eq!(report.empty_out, 0);
        assert!(!report.complete);
        assert!(!bundle_path(&layout.sequence_dir(), 1).exists());

        let bundle = SequenceBundle::read_npz(&bundle_path(&layout.sequence_dir(), 0)).unwrap();
        assert_eq!(bundle.entity_id, EntityId(10));
        assert_eq!(bundle.in_flow.row(0), &[20.0, 0.2]);
        assert_eq!(bundle.in_flow.row(1), &[40.0, 0.4]);
        assert_eq!(bundle.n_out, 1);

        let clamp = PipelineConfig {
            overflow_policy: OverflowPolicy::Clamp,
            ..config.clone()
        };
        let mut retry = SequencePhase::open(&clamp, Arc::clone(&index), &layout, &scan).unwrap();
        assert_eq!(retry.spec().max_temporal_key, 100);
        let (_, report) = retry.run(&CancelFlag::new()).unwrap();
        assert_eq!(report.already_done, 2);
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.proxy_clamped, 1);
        assert!(report.complete);

        let retried = SequenceBundle::read_npz(&bundle_path(&layout.sequence_dir(), 1)).unwrap();
        assert_eq!(retried.label, Label::Suspicious);
        assert_eq!(retried.in_flow.row(1), &[150.0, 1.0]);
    }

    #[test]
    fn cancellation_stops_between_entities() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let layout = WorkspaceLayout::new(&config.work_dir);
        let index = index();
        let scan = seed(&layout, &index);

        let mut phase = SequencePhase::open(&config, Arc::clone(&index), &layout, &scan).unwrap();
        let first = phase.next_entity().unwrap().unwrap();
        assert_eq!(first.status, EntityStatus::Finalized);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let (outcome, report) = phase.run(&cancel).unwrap();
        assert_eq!(outcome, PhaseOutcome::Cancelled);
        assert_eq!(report.processed, 1);

        let mut resumed = SequencePhase::open(&config, Arc::clone(&index), &layout, &scan).unwrap();
        let next = resumed.next_entity().unwrap().unwrap();
        assert_eq!(next.dense, 1);
    }

    #[test]
    fn spools_are_retired_only_after_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.retain_spools = false;
        config.sequence_checkpoint_every = 2;
        let layout = WorkspaceLayout::new(&config.work_dir);
        let index = index();
        let scan = seed(&layout, &index);
        let spools = SpoolStore::open(&layout.spool_dir(), 1, false).unwrap();

        let mut phase = SequencePhase::open(&config, Arc::clone(&index), &layout, &scan).unwrap();
        phase.next_entity().unwrap();
        assert!(spools.spool_path(EntityId(10), Direction::Inbound).exists());
        phase.checkpoint().unwrap();
        assert!(!spools.spool_path(EntityId(10), Direction::Inbound).exists());

        // A failed entity keeps its spools for the retry.
        phase.run(&CancelFlag::new()).unwrap();
        assert!(spools.spool_path(EntityId(20), Direction::Inbound).exists());
        assert!(!spools.spool_path(EntityId(30), Direction::Outbound).exists());
    }

    #[test]
    fn changed_window_is_rejected_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let layout = WorkspaceLayout::new(&config.work_dir);
        let index = index();
        let scan = seed(&layout, &index);
        SequencePhase::open(&config, Arc::clone(&index), &layout, &scan).unwrap();

        let wider = PipelineConfig {
            window_len: 3,
            ..config.clone()
        };
        let err = SequencePhase::open(&wider, index, &layout, &scan).unwrap_err();
        assert!(matches!(err, PipelineError::CheckpointMismatch { .. }));
    }
}
