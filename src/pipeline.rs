//! Orchestration of the two phases over one work directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use atomic_write_file::AtomicWriteFile;
use tracing::instrument;
use uuid::Uuid;

use crate::constants::{
    CHECKPOINT_DIR, SCAN_CHECKPOINT_FILE, SEQUENCE_CHECKPOINT_FILE, SEQUENCE_DIR, SPOOL_DIR,
    SUMMARY_FILE,
};
use crate::error::{PipelineError, Result};
use crate::extract::ExtractionPhase;
use crate::io::{CheckpointFile, CheckpointManager, WorkspaceLock};
use crate::sequence::SequencePhase;
use crate::types::{
    EntityIndex, PhaseOutcome, PipelineConfig, PipelineSummary, ScanCheckpoint,
    SequenceCheckpoint,
};

/// Where everything lives under the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            root: work_dir.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn spool_dir(&self) -> PathBuf {
        self.root.join(SPOOL_DIR)
    }

    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join(CHECKPOINT_DIR)
    }

    #[must_use]
    pub fn sequence_dir(&self) -> PathBuf {
        self.root.join(SEQUENCE_DIR)
    }

    #[must_use]
    pub fn summary_path(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }
}

/// Cooperative cancellation, honoured only between chunks and between entities.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress read from a work directory without locking it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStatus {
    pub scan: Option<ScanCheckpoint>,
    pub sequences: Option<SequenceCheckpoint>,
    pub last_summary: Option<PipelineSummary>,
}

impl PipelineStatus {
    #[must_use]
    pub fn extraction_complete(&self) -> bool {
        self.scan.as_ref().is_some_and(|scan| scan.complete)
    }

    #[must_use]
    pub fn windowing_complete(&self) -> bool {
        self.sequences.as_ref().is_some_and(|seq| seq.complete)
    }
}

/// Runs extraction to completion, then windowing over every entity.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    index: Arc<EntityIndex>,
    layout: WorkspaceLayout,
    cancel: CancelFlag,
    run_id: Uuid,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, index: EntityIndex) -> Result<Self> {
        config.validate()?;
        if index.is_empty() {
            tracing::warn!(target: "edgeseq::pipeline", "entity index is empty; nothing will be routed");
        }
        let layout = WorkspaceLayout::new(&config.work_dir);
        Ok(Self {
            config,
            index: Arc::new(index),
            layout,
            cancel: CancelFlag::new(),
            run_id: Uuid::new_v4(),
        })
    }

    /// Build from configuration alone, loading the index from `index_path`.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let Some(index_path) = config.index_path.clone() else {
            return Err(PipelineError::InvalidConfig {
                reason: "index_path is required when no entity index is supplied".into(),
            });
        };
        let index = EntityIndex::load_json(&index_path)?;
        Self::new(config, index)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<EntityIndex> {
        &self.index
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// A handle that stops [`run`](Self::run) at the next safe point.
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Exclusive access to the work directory. [`run`](Self::run) takes it
    /// itself; callers driving phases step by step should hold it.
    pub fn lock(&self) -> Result<WorkspaceLock> {
        WorkspaceLock::acquire(self.layout.root())
    }

    pub fn extraction_phase(&self) -> Result<ExtractionPhase> {
        ExtractionPhase::open(
            &self.config,
            Arc::clone(&self.index),
            &self.layout,
            self.run_id,
        )
    }

    pub fn sequence_phase(&self) -> Result<SequencePhase> {
        let scan = CheckpointManager::new(&self.layout.checkpoint_dir(), 1).load()?;
        SequencePhase::open(&self.config, Arc::clone(&self.index), &self.layout, &scan)
    }

    /// Run both phases, write `summary.json` and return the summary. Resumes
    /// from whatever checkpoints the work directory holds.
    #[instrument(
        target = "edgeseq::pipeline",
        skip_all,
        fields(run_id = %self.run_id, work_dir = %self.layout.root().display())
    )]
    pub fn run(&self) -> Result<PipelineSummary> {
        let _lock = self.lock()?;
        tracing::info!(
            target: "edgeseq::pipeline",
            entities = self.index.len(),
            chunk_size = self.config.chunk_size,
            window_len = self.config.window_len,
            "pipeline run started"
        );

        let (mut outcome, extraction) = self.extraction_phase()?.run(&self.cancel)?;
        let sequences = if outcome == PhaseOutcome::Completed {
            let (windowing, report) = self.sequence_phase()?.run(&self.cancel)?;
            outcome = windowing;
            Some(report)
        } else {
            None
        };

        let summary = PipelineSummary {
            run_id: self.run_id,
            outcome,
            extraction,
            sequences,
        };
        write_summary(&self.layout.summary_path(), &summary)?;
        tracing::info!(
            target: "edgeseq::pipeline",
            outcome = ?summary.outcome,
            rows = summary.extraction.rows_consumed,
            routed = summary.extraction.records_routed,
            skipped = summary.extraction.rows_skipped.total(),
            processed = summary.sequences.as_ref().map_or(0, |s| s.processed),
            failed = summary.sequences.as_ref().map_or(0, |s| s.failed),
            "pipeline run finished"
        );
        Ok(summary)
    }

    /// Read both checkpoints and the last summary of `work_dir`.
    pub fn status(work_dir: &Path) -> Result<PipelineStatus> {
        let layout = WorkspaceLayout::new(work_dir);
        let checkpoints = layout.checkpoint_dir();
        let scan = CheckpointFile::<ScanCheckpoint>::new(checkpoints.join(SCAN_CHECKPOINT_FILE))
            .load()?;
        let sequences =
            CheckpointFile::<SequenceCheckpoint>::new(checkpoints.join(SEQUENCE_CHECKPOINT_FILE))
                .load()?;
        let last_summary = match fs_err::read(layout.summary_path()) {
            Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        Ok(PipelineStatus {
            scan,
            sequences,
            last_summary,
        })
    }
}

fn write_summary(path: &Path, summary: &PipelineSummary) -> Result<()> {
    let json = serde_json::to_vec_pretty(summary)?;
    let mut file = AtomicWriteFile::options().open(path)?;
    file.write_all(&json)?;
    file.write_all(b"\n")?;
    file.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_places_each_area_under_work_dir() {
        let layout = WorkspaceLayout::new(Path::new("/data/work"));
        assert_eq!(layout.spool_dir(), Path::new("/data/work/spools"));
        assert_eq!(layout.checkpoint_dir(), Path::new("/data/work/checkpoints"));
        assert_eq!(layout.sequence_dir(), Path::new("/data/work/sequences"));
        assert_eq!(layout.summary_path(), Path::new("/data/work/summary.json"));
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let handle = flag.clone();
        assert!(!flag.is_cancelled());
        handle.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn from_config_requires_index_path() {
        let config = PipelineConfig::builder("edges.csv", "work").build();
        assert!(matches!(
            Pipeline::from_config(config).unwrap_err(),
            PipelineError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn status_of_fresh_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let status = Pipeline::status(dir.path()).unwrap();
        assert_eq!(status, PipelineStatus::default());
        assert!(!status.extraction_complete());
    }
}
