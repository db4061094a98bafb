//! Exclusive lock over a work directory.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::constants::LOCK_FILE;
use crate::error::{PipelineError, Result};

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: fs_err::File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Take the lock without blocking. Another live run on the same work
    /// directory is reported as [`PipelineError::Lock`].
    pub fn acquire(work_dir: &Path) -> Result<Self> {
        fs_err::create_dir_all(work_dir)?;
        let path = work_dir.join(LOCK_FILE);
        let mut file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.file().try_lock_exclusive().is_err() {
            return Err(PipelineError::Lock(format!(
                "{} is held by another run",
                path.display()
            )));
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!(target: "edgeseq::pipeline", path = %path.display(), "workspace locked");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.file().unlock() {
            tracing::warn!(
                target: "edgeseq::pipeline",
                path = %self.path.display(),
                error = %err,
                "failed to release workspace lock"
            );
        }
    }
}
