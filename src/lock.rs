//! Exclusive advisory lock on a segment directory.
//!
//! Collection and compaction both take this lock, so they never touch the same
//! directory at the same time. The lock is released when the handle drops.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::constants::LOCK_FILE_NAME;
use crate::error::{Result, TrawlError};

#[derive(Debug)]
pub struct DirLock {
    file: File,
    dir: PathBuf,
}

impl DirLock {
    /// Take the lock without waiting; fails with [`TrawlError::Lock`] if it is held.
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs_err::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(err) = FileExt::try_lock_exclusive(&file) {
            let holder = Self::holder(dir).unwrap_or_else(|| "unknown holder".to_string());
            return Err(TrawlError::Lock(format!(
                "{} is locked by {holder}: {err}",
                dir.display()
            )));
        }

        file.set_len(0)?;
        writeln!(
            file,
            "pid={} since={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        )?;
        file.sync_all()?;

        tracing::debug!(lock.dir = %dir.display(), "segment directory locked");
        Ok(Self {
            file,
            dir: dir.to_path_buf(),
        })
    }

    /// Owner line written by the current holder, if any.
    #[must_use]
    pub fn holder(dir: &Path) -> Option<String> {
        let text = fs_err::read_to_string(dir.join(LOCK_FILE_NAME)).ok()?;
        let line = text.lines().next()?.trim().to_string();
        (!line.is_empty()).then_some(line)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether this lock guards `dir`.
    #[must_use]
    pub fn covers(&self, dir: &Path) -> bool {
        self.dir == dir
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(lock.dir = %self.dir.display(), error = %err, "failed to release lock");
        }
    }
}
