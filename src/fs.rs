//! Filesystem helpers used when opening storage instances
//!
//! Directory creation, free-space checks and an exclusive directory lock so
//! two processes never open the same shard directories.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, ShardLogError};

/// Name of the lock file inside a locked directory
pub const LOCK_FILENAME: &str = "LOCK";

/// Create `path` and any missing parents
pub fn prepare_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Free bytes available to this process on the filesystem holding `path`
pub fn available_space(path: &Path) -> Result<u64> {
    Ok(fs2::available_space(path)?)
}

/// Fail with `InsufficientSpace` when `path` has less than `required` bytes
/// free. Returns the available byte count.
pub fn check_free_space(path: &Path, required: u64) -> Result<u64> {
    let available = available_space(path)?;
    if available < required {
        return Err(ShardLogError::InsufficientSpace {
            path: path.to_path_buf(),
            available,
            required,
        });
    }
    Ok(available)
}

/// Exclusive lock on a data directory, released on drop
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Lock `dir`, creating it if needed. Never blocks: a directory held by
    /// another process fails with `DirLocked`.
    pub fn acquire(dir: &Path) -> Result<Self> {
        prepare_dir(dir)?;

        let path = dir.join(LOCK_FILENAME);
        let file = File::create(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "acquired directory lock");
                Ok(Self { file, path })
            }
            Err(e) if is_contended(&e) => Err(ShardLogError::DirLocked(dir.to_path_buf())),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release directory lock");
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
