//! Cross-process advisory file locking.
//!
//! Lock files are long-lived and never deleted after use: deleting a lock
//! file while another process holds or is about to acquire it reintroduces
//! the race the lock exists to prevent.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fs2::FileExt;

const RETRY_DELAY: Duration = Duration::from_millis(100);
/// Upper bound on lock acquisition. Index critical sections are short;
/// waiting longer than this means a peer died while holding the flock or
/// the filesystem is wedged.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// An exclusive flock(2) on a well-known path.
#[derive(Debug, Clone)]
pub struct Flock {
    path: PathBuf,
}

impl Flock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the lock, polling every 100 ms. The returned guard holds
    /// the lock until dropped.
    pub async fn lock(&self) -> Result<FlockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("open lock file {}", self.path.display()))?;

        let deadline = tokio::time::Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(FlockGuard { file }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("acquire flock {}", self.path.display()))
                }
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "acquire flock {}: timed out after {ACQUIRE_TIMEOUT:?}",
                    self.path.display()
                );
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
}

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct FlockGuard {
    file: File,
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
