//! Crash-safe persistent JSON indexes protected by advisory file locks.
//!
//! Every subsystem (image stores, VM backend, network provider) keeps its
//! state in one JSON file guarded by one flock. All cross-process
//! coordination in Cocoon goes through these stores: the controller is a
//! short-lived command process, so there is no in-memory state to share.

pub mod flock;

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use flock::{Flock, FlockGuard};

use crate::utils::atomic_write_json;

/// A typed index value. `init` runs after deserialization to fill in
/// structures serde leaves empty (maps absent from old files).
pub trait Index: Default + Serialize + DeserializeOwned {
    fn init(&mut self) {}
}

/// A JSON file plus the flock that serializes access to it.
#[derive(Debug)]
pub struct JsonStore<I> {
    path: PathBuf,
    lock: Flock,
    _marker: PhantomData<fn() -> I>,
}

// Manual impl: a derive would demand `I: Clone`, but only paths are held.
impl<I> Clone for JsonStore<I> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            lock: self.lock.clone(),
            _marker: PhantomData,
        }
    }
}

impl<I: Index> JsonStore<I> {
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Flock::new(lock_path),
            _marker: PhantomData,
        }
    }

    pub fn locker(&self) -> &Flock {
        &self.lock
    }

    /// Acquires the lock, loads (or initializes) the index, and calls `fn`
    /// on it. Nothing is written back; use for consistent read-only views.
    pub async fn with<R>(&self, f: impl FnOnce(&mut I) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock().await?;
        let mut idx = load(&self.path)?;
        f(&mut idx)
    }

    /// Read-modify-write under the lock: if `fn` succeeds, the index is
    /// persisted atomically (temp file + fsync + rename).
    pub async fn update<R>(&self, f: impl FnOnce(&mut I) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock().await?;
        let mut idx = load(&self.path)?;
        let out = f(&mut idx)?;
        atomic_write_json(&self.path, &idx)
            .with_context(|| format!("persist {}", self.path.display()))?;
        Ok(out)
    }

    /// Loads the index WITHOUT taking the lock. Only valid when the caller
    /// already holds it; the GC orchestrator acquires every module's lock
    /// up front and then reads through this.
    pub fn read<R>(&self, f: impl FnOnce(&I) -> Result<R>) -> Result<R> {
        let idx = load(&self.path)?;
        f(&idx)
    }

    /// Mutates and persists WITHOUT taking the lock. Same caveat as
    /// [`JsonStore::read`]: the caller must already hold the flock.
    pub fn write<R>(&self, f: impl FnOnce(&mut I) -> Result<R>) -> Result<R> {
        let mut idx = load(&self.path)?;
        let out = f(&mut idx)?;
        atomic_write_json(&self.path, &idx)
            .with_context(|| format!("persist {}", self.path.display()))?;
        Ok(out)
    }
}

/// A missing file is an empty index; an unreadable or unparseable file is
/// fatal, since silently starting from empty would orphan every record.
fn load<I: Index>(path: &Path) -> Result<I> {
    let mut idx = match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data)
            .with_context(|| format!("parse {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => I::default(),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    idx.init();
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct TestIndex {
        #[serde(default)]
        entries: HashMap<String, u32>,
    }

    impl Index for TestIndex {}

    fn store(dir: &TempDir) -> JsonStore<TestIndex> {
        JsonStore::new(dir.path().join("idx.json"), dir.path().join("idx.lock"))
    }

    #[tokio::test]
    async fn missing_file_is_empty_index() {
        let dir = TempDir::new().unwrap();
        let n = store(&dir)
            .with(|idx| Ok(idx.entries.len()))
            .await
            .unwrap();
        assert_eq!(n, 0);
        // `with` does not create the file.
        assert!(!dir.path().join("idx.json").exists());
    }

    #[tokio::test]
    async fn update_persists_and_with_sees_it() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.update(|idx| {
            idx.entries.insert("a".into(), 1);
            Ok(())
        })
        .await
        .unwrap();

        let v = s.with(|idx| Ok(idx.entries.get("a").copied())).await.unwrap();
        assert_eq!(v, Some(1));
    }

    #[tokio::test]
    async fn failed_update_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.update(|idx| {
            idx.entries.insert("a".into(), 1);
            Ok(())
        })
        .await
        .unwrap();

        let err = s
            .update(|idx| -> Result<()> {
                idx.entries.insert("b".into(), 2);
                anyhow::bail!("mutation rejected")
            })
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("mutation rejected"));

        let n = s.with(|idx| Ok(idx.entries.len())).await.unwrap();
        assert_eq!(n, 1, "rejected mutation must not reach disk");
    }

    #[tokio::test]
    async fn corrupt_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("idx.json"), b"{ not json").unwrap();
        let err = store(&dir).with(|_| Ok(())).await.unwrap_err();
        assert!(format!("{err:#}").contains("parse"));
    }

    #[tokio::test]
    async fn updates_are_serialized_across_tasks() {
        let dir = TempDir::new().unwrap();
        let s = std::sync::Arc::new(store(&dir));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                s.update(|idx| {
                    let v = idx.entries.entry("count".into()).or_insert(0);
                    *v += 1;
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let v = s.with(|idx| Ok(idx.entries["count"])).await.unwrap();
        assert_eq!(v, 8, "no lost updates under the lock");
    }

    #[tokio::test]
    async fn lockless_read_write_round_trip() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        // Callers of read/write hold the flock externally (GC); the store
        // itself just does the IO.
        s.write(|idx| {
            idx.entries.insert("x".into(), 7);
            Ok(())
        })
        .unwrap();
        let v = s.read(|idx| Ok(idx.entries["x"])).unwrap();
        assert_eq!(v, 7);
    }
}
