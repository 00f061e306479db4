//! GC module for the VM backend: orphan run/log directories and records
//! stuck in `creating` from a crashed create.
//!
//! This module is also the source of the two cross-module capabilities:
//! the blob ids pinned by VMs (consumed by both image stores) and the set
//! of active VM ids (consumed by the network provider).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::config::Config;
use crate::gc::{Module, Snapshot};
use crate::store::{Flock, JsonStore};
use crate::types::VmState;
use crate::utils::fs::{filter_unreferenced, scan_subdirs};

use super::index::VmIndex;

/// A `creating` record untouched for this long is a crashed create, not
/// one in progress. Matches the stale-temp threshold of the image stores.
const STALE_CREATING_AGE: Duration = crate::images::STALE_TEMP_AGE;

struct ChSnapshot {
    vm_ids: HashSet<String>,
    pinned_blobs: HashSet<String>,
    run_dirs: Vec<String>,
    log_dirs: Vec<String>,
    stale_creating: Vec<String>,
}

impl Snapshot for ChSnapshot {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn used_blob_ids(&self) -> Option<&HashSet<String>> {
        Some(&self.pinned_blobs)
    }

    fn active_vm_ids(&self) -> Option<&HashSet<String>> {
        Some(&self.vm_ids)
    }
}

pub(super) struct ChGcModule {
    conf: Config,
    store: JsonStore<VmIndex>,
}

impl ChGcModule {
    pub(super) fn new(conf: Config, store: JsonStore<VmIndex>) -> Self {
        Self { conf, store }
    }
}

#[async_trait]
impl Module for ChGcModule {
    fn name(&self) -> &str {
        super::KIND
    }

    fn locker(&self) -> Flock {
        self.store.locker().clone()
    }

    async fn read_db(&self) -> Result<Box<dyn Snapshot>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(STALE_CREATING_AGE).expect("constant in range");
        let (vm_ids, pinned_blobs, stale_creating) = self.store.read(|idx| {
            let stale = idx
                .vms
                .values()
                .filter(|r| r.state == VmState::Creating && r.updated_at < cutoff)
                .map(|r| r.id.clone())
                .collect();
            Ok((idx.vm_ids(), idx.pinned_blob_ids(), stale))
        })?;

        Ok(Box::new(ChSnapshot {
            vm_ids,
            pinned_blobs,
            run_dirs: scan_subdirs(&self.conf.ch_run_base_dir()),
            log_dirs: scan_subdirs(&self.conf.ch_log_base_dir()),
            stale_creating,
        }))
    }

    fn resolve(
        &self,
        snap: &dyn Snapshot,
        _peers: &HashMap<String, Box<dyn Snapshot>>,
    ) -> Vec<String> {
        let Some(own) = snap.as_any().downcast_ref::<ChSnapshot>() else {
            return Vec::new();
        };
        // Orphans: dirs on disk with no record behind them.
        let mut ids = filter_unreferenced(&own.run_dirs, &own.vm_ids);
        for id in filter_unreferenced(&own.log_dirs, &own.vm_ids) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        // Plus crashed creates, which still have records.
        for id in &own.stale_creating {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    async fn collect(&self, ids: &[String]) -> Result<()> {
        let mut errs = Vec::new();
        let mut purge = Vec::new();

        for id in ids {
            for dir in [self.conf.ch_vm_run_dir(id), self.conf.ch_vm_log_dir(id)] {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        errs.push(anyhow::anyhow!("remove {}: {e}", dir.display()));
                    }
                }
            }
            purge.push(id.clone());
        }

        // Purge crashed-create records (lockless write; the orchestrator
        // holds our flock).
        let write = self.store.write(|idx| {
            let mut removed = 0usize;
            for id in &purge {
                let is_stale_creating = idx
                    .vms
                    .get(id)
                    .map(|r| r.state == VmState::Creating)
                    .unwrap_or(false);
                if is_stale_creating {
                    if let Some(rec) = idx.vms.remove(id) {
                        // Use the record's persisted paths, which win over
                        // the currently configured base dirs.
                        let _ = std::fs::remove_dir_all(&rec.run_dir);
                        let _ = std::fs::remove_dir_all(&rec.log_dir);
                        idx.names.remove(&rec.config.name);
                        removed += 1;
                    }
                }
            }
            Ok(removed)
        });
        match write {
            Ok(removed) if removed > 0 => {
                info!(removed, "purged crashed-create records");
            }
            Ok(_) => {}
            Err(e) => errs.push(e.context("purge creating records")),
        }

        match crate::error::join_batch_errors("vm gc", errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
