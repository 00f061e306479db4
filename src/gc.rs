//! Cross-module garbage collection.
//!
//! Each backend registers a [`Module`] describing how to snapshot its
//! state, decide what is collectible, and delete it. The orchestrator runs
//! all modules under a global multi-lock so no backend can mutate its
//! index mid-sweep:
//!
//! 1. acquire every module's flock in name-sorted order (fixed order
//!    prevents deadlock against a concurrent GC run)
//! 2. `read_db` on every module → peer snapshot map
//! 3. `resolve` on every module (pure, peer-aware) → per-module id sets
//! 4. `collect` on every module, continuing past failures
//! 5. release all locks in reverse order
//!
//! Snapshots are heterogeneous: a module only understands its own type.
//! Cross-module needs are covered by two narrow capabilities on
//! [`Snapshot`] (blob ids pinned by live VMs, and the set of active VM
//! ids) which consuming modules read from the peer map without knowing
//! who produced them.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::join_batch_errors;
use crate::store::Flock;

/// A point-in-time view of one module's state, taken under its lock.
pub trait Snapshot: Send + Sync {
    /// Concrete-type escape hatch: a module downcasts its own snapshot
    /// back out of the peer map.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Blob hexes that must survive collection because a VM pins them.
    fn used_blob_ids(&self) -> Option<&HashSet<String>> {
        None
    }

    /// Ids of VMs that exist in the VM index.
    fn active_vm_ids(&self) -> Option<&HashSet<String>> {
        None
    }
}

/// Union of a capability across all peer snapshots.
pub fn collect_used_blob_ids(peers: &HashMap<String, Box<dyn Snapshot>>) -> HashSet<String> {
    peers
        .values()
        .filter_map(|s| s.used_blob_ids())
        .flatten()
        .cloned()
        .collect()
}

pub fn collect_active_vm_ids(peers: &HashMap<String, Box<dyn Snapshot>>) -> HashSet<String> {
    peers
        .values()
        .filter_map(|s| s.active_vm_ids())
        .flatten()
        .cloned()
        .collect()
}

/// One backend's garbage collection hooks.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// The flock protecting this module's index. Held by the orchestrator
    /// for the whole run; `read_db` and `collect` must use the lockless
    /// store accessors.
    fn locker(&self) -> Flock;

    async fn read_db(&self) -> Result<Box<dyn Snapshot>>;

    /// Pure decision: which ids to collect, given this module's snapshot
    /// and every peer's.
    fn resolve(
        &self,
        snap: &dyn Snapshot,
        peers: &HashMap<String, Box<dyn Snapshot>>,
    ) -> Vec<String>;

    async fn collect(&self, ids: &[String]) -> Result<()>;
}

#[derive(Default)]
pub struct Orchestrator {
    modules: Vec<Box<dyn Module>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    /// Runs a full collection cycle. With no modules registered this is a
    /// no-op. Per-module collect failures are logged and aggregated; the
    /// sweep continues past them.
    pub async fn run(&self) -> Result<()> {
        if self.modules.is_empty() {
            return Ok(());
        }

        let mut order: Vec<usize> = (0..self.modules.len()).collect();
        order.sort_by(|&a, &b| self.modules[a].name().cmp(self.modules[b].name()));

        // Phase 1: global multi-lock, sorted by module name.
        let mut guards = Vec::with_capacity(order.len());
        for &i in &order {
            let module = &self.modules[i];
            let guard = module.locker().lock().await?;
            guards.push(guard);
        }

        // Phase 2: snapshot every module.
        let mut peers: HashMap<String, Box<dyn Snapshot>> = HashMap::new();
        for &i in &order {
            let module = &self.modules[i];
            let snap = module.read_db().await?;
            peers.insert(module.name().to_string(), snap);
        }

        // Phase 3: resolve deletion sets (pure).
        let mut to_collect: Vec<(usize, Vec<String>)> = Vec::new();
        for &i in &order {
            let module = &self.modules[i];
            let snap = &peers[module.name()];
            let ids = module.resolve(snap.as_ref(), &peers);
            if !ids.is_empty() {
                info!(module = module.name(), count = ids.len(), "collectible ids resolved");
            }
            to_collect.push((i, ids));
        }

        // Phase 4: collect, continuing past failures.
        let mut errs = Vec::new();
        for (i, ids) in to_collect {
            let module = &self.modules[i];
            if let Err(e) = module.collect(&ids).await {
                warn!(module = module.name(), error = %format!("{e:#}"), "collect failed");
                errs.push(e.context(format!("module {}", module.name())));
            }
        }

        // Phase 5: release in reverse acquisition order.
        while let Some(guard) = guards.pop() {
            drop(guard);
        }

        match join_batch_errors("gc", errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
