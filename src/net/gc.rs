//! GC module for the network provider: orphan netns entries and stale
//! records belonging to VMs that no longer exist.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::config::{Config, NETNS_BASE, NETNS_PREFIX};
use crate::gc::{collect_active_vm_ids, Module, Snapshot};
use crate::store::{Flock, JsonStore};

use super::cni::{self, Conflist, RuntimeConf};
use super::db::NetworkIndex;
use super::netns;

struct CniSnapshot {
    /// VM ids present in network records.
    db_vm_ids: HashSet<String>,
    /// VM ids extracted from /var/run/netns/cocoon-* entries.
    netns_vm_ids: Vec<String>,
}

impl Snapshot for CniSnapshot {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub(super) struct CniGcModule {
    conf: Config,
    store: JsonStore<NetworkIndex>,
    conflist: Option<Conflist>,
}

impl CniGcModule {
    pub(super) fn new(
        conf: Config,
        store: JsonStore<NetworkIndex>,
        conflist: Option<Conflist>,
    ) -> Self {
        Self {
            conf,
            store,
            conflist,
        }
    }
}

#[async_trait]
impl Module for CniGcModule {
    fn name(&self) -> &str {
        super::KIND
    }

    fn locker(&self) -> Flock {
        self.store.locker().clone()
    }

    async fn read_db(&self) -> Result<Box<dyn Snapshot>> {
        let db_vm_ids = self.store.read(|idx| Ok(idx.vm_ids()))?;

        // Only entries with our prefix: docker/containerd own the rest.
        let mut netns_vm_ids = Vec::new();
        if let Ok(entries) = std::fs::read_dir(NETNS_BASE) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(vm_id) = name.strip_prefix(NETNS_PREFIX) {
                    netns_vm_ids.push(vm_id.to_string());
                }
            }
        }
        netns_vm_ids.sort();

        Ok(Box::new(CniSnapshot {
            db_vm_ids,
            netns_vm_ids,
        }))
    }

    fn resolve(
        &self,
        snap: &dyn Snapshot,
        peers: &HashMap<String, Box<dyn Snapshot>>,
    ) -> Vec<String> {
        let Some(own) = snap.as_any().downcast_ref::<CniSnapshot>() else {
            return Vec::new();
        };
        let active = collect_active_vm_ids(peers);

        // Orphans: (record VM ids ∪ netns VM ids) − active VM ids.
        let mut candidates: Vec<String> = own
            .db_vm_ids
            .iter()
            .cloned()
            .chain(own.netns_vm_ids.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|id| !active.contains(id))
            .collect();
        candidates.sort();
        candidates
    }

    async fn collect(&self, ids: &[String]) -> Result<()> {
        let mut errs = Vec::new();

        for vm_id in ids {
            // Lockless read: the orchestrator holds our flock.
            let records = match self.store.read(|idx| Ok(idx.by_vm_id(vm_id))) {
                Ok(records) => records,
                Err(e) => {
                    errs.push(e.context(format!("read records for {vm_id}")));
                    continue;
                }
            };

            // CNI DEL per NIC, best-effort IPAM release before the netns
            // disappears.
            if let Some(conflist) = &self.conflist {
                let ns_path = self.conf.netns_path(vm_id);
                for rec in &records {
                    let rt = RuntimeConf {
                        container_id: vm_id,
                        netns: &ns_path,
                        if_name: &rec.if_name,
                    };
                    if let Err(e) =
                        cni::del_network_list(&self.conf.cni_bin_dir, conflist, &rt).await
                    {
                        warn!(vm_id = %vm_id, if_name = %rec.if_name, error = %format!("{e:#}"), "CNI DEL failed");
                    }
                }
            }

            if let Err(e) = netns::delete_netns(&self.conf.netns_name(vm_id)).await {
                errs.push(e.context(format!("remove netns of {vm_id}")));
            }

            if !records.is_empty() {
                let vm_id = vm_id.clone();
                if let Err(e) = self.store.write(move |idx| {
                    idx.networks.retain(|_, rec| rec.vm_id != vm_id);
                    Ok(())
                }) {
                    errs.push(e.context("clean network records"));
                }
            }
        }

        match crate::error::join_batch_errors("network gc", errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
