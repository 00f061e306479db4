//! Per-VM networking: named netns, CNI-assigned addressing, bridge + tap
//! assembly for the VMM.

pub mod cni;
pub mod db;
pub mod netns;

mod gc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::store::JsonStore;
use crate::types::{Network, NetworkConfig, VmConfig};
use crate::utils::{generate_id, generate_mac};

use cni::{Conflist, RuntimeConf};
use db::NetworkIndex;

pub const KIND: &str = "cni";
const NIC_QUEUE_SIZE: u32 = 256;

pub struct CniProvider {
    conf: Config,
    store: JsonStore<NetworkIndex>,
    /// None when no conflist was found; every mutating call then fails
    /// with [`Error::NotConfigured`] so callers can run VMs without
    /// networking.
    conflist: Option<Conflist>,
}

impl CniProvider {
    pub fn new(conf: &Config) -> Result<Self> {
        crate::utils::ensure_dirs([conf.cni_db_dir()])?;
        let conflist = cni::load_conflist(&conf.cni_conf_dir)?;
        match &conflist {
            Some(c) => info!(network = %c.name, "CNI network provider configured"),
            None => info!(dir = %conf.cni_conf_dir.display(), "no CNI conflist, networking disabled"),
        }
        Ok(Self {
            conf: conf.clone(),
            store: JsonStore::new(conf.cni_index_file(), conf.cni_index_lock()),
            conflist,
        })
    }

    pub fn kind(&self) -> &'static str {
        KIND
    }

    pub fn configured(&self) -> bool {
        self.conflist.is_some()
    }

    /// Checks that the VM's netns still exists (e.g. after a host
    /// reboot, /var/run is gone).
    pub fn verify(&self, vm_id: &str) -> Result<()> {
        let name = self.conf.netns_name(vm_id);
        if netns::netns_exists(&name) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("netns {name}")).into())
        }
    }

    /// Creates netns, invokes CNI ADD, and assembles bridge + tap for
    /// each NIC. With `existing` (recovery after host reboot), persisted
    /// MACs and records are reused and only the plumbing is recreated.
    pub async fn config(
        &self,
        vm_id: &str,
        num_nics: usize,
        vm_cfg: &VmConfig,
        existing: Option<&[NetworkConfig]>,
    ) -> Result<Vec<NetworkConfig>> {
        let Some(conflist) = &self.conflist else {
            return Err(Error::NotConfigured(format!(
                "no conflist found in {}",
                self.conf.cni_conf_dir.display()
            ))
            .into());
        };

        let ns_name = self.conf.netns_name(vm_id);
        let ns_path = self.conf.netns_path(vm_id);

        netns::create_netns(&ns_name).await?;

        match self
            .config_nics(conflist, vm_id, num_nics, vm_cfg, existing, &ns_path, &ns_name)
            .await
        {
            Ok(configs) => Ok(configs),
            Err(e) => {
                // Tear the netns down so a retry starts clean.
                if let Err(del_err) = netns::delete_netns(&ns_name).await {
                    warn!(netns = %ns_name, error = %format!("{del_err:#}"), "teardown failed");
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn config_nics(
        &self,
        conflist: &Conflist,
        vm_id: &str,
        num_nics: usize,
        vm_cfg: &VmConfig,
        existing: Option<&[NetworkConfig]>,
        ns_path: &std::path::Path,
        ns_name: &str,
    ) -> Result<Vec<NetworkConfig>> {
        let mut configs = Vec::with_capacity(num_nics);

        for i in 0..num_nics {
            let if_name = format!("eth{i}");
            let br_name = format!("br{i}");
            let tap_name = format!("tap{i}");

            let rt = RuntimeConf {
                container_id: vm_id,
                netns: ns_path,
                if_name: &if_name,
            };
            let result = cni::add_network_list(&self.conf.cni_bin_dir, conflist, &rt)
                .await
                .with_context(|| format!("CNI ADD {vm_id}/{if_name}"))?;

            netns::setup_bridge_tap(ns_name, &if_name, &br_name, &tap_name)
                .await
                .with_context(|| format!("setup bridge/tap for {vm_id}"))?;

            // Recovery keeps the guest's MAC stable so DHCP leases and
            // ARP caches survive a host reboot.
            let prior = existing.and_then(|e| e.get(i));
            let mac = prior
                .map(|p| p.mac.clone())
                .unwrap_or_else(generate_mac);
            let network = match prior {
                Some(p) => p.network.clone(),
                None => Network {
                    id: generate_id(),
                    net_type: conflist.name.clone(),
                    ip: result.ip,
                    gateway: result.gateway,
                    netmask: result.netmask,
                    hostname: vm_cfg.name.clone(),
                },
            };

            info!(
                vm_id,
                nic = i,
                ip = %network.ip,
                gateway = %network.gateway,
                tap = %tap_name,
                mac = %mac,
                "NIC configured"
            );

            configs.push(NetworkConfig {
                tap: tap_name,
                mac,
                queues: vm_cfg.cpu,
                queue_size: NIC_QUEUE_SIZE,
                network,
            });
        }

        // First-time setup persists one record per NIC; recovery reuses
        // the records already present.
        if existing.is_none() {
            let vm_id = vm_id.to_string();
            let to_persist = configs.clone();
            self.store
                .update(move |idx| {
                    for (i, cfg) in to_persist.iter().enumerate() {
                        idx.networks.insert(
                            cfg.network.id.clone(),
                            db::NetworkRecord {
                                network: cfg.network.clone(),
                                vm_id: vm_id.clone(),
                                if_name: format!("eth{i}"),
                                mac: cfg.mac.clone(),
                            },
                        );
                    }
                    Ok(())
                })
                .await
                .context("persist network records")?;
        }

        Ok(configs)
    }

    /// Tears down networking for each VM: CNI DEL per NIC (best-effort
    /// IPAM release), netns removal, record cleanup. Returns the ids that
    /// were fully cleaned.
    pub async fn delete(&self, vm_ids: &[String]) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        let mut errs = Vec::new();

        for vm_id in vm_ids {
            match self.delete_one(vm_id).await {
                Ok(()) => deleted.push(vm_id.clone()),
                Err(e) => {
                    warn!(vm_id = %vm_id, error = %format!("{e:#}"), "network delete failed");
                    errs.push(e.context(format!("VM {vm_id}")));
                }
            }
        }

        match crate::error::join_batch_errors("network delete", errs) {
            Some(err) => Err(err),
            None => Ok(deleted),
        }
    }

    async fn delete_one(&self, vm_id: &str) -> Result<()> {
        let records = self.store.with(|idx| Ok(idx.by_vm_id(vm_id))).await?;

        if let Some(conflist) = &self.conflist {
            let ns_path = self.conf.netns_path(vm_id);
            for rec in &records {
                let rt = RuntimeConf {
                    container_id: vm_id,
                    netns: &ns_path,
                    if_name: &rec.if_name,
                };
                let _ = cni::del_network_list(&self.conf.cni_bin_dir, conflist, &rt).await;
            }
        }

        netns::delete_netns(&self.conf.netns_name(vm_id)).await?;

        if !records.is_empty() {
            let vm_id = vm_id.to_string();
            self.store
                .update(move |idx| {
                    idx.networks.retain(|_, rec| rec.vm_id != vm_id);
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    pub async fn inspect(&self, id: &str) -> Result<Option<Network>> {
        self.store
            .with(|idx| Ok(idx.networks.get(id).map(|r| r.network.clone())))
            .await
    }

    pub async fn list(&self) -> Result<Vec<Network>> {
        self.store
            .with(|idx| {
                let mut nets: Vec<Network> =
                    idx.networks.values().map(|r| r.network.clone()).collect();
                nets.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(nets)
            })
            .await
    }

    pub fn register_gc(&self, orch: &mut crate::gc::Orchestrator) {
        orch.register(Box::new(gc::CniGcModule::new(
            self.conf.clone(),
            self.store.clone(),
            self.conflist.clone(),
        )));
    }
}
