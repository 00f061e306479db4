//! OCI image backend: registry images converted to per-layer EROFS blobs.

mod erofs;
mod gc;
mod pull;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use crate::config::Config;
use crate::error::Error;
use crate::images::{ImageIndex, ImageStore, Tracker};
use crate::store::JsonStore;
use crate::types::{BootConfig, Image, StorageConfig, VmConfig};
use crate::utils::valid_file;

pub const KIND: &str = "oci";
/// Serial prefix for readonly layer disks; the guest orders its overlay
/// mount by these.
pub const LAYER_SERIAL_PREFIX: &str = "cocoon-layer";
/// Serial of the guest-writable COW disk.
pub const COW_SERIAL: &str = "cocoon-cow";

/// Appends `:latest` when the ref names neither tag nor digest.
pub fn normalize_ref(ref_: &str) -> Result<String> {
    if ref_.is_empty() {
        return Err(Error::Invalid("empty image reference".to_string()).into());
    }
    if ref_.contains(':') || ref_.contains('@') {
        Ok(ref_.to_string())
    } else {
        Ok(format!("{ref_}:latest"))
    }
}

fn normalize_for_lookup(id: &str) -> Option<String> {
    match normalize_ref(id) {
        Ok(n) if n != id => Some(n),
        _ => None,
    }
}

pub struct OciStore {
    conf: Config,
    store: JsonStore<ImageIndex>,
    /// Bounds concurrent layer conversions.
    pool: Arc<Semaphore>,
    /// Per-ref gates: concurrent pulls of one ref collapse onto a single
    /// in-flight operation (joiners re-check the index and short-circuit).
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OciStore {
    pub fn new(conf: &Config) -> Result<Self> {
        crate::utils::ensure_dirs([
            conf.oci_db_dir(),
            conf.oci_temp_dir(),
            conf.oci_blobs_dir(),
            conf.oci_boot_base_dir(),
        ])?;
        Ok(Self {
            conf: conf.clone(),
            store: JsonStore::new(conf.oci_index_file(), conf.oci_index_lock()),
            pool: Arc::new(Semaphore::new(conf.pool_size.max(1))),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    async fn ref_gate(&self, ref_: &str) -> Arc<Mutex<()>> {
        let mut map = self.inflight.lock().await;
        map.entry(ref_.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl ImageStore for OciStore {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn pull(&self, ref_: &str, tracker: &Tracker) -> Result<()> {
        let ref_ = normalize_ref(ref_)?;
        let gate = self.ref_gate(&ref_).await;
        let _in_flight = gate.lock().await;
        pull::pull(&self.conf, &self.store, &self.pool, &ref_, tracker).await
    }

    async fn inspect(&self, id: &str) -> Result<Option<Image>> {
        self.store
            .with(|idx| {
                let refs = idx.lookup_refs(id, &[normalize_for_lookup]);
                let Some(entry) = refs.first().and_then(|r| idx.images.get(r)) else {
                    return Ok(None);
                };
                Ok(Some(self.entry_to_image(entry)))
            })
            .await
    }

    async fn list(&self) -> Result<Vec<Image>> {
        self.store
            .with(|idx| {
                let mut images: Vec<Image> =
                    idx.images.values().map(|e| self.entry_to_image(e)).collect();
                images.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(images)
            })
            .await
    }

    async fn delete(&self, ids: &[String]) -> Result<Vec<String>> {
        self.store
            .update(|idx| Ok(idx.delete_by_ids(ids, &[normalize_for_lookup])))
            .await
    }

    async fn config(&self, vms: &[VmConfig]) -> Result<Vec<(Vec<StorageConfig>, BootConfig)>> {
        self.store
            .with(|idx| {
                let mut out = Vec::with_capacity(vms.len());
                for vm in vms {
                    let refs = idx.lookup_refs(&vm.image, &[normalize_for_lookup]);
                    let entry = refs
                        .first()
                        .and_then(|r| idx.images.get(r))
                        .ok_or_else(|| Error::NotFound(format!("image {:?}", vm.image)))?;

                    let mut configs = Vec::with_capacity(entry.layers.len() + 1);
                    for (i, layer) in entry.layers.iter().enumerate() {
                        let path = self.conf.oci_blob_path(layer.hex());
                        if !valid_file(&path) {
                            anyhow::bail!(
                                "blob {} missing or empty for VM {} (run pull again)",
                                path.display(),
                                vm.name
                            );
                        }
                        configs.push(StorageConfig {
                            path,
                            readonly: true,
                            serial: format!("{LAYER_SERIAL_PREFIX}{i}"),
                        });
                    }
                    // The rw COW disk lives in the VM's run dir; the
                    // backend fills the path at create time.
                    configs.push(StorageConfig {
                        path: std::path::PathBuf::new(),
                        readonly: false,
                        serial: COW_SERIAL.to_string(),
                    });

                    let kernel_layer = entry
                        .kernel_layer
                        .as_ref()
                        .ok_or_else(|| Error::NotFound(format!("kernel for {:?}", vm.image)))?;
                    let initrd_layer = entry
                        .initrd_layer
                        .as_ref()
                        .ok_or_else(|| Error::NotFound(format!("initrd for {:?}", vm.image)))?;
                    let kernel_path = self.conf.oci_kernel_path(kernel_layer.hex());
                    let initrd_path = self.conf.oci_initrd_path(initrd_layer.hex());
                    for p in [&kernel_path, &initrd_path] {
                        if !valid_file(p) {
                            anyhow::bail!(
                                "boot file {} missing for VM {} (run pull again)",
                                p.display(),
                                vm.name
                            );
                        }
                    }

                    out.push((
                        configs,
                        BootConfig::DirectKernel {
                            kernel_path,
                            initrd_path,
                        },
                    ));
                }
                Ok(out)
            })
            .await
    }

    fn register_gc(&self, orch: &mut crate::gc::Orchestrator) {
        orch.register(Box::new(gc::OciGcModule::new(
            self.conf.clone(),
            self.store.clone(),
        )));
    }
}

impl OciStore {
    fn entry_to_image(&self, entry: &crate::images::ImageEntry) -> Image {
        let size = entry
            .layers
            .iter()
            .filter_map(|l| std::fs::metadata(self.conf.oci_blob_path(l.hex())).ok())
            .map(|m| m.len())
            .sum();
        Image {
            id: entry.manifest_digest.as_str().to_string(),
            name: entry.ref_.clone(),
            image_type: KIND.to_string(),
            size,
            created_at: entry.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_appends_latest() {
        assert_eq!(normalize_ref("ubuntu").unwrap(), "ubuntu:latest");
        assert_eq!(normalize_ref("ubuntu:24.04").unwrap(), "ubuntu:24.04");
        assert_eq!(
            normalize_ref("ghcr.io/x/y@sha256:abcd").unwrap(),
            "ghcr.io/x/y@sha256:abcd"
        );
        let err = normalize_ref("").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Invalid(_))
        ));
    }

    #[test]
    fn lookup_normalizer_only_fires_when_changed() {
        assert_eq!(
            normalize_for_lookup("ubuntu"),
            Some("ubuntu:latest".to_string())
        );
        assert_eq!(normalize_for_lookup("ubuntu:24.04"), None);
    }
}
