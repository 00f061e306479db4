//! Cloud image backend: qcow2 images fetched by URL, booted via UEFI.

mod gc;
mod pull;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::Error;
use crate::images::{ImageIndex, ImageStore, Tracker};
use crate::store::JsonStore;
use crate::types::{BootConfig, Image, StorageConfig, VmConfig};
use crate::utils::valid_file;

pub const KIND: &str = "cloudimg";
/// Serial of the readonly backing blob.
pub const BASE_SERIAL: &str = "cocoon-base";

pub struct CloudImgStore {
    conf: Config,
    store: JsonStore<ImageIndex>,
    /// Per-URL gates: concurrent pulls of one URL collapse.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CloudImgStore {
    pub fn new(conf: &Config) -> Result<Self> {
        crate::utils::ensure_dirs([
            conf.cloudimg_db_dir(),
            conf.cloudimg_temp_dir(),
            conf.cloudimg_blobs_dir(),
        ])?;
        Ok(Self {
            conf: conf.clone(),
            store: JsonStore::new(conf.cloudimg_index_file(), conf.cloudimg_index_lock()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_url(ref_: &str) -> bool {
        ref_.starts_with("http://") || ref_.starts_with("https://")
    }
}

#[async_trait]
impl ImageStore for CloudImgStore {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn pull(&self, url: &str, tracker: &Tracker) -> Result<()> {
        if !Self::is_url(url) {
            return Err(Error::Invalid(format!("not a cloud image URL: {url:?}")).into());
        }
        let gate = {
            let mut map = self.inflight.lock().await;
            map.entry(url.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _in_flight = gate.lock().await;
        pull::pull(&self.conf, &self.store, url, tracker).await
    }

    async fn inspect(&self, id: &str) -> Result<Option<Image>> {
        self.store
            .with(|idx| {
                let refs = idx.lookup_refs(id, &[]);
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
        self.store.update(|idx| Ok(idx.delete_by_ids(ids, &[]))).await
    }

    async fn config(&self, vms: &[VmConfig]) -> Result<Vec<(Vec<StorageConfig>, BootConfig)>> {
        self.store
            .with(|idx| {
                let mut out = Vec::with_capacity(vms.len());
                for vm in vms {
                    let refs = idx.lookup_refs(&vm.image, &[]);
                    let entry = refs
                        .first()
                        .and_then(|r| idx.images.get(r))
                        .ok_or_else(|| Error::NotFound(format!("image {:?}", vm.image)))?;

                    let hex = entry
                        .layers
                        .first()
                        .ok_or_else(|| Error::NotFound(format!("blob for {:?}", vm.image)))?
                        .hex();
                    let blob_path = self.conf.cloudimg_blob_path(hex);
                    if !valid_file(&blob_path) {
                        anyhow::bail!(
                            "blob {} missing or empty for VM {} (run pull again)",
                            blob_path.display(),
                            vm.name
                        );
                    }

                    let firmware_path = self.conf.firmware_path();
                    if !valid_file(&firmware_path) {
                        anyhow::bail!("UEFI firmware not found: {}", firmware_path.display());
                    }

                    // The rw qcow2 overlay lives in the VM's run dir; the
                    // backend fills the path at create time.
                    let configs = vec![
                        StorageConfig {
                            path: blob_path,
                            readonly: true,
                            serial: BASE_SERIAL.to_string(),
                        },
                        StorageConfig {
                            path: std::path::PathBuf::new(),
                            readonly: false,
                            serial: super::oci::COW_SERIAL.to_string(),
                        },
                    ];
                    out.push((configs, BootConfig::Uefi { firmware_path }));
                }
                Ok(out)
            })
            .await
    }

    fn register_gc(&self, orch: &mut crate::gc::Orchestrator) {
        orch.register(Box::new(gc::CloudImgGcModule::new(
            self.conf.clone(),
            self.store.clone(),
        )));
    }
}

impl CloudImgStore {
    fn entry_to_image(&self, entry: &crate::images::ImageEntry) -> Image {
        let size = entry
            .layers
            .iter()
            .filter_map(|l| std::fs::metadata(self.conf.cloudimg_blob_path(l.hex())).ok())
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
    fn url_detection() {
        assert!(CloudImgStore::is_url("https://cloud-images.ubuntu.com/noble.img"));
        assert!(CloudImgStore::is_url("http://mirror/x.qcow2"));
        assert!(!CloudImgStore::is_url("ubuntu:24.04"));
        assert!(!CloudImgStore::is_url("ghcr.io/x/y"));
    }
}
