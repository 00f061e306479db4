//! GC module for the OCI store: unreferenced EROFS blobs and boot dirs.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::gc::{collect_used_blob_ids, Module, Snapshot};
use crate::images::{sweep_stale_temp, ImageIndex};
use crate::store::{Flock, JsonStore};
use crate::utils::fs::{filter_unreferenced, scan_file_stems, scan_subdirs};

struct OciSnapshot {
    /// Digest hexes referenced by the index.
    refs: HashSet<String>,
    /// Hexes of .erofs blobs on disk.
    blobs: Vec<String>,
    /// Hex-named boot directories on disk.
    boot_dirs: Vec<String>,
}

impl Snapshot for OciSnapshot {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub(super) struct OciGcModule {
    conf: Config,
    store: JsonStore<ImageIndex>,
}

impl OciGcModule {
    pub(super) fn new(conf: Config, store: JsonStore<ImageIndex>) -> Self {
        Self { conf, store }
    }
}

#[async_trait]
impl Module for OciGcModule {
    fn name(&self) -> &str {
        super::KIND
    }

    fn locker(&self) -> Flock {
        self.store.locker().clone()
    }

    async fn read_db(&self) -> Result<Box<dyn Snapshot>> {
        let refs = self.store.read(|idx| Ok(idx.referenced_digests()))?;
        Ok(Box::new(OciSnapshot {
            refs,
            blobs: scan_file_stems(&self.conf.oci_blobs_dir(), "erofs"),
            boot_dirs: scan_subdirs(&self.conf.oci_boot_base_dir()),
        }))
    }

    fn resolve(
        &self,
        snap: &dyn Snapshot,
        peers: &HashMap<String, Box<dyn Snapshot>>,
    ) -> Vec<String> {
        // Protection set = index refs ∪ blobs pinned by live VMs.
        let Some(own) = snap.as_any().downcast_ref::<OciSnapshot>() else {
            return Vec::new();
        };
        let mut protected = own.refs.clone();
        protected.extend(collect_used_blob_ids(peers));

        let mut candidates = filter_unreferenced(&own.blobs, &protected);
        for hex in filter_unreferenced(&own.boot_dirs, &protected) {
            if !candidates.contains(&hex) {
                candidates.push(hex);
            }
        }
        candidates
    }

    async fn collect(&self, ids: &[String]) -> Result<()> {
        let mut errs = sweep_stale_temp(&self.conf.oci_temp_dir(), true);
        for hex in ids {
            if let Err(e) = std::fs::remove_file(self.conf.oci_blob_path(hex)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    errs.push(anyhow::anyhow!("remove blob {hex}: {e}"));
                }
            }
            if let Err(e) = std::fs::remove_dir_all(self.conf.oci_boot_dir(hex)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    errs.push(anyhow::anyhow!("remove boot dir {hex}: {e}"));
                }
            }
        }
        match crate::error::join_batch_errors("oci gc", errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
