//! GC module for the cloud image store: unreferenced qcow2 blobs.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::gc::{collect_used_blob_ids, Module, Snapshot};
use crate::images::{sweep_stale_temp, ImageIndex};
use crate::store::{Flock, JsonStore};
use crate::utils::fs::{filter_unreferenced, scan_file_stems};

struct CloudImgSnapshot {
    refs: HashSet<String>,
    blobs: Vec<String>,
}

impl Snapshot for CloudImgSnapshot {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub(super) struct CloudImgGcModule {
    conf: Config,
    store: JsonStore<ImageIndex>,
}

impl CloudImgGcModule {
    pub(super) fn new(conf: Config, store: JsonStore<ImageIndex>) -> Self {
        Self { conf, store }
    }
}

#[async_trait]
impl Module for CloudImgGcModule {
    fn name(&self) -> &str {
        super::KIND
    }

    fn locker(&self) -> Flock {
        self.store.locker().clone()
    }

    async fn read_db(&self) -> Result<Box<dyn Snapshot>> {
        let refs = self.store.read(|idx| Ok(idx.referenced_digests()))?;
        Ok(Box::new(CloudImgSnapshot {
            refs,
            blobs: scan_file_stems(&self.conf.cloudimg_blobs_dir(), "qcow2"),
        }))
    }

    fn resolve(
        &self,
        snap: &dyn Snapshot,
        peers: &HashMap<String, Box<dyn Snapshot>>,
    ) -> Vec<String> {
        let Some(own) = snap.as_any().downcast_ref::<CloudImgSnapshot>() else {
            return Vec::new();
        };
        let mut protected = own.refs.clone();
        protected.extend(collect_used_blob_ids(peers));
        filter_unreferenced(&own.blobs, &protected)
    }

    async fn collect(&self, ids: &[String]) -> Result<()> {
        let mut errs = sweep_stale_temp(&self.conf.cloudimg_temp_dir(), false);
        for hex in ids {
            if let Err(e) = std::fs::remove_file(self.conf.cloudimg_blob_path(hex)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    errs.push(anyhow::anyhow!("remove blob {hex}: {e}"));
                }
            }
        }
        match crate::error::join_batch_errors("cloudimg gc", errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
