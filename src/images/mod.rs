//! Content-addressed image stores.
//!
//! Two backends share one index shape and one set of lookup rules:
//! - [`oci`]: container images pulled from a registry, one EROFS blob per
//!   layer, kernel/initrd extracted from the layers.
//! - [`cloudimg`]: qcow2 cloud images downloaded by URL, one converted
//!   blob per image, booted via UEFI firmware.
//!
//! Blobs are owned by the store; VMs only pin them (by hex) for GC.

pub mod cloudimg;
pub mod digest;
pub mod oci;
pub mod progress;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BootConfig, Image, StorageConfig, VmConfig};

pub use digest::Digest;
pub use progress::{null_tracker, PullEvent, Tracker};

/// Minimum hex digits for a digest-prefix lookup. Shorter prefixes are
/// rejected outright: "sha256:a" must not match half the store.
pub const MIN_HEX_PREFIX: usize = 12;

/// Temp entries older than this are swept by GC. Long enough that no
/// legitimately running pull still owns them.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(6 * 60 * 60);

/// One pulled image, common shape across backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Normalized ref (OCI) or URL (cloudimg).
    #[serde(rename = "ref")]
    pub ref_: String,
    /// Manifest digest (OCI) or content digest (cloudimg).
    pub manifest_digest: Digest,
    /// Ordered layer digests; exactly one element for cloud images.
    pub layers: Vec<Digest>,
    /// Layer that contributed the kernel (OCI direct boot only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_layer: Option<Digest>,
    /// Layer that contributed the initrd (OCI direct boot only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd_layer: Option<Digest>,
    pub created_at: DateTime<Utc>,
}

impl ImageEntry {
    /// Every blob hex this entry references (layers + boot dirs).
    pub fn digest_hexes(&self) -> Vec<String> {
        let mut hexes: Vec<String> = self.layers.iter().map(|d| d.hex().to_string()).collect();
        for d in [&self.kernel_layer, &self.initrd_layer].into_iter().flatten() {
            let h = d.hex().to_string();
            if !hexes.contains(&h) {
                hexes.push(h);
            }
        }
        hexes
    }
}

/// Shared top-level index shape: ref → entry.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(default)]
    pub images: HashMap<String, ImageEntry>,
}

impl crate::store::Index for ImageIndex {}

impl ImageIndex {
    /// All blob hexes referenced by any entry; the GC protection set.
    pub fn referenced_digests(&self) -> HashSet<String> {
        self.images
            .values()
            .flat_map(|e| e.digest_hexes())
            .collect()
    }

    /// Resolves `id` to matching ref keys: exact key, normalizer output,
    /// exact digest, or digest prefix of at least [`MIN_HEX_PREFIX`] hex
    /// chars. Digest matches collect every alias so delete-by-digest
    /// removes all refs of that image.
    pub fn lookup_refs(&self, id: &str, normalizers: &[fn(&str) -> Option<String>]) -> Vec<String> {
        if self.images.contains_key(id) {
            return vec![id.to_string()];
        }
        for norm in normalizers {
            if let Some(normalized) = norm(id) {
                if self.images.contains_key(&normalized) {
                    return vec![normalized];
                }
            }
        }

        let id_hex = digest::strip_algo(id);
        let mut refs: Vec<String> = Vec::new();
        for (ref_, entry) in &self.images {
            let d = entry.manifest_digest.as_str();
            let d_hex = entry.manifest_digest.hex();
            if d == id || d_hex == id {
                refs.push(ref_.clone());
                continue;
            }
            if id_hex.len() >= MIN_HEX_PREFIX && d_hex.starts_with(id_hex) {
                refs.push(ref_.clone());
            }
        }
        refs.sort();
        refs
    }

    /// Removes entries matching each id (all aliases). Returns removed
    /// refs; unknown ids are skipped, so a second delete is a no-op.
    pub fn delete_by_ids(
        &mut self,
        ids: &[String],
        normalizers: &[fn(&str) -> Option<String>],
    ) -> Vec<String> {
        let mut deleted = Vec::new();
        for id in ids {
            for ref_ in self.lookup_refs(id, normalizers) {
                if self.images.remove(&ref_).is_some() {
                    deleted.push(ref_);
                }
            }
        }
        deleted
    }
}

/// Behavior shared by both image backends, as consumed by the commands
/// layer. `config` is the bridge to the VM backend: it turns a VM's image
/// ref into disk attachments plus a boot method.
#[async_trait]
pub trait ImageStore: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn pull(&self, ref_: &str, tracker: &Tracker) -> Result<()>;
    async fn inspect(&self, id: &str) -> Result<Option<Image>>;
    async fn list(&self) -> Result<Vec<Image>>;
    async fn delete(&self, ids: &[String]) -> Result<Vec<String>>;

    /// Resolves each VM's image into ordered storage configs and a boot
    /// config. Fails per-VM when a blob file is missing or invalid.
    async fn config(&self, vms: &[VmConfig]) -> Result<Vec<(Vec<StorageConfig>, BootConfig)>>;

    fn register_gc(&self, orch: &mut crate::gc::Orchestrator);
}

/// Removes temp entries older than [`STALE_TEMP_AGE`]. OCI pulls use temp
/// directories, cloudimg pulls use temp files; `dirs_only` selects which
/// kind a backend owns.
pub fn sweep_stale_temp(dir: &std::path::Path, dirs_only: bool) -> Vec<anyhow::Error> {
    let cutoff = SystemTime::now() - STALE_TEMP_AGE;
    crate::utils::fs::remove_matching(dir, |entry| {
        if dirs_only && !entry.path().is_dir() {
            return false;
        }
        entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|t| t < cutoff)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ref_: &str, hex64: &str, layers: &[&str]) -> ImageEntry {
        ImageEntry {
            ref_: ref_.to_string(),
            manifest_digest: Digest::from_hex(hex64),
            layers: layers.iter().map(|h| Digest::from_hex(h)).collect(),
            kernel_layer: None,
            initrd_layer: None,
            created_at: Utc::now(),
        }
    }

    fn index() -> ImageIndex {
        let mut idx = ImageIndex::default();
        let d1 = "aa11".repeat(16); // 64 hex chars
        let d2 = "bb22".repeat(16);
        idx.images
            .insert("docker.io/library/ubuntu:24.04".into(), entry("docker.io/library/ubuntu:24.04", &d1, &["1111"]));
        idx.images
            .insert("ghcr.io/x/ubuntu:latest".into(), entry("ghcr.io/x/ubuntu:latest", &d1, &["1111"]));
        idx.images
            .insert("https://example.com/img.qcow2".into(), entry("https://example.com/img.qcow2", &d2, &["2222"]));
        idx
    }

    fn norm_latest(id: &str) -> Option<String> {
        if id.contains(':') || id.contains('@') {
            None
        } else {
            Some(format!("{id}:latest"))
        }
    }

    #[test]
    fn exact_and_normalized_lookup() {
        let idx = index();
        assert_eq!(
            idx.lookup_refs("docker.io/library/ubuntu:24.04", &[]),
            vec!["docker.io/library/ubuntu:24.04"]
        );
        assert_eq!(
            idx.lookup_refs("ghcr.io/x/ubuntu", &[norm_latest]),
            vec!["ghcr.io/x/ubuntu:latest"]
        );
    }

    #[test]
    fn digest_lookup_collects_all_aliases() {
        let idx = index();
        let d1 = "aa11".repeat(16);
        let refs = idx.lookup_refs(&format!("sha256:{d1}"), &[]);
        assert_eq!(
            refs,
            vec!["docker.io/library/ubuntu:24.04", "ghcr.io/x/ubuntu:latest"]
        );
        // Bare hex works too.
        assert_eq!(idx.lookup_refs(&d1, &[]).len(), 2);
    }

    #[test]
    fn digest_prefix_needs_12_hex() {
        let idx = index();
        let d1 = "aa11".repeat(16);
        assert_eq!(idx.lookup_refs(&d1[..12], &[]).len(), 2);
        assert_eq!(idx.lookup_refs(&format!("sha256:{}", &d1[..12]), &[]).len(), 2);
        assert!(idx.lookup_refs(&d1[..11], &[]).is_empty());
        assert!(idx.lookup_refs("a", &[]).is_empty());
    }

    #[test]
    fn prefix_lookup_equals_full_lookup_for_unique_prefix() {
        let idx = index();
        let d1 = "aa11".repeat(16);
        assert_eq!(idx.lookup_refs(&d1[..12], &[]), idx.lookup_refs(&d1, &[]));
    }

    #[test]
    fn delete_by_digest_removes_aliases_and_is_idempotent() {
        let mut idx = index();
        let d1 = "aa11".repeat(16);
        let deleted = idx.delete_by_ids(&[d1.clone()], &[]);
        assert_eq!(deleted.len(), 2);
        assert_eq!(idx.images.len(), 1);

        let again = idx.delete_by_ids(&[d1], &[]);
        assert!(again.is_empty());
        assert_eq!(idx.images.len(), 1);
    }

    #[test]
    fn referenced_digests_unions_layers_and_boot() {
        let mut idx = ImageIndex::default();
        let mut e = entry("r", &"cc33".repeat(16), &["l1", "l2"]);
        e.kernel_layer = Some(Digest::from_hex("l2"));
        e.initrd_layer = Some(Digest::from_hex("l3"));
        idx.images.insert("r".into(), e);
        let refs = idx.referenced_digests();
        assert_eq!(
            refs,
            ["l1", "l2", "l3"].iter().map(|s| s.to_string()).collect()
        );
    }
}
