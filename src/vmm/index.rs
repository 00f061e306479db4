//! Persisted VM index: records, the name map, and ref resolution.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{BootConfig, NetworkConfig, StorageConfig, Vm, VmConfig, VmState};
use crate::utils::read_pid_file;

/// Minimum id-prefix length accepted by ref resolution.
pub const MIN_ID_PREFIX: usize = 3;

/// The persisted record for one VM.
///
/// `run_dir`/`log_dir` are captured at create time and used for every
/// later cleanup, so reconfiguring the global directories between create
/// and delete cannot orphan files. The PID is not stored: it changes on
/// every start, so reads derive it from the PID file under `run_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub state: VmState,
    pub config: VmConfig,

    /// Ordered disk attachments (readonly layers first, then the COW
    /// disk, then the cidata seed for cloud images).
    pub storage_configs: Vec<StorageConfig>,
    pub boot_config: BootConfig,
    #[serde(default)]
    pub network_configs: Vec<NetworkConfig>,

    /// Blob hexes this VM pins against image GC.
    #[serde(default)]
    pub image_blob_ids: HashSet<String>,

    /// Console endpoint recorded at start time (socket or PTY path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_path: Option<PathBuf>,
    /// Set once the VM has booted at least once; cloud-init seeds are not
    /// regenerated after that.
    #[serde(default)]
    pub first_booted: bool,

    pub run_dir: PathBuf,
    pub log_dir: PathBuf,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl VmRecord {
    // Runtime paths are all derived from the persisted run dir.

    pub fn api_socket_path(&self) -> PathBuf {
        self.run_dir.join("api.sock")
    }
    pub fn pid_file(&self) -> PathBuf {
        self.run_dir.join("ch.pid")
    }
    pub fn cmdline_file(&self) -> PathBuf {
        self.run_dir.join("cmdline")
    }
    pub fn console_sock(&self) -> PathBuf {
        self.run_dir.join("console.sock")
    }
    pub fn cow_raw_path(&self) -> PathBuf {
        self.run_dir.join("cow.raw")
    }
    pub fn overlay_path(&self) -> PathBuf {
        self.run_dir.join("overlay.qcow2")
    }
    pub fn cidata_path(&self) -> PathBuf {
        self.run_dir.join("cidata.img")
    }
    pub fn process_log_path(&self) -> PathBuf {
        self.log_dir.join("ch.log")
    }

    /// The externally visible view, with pid/socket recomputed from the
    /// run dir so the response reflects live state.
    pub fn to_vm(&self) -> Vm {
        Vm {
            id: self.id.clone(),
            state: self.state,
            config: self.config.clone(),
            pid: read_pid_file(&self.pid_file()),
            api_socket_path: Some(self.api_socket_path()),
            console_path: self.console_path.clone(),
            network_configs: self.network_configs.clone(),
            storage_configs: self.storage_configs.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
        }
    }
}

/// Top-level structure of vms.json.
///
/// Invariants: `names[r.config.name] == r.id` for every record, and no
/// two records share a name. Both maps are always mutated inside one
/// `update` so a crash cannot split them.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VmIndex {
    #[serde(default)]
    pub vms: HashMap<String, VmRecord>,
    #[serde(default)]
    pub names: HashMap<String, String>,
}

impl crate::store::Index for VmIndex {}

impl VmIndex {
    /// Resolves a user-supplied ref to an exact VM id: exact id, then
    /// registered name, then id prefix of at least [`MIN_ID_PREFIX`]
    /// characters. Ambiguous prefixes fail rather than guess.
    pub fn resolve_ref(&self, ref_: &str) -> anyhow::Result<String> {
        if ref_.is_empty() {
            return Err(Error::Invalid("empty VM reference".to_string()).into());
        }
        if self.vms.contains_key(ref_) {
            return Ok(ref_.to_string());
        }
        if let Some(id) = self.names.get(ref_) {
            return Ok(id.clone());
        }
        if ref_.len() >= MIN_ID_PREFIX {
            let mut matches = self
                .vms
                .keys()
                .filter(|id| id.starts_with(ref_))
                .cloned()
                .collect::<Vec<_>>();
            match matches.len() {
                0 => {}
                1 => return Ok(matches.remove(0)),
                _ => return Err(Error::Ambiguous(ref_.to_string()).into()),
            }
        }
        Err(Error::NotFound(format!("VM {ref_:?}")).into())
    }

    /// Batch resolution under one lock, deduping refs that collapse onto
    /// the same id.
    pub fn resolve_refs(&self, refs: &[String]) -> anyhow::Result<Vec<String>> {
        let mut ids = Vec::with_capacity(refs.len());
        for ref_ in refs {
            let id = self
                .resolve_ref(ref_)
                .map_err(|e| e.context(format!("resolve {ref_:?}")))?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Ids of all VMs present in the index; the GC active set.
    pub fn vm_ids(&self) -> HashSet<String> {
        self.vms.keys().cloned().collect()
    }

    /// Union of blob hexes pinned by any VM.
    pub fn pinned_blob_ids(&self) -> HashSet<String> {
        self.vms
            .values()
            .flat_map(|r| r.image_blob_ids.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BootConfig;

    pub(crate) fn record(id: &str, name: &str) -> VmRecord {
        let now = Utc::now();
        VmRecord {
            id: id.to_string(),
            state: VmState::Created,
            config: VmConfig {
                name: name.to_string(),
                cpu: 2,
                memory: 1 << 30,
                storage: 10 << 30,
                image: "ubuntu:24.04".to_string(),
            },
            storage_configs: Vec::new(),
            boot_config: BootConfig::Uefi {
                firmware_path: "/fw/CLOUDHV.fd".into(),
            },
            network_configs: Vec::new(),
            image_blob_ids: HashSet::new(),
            console_path: None,
            first_booted: false,
            run_dir: format!("/run/cocoon/cloudhypervisor/{id}").into(),
            log_dir: format!("/var/log/cocoon/cloudhypervisor/{id}").into(),
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        }
    }

    fn index() -> VmIndex {
        let mut idx = VmIndex::default();
        for (id, name) in [
            ("aabbccdd11223344", "web"),
            ("aabbccdd99887766", "db"),
            ("ffee000011223344", "cache"),
        ] {
            idx.vms.insert(id.to_string(), record(id, name));
            idx.names.insert(name.to_string(), id.to_string());
        }
        idx
    }

    #[test]
    fn resolves_exact_id_and_name() {
        let idx = index();
        assert_eq!(idx.resolve_ref("aabbccdd11223344").unwrap(), "aabbccdd11223344");
        assert_eq!(idx.resolve_ref("cache").unwrap(), "ffee000011223344");
        // A two-character name still resolves via the name map.
        assert_eq!(idx.resolve_ref("db").unwrap(), "aabbccdd99887766");
    }

    #[test]
    fn prefix_needs_three_chars_and_uniqueness() {
        let idx = index();
        assert_eq!(idx.resolve_ref("ffe").unwrap(), "ffee000011223344");

        let err = idx.resolve_ref("aabbcc").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Ambiguous(_))
        ));

        // Two characters never prefix-match, even when unique.
        let err = idx.resolve_ref("ff").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));

        let err = idx.resolve_ref("000").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
    }

    #[test]
    fn batch_resolution_dedups() {
        let idx = index();
        // "aab" is ambiguous, so the whole batch fails.
        assert!(idx
            .resolve_refs(&["web".into(), "aabbccdd11223344".into(), "aab".to_string()])
            .is_err());

        let ids = idx
            .resolve_refs(&["web".into(), "aabbccdd112".into()])
            .unwrap();
        assert_eq!(ids, vec!["aabbccdd11223344"]);
    }

    #[test]
    fn name_map_invariant_holds() {
        let idx = index();
        for rec in idx.vms.values() {
            assert_eq!(idx.names[&rec.config.name], rec.id);
        }
        assert_eq!(idx.names.len(), idx.vms.len());
    }

    #[test]
    fn runtime_paths_derive_from_run_dir() {
        let rec = record("abc123", "x");
        assert_eq!(
            rec.api_socket_path(),
            PathBuf::from("/run/cocoon/cloudhypervisor/abc123/api.sock")
        );
        assert_eq!(
            rec.pid_file(),
            PathBuf::from("/run/cocoon/cloudhypervisor/abc123/ch.pid")
        );
        assert_eq!(
            rec.process_log_path(),
            PathBuf::from("/var/log/cocoon/cloudhypervisor/abc123/ch.log")
        );
    }
}
