//! Shared domain types persisted in the on-disk indexes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a VM as seen by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// DB placeholder written, dirs/disks being prepared.
    Creating,
    /// Registered, VMM process not yet started.
    Created,
    /// VMM process alive, guest is up.
    Running,
    /// VMM process has exited cleanly.
    Stopped,
    /// Start or stop failed.
    Error,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Creating => "creating",
            VmState::Created => "created",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Resources requested for a new VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub cpu: u32,
    /// Memory in bytes.
    pub memory: u64,
    /// COW disk size in bytes.
    pub storage: u64,
    /// Image reference the VM was created from.
    pub image: String,
}

/// One disk attachment passed to the VMM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: std::path::PathBuf,
    pub readonly: bool,
    /// Disk serial the guest matches to order its overlay mount.
    pub serial: String,
}

/// How the guest is booted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootConfig {
    /// OCI images: kernel + initrd extracted from the image layers.
    DirectKernel {
        kernel_path: std::path::PathBuf,
        initrd_path: std::path::PathBuf,
    },
    /// Cloud images: external UEFI firmware.
    Uefi { firmware_path: std::path::PathBuf },
}

impl BootConfig {
    pub fn is_direct(&self) -> bool {
        matches!(self, BootConfig::DirectKernel { .. })
    }
}

/// Guest-side IP configuration returned by the network provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    /// Name of the CNI network that produced this config.
    #[serde(rename = "type")]
    pub net_type: String,
    pub ip: String,
    pub gateway: String,
    pub netmask: String,
    pub hostname: String,
}

/// One NIC as passed to the VMM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub tap: String,
    pub mac: String,
    pub queues: u32,
    pub queue_size: u32,
    pub network: Network,
}

/// Runtime record for a VM, as returned by inspect/list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub state: VmState,
    pub config: VmConfig,

    // Runtime fields, recomputed from the run dir at read time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_socket_path: Option<std::path::PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_path: Option<std::path::PathBuf>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_configs: Vec<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_configs: Vec<StorageConfig>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Image summary returned by the image stores' list/inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    /// Manifest digest, `sha256:<hex>`.
    pub id: String,
    /// Ref or URL the image was pulled by.
    pub name: String,
    /// Backend type: "oci" or "cloudimg".
    #[serde(rename = "type")]
    pub image_type: String,
    /// Total on-disk blob size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}
