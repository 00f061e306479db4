//! Global configuration and on-disk layout.
//!
//! Everything Cocoon persists lives under three roots:
//! - `root_dir`: durable data: image blobs, indexes, firmware
//! - `run_dir`: ephemeral runtime state: sockets, PID files, COW disks
//! - `log_dir`: per-VM logs, kept across stops so crashes stay inspectable
//!
//! Path helpers are centralized here so the rest of the crate never builds
//! paths by hand. Per-VM run/log paths are only used at create time; after
//! that the VM record carries its own absolute paths (see `vmm::index`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const NETNS_BASE: &str = "/var/run/netns";
/// Prefix for Cocoon-managed named netns. Keeps GC away from entries
/// created by docker, containerd, etc.
pub const NETNS_PREFIX: &str = "cocoon-";

#[derive(Debug, Clone)]
pub struct Config {
    pub root_dir: PathBuf,
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Path or name of the cloud-hypervisor executable.
    pub ch_binary: String,
    /// Seconds to wait for a guest to honor ACPI power-button before
    /// escalating to SIGTERM/SIGKILL.
    pub stop_timeout_secs: u64,
    /// Concurrency bound for layer processing. Defaults to logical CPUs.
    pub pool_size: usize,
    pub cni_conf_dir: PathBuf,
    pub cni_bin_dir: PathBuf,
    /// Root password injected into cloudimg VMs via cloud-init. Empty
    /// means none is set.
    pub root_password: Option<String>,
    /// Comma or semicolon separated DNS servers for guest network config.
    pub dns: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/cocoon"),
            run_dir: PathBuf::from("/var/lib/cocoon/run"),
            log_dir: PathBuf::from("/var/log/cocoon"),
            ch_binary: "cloud-hypervisor".to_string(),
            stop_timeout_secs: 30,
            pool_size: num_cpus(),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            cni_bin_dir: PathBuf::from("/opt/cni/bin"),
            root_password: None,
            dns: "8.8.8.8,1.1.1.1".to_string(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Config {
    /// DNS server list, split on `,` and `;`, whitespace trimmed.
    pub fn dns_servers(&self) -> Vec<String> {
        self.dns
            .replace(';', ",")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn ch_binary_name(&self) -> String {
        Path::new(&self.ch_binary)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.ch_binary.clone())
    }

    /// UEFI firmware blob used to boot cloud images.
    pub fn firmware_path(&self) -> PathBuf {
        self.root_dir.join("firmware").join("CLOUDHV.fd")
    }

    // --- OCI image store ---

    fn oci_dir(&self) -> PathBuf {
        self.root_dir.join("oci")
    }
    pub fn oci_db_dir(&self) -> PathBuf {
        self.oci_dir().join("db")
    }
    pub fn oci_temp_dir(&self) -> PathBuf {
        self.oci_dir().join("temp")
    }
    pub fn oci_blobs_dir(&self) -> PathBuf {
        self.oci_dir().join("blobs")
    }
    pub fn oci_boot_base_dir(&self) -> PathBuf {
        self.oci_dir().join("boot")
    }
    pub fn oci_index_file(&self) -> PathBuf {
        self.oci_db_dir().join("images.json")
    }
    pub fn oci_index_lock(&self) -> PathBuf {
        self.oci_db_dir().join("images.lock")
    }
    pub fn oci_blob_path(&self, layer_hex: &str) -> PathBuf {
        self.oci_blobs_dir().join(format!("{layer_hex}.erofs"))
    }
    pub fn oci_boot_dir(&self, layer_hex: &str) -> PathBuf {
        self.oci_boot_base_dir().join(layer_hex)
    }
    pub fn oci_kernel_path(&self, layer_hex: &str) -> PathBuf {
        self.oci_boot_dir(layer_hex).join("vmlinuz")
    }
    pub fn oci_initrd_path(&self, layer_hex: &str) -> PathBuf {
        self.oci_boot_dir(layer_hex).join("initrd.img")
    }

    // --- Cloud image store ---

    fn cloudimg_dir(&self) -> PathBuf {
        self.root_dir.join("cloudimg")
    }
    pub fn cloudimg_db_dir(&self) -> PathBuf {
        self.cloudimg_dir().join("db")
    }
    pub fn cloudimg_temp_dir(&self) -> PathBuf {
        self.cloudimg_dir().join("temp")
    }
    pub fn cloudimg_blobs_dir(&self) -> PathBuf {
        self.cloudimg_dir().join("blobs")
    }
    pub fn cloudimg_index_file(&self) -> PathBuf {
        self.cloudimg_db_dir().join("images.json")
    }
    pub fn cloudimg_index_lock(&self) -> PathBuf {
        self.cloudimg_db_dir().join("images.lock")
    }
    pub fn cloudimg_blob_path(&self, hex: &str) -> PathBuf {
        self.cloudimg_blobs_dir().join(format!("{hex}.qcow2"))
    }

    // --- Cloud Hypervisor backend ---

    fn ch_dir(&self) -> PathBuf {
        self.root_dir.join("cloudhypervisor")
    }
    pub fn ch_db_dir(&self) -> PathBuf {
        self.ch_dir().join("db")
    }
    pub fn ch_index_file(&self) -> PathBuf {
        self.ch_db_dir().join("vms.json")
    }
    pub fn ch_index_lock(&self) -> PathBuf {
        self.ch_db_dir().join("vms.lock")
    }
    /// Base directory that holds one runtime subdirectory per VM.
    pub fn ch_run_base_dir(&self) -> PathBuf {
        self.run_dir.join("cloudhypervisor")
    }
    /// Base directory that holds one log subdirectory per VM.
    pub fn ch_log_base_dir(&self) -> PathBuf {
        self.log_dir.join("cloudhypervisor")
    }
    pub fn ch_vm_run_dir(&self, vm_id: &str) -> PathBuf {
        self.ch_run_base_dir().join(vm_id)
    }
    pub fn ch_vm_log_dir(&self, vm_id: &str) -> PathBuf {
        self.ch_log_base_dir().join(vm_id)
    }

    // --- CNI network provider ---

    fn cni_dir(&self) -> PathBuf {
        self.root_dir.join("cni")
    }
    pub fn cni_db_dir(&self) -> PathBuf {
        self.cni_dir().join("db")
    }
    pub fn cni_index_file(&self) -> PathBuf {
        self.cni_db_dir().join("networks.json")
    }
    pub fn cni_index_lock(&self) -> PathBuf {
        self.cni_db_dir().join("networks.lock")
    }
    pub fn netns_name(&self, vm_id: &str) -> String {
        format!("{NETNS_PREFIX}{vm_id}")
    }
    pub fn netns_path(&self, vm_id: &str) -> PathBuf {
        PathBuf::from(NETNS_BASE).join(self.netns_name(vm_id))
    }

    /// Creates the static directory skeleton for every subsystem. Per-VM
    /// directories are created on demand at VM create time.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.oci_db_dir(),
            self.oci_temp_dir(),
            self.oci_blobs_dir(),
            self.oci_boot_base_dir(),
            self.cloudimg_db_dir(),
            self.cloudimg_temp_dir(),
            self.cloudimg_blobs_dir(),
            self.ch_db_dir(),
            self.ch_run_base_dir(),
            self.ch_log_base_dir(),
            self.cni_db_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_parsing() {
        let mut conf = Config::default();
        assert_eq!(conf.dns_servers(), vec!["8.8.8.8", "1.1.1.1"]);
        conf.dns = "10.0.0.1; 10.0.0.2 ,,".to_string();
        assert_eq!(conf.dns_servers(), vec!["10.0.0.1", "10.0.0.2"]);
        conf.dns = String::new();
        assert!(conf.dns_servers().is_empty());
    }

    #[test]
    fn layout_is_rooted() {
        let conf = Config {
            root_dir: PathBuf::from("/data"),
            ..Config::default()
        };
        assert_eq!(
            conf.oci_blob_path("abc"),
            PathBuf::from("/data/oci/blobs/abc.erofs")
        );
        assert_eq!(
            conf.cloudimg_blob_path("abc"),
            PathBuf::from("/data/cloudimg/blobs/abc.qcow2")
        );
        assert_eq!(conf.ch_index_file(), PathBuf::from("/data/cloudhypervisor/db/vms.json"));
        assert_eq!(conf.netns_name("beef"), "cocoon-beef");
        assert_eq!(
            conf.netns_path("beef"),
            PathBuf::from("/var/run/netns/cocoon-beef")
        );
    }

    #[test]
    fn ch_binary_name_strips_path() {
        let conf = Config {
            ch_binary: "/usr/local/bin/cloud-hypervisor".to_string(),
            ..Config::default()
        };
        assert_eq!(conf.ch_binary_name(), "cloud-hypervisor");
    }
}
