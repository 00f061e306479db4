//! VM creation: placeholder record, per-VM directories, disk and
//! cloud-init seed preparation, rollback on failure.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::error::Error;
use crate::types::{BootConfig, NetworkConfig, StorageConfig, Vm, VmConfig, VmState};
use crate::utils::generate_id;

use super::index::VmRecord;
use super::CloudHypervisor;

impl CloudHypervisor {
    /// Creates a VM: reserves the name, persists a `creating` placeholder,
    /// materializes the run/log dirs, prepares the writable disk (and the
    /// cloud-init seed for UEFI guests), then flips the record to
    /// `created`. Any failure rolls the placeholder back and removes the
    /// directories.
    pub async fn create(
        &self,
        config: VmConfig,
        storage_configs: Vec<StorageConfig>,
        network_configs: Vec<NetworkConfig>,
        boot_config: BootConfig,
    ) -> Result<Vm> {
        if config.name.is_empty() {
            return Err(Error::Invalid("VM name must not be empty".to_string()).into());
        }
        if config.cpu == 0 || config.memory == 0 {
            return Err(Error::Invalid("cpu and memory must be non-zero".to_string()).into());
        }

        let id = generate_id();
        let now = Utc::now();
        let run_dir = self.conf.ch_vm_run_dir(&id);
        let log_dir = self.conf.ch_vm_log_dir(&id);

        let mut rec = VmRecord {
            id: id.clone(),
            state: VmState::Creating,
            image_blob_ids: pinned_blob_ids(&storage_configs, &boot_config),
            config,
            storage_configs,
            boot_config,
            network_configs,
            console_path: None,
            first_booted: false,
            run_dir: run_dir.clone(),
            log_dir: log_dir.clone(),
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        };

        // The writable disk lives in the run dir, which only exists now
        // that the id is known.
        let cow_path = if rec.boot_config.is_direct() {
            rec.cow_raw_path()
        } else {
            rec.overlay_path()
        };
        for disk in rec.storage_configs.iter_mut().filter(|d| !d.readonly) {
            if disk.path.as_os_str().is_empty() {
                disk.path = cow_path.clone();
            }
        }

        // Reserve name + id with the placeholder under one update.
        let name = rec.config.name.clone();
        let placeholder = rec.clone();
        self.store
            .update(move |idx| {
                if idx.names.contains_key(&name) {
                    return Err(Error::AlreadyExists(name.clone()).into());
                }
                if idx.vms.contains_key(&placeholder.id) {
                    bail!("generated id collided, retry create");
                }
                idx.names.insert(name.clone(), placeholder.id.clone());
                idx.vms.insert(placeholder.id.clone(), placeholder);
                Ok(())
            })
            .await?;

        // Everything after the placeholder is rolled back on failure.
        match self.materialize(&mut rec).await {
            Ok(()) => {}
            Err(e) => {
                self.rollback_create(&rec).await;
                return Err(e);
            }
        }

        // Flip to created, persisting the finalized disk/seed layout.
        let finalized = rec.clone();
        let flipped = self
            .store
            .update(move |idx| {
                let Some(stored) = idx.vms.get_mut(&finalized.id) else {
                    bail!("VM {} disappeared during create", finalized.id);
                };
                *stored = finalized;
                stored.state = VmState::Created;
                stored.updated_at = Utc::now();
                Ok(stored.to_vm())
            })
            .await;

        match flipped {
            Ok(vm) => {
                info!(vm_id = %id, name = %vm.config.name, "VM created");
                Ok(vm)
            }
            Err(e) => {
                self.rollback_create(&rec).await;
                Err(e)
            }
        }
    }

    /// Attaches network configs produced by the network provider to an
    /// existing record, and refreshes the cloud-init seed so the guest
    /// boots with its assigned addresses.
    pub async fn attach_networks(&self, id: &str, configs: Vec<NetworkConfig>) -> Result<()> {
        let rec = self
            .store
            .update(|idx| {
                let rec = idx
                    .vms
                    .get_mut(id)
                    .ok_or_else(|| Error::NotFound(format!("VM {id}")))?;
                rec.network_configs = configs;
                rec.updated_at = Utc::now();
                Ok(rec.clone())
            })
            .await?;

        if !rec.boot_config.is_direct() && !rec.first_booted {
            crate::metadata::write_cidata(&rec, &self.conf)
                .await
                .context("refresh cloud-init seed")?;
        }
        Ok(())
    }

    async fn materialize(&self, rec: &mut VmRecord) -> Result<()> {
        crate::utils::ensure_dirs([&rec.run_dir, &rec.log_dir])?;

        if rec.boot_config.is_direct() {
            prepare_cow_raw(&rec.cow_raw_path(), rec.config.storage).await?;
        } else {
            let base = rec
                .storage_configs
                .iter()
                .find(|d| d.readonly)
                .map(|d| d.path.clone())
                .context("cloud image VM has no backing blob")?;
            prepare_overlay(&base, &rec.overlay_path(), rec.config.storage).await?;

            // Cloud images boot cloud-init from a FAT12 seed disk.
            crate::metadata::write_cidata(rec, &self.conf)
                .await
                .context("build cloud-init seed")?;
            if !rec
                .storage_configs
                .iter()
                .any(|d| d.serial == crate::metadata::CIDATA_SERIAL)
            {
                rec.storage_configs.push(StorageConfig {
                    path: rec.cidata_path(),
                    readonly: true,
                    serial: crate::metadata::CIDATA_SERIAL.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn rollback_create(&self, rec: &VmRecord) {
        let id = rec.id.clone();
        let name = rec.config.name.clone();
        if let Err(e) = self
            .store
            .update(move |idx| {
                idx.vms.remove(&id);
                idx.names.remove(&name);
                Ok(())
            })
            .await
        {
            warn!(vm_id = %rec.id, error = %format!("{e:#}"), "rollback of placeholder failed");
        }
        if let Err(e) = self.remove_vm_dirs(rec) {
            warn!(vm_id = %rec.id, error = %format!("{e:#}"), "rollback of VM dirs failed");
        }
    }
}

/// Blob hexes this VM must pin: every readonly blob plus the boot layers.
/// Derived from the file stems of the content-addressed paths.
fn pinned_blob_ids(storage: &[StorageConfig], boot: &BootConfig) -> HashSet<String> {
    let mut ids: HashSet<String> = storage
        .iter()
        .filter(|d| d.readonly)
        .filter_map(|d| d.path.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .collect();

    if let BootConfig::DirectKernel {
        kernel_path,
        initrd_path,
    } = boot
    {
        // Boot files live under oci/boot/<layer-hex>/.
        for p in [kernel_path, initrd_path] {
            if let Some(hex) = p.parent().and_then(Path::file_name) {
                ids.insert(hex.to_string_lossy().into_owned());
            }
        }
    }
    ids
}

/// OCI guests get a raw ext4 COW disk sized to the requested storage.
async fn prepare_cow_raw(path: &Path, size_bytes: u64) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("create COW disk {}", path.display()))?;
    file.set_len(size_bytes)
        .with_context(|| format!("truncate COW disk to {size_bytes} bytes"))?;
    drop(file);

    let output = tokio::process::Command::new("mkfs.ext4")
        .args(["-F", "-q"])
        .arg(path)
        .output()
        .await
        .context("exec mkfs.ext4")?;
    if !output.status.success() {
        bail!(
            "mkfs.ext4 failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Cloud-image guests get a qcow2 overlay backed by the readonly blob,
/// resized to the requested storage.
async fn prepare_overlay(base: &Path, overlay: &Path, size_bytes: u64) -> Result<()> {
    let output = tokio::process::Command::new("qemu-img")
        .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
        .arg(base)
        .arg(overlay)
        .output()
        .await
        .context("exec qemu-img create")?;
    if !output.status.success() {
        bail!(
            "qemu-img create failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let output = tokio::process::Command::new("qemu-img")
        .args(["resize"])
        .arg(overlay)
        .arg(size_bytes.to_string())
        .output()
        .await
        .context("exec qemu-img resize")?;
    if !output.status.success() {
        bail!(
            "qemu-img resize failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_ids_cover_layers_and_boot_dirs() {
        let storage = vec![
            StorageConfig {
                path: "/data/oci/blobs/lay1.erofs".into(),
                readonly: true,
                serial: "cocoon-layer0".into(),
            },
            StorageConfig {
                path: "/data/oci/blobs/lay2.erofs".into(),
                readonly: true,
                serial: "cocoon-layer1".into(),
            },
            StorageConfig {
                path: "/run/x/cow.raw".into(),
                readonly: false,
                serial: "cocoon-cow".into(),
            },
        ];
        let boot = BootConfig::DirectKernel {
            kernel_path: "/data/oci/boot/lay2/vmlinuz".into(),
            initrd_path: "/data/oci/boot/lay9/initrd.img".into(),
        };
        let ids = pinned_blob_ids(&storage, &boot);
        assert_eq!(
            ids,
            ["lay1", "lay2", "lay9"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn cloudimg_pins_only_the_backing_blob() {
        let storage = vec![
            StorageConfig {
                path: "/data/cloudimg/blobs/abc123.qcow2".into(),
                readonly: true,
                serial: "cocoon-base".into(),
            },
            StorageConfig {
                path: std::path::PathBuf::new(),
                readonly: false,
                serial: "cocoon-cow".into(),
            },
        ];
        let boot = BootConfig::Uefi {
            firmware_path: "/fw/CLOUDHV.fd".into(),
        };
        let ids = pinned_blob_ids(&storage, &boot);
        assert_eq!(ids, ["abc123".to_string()].into_iter().collect());
    }
}
