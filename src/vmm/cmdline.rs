//! Cloud Hypervisor argument assembly.
//!
//! The full invocation is derived from the persisted VM record; the image
//! is never re-resolved, so a VM starts identically even after its image
//! ref has been retagged or deleted from the index.

use crate::types::{BootConfig, StorageConfig};

use super::index::VmRecord;

const DISK_NUM_QUEUES: u32 = 2;
const DISK_QUEUE_SIZE: u32 = 256;

/// Builds the complete argument vector for `cloud-hypervisor`.
pub fn build_args(rec: &VmRecord) -> Vec<String> {
    let mut args = Vec::new();
    let mem_mib = rec.config.memory >> 20;

    args.push("--api-socket".to_string());
    args.push(rec.api_socket_path().display().to_string());

    args.push("--cpus".to_string());
    args.push(format!("boot={0},max={0}", rec.config.cpu));

    args.push("--memory".to_string());
    args.push(format!("size={mem_mib}M"));

    args.push("--rng".to_string());
    args.push("src=/dev/urandom".to_string());

    // Half the memory as balloon target keeps the host side reclaimable
    // without starving the guest.
    args.push("--balloon".to_string());
    args.push(format!(
        "size={}M,deflate_on_oom=on,free_page_reporting=on",
        mem_mib / 2
    ));

    args.push("--watchdog".to_string());

    match &rec.boot_config {
        BootConfig::DirectKernel {
            kernel_path,
            initrd_path,
        } => {
            args.push("--kernel".to_string());
            args.push(kernel_path.display().to_string());
            args.push("--initramfs".to_string());
            args.push(initrd_path.display().to_string());
            args.push("--cmdline".to_string());
            args.push(kernel_cmdline(&rec.storage_configs));
            // The guest's virtio console gets a host PTY; the legacy
            // serial port stays off.
            args.push("--console".to_string());
            args.push("pty".to_string());
            args.push("--serial".to_string());
            args.push("off".to_string());
        }
        BootConfig::Uefi { firmware_path } => {
            args.push("--firmware".to_string());
            args.push(firmware_path.display().to_string());
            // UEFI guests talk on the serial port; expose it as a socket.
            args.push("--serial".to_string());
            args.push(format!("socket={}", rec.console_sock().display()));
            args.push("--console".to_string());
            args.push("off".to_string());
        }
    }

    if !rec.storage_configs.is_empty() {
        args.push("--disk".to_string());
        for disk in &rec.storage_configs {
            args.push(disk_arg(disk));
        }
    }

    if !rec.network_configs.is_empty() {
        args.push("--net".to_string());
        for net in &rec.network_configs {
            args.push(format!(
                "tap={},mac={},num_queues={},queue_size={}",
                net.tap, net.mac, net.queues, net.queue_size
            ));
        }
    }

    args
}

/// Kernel command line for direct-boot guests. Layer serials are reversed
/// so the top layer is leftmost, matching overlay lowerdir ordering.
fn kernel_cmdline(storage: &[StorageConfig]) -> String {
    let mut layer_serials: Vec<&str> = storage
        .iter()
        .filter(|s| s.readonly && s.serial.starts_with(crate::images::oci::LAYER_SERIAL_PREFIX))
        .map(|s| s.serial.as_str())
        .collect();
    layer_serials.reverse();

    format!(
        "boot=cocoon cocoon.layers={} cocoon.cow={} clocksource=kvm-clock rw",
        layer_serials.join(","),
        crate::images::oci::COW_SERIAL,
    )
}

fn disk_arg(disk: &StorageConfig) -> String {
    let mut parts = vec![format!("path={}", disk.path.display())];
    if disk.readonly {
        parts.push("readonly=on".to_string());
    }
    parts.push("direct=on".to_string());
    parts.push(format!("num_queues={DISK_NUM_QUEUES}"));
    parts.push(format!("queue_size={DISK_QUEUE_SIZE}"));

    let is_qcow2 = disk
        .path
        .extension()
        .map(|e| e == "qcow2")
        .unwrap_or(false);
    if is_qcow2 {
        parts.push("image_type=qcow2".to_string());
        if !disk.readonly {
            // The rw overlay references the base blob as backing file.
            parts.push("backing_files=on".to_string());
        }
    } else {
        parts.push("image_type=raw".to_string());
    }

    parts.push(format!("serial={}", disk.serial));
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VmConfig, VmState};
    use chrono::Utc;
    use std::collections::HashSet;

    fn base_record(boot: BootConfig, storage: Vec<StorageConfig>) -> VmRecord {
        let now = Utc::now();
        VmRecord {
            id: "feedface00112233".into(),
            state: VmState::Created,
            config: VmConfig {
                name: "test".into(),
                cpu: 4,
                memory: 2 << 30,
                storage: 10 << 30,
                image: "img".into(),
            },
            storage_configs: storage,
            boot_config: boot,
            network_configs: Vec::new(),
            image_blob_ids: HashSet::new(),
            console_path: None,
            first_booted: false,
            run_dir: "/run/cocoon/cloudhypervisor/feedface00112233".into(),
            log_dir: "/log/cocoon/cloudhypervisor/feedface00112233".into(),
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        }
    }

    fn ro(path: &str, serial: &str) -> StorageConfig {
        StorageConfig {
            path: path.into(),
            readonly: true,
            serial: serial.into(),
        }
    }

    fn rw(path: &str, serial: &str) -> StorageConfig {
        StorageConfig {
            path: path.into(),
            readonly: false,
            serial: serial.into(),
        }
    }

    #[test]
    fn direct_boot_args() {
        let rec = base_record(
            BootConfig::DirectKernel {
                kernel_path: "/blobs/boot/k/vmlinuz".into(),
                initrd_path: "/blobs/boot/i/initrd.img".into(),
            },
            vec![
                ro("/blobs/l0.erofs", "cocoon-layer0"),
                ro("/blobs/l1.erofs", "cocoon-layer1"),
                rw("/run/cocoon/cloudhypervisor/feedface00112233/cow.raw", "cocoon-cow"),
            ],
        );
        let args = build_args(&rec);
        let joined = args.join(" ");

        assert!(joined.contains("--api-socket /run/cocoon/cloudhypervisor/feedface00112233/api.sock"));
        assert!(joined.contains("--cpus boot=4,max=4"));
        assert!(joined.contains("--memory size=2048M"));
        assert!(joined.contains("--balloon size=1024M,deflate_on_oom=on,free_page_reporting=on"));
        assert!(joined.contains("--watchdog"));
        assert!(joined.contains("--rng src=/dev/urandom"));
        assert!(joined.contains("--kernel /blobs/boot/k/vmlinuz"));
        assert!(joined.contains("--initramfs /blobs/boot/i/initrd.img"));
        // Top layer leftmost.
        assert!(joined.contains(
            "boot=cocoon cocoon.layers=cocoon-layer1,cocoon-layer0 cocoon.cow=cocoon-cow clocksource=kvm-clock rw"
        ));
        assert!(joined.contains("--console pty"));
        assert!(joined.contains("--serial off"));
        assert!(!joined.contains("--firmware"));

        // Disks keep their order and attributes.
        let disk_idx = args.iter().position(|a| a == "--disk").unwrap();
        assert!(args[disk_idx + 1].starts_with("path=/blobs/l0.erofs,readonly=on,direct=on"));
        assert!(args[disk_idx + 1].contains("image_type=raw"));
        assert!(args[disk_idx + 1].ends_with("serial=cocoon-layer0"));
        assert!(args[disk_idx + 3].contains("path=/run/cocoon/cloudhypervisor/feedface00112233/cow.raw"));
        assert!(!args[disk_idx + 3].contains("readonly=on"));
    }

    #[test]
    fn uefi_args() {
        let mut rec = base_record(
            BootConfig::Uefi {
                firmware_path: "/fw/CLOUDHV.fd".into(),
            },
            vec![
                ro("/blobs/base.qcow2", "cocoon-base"),
                rw(
                    "/run/cocoon/cloudhypervisor/feedface00112233/overlay.qcow2",
                    "cocoon-cow",
                ),
            ],
        );
        rec.network_configs.push(crate::types::NetworkConfig {
            tap: "tap0".into(),
            mac: "02:11:22:33:44:55".into(),
            queues: 4,
            queue_size: 256,
            network: crate::types::Network {
                id: "n1".into(),
                net_type: "bridge".into(),
                ip: "10.4.0.5".into(),
                gateway: "10.4.0.1".into(),
                netmask: "255.255.255.0".into(),
                hostname: "test".into(),
            },
        });

        let args = build_args(&rec);
        let joined = args.join(" ");
        assert!(joined.contains("--firmware /fw/CLOUDHV.fd"));
        assert!(joined.contains(
            "--serial socket=/run/cocoon/cloudhypervisor/feedface00112233/console.sock"
        ));
        assert!(joined.contains("--console off"));
        assert!(!joined.contains("--kernel"));
        assert!(!joined.contains("--cmdline"));

        // Base blob is readonly qcow2 without backing files; the overlay
        // is rw qcow2 with backing files.
        let disk_idx = args.iter().position(|a| a == "--disk").unwrap();
        assert!(args[disk_idx + 1].contains("readonly=on"));
        assert!(args[disk_idx + 1].contains("image_type=qcow2"));
        assert!(!args[disk_idx + 1].contains("backing_files"));
        assert!(args[disk_idx + 2].contains("image_type=qcow2,backing_files=on"));

        assert!(joined.contains("--net tap=tap0,mac=02:11:22:33:44:55,num_queues=4,queue_size=256"));
    }
}
