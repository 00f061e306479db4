//! Cross-module GC scenarios over a real on-disk layout: blobs pinned by
//! VMs survive, unpinned blobs and orphan dirs are reclaimed.

use std::collections::HashSet;

use chrono::Utc;
use cocoon::config::Config;
use cocoon::gc::Orchestrator;
use cocoon::images::cloudimg::CloudImgStore;
use cocoon::images::oci::OciStore;
use cocoon::images::{Digest, ImageEntry, ImageIndex, ImageStore};
use cocoon::store::JsonStore;
use cocoon::types::{BootConfig, VmConfig, VmState};
use cocoon::vmm::index::{VmIndex, VmRecord};
use cocoon::vmm::CloudHypervisor;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config {
        root_dir: dir.path().join("root"),
        run_dir: dir.path().join("run"),
        log_dir: dir.path().join("log"),
        ..Config::default()
    }
}

fn seed_oci_blob(conf: &Config, hex: &str) {
    std::fs::write(conf.oci_blob_path(hex), b"erofs-bytes").unwrap();
}

async fn seed_oci_entry(conf: &Config, ref_: &str, manifest_hex: &str, layer_hex: &str) {
    let store: JsonStore<ImageIndex> =
        JsonStore::new(conf.oci_index_file(), conf.oci_index_lock());
    let entry = ImageEntry {
        ref_: ref_.to_string(),
        manifest_digest: Digest::from_hex(manifest_hex),
        layers: vec![Digest::from_hex(layer_hex)],
        kernel_layer: Some(Digest::from_hex(layer_hex)),
        initrd_layer: Some(Digest::from_hex(layer_hex)),
        created_at: Utc::now(),
    };
    store
        .update(move |idx| {
            idx.images.insert(entry.ref_.clone(), entry);
            Ok(())
        })
        .await
        .unwrap();
}

async fn seed_vm(conf: &Config, id: &str, name: &str, state: VmState, pins: &[&str]) {
    let store: JsonStore<VmIndex> = JsonStore::new(conf.ch_index_file(), conf.ch_index_lock());
    let now = Utc::now();
    let rec = VmRecord {
        id: id.to_string(),
        state,
        config: VmConfig {
            name: name.to_string(),
            cpu: 1,
            memory: 1 << 30,
            storage: 1 << 30,
            image: "whatever".to_string(),
        },
        storage_configs: Vec::new(),
        boot_config: BootConfig::Uefi {
            firmware_path: conf.firmware_path(),
        },
        network_configs: Vec::new(),
        image_blob_ids: pins.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
        console_path: None,
        first_booted: false,
        run_dir: conf.ch_vm_run_dir(id),
        log_dir: conf.ch_vm_log_dir(id),
        created_at: now,
        updated_at: now,
        started_at: None,
        stopped_at: None,
    };
    store
        .update(move |idx| {
            idx.names.insert(rec.config.name.clone(), rec.id.clone());
            idx.vms.insert(rec.id.clone(), rec);
            Ok(())
        })
        .await
        .unwrap();
}

async fn run_gc(conf: &Config) {
    let oci = OciStore::new(conf).unwrap();
    let cloudimg = CloudImgStore::new(conf).unwrap();
    let hyper = CloudHypervisor::new(conf).unwrap();

    let mut orch = Orchestrator::new();
    oci.register_gc(&mut orch);
    cloudimg.register_gc(&mut orch);
    hyper.register_gc(&mut orch);
    orch.run().await.unwrap();
}

#[tokio::test]
async fn pinned_blob_survives_until_vm_is_deleted() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir);
    conf.ensure_dirs().unwrap();

    // Blob h1 exists on disk and is pinned by a VM, but the image index
    // entry is gone (user ran rmi).
    seed_oci_blob(&conf, "h1");
    seed_vm(&conf, "aaaa000011112222", "v1", VmState::Stopped, &["h1"]).await;

    run_gc(&conf).await;
    assert!(
        conf.oci_blob_path("h1").exists(),
        "blob pinned by a live VM must survive GC"
    );

    // Delete the VM record; the pin is gone.
    let store: JsonStore<VmIndex> = JsonStore::new(conf.ch_index_file(), conf.ch_index_lock());
    store
        .update(|idx| {
            let rec = idx.vms.remove("aaaa000011112222").unwrap();
            idx.names.remove(&rec.config.name);
            Ok(())
        })
        .await
        .unwrap();

    run_gc(&conf).await;
    assert!(
        !conf.oci_blob_path("h1").exists(),
        "unpinned, unindexed blob is reclaimed"
    );
}

#[tokio::test]
async fn indexed_blob_is_never_collected() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir);
    conf.ensure_dirs().unwrap();

    seed_oci_blob(&conf, "h2");
    seed_oci_entry(&conf, "ghcr.io/x/img:latest", &"99".repeat(32), "h2").await;

    run_gc(&conf).await;
    assert!(conf.oci_blob_path("h2").exists());
}

#[tokio::test]
async fn orphan_vm_dirs_are_removed() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir);
    conf.ensure_dirs().unwrap();

    // A run dir and a log dir with no record behind them.
    std::fs::create_dir_all(conf.ch_vm_run_dir("deadbeef00000000")).unwrap();
    std::fs::create_dir_all(conf.ch_vm_log_dir("deadbeef00000000")).unwrap();
    // And a live VM whose dirs must stay.
    seed_vm(&conf, "bbbb000011112222", "live", VmState::Created, &[]).await;
    std::fs::create_dir_all(conf.ch_vm_run_dir("bbbb000011112222")).unwrap();

    run_gc(&conf).await;
    assert!(!conf.ch_vm_run_dir("deadbeef00000000").exists());
    assert!(!conf.ch_vm_log_dir("deadbeef00000000").exists());
    assert!(conf.ch_vm_run_dir("bbbb000011112222").exists());
}

#[tokio::test]
async fn stale_creating_record_is_purged() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir);
    conf.ensure_dirs().unwrap();

    seed_vm(&conf, "cccc000011112222", "crashed", VmState::Creating, &[]).await;

    // Age the record past the stale threshold.
    let store: JsonStore<VmIndex> = JsonStore::new(conf.ch_index_file(), conf.ch_index_lock());
    store
        .update(|idx| {
            let rec = idx.vms.get_mut("cccc000011112222").unwrap();
            rec.updated_at = Utc::now() - chrono::Duration::hours(12);
            Ok(())
        })
        .await
        .unwrap();

    run_gc(&conf).await;

    let gone = store
        .with(|idx| Ok(!idx.vms.contains_key("cccc000011112222")))
        .await
        .unwrap();
    assert!(gone, "crashed create is purged");
    let name_gone = store
        .with(|idx| Ok(!idx.names.contains_key("crashed")))
        .await
        .unwrap();
    assert!(name_gone, "name map entry goes with the record");
}

#[tokio::test]
async fn fresh_creating_record_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir);
    conf.ensure_dirs().unwrap();

    seed_vm(&conf, "dddd000011112222", "in-progress", VmState::Creating, &[]).await;
    run_gc(&conf).await;

    let store: JsonStore<VmIndex> = JsonStore::new(conf.ch_index_file(), conf.ch_index_lock());
    let present = store
        .with(|idx| Ok(idx.vms.contains_key("dddd000011112222")))
        .await
        .unwrap();
    assert!(present, "an in-progress create must not be purged");
}

#[tokio::test]
async fn gc_with_no_modules_is_a_noop() {
    Orchestrator::new().run().await.unwrap();
}
