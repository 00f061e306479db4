//! Image store behavior against a real on-disk index: lookup laws,
//! alias-wide deletion, idempotent pulls at the index level.

use chrono::Utc;
use cocoon::config::Config;
use cocoon::images::oci::OciStore;
use cocoon::images::{Digest, ImageEntry, ImageIndex, ImageStore};
use cocoon::store::JsonStore;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config {
        root_dir: dir.path().join("root"),
        run_dir: dir.path().join("run"),
        log_dir: dir.path().join("log"),
        ..Config::default()
    }
}

async fn seed_entry(conf: &Config, ref_: &str, manifest_hex: &str, layer_hex: &str) {
    let store: JsonStore<ImageIndex> =
        JsonStore::new(conf.oci_index_file(), conf.oci_index_lock());
    std::fs::write(conf.oci_blob_path(layer_hex), b"blob").unwrap();
    let entry = ImageEntry {
        ref_: ref_.to_string(),
        manifest_digest: Digest::from_hex(manifest_hex),
        layers: vec![Digest::from_hex(layer_hex)],
        kernel_layer: None,
        initrd_layer: None,
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

#[tokio::test]
async fn inspect_by_ref_digest_and_prefix() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir);
    let store = OciStore::new(&conf).unwrap();
    let manifest = "ab12".repeat(16);
    seed_entry(&conf, "ghcr.io/x/app:latest", &manifest, "layer1").await;

    // Exact ref, normalized ref, full digest, 12-hex prefix.
    for id in [
        "ghcr.io/x/app:latest".to_string(),
        "ghcr.io/x/app".to_string(),
        format!("sha256:{manifest}"),
        manifest.clone(),
        manifest[..12].to_string(),
    ] {
        let image = store
            .inspect(&id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{id} should resolve"));
        assert_eq!(image.name, "ghcr.io/x/app:latest");
        assert_eq!(image.image_type, "oci");
    }

    // 11-hex prefix never matches.
    assert!(store.inspect(&manifest[..11]).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_by_digest_removes_every_alias() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir);
    let store = OciStore::new(&conf).unwrap();
    let manifest = "cd34".repeat(16);
    seed_entry(&conf, "ghcr.io/x/app:latest", &manifest, "layerA").await;
    seed_entry(&conf, "docker.io/library/app:1.0", &manifest, "layerA").await;
    seed_entry(&conf, "ghcr.io/other:latest", &"ef56".repeat(16), "layerB").await;

    let mut deleted = store.delete(&[manifest[..12].to_string()]).await.unwrap();
    deleted.sort();
    assert_eq!(
        deleted,
        vec!["docker.io/library/app:1.0", "ghcr.io/x/app:latest"]
    );

    // Second delete of the same digest is a no-op.
    let again = store.delete(&[manifest]).await.unwrap();
    assert!(again.is_empty());

    let remaining = store.list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "ghcr.io/other:latest");
}

#[tokio::test]
async fn list_reports_blob_sizes() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir);
    let store = OciStore::new(&conf).unwrap();
    seed_entry(&conf, "a:latest", &"11".repeat(32), "sized").await;

    let images = store.list().await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].size, 4, "size of the seeded blob file");
}

#[tokio::test]
async fn config_fails_per_vm_when_blob_is_missing() {
    let dir = TempDir::new().unwrap();
    let conf = test_config(&dir);
    let store = OciStore::new(&conf).unwrap();
    let manifest = "77".repeat(32);
    seed_entry(&conf, "gone:latest", &manifest, "vanished").await;
    std::fs::remove_file(conf.oci_blob_path("vanished")).unwrap();

    let vm = cocoon::types::VmConfig {
        name: "v".into(),
        cpu: 1,
        memory: 1 << 30,
        storage: 1 << 30,
        image: "gone:latest".into(),
    };
    let err = store.config(std::slice::from_ref(&vm)).await.unwrap_err();
    assert!(format!("{err:#}").contains("missing"));
}
