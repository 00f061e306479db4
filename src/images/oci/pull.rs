//! OCI image pull: registry fetch, concurrent layer conversion, index
//! commit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::Config;
use crate::images::digest::strip_algo;
use crate::images::{Digest, ImageEntry, ImageIndex, PullEvent, Tracker};
use crate::store::JsonStore;

use super::erofs;

/// Output of processing one layer.
struct LayerResult {
    index: usize,
    hex: String,
    /// Temp EROFS path; `None` when the blob was already cached.
    erofs_tmp: Option<PathBuf>,
    /// Temp (or cached) boot file paths; moved into the boot dir on commit.
    kernel_tmp: Option<PathBuf>,
    initrd_tmp: Option<PathBuf>,
    cached: bool,
}

/// Registry credentials from the environment; anonymous otherwise.
fn registry_auth() -> RegistryAuth {
    match (
        std::env::var("COCOON_REGISTRY_USERNAME"),
        std::env::var("COCOON_REGISTRY_PASSWORD"),
    ) {
        (Ok(user), Ok(pass)) => RegistryAuth::Basic(user, pass),
        _ => RegistryAuth::Anonymous,
    }
}

/// OCI architecture name for the running host.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Resolves a manifest index to the host-platform image manifest.
async fn resolve_image_manifest(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
) -> Result<(OciImageManifest, String)> {
    let (manifest, digest) = client
        .pull_manifest(reference, auth)
        .await
        .with_context(|| format!("fetch manifest for {reference}"))?;

    match manifest {
        OciManifest::Image(img) => Ok((img, digest)),
        OciManifest::ImageIndex(index) => {
            let arch = host_arch();
            let entry = index
                .manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .map(|p| p.os == "linux" && p.architecture == arch)
                        .unwrap_or(false)
                })
                .with_context(|| format!("no linux/{arch} manifest in index for {reference}"))?;

            let platform_ref = oci_distribution::Reference::with_digest(
                reference.registry().to_string(),
                reference.repository().to_string(),
                entry.digest.clone(),
            );
            let (manifest, _) = client
                .pull_manifest(&platform_ref, auth)
                .await
                .with_context(|| format!("fetch platform manifest {}", entry.digest))?;
            match manifest {
                OciManifest::Image(img) => Ok((img, digest)),
                OciManifest::ImageIndex(_) => {
                    bail!("nested manifest index for {reference}")
                }
            }
        }
    }
}

pub(super) async fn pull(
    conf: &Config,
    store: &JsonStore<ImageIndex>,
    pool: &Arc<Semaphore>,
    ref_: &str,
    tracker: &Tracker,
) -> Result<()> {
    let reference: Reference = ref_
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid image reference {ref_:?}: {e}"))?;
    let auth = Arc::new(registry_auth());
    let client = Arc::new(Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    }));

    info!(image = ref_, "pulling OCI image");
    let (manifest, manifest_digest) =
        resolve_image_manifest(&client, &reference, &auth).await?;
    let digest_hex = strip_algo(&manifest_digest).to_string();

    // Idempotency: a ref already recorded at this manifest digest is up to
    // date, and concurrent pulls that joined the in-flight gate land here.
    let up_to_date = store
        .with(|idx| {
            Ok(idx
                .images
                .get(ref_)
                .map(|e| e.manifest_digest.hex() == digest_hex)
                .unwrap_or(false))
        })
        .await?;
    if up_to_date {
        info!(image = ref_, digest = %digest_hex, "already up to date");
        tracker(PullEvent::Done);
        return Ok(());
    }

    let layers = manifest.layers.clone();
    if layers.is_empty() {
        bail!("image {ref_} has no layers");
    }
    tracker(PullEvent::Start {
        total: layers.len(),
    });

    // Work dir under the store's temp root; stale ones are swept by GC if
    // we die mid-pull.
    let work_dir = tempfile::Builder::new()
        .prefix("pull-")
        .tempdir_in(conf.oci_temp_dir())
        .context("create pull work dir")?;

    // Fan out layer processing, bounded by the worker pool.
    let mut tasks = tokio::task::JoinSet::new();
    for (i, layer) in layers.iter().enumerate() {
        let permit_pool = pool.clone();
        let client = Arc::clone(&client);
        let reference = reference.clone();
        let auth = Arc::clone(&auth);
        let layer = layer.clone();
        let conf = conf.clone();
        let work = work_dir.path().to_path_buf();
        tasks.spawn(async move {
            let _permit = permit_pool.acquire_owned().await.expect("pool closed");
            process_layer(&conf, &client, &reference, &auth, i, &layer, &work)
                .await
                .with_context(|| format!("layer {i} ({})", layer.digest))
        });
    }

    let mut results: Vec<LayerResult> = Vec::with_capacity(layers.len());
    while let Some(joined) = tasks.join_next().await {
        let result = joined.context("layer task")??;
        tracker(PullEvent::LayerDone {
            index: result.index,
            total: layers.len(),
            digest: format!("sha256:{}", result.hex),
        });
        results.push(result);
    }
    results.sort_by_key(|r| r.index);

    tracker(PullEvent::Commit);
    commit(conf, store, ref_, &digest_hex, results).await?;
    info!(image = ref_, digest = %digest_hex, layers = layers.len(), "pulled");
    tracker(PullEvent::Done);
    Ok(())
}

/// Downloads and converts one layer, unless its blob is already cached.
async fn process_layer(
    conf: &Config,
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    index: usize,
    layer: &OciDescriptor,
    work_dir: &std::path::Path,
) -> Result<LayerResult> {
    let hex = strip_algo(&layer.digest).to_string();

    // Cached blob: reuse it, pick up previously extracted boot files.
    if conf.oci_blob_path(&hex).is_file() {
        debug!(layer = %hex, "layer cached, skipping conversion");
        let kernel = conf.oci_kernel_path(&hex);
        let initrd = conf.oci_initrd_path(&hex);
        return Ok(LayerResult {
            index,
            hex,
            erofs_tmp: None,
            kernel_tmp: kernel.is_file().then_some(kernel),
            initrd_tmp: initrd.is_file().then_some(initrd),
            cached: true,
        });
    }

    // Download the raw blob.
    let blob_path = work_dir.join(format!("{hex}.blob"));
    {
        let mut out = tokio::fs::File::create(&blob_path)
            .await
            .with_context(|| format!("create {}", blob_path.display()))?;
        client
            .pull_blob(reference, layer, &mut out)
            .await
            .with_context(|| format!("download layer {hex}"))?;
    }

    // Decompress to a plain tar when the media type says gzip.
    let tar_path = if layer.media_type.contains("gzip") {
        let tar = work_dir.join(format!("{hex}.tar"));
        erofs::gunzip(blob_path.clone(), tar.clone()).await?;
        let _ = tokio::fs::remove_file(&blob_path).await;
        tar
    } else {
        blob_path
    };

    // Two independent consumers of the tar: the boot-file scan and the
    // EROFS conversion.
    let erofs_tmp = work_dir.join(format!("{hex}.erofs"));
    let (boot, convert) = tokio::join!(
        erofs::scan_boot_files(tar_path.clone(), work_dir.to_path_buf(), hex.clone()),
        erofs::convert_tar(&tar_path, &hex, &erofs_tmp),
    );
    convert?;
    let boot = boot?;
    let _ = tokio::fs::remove_file(&tar_path).await;

    Ok(LayerResult {
        index,
        hex,
        erofs_tmp: Some(erofs_tmp),
        kernel_tmp: boot.kernel,
        initrd_tmp: boot.initrd,
        cached: false,
    })
}

/// Moves converted artifacts into the content-addressed store and records
/// the entry. Renames are idempotent: an interrupted commit is healed by
/// the next pull overwriting the same paths.
async fn commit(
    conf: &Config,
    store: &JsonStore<ImageIndex>,
    ref_: &str,
    manifest_hex: &str,
    results: Vec<LayerResult>,
) -> Result<()> {
    let mut layer_digests = Vec::with_capacity(results.len());
    let mut kernel_layer: Option<Digest> = None;
    let mut initrd_layer: Option<Digest> = None;

    for r in &results {
        if let Some(tmp) = &r.erofs_tmp {
            let dst = conf.oci_blob_path(&r.hex);
            tokio::fs::rename(tmp, &dst)
                .await
                .with_context(|| format!("move layer {} into blob store", r.hex))?;
        }

        if !r.cached && (r.kernel_tmp.is_some() || r.initrd_tmp.is_some()) {
            let boot_dir = conf.oci_boot_dir(&r.hex);
            tokio::fs::create_dir_all(&boot_dir)
                .await
                .with_context(|| format!("create boot dir for {}", r.hex))?;
            if let Some(k) = &r.kernel_tmp {
                tokio::fs::rename(k, conf.oci_kernel_path(&r.hex))
                    .await
                    .with_context(|| format!("move kernel of layer {}", r.hex))?;
            }
            if let Some(i) = &r.initrd_tmp {
                tokio::fs::rename(i, conf.oci_initrd_path(&r.hex))
                    .await
                    .with_context(|| format!("move initrd of layer {}", r.hex))?;
            }
        }

        // Later layers override earlier ones.
        if r.kernel_tmp.is_some() {
            kernel_layer = Some(Digest::from_hex(&r.hex));
        }
        if r.initrd_tmp.is_some() {
            initrd_layer = Some(Digest::from_hex(&r.hex));
        }
        layer_digests.push(Digest::from_hex(&r.hex));
    }

    let (Some(kernel_layer), Some(initrd_layer)) = (kernel_layer, initrd_layer) else {
        bail!("image {ref_} has no boot files (vmlinuz/initrd.img)");
    };

    let entry = ImageEntry {
        ref_: ref_.to_string(),
        manifest_digest: Digest::from_hex(manifest_hex),
        layers: layer_digests,
        kernel_layer: Some(kernel_layer),
        initrd_layer: Some(initrd_layer),
        created_at: Utc::now(),
    };

    store
        .update(|idx| {
            idx.images.insert(ref_.to_string(), entry);
            Ok(())
        })
        .await
        .context("update image index")
}
