//! Cloud image pull: streaming download, content digest, qcow2 v3
//! conversion, blob commit.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::StreamExt;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::config::Config;
use crate::images::{Digest, ImageEntry, ImageIndex, PullEvent, Tracker};
use crate::store::JsonStore;

pub(super) async fn pull(
    conf: &Config,
    store: &JsonStore<ImageIndex>,
    url: &str,
    tracker: &Tracker,
) -> Result<()> {
    tracker(PullEvent::Start { total: 1 });
    info!(url, "downloading cloud image");

    // Stream the download into a temp file, hashing as we go.
    let download = tempfile::Builder::new()
        .prefix("download-")
        .tempfile_in(conf.cloudimg_temp_dir())
        .context("create download temp file")?;
    let download_path = download.path().to_path_buf();

    let hex = {
        let response = reqwest::get(url)
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        let total = response.content_length().unwrap_or(0);
        tracker(PullEvent::Download { done: 0, total });

        let mut hasher = Sha256::new();
        let mut out = tokio::fs::File::create(&download_path)
            .await
            .context("open download temp file")?;
        let mut done: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("read body of {url}"))?;
            hasher.update(&chunk);
            out.write_all(&chunk).await.context("write download")?;
            done += chunk.len() as u64;
            tracker(PullEvent::Download { done, total });
        }
        out.flush().await.context("flush download")?;
        hex::encode(hasher.finalize())
    };

    // Idempotency: same URL, same bytes, nothing to do.
    let up_to_date = store
        .with(|idx| {
            Ok(idx
                .images
                .get(url)
                .map(|e| e.manifest_digest.hex() == hex)
                .unwrap_or(false))
        })
        .await?;
    if up_to_date && conf.cloudimg_blob_path(&hex).is_file() {
        info!(url, digest = %hex, "already up to date");
        tracker(PullEvent::Done);
        return Ok(());
    }

    // Convert to qcow2 v3 unless the image already is one.
    let blob_path = conf.cloudimg_blob_path(&hex);
    if needs_conversion(&download_path).await? {
        tracker(PullEvent::Convert);
        let converted = conf
            .cloudimg_temp_dir()
            .join(format!("convert-{hex}.qcow2"));
        convert_qcow2(&download_path, &converted).await?;
        tokio::fs::rename(&converted, &blob_path)
            .await
            .context("move converted blob into store")?;
    } else {
        // Already qcow2 v3: persist the downloaded bytes directly. The
        // temp file must not be auto-deleted after the rename.
        let (_file, path) = download.keep().context("keep download temp file")?;
        tokio::fs::rename(&path, &blob_path)
            .await
            .context("move blob into store")?;
    }

    tracker(PullEvent::Commit);
    store
        .update(|idx| {
            idx.images.insert(
                url.to_string(),
                ImageEntry {
                    ref_: url.to_string(),
                    manifest_digest: Digest::from_hex(&hex),
                    layers: vec![Digest::from_hex(&hex)],
                    kernel_layer: None,
                    initrd_layer: None,
                    created_at: Utc::now(),
                },
            );
            Ok(())
        })
        .await
        .context("update image index")?;

    info!(url, digest = %hex, "pulled");
    tracker(PullEvent::Done);
    Ok(())
}

/// True unless `qemu-img info` reports qcow2 with compat 1.1 (v3).
async fn needs_conversion(path: &Path) -> Result<bool> {
    let output = tokio::process::Command::new("qemu-img")
        .args(["info", "--output=json"])
        .arg(path)
        .output()
        .await
        .context("exec qemu-img info")?;
    if !output.status.success() {
        bail!(
            "qemu-img info failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let info: serde_json::Value =
        serde_json::from_slice(&output.stdout).context("parse qemu-img info")?;
    if info["format"] != "qcow2" {
        return Ok(true);
    }
    let compat = info["format-specific"]["data"]["compat"]
        .as_str()
        .unwrap_or("");
    Ok(compat != "1.1")
}

async fn convert_qcow2(src: &Path, dst: &Path) -> Result<()> {
    let output = tokio::process::Command::new("qemu-img")
        .args(["convert", "-O", "qcow2", "-o", "compat=1.1"])
        .arg(src)
        .arg(dst)
        .output()
        .await
        .context("exec qemu-img convert")?;
    if !output.status.success() {
        bail!(
            "qemu-img convert failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}
