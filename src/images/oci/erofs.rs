//! Per-layer EROFS conversion and boot-file extraction.
//!
//! Each OCI layer becomes a single EROFS image built by the external
//! `mkfs.erofs` tool from the layer's tar stream:
//!
//! ```text
//! mkfs.erofs --tar=f -zlz4hc -C16384 -T0 -U <uuid> out.erofs < layer.tar
//! ```
//!
//! The filesystem UUID is a v5 UUID derived from the layer hex, so
//! identical layer bytes always produce the same guest-visible UUID.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::utils::uuid_v5;

const EROFS_CLUSTER_SIZE: u32 = 16384;
const EROFS_COMPRESSION: &str = "lz4hc";

/// Builds `out` from the uncompressed tar at `tar_path`.
pub async fn convert_tar(tar_path: &Path, layer_hex: &str, out: &Path) -> Result<()> {
    let stdin = std::fs::File::open(tar_path)
        .with_context(|| format!("open layer tar {}", tar_path.display()))?;

    let output = tokio::process::Command::new("mkfs.erofs")
        .arg("--tar=f")
        .arg(format!("-z{EROFS_COMPRESSION}"))
        .arg(format!("-C{EROFS_CLUSTER_SIZE}"))
        .arg("-T0")
        .arg("-U")
        .arg(uuid_v5(layer_hex))
        .arg(out)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("exec mkfs.erofs")?;

    if !output.status.success() {
        bail!(
            "mkfs.erofs failed for layer {layer_hex}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Boot artifacts found inside one layer.
#[derive(Debug, Default)]
pub struct BootFiles {
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
}

/// Scans the tar at `tar_path` for `vmlinuz*` / `initrd.img*` under
/// `boot/` or at the archive root, writing hits to
/// `<work_dir>/<layer_hex>.vmlinuz` / `.initrd.img`. Runs on the blocking
/// pool; tar iteration is synchronous IO.
pub async fn scan_boot_files(
    tar_path: PathBuf,
    work_dir: PathBuf,
    layer_hex: String,
) -> Result<BootFiles> {
    tokio::task::spawn_blocking(move || scan_boot_files_sync(&tar_path, &work_dir, &layer_hex))
        .await
        .context("boot scan task")?
}

fn scan_boot_files_sync(tar_path: &Path, work_dir: &Path, layer_hex: &str) -> Result<BootFiles> {
    let file = std::fs::File::open(tar_path)
        .with_context(|| format!("open layer tar {}", tar_path.display()))?;
    let mut archive = tar::Archive::new(file);
    let mut found = BootFiles::default();

    for entry in archive.entries().context("iterate layer tar")? {
        let mut entry = match entry {
            Ok(e) => e,
            // A damaged trailing entry should not lose boot files already
            // extracted; mkfs.erofs will surface real corruption.
            Err(e) => {
                debug!(layer = layer_hex, error = %e, "tar entry unreadable, stopping scan");
                break;
            }
        };
        let path = entry.path().context("tar entry path")?.into_owned();
        let Some(base) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let dir_ok = match path.parent().and_then(|p| p.to_str()) {
            Some("") | Some(".") | Some("boot") => true,
            _ => false,
        };
        if !dir_ok || !entry.header().entry_type().is_file() {
            continue;
        }

        let dst = if base.starts_with("vmlinuz") {
            work_dir.join(format!("{layer_hex}.vmlinuz"))
        } else if base.starts_with("initrd.img") {
            work_dir.join(format!("{layer_hex}.initrd.img"))
        } else {
            continue;
        };

        let mut out = std::fs::File::create(&dst)
            .with_context(|| format!("create boot file {}", dst.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("extract {}", path.display()))?;

        if base.starts_with("vmlinuz") {
            found.kernel = Some(dst);
        } else {
            found.initrd = Some(dst);
        }
    }
    Ok(found)
}

/// Decompresses a gzip blob to `out` on the blocking pool.
pub async fn gunzip(src: PathBuf, out: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&src)
            .with_context(|| format!("open compressed layer {}", src.display()))?;
        let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
        let mut dst = std::fs::File::create(&out)
            .with_context(|| format!("create {}", out.display()))?;
        std::io::copy(&mut decoder, &mut dst).context("gunzip layer")?;
        Ok(())
    })
    .await
    .context("gunzip task")?
}
