//! `cocoon pull` with progress reporting for both backends.

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::RefsArgs;
use crate::config::Config;
use crate::images::{cloudimg::CloudImgStore, oci::OciStore, ImageStore, PullEvent, Tracker};
use crate::utils::size::format_size;

pub async fn cmd_pull(conf: &Config, args: RefsArgs) -> Result<()> {
    let oci = OciStore::new(conf).context("init oci backend")?;
    let cloudimg = CloudImgStore::new(conf).context("init cloudimg backend")?;

    for image in &args.refs {
        if CloudImgStore::is_url(image) {
            cloudimg
                .pull(image, &cloudimg_tracker(image.clone()))
                .await
                .with_context(|| format!("pull {image}"))?;
        } else {
            oci.pull(image, &oci_tracker(image.clone()))
                .await
                .with_context(|| format!("pull {image}"))?;
        }
    }
    Ok(())
}

fn oci_tracker(image: String) -> Tracker {
    Box::new(move |event| match event {
        PullEvent::Start { total } => info!(image = %image, layers = total, "pulling"),
        PullEvent::LayerDone {
            index,
            total,
            digest,
        } => info!(image = %image, "[{}/{}] {} done", index + 1, total, digest),
        PullEvent::Commit => info!(image = %image, "committing"),
        PullEvent::Done => info!(image = %image, "done"),
        _ => {}
    })
}

fn cloudimg_tracker(url: String) -> Tracker {
    use std::io::Write;
    Box::new(move |event| match event {
        PullEvent::Download { done: 0, total } if total > 0 => {
            info!(url = %url, size = %format_size(total), "downloading");
        }
        PullEvent::Download { done: 0, .. } => info!(url = %url, "downloading"),
        PullEvent::Download { done, total } if total > 0 => {
            let pct = done as f64 / total as f64 * 100.0;
            print!("\r  {} / {} ({pct:.1}%)", format_size(done), format_size(total));
            let _ = std::io::stdout().flush();
        }
        PullEvent::Download { done, .. } => {
            print!("\r  {} downloaded", format_size(done));
            let _ = std::io::stdout().flush();
        }
        PullEvent::Convert => {
            println!();
            info!(url = %url, "converting to qcow2");
        }
        PullEvent::Commit => info!(url = %url, "committing"),
        PullEvent::Done => info!(url = %url, "done"),
        _ => {}
    })
}
