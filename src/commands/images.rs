//! `cocoon images` and `cocoon rmi`.

use anyhow::Result;
use tracing::{info, warn};

use crate::cli::RefsArgs;
use crate::config::Config;
use crate::utils::size::format_size;

pub async fn cmd_images(conf: &Config) -> Result<()> {
    let backends = super::image_backends(conf)?;

    let mut images = Vec::new();
    for backend in &backends {
        images.extend(backend.list().await?);
    }
    if images.is_empty() {
        println!("No images found.");
        return Ok(());
    }
    images.sort_by(|a, b| a.name.cmp(&b.name));

    println!(
        "{:<60} {:<10} {:>9}  {:<22} {}",
        "NAME", "TYPE", "SIZE", "CREATED", "DIGEST"
    );
    for image in &images {
        println!(
            "{:<60} {:<10} {:>9}  {:<22} {}",
            image.name,
            image.image_type,
            format_size(image.size),
            image.created_at.format("%Y-%m-%d %H:%M:%S"),
            short_digest(&image.id),
        );
    }
    Ok(())
}

pub async fn cmd_rmi(conf: &Config, args: RefsArgs) -> Result<()> {
    let backends = super::image_backends(conf)?;

    let mut deleted = Vec::new();
    for backend in &backends {
        deleted.extend(backend.delete(&args.refs).await?);
    }

    for ref_ in &deleted {
        info!(image = %ref_, "deleted from index");
    }
    if deleted.is_empty() {
        warn!("no matching images");
    } else {
        info!("blobs are reclaimed by the next `cocoon gc` run");
    }
    Ok(())
}

fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..hex.len().min(12)]
}
