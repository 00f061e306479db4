//! Named network namespaces and the in-namespace bridge/tap plumbing.
//!
//! Uses `ip netns add` for persistent namespaces in /var/run/netns/ and
//! `ip netns exec` for the device assembly inside. Both are idempotent
//! against "already exists" / "already gone".

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

/// Creates the named netns. Reuses an existing one with a warning.
pub async fn create_netns(ns_name: &str) -> Result<()> {
    debug!(netns = %ns_name, "creating network namespace");
    let output = Command::new("ip")
        .args(["netns", "add", ns_name])
        .output()
        .await
        .context("exec ip netns add")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            warn!(netns = %ns_name, "netns already exists, reusing");
            return Ok(());
        }
        bail!("ip netns add {ns_name}: {stderr}");
    }
    Ok(())
}

/// Deletes the named netns. Already-gone namespaces are fine.
pub async fn delete_netns(ns_name: &str) -> Result<()> {
    debug!(netns = %ns_name, "deleting network namespace");
    let output = Command::new("ip")
        .args(["netns", "del", ns_name])
        .output()
        .await
        .context("exec ip netns del")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such file") || stderr.contains("Cannot remove") {
            debug!(netns = %ns_name, "netns already gone");
            return Ok(());
        }
        bail!("ip netns del {ns_name}: {stderr}");
    }
    Ok(())
}

pub fn netns_exists(ns_name: &str) -> bool {
    std::path::Path::new(crate::config::NETNS_BASE)
        .join(ns_name)
        .exists()
}

/// Assembles the guest-facing L2 plumbing inside the netns:
///
/// 1. flush addresses from the CNI interface (the guest owns the IP)
/// 2. create the bridge, enslave the CNI interface
/// 3. create the tap, enslave it too
/// 4. bring all three up
pub async fn setup_bridge_tap(
    ns_name: &str,
    if_name: &str,
    br_name: &str,
    tap_name: &str,
) -> Result<()> {
    let steps: &[&[&str]] = &[
        &["addr", "flush", "dev", if_name],
        &["link", "add", br_name, "type", "bridge"],
        &["link", "set", if_name, "master", br_name],
        &["tuntap", "add", tap_name, "mode", "tap"],
        &["link", "set", tap_name, "master", br_name],
        &["link", "set", if_name, "up"],
        &["link", "set", tap_name, "up"],
        &["link", "set", br_name, "up"],
    ];

    for step in steps {
        let mut args = vec!["netns", "exec", ns_name, "ip"];
        args.extend_from_slice(step);
        let output = Command::new("ip")
            .args(&args)
            .output()
            .await
            .with_context(|| format!("exec ip {step:?} in {ns_name}"))?;
        if !output.status.success() {
            bail!(
                "ip {} in netns {ns_name}: {}",
                step.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn netns_lifecycle_requires_root() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("skipping netns_lifecycle - requires root");
            return;
        }
        let ns = "cocoon-test-ns";
        let _ = delete_netns(ns).await;

        create_netns(ns).await.unwrap();
        assert!(netns_exists(ns));
        // Idempotent create.
        create_netns(ns).await.unwrap();

        delete_netns(ns).await.unwrap();
        assert!(!netns_exists(ns));
        // Idempotent delete.
        delete_netns(ns).await.unwrap();
    }

    #[test]
    fn missing_netns_reports_absent() {
        assert!(!netns_exists("cocoon-definitely-not-here"));
    }
}
