//! `cocoon start`, `cocoon stop`, and `cocoon rm`.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::{RefsArgs, RmArgs};
use crate::config::Config;
use crate::error;

pub async fn cmd_start(conf: &Config, args: RefsArgs) -> Result<()> {
    let hyper = super::hypervisor(conf)?;
    let net = super::network(conf)?;

    // Recover networking for VMs whose netns vanished (host reboot):
    // recreate netns and taps with the persisted MACs before launching.
    let ids = hyper.resolve_refs(&args.refs).await?;
    for id in &ids {
        let vm = hyper.inspect(id).await?;
        if vm.network_configs.is_empty() || net.verify(id).is_ok() {
            continue;
        }
        if !net.configured() {
            warn!(vm_id = %id, "netns missing and no CNI conflist, starting without recovery");
            continue;
        }
        info!(vm_id = %id, "recreating netns after host reboot");
        net.config(
            id,
            vm.network_configs.len(),
            &vm.config,
            Some(&vm.network_configs),
        )
        .await
        .with_context(|| format!("recover networking for VM {id}"))?;
    }

    let outcome = hyper.start(&ids).await?;
    for id in &outcome.succeeded {
        info!(vm_id = %id, "started");
    }
    match outcome.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub async fn cmd_stop(conf: &Config, args: RefsArgs) -> Result<()> {
    let hyper = super::hypervisor(conf)?;
    let outcome = hyper.stop(&args.refs).await?;
    for id in &outcome.succeeded {
        info!(vm_id = %id, "stopped");
    }
    match outcome.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub async fn cmd_rm(conf: &Config, args: RmArgs) -> Result<()> {
    let hyper = super::hypervisor(conf)?;
    let outcome = hyper.delete(&args.refs, args.force).await?;

    // Tear down networking for the VMs that are actually gone. The netns
    // removal works even without a conflist; CNI DEL is skipped then.
    if !outcome.succeeded.is_empty() {
        let net = super::network(conf)?;
        if let Err(e) = net.delete(&outcome.succeeded).await {
            if !error::is_not_configured(&e) {
                warn!(error = %format!("{e:#}"), "network teardown incomplete");
            }
        }
    }

    for id in &outcome.succeeded {
        info!(vm_id = %id, "deleted");
    }
    if outcome.succeeded.is_empty() && outcome.error.is_none() {
        info!("no VMs deleted");
    }
    match outcome.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
