//! `cocoon ps` and `cocoon inspect`.

use anyhow::{Context, Result};

use crate::cli::RefArgs;
use crate::config::Config;
use crate::types::{Vm, VmState};
use crate::utils::size::format_size;
use crate::utils::verify_process_cmdline;

pub async fn cmd_ps(conf: &Config) -> Result<()> {
    let hyper = super::hypervisor(conf)?;
    let vms = hyper.list().await?;

    if vms.is_empty() {
        println!("No VMs found.");
        return Ok(());
    }

    println!(
        "{:<16} {:<20} {:<16} {:>4} {:>9}  {:<40} {}",
        "ID", "NAME", "STATE", "CPU", "MEMORY", "IMAGE", "CREATED"
    );
    for vm in &vms {
        println!(
            "{:<16} {:<20} {:<16} {:>4} {:>9}  {:<40} {}",
            vm.id,
            vm.config.name,
            reconcile_state(conf, vm),
            vm.config.cpu,
            format_size(vm.config.memory),
            vm.config.image,
            vm.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

pub async fn cmd_inspect(conf: &Config, args: RefArgs) -> Result<()> {
    let hyper = super::hypervisor(conf)?;
    let vm = hyper.inspect(&args.vm).await?;
    let json = serde_json::to_string_pretty(&vm).context("serialize VM")?;
    println!("{json}");
    Ok(())
}

/// A record can say `running` while the process died underneath it (host
/// reboot, OOM kill). Display the reconciled truth; the index itself is
/// healed by the next start/stop.
fn reconcile_state(conf: &Config, vm: &Vm) -> String {
    if vm.state != VmState::Running {
        return vm.state.to_string();
    }
    let live = match (vm.pid, &vm.api_socket_path) {
        (Some(pid), Some(socket)) => {
            verify_process_cmdline(pid, &conf.ch_binary_name(), &socket.to_string_lossy())
        }
        _ => false,
    };
    if live {
        vm.state.to_string()
    } else {
        "stopped (stale)".to_string()
    }
}
