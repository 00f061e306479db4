//! `cocoon create` and `cocoon run`.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::CreateArgs;
use crate::config::Config;
use crate::error;
use crate::types::{Vm, VmConfig};
use crate::utils::parse_size;

pub async fn cmd_create(conf: &Config, args: CreateArgs) -> Result<()> {
    let vm = create_vm(conf, &args).await?;
    info!(vm_id = %vm.id, name = %vm.config.name, state = %vm.state, "VM created");
    info!("start with: cocoon start {}", vm.id);
    Ok(())
}

pub async fn cmd_run(conf: &Config, args: CreateArgs) -> Result<()> {
    let vm = create_vm(conf, &args).await?;
    info!(vm_id = %vm.id, name = %vm.config.name, "VM created");

    let hyper = super::hypervisor(conf)?;
    let outcome = hyper.start(std::slice::from_ref(&vm.id)).await?;
    for id in &outcome.succeeded {
        info!(vm_id = %id, "VM started");
    }
    match outcome.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Shared create flow: resolve the image, create the VM, then attach
/// networking when the provider is configured.
async fn create_vm(conf: &Config, args: &CreateArgs) -> Result<Vm> {
    let vm_cfg = vm_config_from_args(args)?;

    let backends = super::image_backends(conf)?;
    let (storage_configs, boot_config) = super::resolve_image(&backends, &vm_cfg).await?;

    let hyper = super::hypervisor(conf)?;
    let vm = hyper
        .create(vm_cfg.clone(), storage_configs, Vec::new(), boot_config)
        .await
        .context("create VM")?;

    if args.nics > 0 {
        let net = super::network(conf)?;
        match net.config(&vm.id, args.nics, &vm_cfg, None).await {
            Ok(configs) => {
                hyper
                    .attach_networks(&vm.id, configs)
                    .await
                    .context("attach networks")?;
            }
            Err(e) if error::is_not_configured(&e) => {
                warn!(vm_id = %vm.id, "no CNI conflist, creating VM without networking");
            }
            Err(e) => {
                // Network setup failed hard: do not leave a half-wired VM.
                let _ = hyper.delete(std::slice::from_ref(&vm.id), true).await;
                return Err(e.context("configure networking"));
            }
        }
    }

    Ok(vm)
}

fn vm_config_from_args(args: &CreateArgs) -> Result<VmConfig> {
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("cocoon-{}", sanitize_name(&args.image)));
    Ok(VmConfig {
        name,
        cpu: args.cpu,
        memory: parse_size(&args.memory)
            .with_context(|| format!("invalid --memory {:?}", args.memory))?,
        storage: parse_size(&args.storage)
            .with_context(|| format!("invalid --storage {:?}", args.storage))?,
        image: args.image.clone(),
    })
}

/// Turns an image ref into something usable as a default VM name.
fn sanitize_name(image: &str) -> String {
    image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_is_derived_from_image() {
        let args = CreateArgs {
            image: "ghcr.io/x/ubuntu:24.04".into(),
            name: None,
            cpu: 2,
            memory: "1G".into(),
            storage: "10G".into(),
            nics: 1,
        };
        let cfg = vm_config_from_args(&args).unwrap();
        assert_eq!(cfg.name, "ghcr-io-x-ubuntu-24-04");
        assert_eq!(cfg.memory, 1 << 30);
        assert_eq!(cfg.storage, 10 << 30);
    }

    #[test]
    fn bad_sizes_are_rejected() {
        let args = CreateArgs {
            image: "x".into(),
            name: Some("n".into()),
            cpu: 2,
            memory: "one gig".into(),
            storage: "10G".into(),
            nics: 1,
        };
        assert!(vm_config_from_args(&args).is_err());
    }
}
