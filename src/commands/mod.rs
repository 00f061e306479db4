//! One handler per CLI subcommand, plus the backend wiring they share.

mod console;
mod create;
mod gc;
mod images;
mod ps;
mod pull;
mod vm;

pub use console::cmd_console;
pub use create::{cmd_create, cmd_run};
pub use gc::cmd_gc;
pub use images::{cmd_images, cmd_rmi};
pub use ps::{cmd_inspect, cmd_ps};
pub use pull::cmd_pull;
pub use vm::{cmd_rm, cmd_start, cmd_stop};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::images::{cloudimg::CloudImgStore, oci::OciStore, ImageStore};
use crate::net::CniProvider;
use crate::types::{BootConfig, StorageConfig, VmConfig};
use crate::vmm::CloudHypervisor;

/// Both image backends, OCI first: the first backend that resolves an
/// image wins.
pub(crate) fn image_backends(conf: &Config) -> Result<Vec<Box<dyn ImageStore>>> {
    Ok(vec![
        Box::new(OciStore::new(conf).context("init oci backend")?),
        Box::new(CloudImgStore::new(conf).context("init cloudimg backend")?),
    ])
}

pub(crate) fn hypervisor(conf: &Config) -> Result<CloudHypervisor> {
    CloudHypervisor::new(conf).context("init hypervisor")
}

pub(crate) fn network(conf: &Config) -> Result<CniProvider> {
    CniProvider::new(conf).context("init network provider")
}

/// Asks each backend in turn to resolve the VM's image into disks and a
/// boot method.
pub(crate) async fn resolve_image(
    backends: &[Box<dyn ImageStore>],
    vm_cfg: &VmConfig,
) -> Result<(Vec<StorageConfig>, BootConfig)> {
    let vms = std::slice::from_ref(vm_cfg);
    let mut failures = Vec::new();
    for backend in backends {
        match backend.config(vms).await {
            Ok(mut resolved) => return Ok(resolved.remove(0)),
            Err(e) => failures.push(format!("{}: {e:#}", backend.kind())),
        }
    }
    anyhow::bail!(
        "image {:?} not resolved: {}",
        vm_cfg.image,
        failures.join("; ")
    )
}
