//! `cocoon gc`: one sweep across every module under the global
//! multi-lock.

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::gc::Orchestrator;

pub async fn cmd_gc(conf: &Config) -> Result<()> {
    let backends = super::image_backends(conf)?;
    let hyper = super::hypervisor(conf)?;
    let net = super::network(conf)?;

    let mut orch = Orchestrator::new();
    for backend in &backends {
        backend.register_gc(&mut orch);
    }
    hyper.register_gc(&mut orch);
    net.register_gc(&mut orch);

    orch.run().await?;
    info!("GC completed");
    Ok(())
}
