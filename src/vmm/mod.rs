//! Cloud Hypervisor VM backend: the persisted VM index plus process
//! lifecycle management.

pub mod api;
pub mod cmdline;
pub mod console;
pub mod index;

mod create;
mod gc;
mod start;
mod stop;

use anyhow::{Context, Result};
use tracing::warn;

use crate::config::Config;
use crate::error::{join_batch_errors, Error};
use crate::store::JsonStore;
use crate::types::{Vm, VmState};
use crate::utils::{read_pid_file, verify_process_cmdline};

use index::{VmIndex, VmRecord};

pub use console::ConsoleConn;

pub const KIND: &str = "cloud-hypervisor";

/// Result of a best-effort batch: every id was attempted; failures are
/// aggregated but do not hide the successes.
#[derive(Debug)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub error: Option<anyhow::Error>,
}

impl BatchOutcome {
    fn collect(op: &str, succeeded: Vec<String>, errs: Vec<anyhow::Error>) -> Self {
        Self {
            succeeded,
            error: join_batch_errors(op, errs),
        }
    }
}

pub struct CloudHypervisor {
    conf: Config,
    store: JsonStore<VmIndex>,
}

impl CloudHypervisor {
    pub fn new(conf: &Config) -> Result<Self> {
        crate::utils::ensure_dirs([
            conf.ch_db_dir(),
            conf.ch_run_base_dir(),
            conf.ch_log_base_dir(),
        ])?;
        Ok(Self {
            conf: conf.clone(),
            store: JsonStore::new(conf.ch_index_file(), conf.ch_index_lock()),
        })
    }

    pub fn kind(&self) -> &'static str {
        KIND
    }

    /// Resolves a single ref (id, name, or id prefix) to a record view.
    pub async fn inspect(&self, ref_: &str) -> Result<Vm> {
        self.store
            .with(|idx| {
                let id = idx.resolve_ref(ref_)?;
                Ok(idx.vms[&id].to_vm())
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Vm>> {
        self.store
            .with(|idx| {
                let mut vms: Vec<Vm> = idx.vms.values().map(VmRecord::to_vm).collect();
                vms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                Ok(vms)
            })
            .await
    }

    /// Batch-resolves refs to exact ids under one lock, deduplicating.
    pub async fn resolve_refs(&self, refs: &[String]) -> Result<Vec<String>> {
        self.store.with(|idx| idx.resolve_refs(refs)).await
    }

    /// Starts each VM; already-running VMs are a successful no-op.
    pub async fn start(&self, refs: &[String]) -> Result<BatchOutcome> {
        let ids = self.resolve_refs(refs).await?;
        let mut succeeded = Vec::new();
        let mut errs = Vec::new();
        for id in ids {
            match self.start_one(&id).await {
                Ok(()) => succeeded.push(id),
                Err(e) => {
                    warn!(vm_id = %id, error = %format!("{e:#}"), "start failed");
                    errs.push(e.context(format!("VM {id}")));
                }
            }
        }
        Ok(BatchOutcome::collect("start", succeeded, errs))
    }

    /// Stops each VM. A VM without a live process is marked stopped.
    pub async fn stop(&self, refs: &[String]) -> Result<BatchOutcome> {
        let ids = self.resolve_refs(refs).await?;
        let mut succeeded = Vec::new();
        let mut errs = Vec::new();
        for id in ids {
            match self.stop_one(&id).await {
                Ok(()) => succeeded.push(id),
                Err(e) => {
                    warn!(vm_id = %id, error = %format!("{e:#}"), "stop failed");
                    errs.push(e.context(format!("VM {id}")));
                }
            }
        }
        Ok(BatchOutcome::collect("stop", succeeded, errs))
    }

    /// Deletes each VM. Running VMs require `force`, which stops them
    /// first. Directories are removed before the index entry so a
    /// filesystem failure keeps the record retryable.
    pub async fn delete(&self, refs: &[String], force: bool) -> Result<BatchOutcome> {
        let ids = self.resolve_refs(refs).await?;
        let mut succeeded = Vec::new();
        let mut errs = Vec::new();
        for id in ids {
            match self.delete_one(&id, force).await {
                Ok(()) => succeeded.push(id),
                Err(e) => {
                    warn!(vm_id = %id, error = %format!("{e:#}"), "delete failed");
                    errs.push(e.context(format!("VM {id}")));
                }
            }
        }
        Ok(BatchOutcome::collect("delete", succeeded, errs))
    }

    async fn delete_one(&self, id: &str, force: bool) -> Result<()> {
        let rec = self.load_record(id).await?;

        if self.running_pid(&rec).is_some() {
            if !force {
                anyhow::bail!("running (use --force to stop and delete)");
            }
            self.stop_one(id).await.context("stop before delete")?;
        }

        self.remove_vm_dirs(&rec)?;

        self.store
            .update(|idx| {
                let Some(rec) = idx.vms.remove(id) else {
                    return Err(Error::NotFound(format!("VM {id}")).into());
                };
                idx.names.remove(&rec.config.name);
                Ok(())
            })
            .await
    }

    pub fn register_gc(&self, orch: &mut crate::gc::Orchestrator) {
        orch.register(Box::new(gc::ChGcModule::new(
            self.conf.clone(),
            self.store.clone(),
        )));
    }

    // --- shared helpers ---

    async fn load_record(&self, id: &str) -> Result<VmRecord> {
        self.store
            .with(|idx| {
                idx.vms
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("VM {id}")).into())
            })
            .await
    }

    /// PID of the VM's process, when the PID file points at a live
    /// process whose cmdline carries both our binary name and this VM's
    /// api socket. Anything else means "not running".
    fn running_pid(&self, rec: &VmRecord) -> Option<u32> {
        let pid = read_pid_file(&rec.pid_file())?;
        let socket = rec.api_socket_path();
        verify_process_cmdline(pid, &self.conf.ch_binary_name(), &socket.to_string_lossy())
            .then_some(pid)
    }

    async fn update_state(&self, id: &str, state: VmState) -> Result<()> {
        let now = chrono::Utc::now();
        self.store
            .update(|idx| {
                let rec = idx
                    .vms
                    .get_mut(id)
                    .ok_or_else(|| Error::NotFound(format!("VM {id}")))?;
                rec.state = state;
                rec.updated_at = now;
                match state {
                    VmState::Running => rec.started_at = Some(now),
                    VmState::Stopped => rec.stopped_at = Some(now),
                    _ => {}
                }
                Ok(())
            })
            .await
    }

    async fn mark_error(&self, id: &str) {
        if let Err(e) = self.update_state(id, VmState::Error).await {
            warn!(vm_id = %id, error = %e, "failed to mark VM as errored");
        }
    }

    /// Removes the per-run files (socket, PID, cmdline, console socket).
    /// Disks stay: the COW survives stop/start cycles and is removed with
    /// the run dir on delete.
    fn cleanup_runtime_files(&self, rec: &VmRecord) {
        for path in [
            rec.api_socket_path(),
            rec.pid_file(),
            rec.cmdline_file(),
            rec.console_sock(),
        ] {
            let _ = std::fs::remove_file(path);
        }
    }

    fn remove_vm_dirs(&self, rec: &VmRecord) -> Result<()> {
        for dir in [&rec.run_dir, &rec.log_dir] {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e).with_context(|| format!("remove {}", dir.display()));
                }
            }
        }
        Ok(())
    }
}
