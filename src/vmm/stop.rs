//! VM stop: ACPI for UEFI guests, API shutdown + signals for direct-boot
//! guests, escalation on timeout.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::types::VmState;
use crate::utils::{is_process_alive, terminate_process, wait_for};

use super::api::VmmClient;
use super::index::VmRecord;
use super::CloudHypervisor;

/// How often we check whether the guest powered off after ACPI.
const ACPI_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// SIGTERM → SIGKILL window.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

impl CloudHypervisor {
    pub(super) async fn stop_one(&self, id: &str) -> Result<()> {
        let rec = self.load_record(id).await?;

        let Some(pid) = self.running_pid(&rec) else {
            // No live process (or a recycled PID that fails the cmdline
            // check): treat as already stopped.
            self.cleanup_runtime_files(&rec);
            return self.update_state(id, VmState::Stopped).await;
        };

        let shutdown = if rec.boot_config.is_direct() {
            // Direct-boot guests have no working ACPI; go straight to
            // the API + signal ladder.
            self.force_terminate(&rec, pid).await
        } else {
            self.shutdown_uefi(&rec, pid).await
        };

        match shutdown {
            Ok(()) => {
                // Runtime files are only removed on success; a failed
                // stop keeps socket and PID so the user can retry.
                self.cleanup_runtime_files(&rec);
                info!(vm_id = %id, "VM stopped");
                self.update_state(id, VmState::Stopped).await
            }
            Err(e) => {
                self.mark_error(id).await;
                Err(e)
            }
        }
    }

    /// UEFI ladder: ACPI power-button → poll up to the configured
    /// timeout → escalate to force_terminate.
    async fn shutdown_uefi(&self, rec: &VmRecord, pid: u32) -> Result<()> {
        let client = VmmClient::new(&rec.api_socket_path());
        let stop_timeout = Duration::from_secs(self.conf.stop_timeout_secs);

        if let Err(e) = client.power_button().await {
            warn!(vm_id = %rec.id, error = %format!("{e:#}"), "power-button failed, escalating");
            return self.force_terminate(rec, pid).await;
        }

        if wait_for(stop_timeout, ACPI_POLL_INTERVAL, || Ok(!is_process_alive(pid)))
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(
            vm_id = %rec.id,
            timeout = ?stop_timeout,
            "guest ignored power-button, escalating"
        );
        self.force_terminate(rec, pid).await
    }

    /// Flushes disk backends via the API, then SIGTERM → SIGKILL. The
    /// cmdline check inside terminate_process keeps a recycled PID safe.
    async fn force_terminate(&self, rec: &VmRecord, pid: u32) -> Result<()> {
        let socket = rec.api_socket_path();
        if let Err(e) = VmmClient::new(&socket).shutdown().await {
            warn!(vm_id = %rec.id, error = %format!("{e:#}"), "vm.shutdown failed");
        }
        terminate_process(
            pid,
            &self.conf.ch_binary_name(),
            &socket.to_string_lossy(),
            TERMINATE_GRACE,
        )
        .await
        .context("terminate VMM process")
    }
}
