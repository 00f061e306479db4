//! VM start: idempotent reconcile, VMM launch inside the VM's netns,
//! socket readiness, state flip.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::types::VmState;
use crate::utils::{terminate_process, wait_for, write_pid_file};

use super::api::VmmClient;
use super::cmdline;
use super::index::VmRecord;
use super::CloudHypervisor;

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_WAIT_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

impl CloudHypervisor {
    pub(super) async fn start_one(&self, id: &str) -> Result<()> {
        let rec = self.load_record(id).await?;

        // Idempotent: a live process wins over whatever the index says.
        // This also heals a crash between "PID written" and
        // "state=running": the next start finds the process and flips
        // the state in place instead of double-launching.
        if self.running_pid(&rec).is_some() {
            if rec.state != VmState::Running {
                self.update_state(id, VmState::Running)
                    .await
                    .with_context(|| format!("reconcile running VM {id}"))?;
            }
            info!(vm_id = %id, "already running");
            return Ok(());
        }

        // Use the paths persisted at create time, never the current
        // global config.
        crate::utils::ensure_dirs([&rec.run_dir, &rec.log_dir])?;
        self.cleanup_runtime_files(&rec);

        let args = cmdline::build_args(&rec);
        self.save_cmdline(&rec, &args);

        let pid = match self.launch(&rec, &args).await {
            Ok(pid) => pid,
            Err(e) => {
                self.mark_error(id).await;
                return Err(e.context("launch VM"));
            }
        };

        // Resolve the console endpoint: direct boot allocates a PTY we
        // must ask the API for; UEFI talks on the serial socket we chose.
        let console_path = if rec.boot_config.is_direct() {
            match VmmClient::new(&rec.api_socket_path()).console_pty().await {
                Ok(path) => path,
                Err(e) => {
                    warn!(vm_id = %id, error = %format!("{e:#}"), "query console PTY failed");
                    None
                }
            }
        } else {
            Some(rec.console_sock())
        };

        // Persist running state. If this fails the process must not be
        // left orphaned with a stale index.
        let now = Utc::now();
        let update = self
            .store
            .update(|idx| {
                let Some(stored) = idx.vms.get_mut(id) else {
                    bail!("VM {id} disappeared from index");
                };
                stored.state = VmState::Running;
                stored.started_at = Some(now);
                stored.updated_at = now;
                stored.console_path = console_path.clone();
                stored.first_booted = true;
                Ok(())
            })
            .await;

        if let Err(e) = update {
            let socket = rec.api_socket_path();
            let _ = terminate_process(
                pid,
                &self.conf.ch_binary_name(),
                &socket.to_string_lossy(),
                TERMINATE_GRACE,
            )
            .await;
            self.cleanup_runtime_files(&rec);
            return Err(e.context("update state"));
        }

        info!(vm_id = %id, pid, "VM started");
        Ok(())
    }

    /// Spawns the VMM detached (own process group) and, when the VM has
    /// network, inside its netns. Returns once the API socket accepts
    /// connections; on failure the process is killed and runtime files
    /// are removed.
    async fn launch(&self, rec: &VmRecord, args: &[String]) -> Result<u32> {
        let log = std::fs::File::create(rec.process_log_path())
            .with_context(|| format!("create process log {}", rec.process_log_path().display()))?;
        let log_err = log.try_clone().context("clone process log handle")?;

        let mut cmd = tokio::process::Command::new(&self.conf.ch_binary);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::from(log))
            .stderr(std::process::Stdio::from(log_err));

        // Netns entry happens on the forked child between fork and exec:
        // nothing in the parent switches namespaces, so no restore is
        // needed and concurrent launches cannot interfere.
        let netns_cstr = if rec.network_configs.is_empty() {
            None
        } else {
            let path = self.conf.netns_path(&rec.id);
            Some(
                std::ffi::CString::new(path.to_string_lossy().as_bytes())
                    .context("netns path contains NUL")?,
            )
        };

        // SAFETY: pre_exec runs after fork, before exec. Only
        // async-signal-safe calls are made (setpgid, open, setns); the
        // CString is allocated before the fork.
        unsafe {
            cmd.pre_exec(move || {
                use nix::fcntl::{open, OFlag};
                use nix::sched::{setns, CloneFlags};
                use nix::sys::stat::Mode;
                use std::os::fd::{FromRawFd, OwnedFd};

                // Detach from the controller's process group so the VMM
                // survives controller exit.
                nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

                if let Some(ref ns_path) = netns_cstr {
                    let fd_raw = open(ns_path.as_c_str(), OFlag::O_RDONLY, Mode::empty())
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    let fd = OwnedFd::from_raw_fd(fd_raw);
                    setns(&fd, CloneFlags::CLONE_NEWNET)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("exec {}", self.conf.ch_binary))?;
        let pid = child
            .id()
            .context("spawned VMM has no PID (already reaped)")?;

        let pid_file = rec.pid_file();
        if let Err(e) = write_pid_file(&pid_file, pid) {
            let _ = child.kill().await;
            return Err(e);
        }

        if let Err(e) = wait_for_socket(&rec.api_socket_path(), &mut child).await {
            let _ = child.kill().await;
            let _ = std::fs::remove_file(&pid_file);
            return Err(e);
        }

        // Drop the handle: the VMM now lives as an independent process,
        // identified from here on by PID file + cmdline check.
        drop(child);
        Ok(pid)
    }

    fn save_cmdline(&self, rec: &VmRecord, args: &[String]) {
        let line = format!("{} {}\n", self.conf.ch_binary, args.join(" "));
        if let Err(e) = std::fs::write(rec.cmdline_file(), line) {
            warn!(vm_id = %rec.id, error = %e, "save cmdline file failed");
        }
    }
}

/// Polls until the API socket is connectable, the process exits, or the
/// timeout fires.
async fn wait_for_socket(socket: &Path, child: &mut tokio::process::Child) -> Result<()> {
    wait_for(SOCKET_WAIT_TIMEOUT, SOCKET_WAIT_INTERVAL, || {
        if std::os::unix::net::UnixStream::connect(socket).is_ok() {
            return Ok(true);
        }
        if let Some(status) = child.try_wait().context("poll VMM process")? {
            bail!("cloud-hypervisor exited before socket was ready: {status}");
        }
        Ok(false)
    })
    .await
    .with_context(|| format!("wait for API socket {}", socket.display()))
}
