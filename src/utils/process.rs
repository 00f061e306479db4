//! PID files and VMM process identity.
//!
//! A PID alone is not enough to address a VMM process: PIDs recycle, and a
//! controller may come back hours after the process it launched has died.
//! Every signal path therefore verifies the target via /proc/<pid>/cmdline
//! before acting.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::poll::wait_for;

const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    std::fs::write(path, format!("{pid}\n"))
        .with_context(|| format!("write PID file {}", path.display()))
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    let data = std::fs::read_to_string(path).ok()?;
    data.trim().parse().ok()
}

/// True if a process with the given PID currently exists. Checks
/// /proc/<pid> so no signal permission is needed.
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0 && Path::new(&format!("/proc/{pid}")).exists()
}

/// Checks that `pid` is running `binary_name` with `expect_arg` on its
/// command line. Prevents cross-instance misidentification when several
/// VMM processes are running, and racing a recycled PID.
///
/// On hosts without /proc, falls back to a bare liveness check.
pub fn verify_process_cmdline(pid: u32, binary_name: &str, expect_arg: &str) -> bool {
    if pid == 0 {
        return false;
    }
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => {
            // cmdline is NUL-separated; compare against the joined form.
            let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
            cmdline.contains(binary_name) && cmdline.contains(expect_arg)
        }
        Err(_) => is_process_alive(pid),
    }
}

/// Terminates a process after verifying its identity: SIGTERM, wait up to
/// `grace`, then SIGKILL. A PID that fails the cmdline check is treated as
/// already gone.
pub async fn terminate_process(
    pid: u32,
    binary_name: &str,
    expect_arg: &str,
    grace: Duration,
) -> Result<()> {
    if !verify_process_cmdline(pid, binary_name, expect_arg) {
        return Ok(());
    }
    let target = Pid::from_raw(pid as i32);

    if kill(target, Signal::SIGTERM).is_err() {
        if !is_process_alive(pid) {
            return Ok(());
        }
        return kill_and_wait(pid, target).await;
    }

    if wait_for(grace, POLL_INTERVAL, || Ok(!is_process_alive(pid)))
        .await
        .is_ok()
    {
        return Ok(());
    }
    kill_and_wait(pid, target).await
}

async fn kill_and_wait(pid: u32, target: Pid) -> Result<()> {
    let _ = kill(target, Signal::SIGKILL);
    wait_for(KILL_WAIT_TIMEOUT, Duration::from_millis(50), || {
        Ok(!is_process_alive(pid))
    })
    .await
    .with_context(|| format!("process {pid} survived SIGKILL"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ch.pid");
        write_pid_file(&path, 4242).unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));
        assert_eq!(read_pid_file(&dir.path().join("missing.pid")), None);
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!is_process_alive(0));
        assert!(!verify_process_cmdline(0, "anything", "arg"));
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn cmdline_check_rejects_wrong_binary() {
        let pid = std::process::id();
        assert!(!verify_process_cmdline(
            pid,
            "definitely-not-this-binary-name",
            "--nor-this-arg"
        ));
    }

    #[tokio::test]
    async fn terminate_unverified_pid_is_noop() {
        // PID 1 is alive but is not our binary; the cmdline check must
        // turn the terminate into a no-op rather than signalling init.
        terminate_process(1, "no-such-vmm", "/no/such/api.sock", Duration::from_millis(10))
            .await
            .unwrap();
    }
}
