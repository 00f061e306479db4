//! Console endpoint resolution: serial socket for UEFI guests, virtio
//! console PTY for direct boot.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};

use crate::error::Error;

use super::CloudHypervisor;

/// An open console connection. UEFI guests expose a Unix socket, direct
/// boot guests a PTY device file.
pub enum ConsoleConn {
    Socket(UnixStream),
    Pty(std::fs::File),
}

impl ConsoleConn {
    /// Splits into independently owned reader and writer halves so a
    /// relay can pump both directions at once.
    pub fn split(self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        match self {
            ConsoleConn::Socket(stream) => {
                let reader = stream.try_clone().context("clone console socket")?;
                Ok((Box::new(reader), Box::new(stream)))
            }
            ConsoleConn::Pty(file) => {
                let reader = file.try_clone().context("clone console PTY")?;
                Ok((Box::new(reader), Box::new(file)))
            }
        }
    }
}

impl CloudHypervisor {
    /// Connects to the console of a running VM. The endpoint path was
    /// recorded at start time.
    pub async fn console(&self, ref_: &str) -> Result<ConsoleConn> {
        let id = self.store.with(|idx| idx.resolve_ref(ref_)).await?;
        let rec = self.load_record(&id).await?;

        if self.running_pid(&rec).is_none() {
            return Err(Error::NotRunning(id).into());
        }

        let path = rec
            .console_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no console endpoint recorded for VM {id}"))?;

        let meta = std::fs::metadata(path)
            .with_context(|| format!("stat console endpoint {}", path.display()))?;

        use std::os::unix::fs::FileTypeExt;
        if meta.file_type().is_socket() {
            let stream = UnixStream::connect(path)
                .with_context(|| format!("connect console socket {}", path.display()))?;
            Ok(ConsoleConn::Socket(stream))
        } else {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("open console PTY {}", path.display()))?;
            Ok(ConsoleConn::Pty(file))
        }
    }
}
