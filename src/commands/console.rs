//! `cocoon console`: attach the terminal to a guest console with raw
//! mode and the line-start escape protocol.

use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context, Result};

use crate::cli::ConsoleArgs;
use crate::config::Config;
use crate::console::{format_escape_char, parse_escape_char, relay};

pub async fn cmd_console(conf: &Config, args: ConsoleArgs) -> Result<()> {
    let escape_char = parse_escape_char(&args.escape_char)?;

    let hyper = super::hypervisor(conf)?;
    let conn = hyper.console(&args.vm).await?;

    let stdin_fd = std::io::stdin().as_raw_fd();
    if unsafe { libc::isatty(stdin_fd) } != 1 {
        bail!("stdin is not a terminal");
    }

    let _raw = RawTerminal::enter(stdin_fd).context("set raw mode")?;
    eprintln!(
        "Connected to {} (escape sequence: {}.)\r",
        args.vm,
        format_escape_char(escape_char)
    );

    // The relay blocks on terminal IO, so run it off the async runtime.
    let result = tokio::task::spawn_blocking(move || relay(conn, escape_char))
        .await
        .context("console relay task")?;

    eprintln!("\r\nDisconnected from {}.\r", args.vm);
    result
}

/// Saves the termios state and switches to raw mode; restores on drop so
/// every exit path (including errors) leaves the terminal sane.
struct RawTerminal {
    fd: i32,
    orig: libc::termios,
}

impl RawTerminal {
    fn enter(fd: i32) -> Result<Self> {
        // SAFETY: plain termios syscalls on a validated tty fd.
        unsafe {
            let mut orig: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut orig) != 0 {
                return Err(std::io::Error::last_os_error()).context("tcgetattr");
            }
            let mut raw = orig;
            libc::cfmakeraw(&mut raw);
            if libc::tcsetattr(fd, libc::TCSANOW, &raw) != 0 {
                return Err(std::io::Error::last_os_error()).context("tcsetattr");
            }
            Ok(Self { fd, orig })
        }
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.orig);
        }
    }
}
