//! Process-control primitives shared across the workspace.
//!
//! Command construction, bounded waits on child processes, named-pipe
//! creation and signal delivery live here so that the engine crates can
//! stay free of platform `cfg` blocks.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Shutdown signals in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT - polite interrupt, lets encoders finalize output.
    Interrupt,
    /// SIGTERM - termination request.
    Terminate,
    /// SIGKILL - forced kill, cannot be caught.
    Kill,
}

impl ShutdownSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deliver a signal to a child process.
///
/// On Unix the signal is sent with `kill(2)`. On other platforms only
/// [`ShutdownSignal::Kill`] has an equivalent (`Child::start_kill`); the
/// graceful signals are no-ops so escalation still terminates the process.
pub fn send_signal(child: &mut Child, signal: ShutdownSignal) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped, nothing to signal.
        return Ok(());
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let sig = match signal {
            ShutdownSignal::Interrupt => Signal::SIGINT,
            ShutdownSignal::Terminate => Signal::SIGTERM,
            ShutdownSignal::Kill => Signal::SIGKILL,
        };
        kill(Pid::from_raw(pid as i32), sig).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    {
        match signal {
            ShutdownSignal::Kill => child.start_kill(),
            _ => Ok(()),
        }
    }
}

/// Wait for a child to exit, bounded by `timeout`.
///
/// Returns `Ok(Some(status))` if the process exited within the window,
/// `Ok(None)` if it is still running when the timeout elapses.
pub async fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<ExitStatus>> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.map(Some),
        Err(_) => Ok(None),
    }
}

/// Create a named pipe (FIFO) at `path`, readable by the packager process.
///
/// Fails on non-Unix platforms: the DASH pipeline wiring requires FIFOs.
pub fn create_fifo(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::stat::Mode;
        use nix::unistd::mkfifo;

        mkfifo(
            path,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "named pipes are only supported on Unix",
        ))
    }
}
