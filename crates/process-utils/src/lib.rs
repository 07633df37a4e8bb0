//! Small process-related helpers shared across the workspace.
//!
//! Transmission and relay binaries are long-running children that must be
//! reaped deterministically, so every command built here is configured with
//! `kill_on_drop` and a closed stdin.

use std::ffi::OsStr;
use std::io;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` suitable for a supervised child.
///
/// The child gets a null stdin, is killed if its handle is dropped, and does
/// not open a console window on Windows.
#[cfg(feature = "tokio")]
pub fn supervised_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

/// Ask the process with the given PID to exit gracefully.
///
/// Sends `SIGTERM` on unix. Other platforms have no graceful equivalent and
/// report [`io::ErrorKind::Unsupported`] so the caller can fall back to a
/// hard kill.
pub fn request_terminate(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "graceful terminate is not supported on this platform",
        ))
    }
}
