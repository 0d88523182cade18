//! Process-id markers and graceful-then-forceful termination.

use std::path::Path;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::store::write_atomic;

pub const SIGTERM_NAME: &str = "SIGTERM";
pub const SIGKILL_NAME: &str = "SIGKILL";

/// Result of a termination attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateOutcome {
    /// Whether any signal was delivered.
    pub signaled: bool,
    /// Strongest signal delivered.
    pub signal: Option<&'static str>,
}

impl TerminateOutcome {
    pub const NOT_SIGNALED: Self = Self {
        signaled: false,
        signal: None,
    };
}

/// Read a pid marker. Missing, empty, or garbage markers read as `None`.
pub async fn read_pid(path: &Path) -> Option<u32> {
    let raw = fs::read_to_string(path).await.ok()?;
    match raw.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => {
            warn!(path = %path.display(), "Ignoring unreadable pid marker");
            None
        }
    }
}

pub async fn write_pid(path: &Path, pid: u32) -> std::io::Result<()> {
    write_atomic(path, pid.to_string().as_bytes()).await
}

/// Remove a pid marker; absence is not an error.
pub async fn remove_pid(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed pid marker"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove pid marker"),
    }
}

#[cfg(unix)]
fn send(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // Safety: kill(2) takes plain integers and has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Whether `pid` names a live process. A permission error means it exists.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    match send(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM, wait `grace`, then SIGKILL if the process is still alive.
#[cfg(unix)]
pub async fn terminate(pid: u32, grace: Duration) -> TerminateOutcome {
    if let Err(e) = send(pid, libc::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM not delivered");
        return TerminateOutcome::NOT_SIGNALED;
    }
    info!(pid, "Sent SIGTERM to worker");
    let mut outcome = TerminateOutcome {
        signaled: true,
        signal: Some(SIGTERM_NAME),
    };

    tokio::time::sleep(grace).await;
    if !is_alive(pid) {
        return outcome;
    }

    match send(pid, libc::SIGKILL) {
        Ok(()) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "Worker ignored SIGTERM, sent SIGKILL");
            outcome.signal = Some(SIGKILL_NAME);
        }
        Err(e) => debug!(pid, error = %e, "SIGKILL not delivered"),
    }
    outcome
}

#[cfg(not(unix))]
pub async fn terminate(pid: u32, _grace: Duration) -> TerminateOutcome {
    warn!(pid, "Process signals unsupported on this platform");
    TerminateOutcome::NOT_SIGNALED
}
