//! Two-step teardown of the gateway process tree.
//!
//! The gateway runs in its own process group (pgid == pid), so signalling the
//! group reaches the kernels it started as well. Graceful stop first; if the
//! group is still around after the grace period, one forceful kill.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM on unix.
    Graceful,
    /// SIGKILL on unix.
    Forceful,
}

/// Why a signal could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalFailure {
    /// The process group no longer exists.
    NoSuchProcess,
    Other(String),
}

/// Signals and probes a process tree. Implemented over the OS, and by fakes in
/// tests.
pub trait ProcessTree {
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), SignalFailure>;
    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Nothing was running.
    AlreadyExited,
    /// Exited after the graceful signal.
    Graceful,
    /// Needed the forceful kill.
    Forced,
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("Failed to kill process tree {pid}: {message}")]
    KillFailed { pid: u32, message: String },

    #[error("Process tree {pid} still alive after forced kill")]
    StillAlive { pid: u32 },
}

/// Stop the tree rooted at `pid`, escalating once after `grace`.
///
/// Returns only when the tree is gone, or with an error if the forceful kill
/// could not be delivered or did not take effect.
pub async fn terminate_tree<T: ProcessTree + ?Sized>(
    tree: &T,
    pid: u32,
    grace: Duration,
    poll: Duration,
) -> Result<TerminationOutcome, ShutdownError> {
    if !tree.is_alive(pid) {
        debug!("[orchestrator] Process tree {} already gone", pid);
        return Ok(TerminationOutcome::AlreadyExited);
    }

    info!("[orchestrator] Stopping process tree {}", pid);
    match tree.signal(pid, StopSignal::Graceful) {
        Ok(()) => {
            if wait_for_exit(tree, pid, grace, poll).await {
                info!("[orchestrator] Process tree {} exited", pid);
                return Ok(TerminationOutcome::Graceful);
            }
            warn!(
                "[orchestrator] Process tree {} still alive after {:?}; killing",
                pid, grace
            );
        }
        Err(SignalFailure::NoSuchProcess) => return Ok(TerminationOutcome::AlreadyExited),
        Err(SignalFailure::Other(message)) => {
            warn!(
                "[orchestrator] Graceful stop of {} failed ({}); killing",
                pid, message
            );
        }
    }

    match tree.signal(pid, StopSignal::Forceful) {
        Ok(()) => {}
        Err(SignalFailure::NoSuchProcess) => return Ok(TerminationOutcome::Forced),
        Err(SignalFailure::Other(message)) => {
            error!("[orchestrator] Failed to kill process tree {}: {}", pid, message);
            return Err(ShutdownError::KillFailed { pid, message });
        }
    }

    if wait_for_exit(tree, pid, grace, poll).await {
        info!("[orchestrator] Process tree {} killed", pid);
        Ok(TerminationOutcome::Forced)
    } else {
        error!("[orchestrator] Process tree {} survived SIGKILL", pid);
        Err(ShutdownError::StillAlive { pid })
    }
}

async fn wait_for_exit<T: ProcessTree + ?Sized>(
    tree: &T,
    pid: u32,
    timeout: Duration,
    poll: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !tree.is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// The real process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTree;

#[cfg(unix)]
impl ProcessTree for SystemProcessTree {
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), SignalFailure> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let sig = match signal {
            StopSignal::Graceful => Signal::SIGTERM,
            StopSignal::Forceful => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SignalFailure::NoSuchProcess),
            Err(e) => Err(SignalFailure::Other(e.to_string())),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // Signal 0 probes for existence without delivering anything.
        !matches!(
            killpg(Pid::from_raw(pid as i32), None::<Signal>),
            Err(Errno::ESRCH)
        )
    }
}

#[cfg(windows)]
impl ProcessTree for SystemProcessTree {
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), SignalFailure> {
        let mut cmd = std::process::Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string(), "/T"]);
        if signal == StopSignal::Forceful {
            cmd.arg("/F");
        }
        match cmd.output() {
            Ok(output) if output.status.success() => Ok(()),
            Ok(_) if !self.is_alive(pid) => Err(SignalFailure::NoSuchProcess),
            Ok(output) => Err(SignalFailure::Other(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Err(e) => Err(SignalFailure::Other(e.to_string())),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}
