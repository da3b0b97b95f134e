//! Thin ptrace layer
//!
//! [`Tracee`] owns a freshly attached pid and guarantees detach on drop so
//! a failed attach sequence never leaks a stopped process. The free
//! functions operate on pids the kernel attached for us (descendants of a
//! traced zygote); their failures mean the pid is gone or no longer ours,
//! which the supervisor logs and absorbs.

use log::warn;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::errors::{MonitorError, Result};

/// Wait flags used everywhere: trace all children, only this thread's
pub fn wait_flags() -> WaitPidFlag {
    WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD
}

/// An attached tracee; detaches on drop unless released
#[derive(Debug)]
pub struct Tracee {
    pid: Pid,
    attached: bool,
}

impl Tracee {
    /// Attach to a running process
    pub fn attach(pid: Pid) -> Result<Self> {
        ptrace::attach(pid)
            .map_err(|e| MonitorError::Trace(format!("attach pid={}: {}", pid, e)))?;
        Ok(Self {
            pid,
            attached: true,
        })
    }

    /// Block until the attach stop arrives
    pub fn wait_for_stop(&self) -> Result<WaitStatus> {
        loop {
            match waitpid(self.pid, Some(wait_flags())) {
                Ok(status) => return Ok(status),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(MonitorError::Trace(format!(
                        "wait pid={}: {}",
                        self.pid, e
                    )))
                }
            }
        }
    }

    pub fn set_options(&self, options: Options) -> Result<()> {
        ptrace::setoptions(self.pid, options)
            .map_err(|e| MonitorError::Trace(format!("setoptions pid={}: {}", self.pid, e)))
    }

    pub fn resume(&self) -> Result<()> {
        ptrace::cont(self.pid, None)
            .map_err(|e| MonitorError::Trace(format!("cont pid={}: {}", self.pid, e)))
    }

    /// Leave the process attached and give up ownership
    pub fn release(mut self) -> Pid {
        self.attached = false;
        self.pid
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if self.attached {
            let _ = ptrace::detach(self.pid, None);
        }
    }
}

/// Resume a stopped pid, optionally forwarding a signal
pub fn resume(pid: Pid, signal: Option<Signal>) {
    if let Err(e) = ptrace::cont(pid, signal) {
        warn!("ptrace cont pid={}: {}", pid, e);
    }
}

/// Enable trace options on a stopped pid
pub fn set_options(pid: Pid, options: Options) {
    if let Err(e) = ptrace::setoptions(pid, options) {
        warn!("ptrace setoptions pid={}: {}", pid, e);
    }
}

/// Event payload of the last trace stop (new child pid for fork events)
pub fn event_message(pid: Pid) -> Option<i64> {
    match ptrace::getevent(pid) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("ptrace geteventmsg pid={}: {}", pid, e);
            None
        }
    }
}

/// Best-effort detach; the pid may already be gone
pub fn detach(pid: Pid, signal: Option<Signal>) {
    let _ = ptrace::detach(pid, signal);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_to_missing_pid_fails() {
        let err = Tracee::attach(Pid::from_raw(9_999_999)).unwrap_err();
        assert!(err.to_string().contains("attach"));
    }

    #[test]
    fn test_detach_on_dead_pid_is_silent() {
        // Must not panic or error out.
        detach(Pid::from_raw(9_999_999), None);
        detach(Pid::from_raw(9_999_999), Some(Signal::SIGSTOP));
    }

    #[test]
    fn test_wait_flags_cover_all_children_of_this_thread() {
        let flags = wait_flags();
        assert!(flags.contains(WaitPidFlag::__WALL));
        assert!(flags.contains(WaitPidFlag::__WNOTHREAD));
    }
}
