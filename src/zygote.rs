//! Zygote registry
//!
//! The set of currently traced zygote processes, each recorded with the
//! mount namespace identity it had at attach time. Zygotes are discovered
//! by scanning procfs for processes whose command line begins with
//! `zygote` and whose parent is pid 1.

use std::collections::HashMap;

use log::{debug, warn};
use nix::sys::ptrace::Options;
use nix::unistd::Pid;

use crate::errors::Result;
use crate::proc::{self, MntNamespace};
use crate::tracee::Tracee;

/// Traced zygotes keyed by pid
///
/// Invariant: every pid in the registry is currently under trace-attach
/// by this monitor; an attach failure rolls the entry back.
#[derive(Debug, Default)]
pub struct ZygoteRegistry {
    entries: HashMap<Pid, MntNamespace>,
}

impl ZygoteRegistry {
    pub fn contains(&self, pid: Pid) -> bool {
        self.entries.contains_key(&pid)
    }

    pub fn remove(&mut self, pid: Pid) {
        self.entries.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Enough zygotes discovered to stop periodic scanning
    pub fn is_complete(&self, goal: usize) -> bool {
        self.entries.len() >= goal
    }

    /// Whether any registered zygote still shares this mount namespace
    pub fn shares_namespace(&self, ns: MntNamespace) -> bool {
        self.entries.values().any(|zygote_ns| *zygote_ns == ns)
    }

    /// Seed an entry without attaching
    #[cfg(test)]
    pub(crate) fn record_for_testing(&mut self, pid: Pid, ns: MntNamespace) {
        self.entries.insert(pid, ns);
    }

    /// Scan procfs and attach every zygote found
    pub fn scan_and_attach(&mut self) {
        for pid in proc::all_pids() {
            let Some(cmdline) = proc::command_line(pid) else {
                continue;
            };
            if !cmdline.starts_with("zygote") {
                continue;
            }
            if proc::parent_pid(pid) != Some(Pid::from_raw(1)) {
                continue;
            }
            self.attach(pid);
        }
    }

    /// Attach to a zygote, or refresh the namespace of a known one
    ///
    /// Re-recording an already-registered pid only updates its namespace
    /// identity; the process is never re-attached.
    pub fn attach(&mut self, pid: Pid) {
        let Some(ns) = proc::mount_ns(pid) else {
            return;
        };
        if let Some(existing) = self.entries.get_mut(&pid) {
            *existing = ns;
            return;
        }
        debug!("tracing zygote pid={}", pid);
        self.entries.insert(pid, ns);
        if let Err(e) = trace_zygote(pid) {
            warn!("lost zygote pid={}: {}", pid, e);
            self.entries.remove(&pid);
        }
    }
}

/// Attach, swallow the initial stop, enable fork tracing, resume
fn trace_zygote(pid: Pid) -> Result<()> {
    let tracee = Tracee::attach(pid)?;
    tracee.wait_for_stop()?;
    tracee.set_options(
        Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEVFORK | Options::PTRACE_O_TRACEEXIT,
    )?;
    tracee.resume()?;
    tracee.release();
    Ok(())
}
