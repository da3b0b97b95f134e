//! Trace supervisor
//!
//! One dedicated thread attaches to every zygote, watches their forks and
//! classifies each new descendant: non-targets are detached as early as
//! possible, targets are detached group-stopped and handed to the hide
//! daemon before they execute any application code.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{Event, Options};
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::config::MonitorConfig;
use crate::errors::{MonitorError, Result};
use crate::events::{self, FsEvent, Notifier, WakePipe};
use crate::pidset::PidSet;
use crate::proc;
use crate::targets::{self, TargetList, TargetMatch};
use crate::tracee;
use crate::zygote::ZygoteRegistry;

const EV_FORK: i32 = Event::PTRACE_EVENT_FORK as i32;
const EV_VFORK: i32 = Event::PTRACE_EVENT_VFORK as i32;
const EV_CLONE: i32 = Event::PTRACE_EVENT_CLONE as i32;

/// Downstream consumer of stopped targets
///
/// `hide` receives a pid that is group-stopped and no longer
/// trace-attached; the daemon must resume it after its mount-namespace
/// work. The match hooks cover cases the monitor recognises but does not
/// hand off today; they default to doing nothing.
pub trait HideDaemon: Send {
    fn hide(&self, pid: Pid);

    /// Monitor lifecycle notification towards the controller
    fn set_hide_state(&self, enabled: bool) {
        let _ = enabled;
    }

    /// An isolated process matched a prefix pattern
    fn on_isolated_match(&self, pid: Pid, uid: u32, cmdline: &str) {
        let _ = (pid, uid, cmdline);
    }

    /// A process matched a name ending in `_zygote`
    fn on_app_zygote(&self, pid: Pid, uid: u32, cmdline: &str) {
        let _ = (pid, uid, cmdline);
    }
}

/// Whether classification consumed the pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    /// Detached one way or another; do not resume
    Consumed,
    /// Still attached; a later stop reclassifies it
    Pending,
}

/// Handle over a running monitor; stopping it joins the thread
pub struct MonitorHandle {
    thread: JoinHandle<()>,
    pthread: Pthread,
}

impl MonitorHandle {
    /// Request termination and wait for the monitor thread to finish
    ///
    /// Idempotent from the monitor's point of view: the termination tag
    /// is absorbed even if the thread is already gone.
    pub fn stop(self) {
        let _ = pthread_kill(self.pthread, events::TERM_SIGNAL);
        if self.thread.join().is_err() {
            warn!("monitor thread panicked");
        }
    }
}

/// Start the monitor thread
///
/// Claims the single monitor slot ([`MonitorError::AlreadyRunning`] if
/// taken), installs the signal handlers and the filesystem watches, then
/// hands everything to the supervisor thread. The initial uid-map refresh
/// and zygote scan run on that thread before its first wait.
pub fn spawn(
    config: MonitorConfig,
    targets: TargetList,
    daemon: Box<dyn HideDaemon>,
) -> Result<MonitorHandle> {
    let wake = WakePipe::install()?;
    events::install_handlers()?;
    let notifier = Notifier::new(&config)?;

    let attaches = PidSet::with_capacity(config.pid_max);
    let monitor = Monitor {
        config,
        targets,
        daemon,
        zygotes: ZygoteRegistry::default(),
        attaches,
        wake,
        notifier: Some(notifier),
    };

    let (tx, rx) = mpsc::channel();
    let thread = thread::Builder::new()
        .name("proc-monitor".to_string())
        .spawn(move || {
            let _ = tx.send(pthread_self());
            monitor.run();
        })
        .map_err(|e| MonitorError::Thread(format!("spawn: {}", e)))?;
    let pthread = rx
        .recv()
        .map_err(|_| MonitorError::Thread("monitor thread died during startup".to_string()))?;

    Ok(MonitorHandle { thread, pthread })
}

struct Monitor {
    config: MonitorConfig,
    targets: TargetList,
    daemon: Box<dyn HideDaemon>,
    zygotes: ZygoteRegistry,
    attaches: PidSet,
    wake: WakePipe,
    notifier: Option<Notifier>,
}

impl Monitor {
    fn run(mut self) {
        if let Err(e) = self.setup() {
            warn!("monitor setup failed: {}", e);
            self.terminate();
            return;
        }
        loop {
            if !self.process_wakes() {
                self.terminate();
                return;
            }
            match waitpid(None::<Pid>, Some(tracee::wait_flags())) {
                Ok(status) => self.handle_stop(status),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // Nothing to trace yet; sleep until a wake-up.
                    debug!("monitor: no tracee, waiting for events");
                    self.wake.wait_readable();
                }
                Err(e) => {
                    warn!("monitor wait: {}", e);
                    self.wake.wait_readable();
                }
            }
        }
    }

    fn setup(&mut self) -> Result<()> {
        events::unblock_signals()?;
        if let Some(notifier) = &self.notifier {
            notifier.bind_to_current_thread()?;
        }
        self.targets.refresh(&self.config.app_data_dir);
        self.rescan();
        if !self.zygotes.is_complete(self.config.zygote_goal) {
            events::arm_timer(self.config.scan_interval);
        }
        // Events queued before the O_ASYNC binding never raise SIGIO;
        // collect them now that the watches are live.
        self.process_fs_events();
        Ok(())
    }

    /// Drain the self-pipe and run the scheduled work on this thread;
    /// false means the termination request arrived
    fn process_wakes(&mut self) -> bool {
        let wakes = self.wake.drain();
        if wakes.quit {
            return false;
        }
        if wakes.notify {
            self.process_fs_events();
        }
        if wakes.timer {
            self.rescan();
        }
        true
    }

    /// Drain the notifier and dispatch every pending filesystem event
    fn process_fs_events(&mut self) {
        let Some(notifier) = self.notifier.take() else {
            return;
        };
        for event in notifier.drain() {
            match event {
                FsEvent::PackageDb => {
                    debug!("package database updated");
                    self.targets.refresh(&self.config.app_data_dir);
                }
                FsEvent::ExecAccess => self.rescan(),
            }
        }
        self.notifier = Some(notifier);
    }

    /// Scan for zygotes; once the expected count is reached the periodic
    /// timer is disarmed
    fn rescan(&mut self) {
        self.zygotes.scan_and_attach();
        if self.zygotes.is_complete(self.config.zygote_goal) {
            events::disarm_timer();
        }
    }

    fn handle_stop(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::PtraceEvent(pid, _, event) => self.handle_trace_event(pid, event),
            WaitStatus::Stopped(pid, Signal::SIGSTOP) => self.handle_attach_stop(pid),
            // Not caused by us: forward the signal unchanged.
            WaitStatus::Stopped(pid, signal) => tracee::resume(pid, Some(signal)),
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                self.detach(pid, None)
            }
            other => {
                if let Some(pid) = other.pid() {
                    self.detach(pid, None);
                }
            }
        }
    }

    fn handle_trace_event(&mut self, pid: Pid, event: i32) {
        if self.zygotes.contains(pid) {
            match event {
                EV_FORK | EV_VFORK => {
                    if let Some(child) = tracee::event_message(pid) {
                        debug!("zygote pid={} forked child={}", pid, child);
                        self.attaches.insert(Pid::from_raw(child as i32));
                    }
                }
                _ => {
                    // EXIT or anything unexpected: the zygote is gone.
                    debug!("zygote pid={} left tracing (event {})", pid, event);
                    self.zygotes.remove(pid);
                    self.detach(pid, None);
                    return;
                }
            }
        } else {
            match event {
                EV_CLONE => {
                    if self.attaches.contains(pid)
                        && self.classify(pid) == Classification::Consumed
                    {
                        return;
                    }
                }
                _ => {
                    // EXEC, EXIT or anything unexpected: stop watching.
                    self.detach(pid, None);
                    return;
                }
            }
        }
        tracee::resume(pid, None);
    }

    /// Initial SIGSTOP after the kernel auto-attached a new descendant
    fn handle_attach_stop(&mut self, pid: Pid) {
        if !self.attaches.contains(pid) && proc::is_thread_group_leader(pid) {
            self.attaches.insert(pid);
        }
        if self.attaches.contains(pid) {
            tracee::set_options(
                pid,
                Options::PTRACE_O_TRACECLONE
                    | Options::PTRACE_O_TRACEEXEC
                    | Options::PTRACE_O_TRACEEXIT,
            );
            tracee::resume(pid, None);
        } else {
            // A thread, not a process: never monitor it.
            self.detach(pid, None);
        }
    }

    /// Decide what a stopped descendant is
    ///
    /// Pending outcomes leave the pid attached so the next clone stop can
    /// reclassify it: the uid may not be applied yet, the command line may
    /// still be a zygote's, or the mount namespace may not have unshared.
    fn classify(&mut self, pid: Pid) -> Classification {
        let Some(uid) = proc::owning_uid(pid) else {
            // Process died unexpectedly, ignore.
            self.detach(pid, None);
            return Classification::Consumed;
        };
        if uid == 0 {
            return Classification::Pending;
        }
        let Some(cmdline) = proc::command_line(pid) else {
            self.detach(pid, None);
            return Classification::Consumed;
        };
        if targets::is_unspecialized(&cmdline) {
            return Classification::Pending;
        }

        let matched = self.targets.lock().match_command(uid, &cmdline);
        match matched {
            Some(TargetMatch::Isolated(_)) => {
                info!("isolated [{}] pid={} uid={}", cmdline, pid, uid);
                self.daemon.on_isolated_match(pid, uid, &cmdline);
                self.detach(pid, None);
                Classification::Consumed
            }
            Some(TargetMatch::AppZygote(_)) => {
                info!("app zygote [{}] pid={} uid={}", cmdline, pid, uid);
                self.daemon.on_app_zygote(pid, uid, &cmdline);
                self.detach(pid, None);
                Classification::Consumed
            }
            Some(TargetMatch::Process(_)) => match proc::mount_ns(pid) {
                Some(ns) if !self.zygotes.shares_namespace(ns) => {
                    info!("target [{}] pid={} uid={}", cmdline, pid, uid);
                    // Detach but keep the process group-stopped; the hide
                    // daemon resumes it once the namespace work is done.
                    self.detach(pid, Some(Signal::SIGSTOP));
                    self.daemon.hide(pid);
                    Classification::Consumed
                }
                Some(_) => Classification::Pending,
                None => {
                    self.detach(pid, None);
                    Classification::Consumed
                }
            },
            None => {
                debug!("[{}] pid={} uid={} is not a target", cmdline, pid, uid);
                self.detach(pid, None);
                Classification::Consumed
            }
        }
    }

    fn detach(&mut self, pid: Pid, signal: Option<Signal>) {
        self.attaches.remove(pid);
        tracee::detach(pid, signal);
    }

    /// Empty all state and release the event sources
    fn terminate(&mut self) {
        debug!("monitor: cleaning up");
        self.targets.lock().clear();
        self.zygotes.clear();
        self.attaches.clear();
        events::disarm_timer();
        self.daemon.set_hide_state(false);
        self.notifier = None;
        debug!("monitor: terminated");
    }
}
