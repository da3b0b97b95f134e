//! Asynchronous event sources funneled into the monitor thread
//!
//! Three signals reach the monitor: filesystem-notifier readiness
//! (`SIGIO`), the zygote-scan timer (`SIGALRM`) and the termination
//! request (`SIGUSR1`). The handlers do no work themselves: each writes a
//! one-byte tag to a non-blocking self-pipe and returns, so every state
//! mutation happens on the monitor thread after it drains the pipe. The
//! handlers are installed without `SA_RESTART`, which bounds event
//! latency by interrupting the supervisor's blocking wait.

use std::ffi::OsString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use log::warn;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use nix::sys::signal::{pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet,
                       SigmaskHow, Signal};
use nix::unistd::{gettid, pipe2};

use crate::config::MonitorConfig;
use crate::errors::{MonitorError, Result};

/// Signal carrying the termination request, aimed at the monitor thread
pub const TERM_SIGNAL: Signal = Signal::SIGUSR1;

const TAG_NOTIFY: u8 = b'n';
const TAG_TIMER: u8 = b't';
const TAG_QUIT: u8 = b'q';

/// Write end of the active monitor's self-pipe; -1 when no monitor runs.
/// The only process-global in the crate: signal handlers cannot capture
/// state, and its emptiness doubles as the single-instance gate.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

fn push_tag(tag: u8) {
    let fd = WAKE_FD.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    // Keep errno intact for the interrupted thread.
    let saved = Errno::last_raw();
    unsafe {
        libc::write(fd, &tag as *const u8 as *const libc::c_void, 1);
    }
    Errno::set_raw(saved);
}

extern "C" fn on_notify(_: libc::c_int) {
    push_tag(TAG_NOTIFY);
}

extern "C" fn on_timer(_: libc::c_int) {
    push_tag(TAG_TIMER);
}

extern "C" fn on_quit(_: libc::c_int) {
    push_tag(TAG_QUIT);
}

/// Pending wake-ups drained from the self-pipe
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Wakes {
    pub notify: bool,
    pub timer: bool,
    pub quit: bool,
}

/// The self-pipe; owning it is owning the single monitor slot
pub struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakePipe {
    /// Create the pipe and claim the monitor slot
    pub fn install() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .map_err(|e| MonitorError::Signal(format!("wake pipe: {}", e)))?;
        let fd = write.as_raw_fd();
        if WAKE_FD
            .compare_exchange(-1, fd, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MonitorError::AlreadyRunning);
        }
        Ok(Self { read, write })
    }

    /// Collect every pending tag without blocking
    pub fn drain(&self) -> Wakes {
        let mut wakes = Wakes::default();
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &tag in &buf[..n] {
                        match tag {
                            TAG_NOTIFY => wakes.notify = true,
                            TAG_TIMER => wakes.timer = true,
                            TAG_QUIT => wakes.quit = true,
                            _ => {}
                        }
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    warn!("wake pipe read: {}", e);
                    break;
                }
            }
        }
        wakes
    }

    /// Block until a tag arrives (or a signal interrupts the wait)
    pub fn wait_readable(&self) {
        let mut fds = [PollFd::new(self.read.as_fd(), PollFlags::POLLIN)];
        let _ = poll(&mut fds, PollTimeout::NONE);
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        // Release the slot before the fds close so a handler can never
        // write into a recycled descriptor.
        let _ = WAKE_FD.compare_exchange(
            self.write.as_raw_fd(),
            -1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Install the three tag-writing handlers
pub fn install_handlers() -> Result<()> {
    let install = |signal: Signal, handler: extern "C" fn(libc::c_int)| -> Result<()> {
        let action = SigAction::new(
            SigHandler::Handler(handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(signal, &action) }
            .map(|_| ())
            .map_err(|e| MonitorError::Signal(format!("sigaction {}: {}", signal, e)))
    };
    install(Signal::SIGIO, on_notify)?;
    install(Signal::SIGALRM, on_timer)?;
    install(TERM_SIGNAL, on_quit)?;
    Ok(())
}

/// Unblock the monitor signals on the calling thread
pub fn unblock_signals() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGIO);
    set.add(Signal::SIGALRM);
    set.add(TERM_SIGNAL);
    pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)
        .map_err(|e| MonitorError::Signal(format!("sigmask: {}", e)))
}

/// Arm the periodic zygote-scan timer on the whole process
pub fn arm_timer(interval: Duration) {
    set_timer(interval);
}

/// Stop the periodic timer
pub fn disarm_timer() {
    set_timer(Duration::ZERO);
}

fn set_timer(interval: Duration) {
    let value = libc::timeval {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_usec: interval.subsec_micros() as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: value,
        it_value: value,
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc < 0 {
        warn!("setitimer: {}", Errno::last());
    }
}

/// A filesystem event the monitor reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEvent {
    /// Write-close on the package database: rebuild the uid map
    PackageDb,
    /// Access on an app-process binary: rescan for new zygotes
    ExecAccess,
}

/// Inotify watches over the package database and app-process binaries
pub struct Notifier {
    inotify: Inotify,
    db_name: OsString,
    db_watch: Option<WatchDescriptor>,
    exec_watches: Vec<WatchDescriptor>,
}

impl Notifier {
    /// Create the notifier and add the watches
    ///
    /// Failing to create the inotify instance is fatal for the monitor;
    /// an unwatchable path is only logged, the host may not carry it.
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
            .map_err(|e| MonitorError::Notify(format!("inotify init: {}", e)))?;
        let mut notifier = Self {
            inotify,
            db_name: OsString::from(&config.package_db),
            db_watch: None,
            exec_watches: Vec::new(),
        };
        notifier.db_watch = notifier.watch(&config.system_dir, AddWatchFlags::IN_CLOSE_WRITE);
        for path in app_process_paths(&config.app_process) {
            if let Some(wd) = notifier.watch(&path, AddWatchFlags::IN_ACCESS) {
                notifier.exec_watches.push(wd);
            }
        }
        Ok(notifier)
    }

    fn watch(&self, path: &Path, mask: AddWatchFlags) -> Option<WatchDescriptor> {
        match self.inotify.add_watch(path, mask) {
            Ok(wd) => Some(wd),
            Err(e) => {
                warn!("cannot watch {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Route notifier readiness to the calling thread as `SIGIO`
    pub fn bind_to_current_thread(&self) -> Result<()> {
        let fd = self.inotify.as_fd().as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL)
            .map_err(|e| MonitorError::Notify(format!("F_GETFL: {}", e)))?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_ASYNC | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags))
            .map_err(|e| MonitorError::Notify(format!("F_SETFL: {}", e)))?;
        #[repr(C)]
        struct f_owner_ex {
            type_: libc::c_int,
            pid: libc::pid_t,
        }
        const F_SETOWN_EX: libc::c_int = 15;
        const F_OWNER_TID: libc::c_int = 0;
        let owner = f_owner_ex {
            type_: F_OWNER_TID,
            pid: gettid().as_raw(),
        };
        let rc = unsafe { libc::fcntl(fd, F_SETOWN_EX, &owner) };
        if rc < 0 {
            return Err(MonitorError::Notify(format!(
                "F_SETOWN_EX: {}",
                Errno::last()
            )));
        }
        Ok(())
    }

    /// Drain the descriptor fully and dispatch every pending event
    pub fn drain(&self) -> Vec<FsEvent> {
        let mut out = Vec::new();
        loop {
            match self.inotify.read_events() {
                Ok(events) => {
                    for event in events {
                        if Some(event.wd) == self.db_watch
                            && event.mask.contains(AddWatchFlags::IN_CLOSE_WRITE)
                            && event.name.as_deref() == Some(self.db_name.as_os_str())
                        {
                            out.push(FsEvent::PackageDb);
                        } else if self.exec_watches.contains(&event.wd)
                            && event.mask.contains(AddWatchFlags::IN_ACCESS)
                        {
                            out.push(FsEvent::ExecAccess);
                        }
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    warn!("inotify read: {}", e);
                    break;
                }
            }
        }
        out
    }
}

/// The binary path(s) to watch: the `32`/`64` pair when split binaries
/// exist, otherwise the bare path
fn app_process_paths(base: &Path) -> Vec<PathBuf> {
    let suffixed = |suffix: &str| {
        let mut name = base
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        base.with_file_name(name)
    };
    let path32 = suffixed("32");
    if path32.exists() {
        let mut paths = vec![path32];
        let path64 = suffixed("64");
        if path64.exists() {
            paths.push(path64);
        }
        paths
    } else {
        vec![base.to_path_buf()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use nix::sys::signal::raise;
    use nix::unistd::write;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_wake_pipe_lifecycle() {
        // WAKE_FD is process-global; serialise with the supervisor tests.
        let _guard = serial_guard();
        let pipe = WakePipe::install().unwrap();

        // Second monitor instance is refused while the slot is taken.
        assert!(matches!(
            WakePipe::install(),
            Err(MonitorError::AlreadyRunning)
        ));

        // Nothing pending yet.
        assert_eq!(pipe.drain(), Wakes::default());

        // Tags written by hand are collected and deduplicated.
        write(&pipe.write, &[TAG_NOTIFY, TAG_TIMER, TAG_NOTIFY]).unwrap();
        let wakes = pipe.drain();
        assert!(wakes.notify);
        assert!(wakes.timer);
        assert!(!wakes.quit);

        // A raised signal goes through the handler into the pipe.
        install_handlers().unwrap();
        unblock_signals().unwrap();
        raise(TERM_SIGNAL).unwrap();
        assert!(pipe.drain().quit);

        // Unknown bytes are ignored.
        write(&pipe.write, b"x").unwrap();
        assert_eq!(pipe.drain(), Wakes::default());

        // Dropping the pipe frees the slot.
        drop(pipe);
        let pipe = WakePipe::install().unwrap();
        drop(pipe);
    }

    #[test]
    fn test_notifier_tolerates_missing_paths() {
        let tmp = tempdir().unwrap();
        let config = MonitorConfig {
            app_data_dir: tmp.path().join("data"),
            system_dir: tmp.path().join("absent-system"),
            app_process: tmp.path().join("absent-app_process"),
            ..Default::default()
        };
        let notifier = Notifier::new(&config).unwrap();
        assert!(notifier.db_watch.is_none());
        assert!(notifier.exec_watches.is_empty());
        assert!(notifier.drain().is_empty());
    }

    #[test]
    fn test_notifier_reports_package_db_write() {
        let tmp = tempdir().unwrap();
        let system_dir = tmp.path().join("system");
        fs::create_dir_all(&system_dir).unwrap();
        let config = MonitorConfig {
            system_dir: system_dir.clone(),
            app_process: tmp.path().join("absent-app_process"),
            ..Default::default()
        };
        let notifier = Notifier::new(&config).unwrap();

        fs::write(system_dir.join("packages.xml"), "<packages/>").unwrap();
        let events = notifier.drain();
        assert!(events.contains(&FsEvent::PackageDb));

        // Writes to other files in the watched directory do not count.
        fs::write(system_dir.join("other.xml"), "<other/>").unwrap();
        assert!(notifier.drain().is_empty());
    }

    #[test]
    fn test_notifier_reports_exec_access() {
        let tmp = tempdir().unwrap();
        let app_process = tmp.path().join("app_process");
        fs::write(&app_process, "binary").unwrap();
        let config = MonitorConfig {
            system_dir: tmp.path().join("absent-system"),
            app_process: app_process.clone(),
            ..Default::default()
        };
        let notifier = Notifier::new(&config).unwrap();
        assert_eq!(notifier.exec_watches.len(), 1);

        fs::read(&app_process).unwrap();
        let events = notifier.drain();
        assert!(events.contains(&FsEvent::ExecAccess));
    }

    #[test]
    fn test_app_process_paths_prefers_split_binaries() {
        let tmp = tempdir().unwrap();
        let base = tmp.path().join("app_process");

        // No split binaries: the bare path.
        assert_eq!(app_process_paths(&base), vec![base.clone()]);

        // 32-bit only.
        let path32 = tmp.path().join("app_process32");
        fs::write(&path32, "").unwrap();
        assert_eq!(app_process_paths(&base), vec![path32.clone()]);

        // Both widths.
        let path64 = tmp.path().join("app_process64");
        fs::write(&path64, "").unwrap();
        assert_eq!(app_process_paths(&base), vec![path32, path64]);
    }
}
