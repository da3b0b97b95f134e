//! zygote-monitor: intercept specialising app processes before they run
//!
//! A ptrace-based monitor for Linux/Android systems. It attaches to every
//! zygote, watches their forks, and classifies each new descendant the
//! moment it leaves the init/zygote identity (uid 0) for its application
//! identity. Descendants matching a controller-supplied hide set are
//! detached in a group-stopped state and handed to an external hide
//! daemon, which performs mount-namespace work on them and resumes them.
//!
//! # Modules
//!
//! - **proc**: pure procfs queries (parent pid, command line, uid, mount
//!   namespace identity, thread-group leadership)
//! - **targets**: the hide set and the uid-to-process matching policy
//! - **zygote**: the registry of traced zygotes and their namespaces
//! - **pidset**: the attach bitmap over the pid space
//! - **tracee**: thin ptrace layer with detach-on-drop
//! - **events**: self-pipe, signal handlers, inotify watches, scan timer
//! - **monitor**: the supervisor thread and its lifecycle handle
//!
//! # Example
//!
//! ```ignore
//! use zygote_monitor::{self as monitor, HideDaemon, MonitorConfig, TargetList};
//! use nix::unistd::Pid;
//!
//! struct Daemon;
//! impl HideDaemon for Daemon {
//!     fn hide(&self, pid: Pid) {
//!         // remount namespaces, then resume the stopped pid
//!     }
//! }
//!
//! let targets = TargetList::new();
//! targets.add("com.example.app", "com.example.app");
//!
//! let handle = monitor::spawn(MonitorConfig::default(), targets.clone(), Box::new(Daemon))?;
//! // ... later
//! handle.stop();
//! # Ok::<(), zygote_monitor::MonitorError>(())
//! ```

pub mod config;
pub mod errors;
pub mod events;
pub mod monitor;
pub mod pidset;
pub mod proc;
pub mod targets;
pub mod tracee;
pub mod zygote;

pub use config::MonitorConfig;
pub use nix::unistd::Pid;
pub use errors::{MonitorError, Result};
pub use monitor::{spawn, HideDaemon, MonitorHandle};
pub use proc::MntNamespace;
pub use targets::{TargetList, TargetMatch, ISOLATED_PACKAGE};
pub use zygote::ZygoteRegistry;
