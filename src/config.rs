//! Monitor configuration
//!
//! All filesystem roots the monitor touches are configurable so tests can
//! point it at a temporary tree; the defaults are the Android paths.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Fallback pid ceiling when `/proc/sys/kernel/pid_max` is unreadable
pub const DEFAULT_PID_MAX: usize = 32768;

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Per-user application data root; each entry is one system user,
    /// each package subdirectory is owned by that package's uid
    pub app_data_dir: PathBuf,
    /// Directory holding the system package database
    pub system_dir: PathBuf,
    /// File name of the package database, watched for write-close
    pub package_db: String,
    /// The app-process binary; `32`/`64` suffixed variants are watched
    /// when the 32-bit binary exists
    pub app_process: PathBuf,
    /// Number of zygotes expected before periodic scanning stops
    pub zygote_goal: usize,
    /// Upper bound of the pid space, sizes the attach bitmap
    pub pid_max: usize,
    /// Zygote rescan period while the registry is incomplete
    pub scan_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            app_data_dir: PathBuf::from("/data/data"),
            system_dir: PathBuf::from("/data/system"),
            package_db: "packages.xml".to_string(),
            app_process: PathBuf::from("/system/bin/app_process"),
            zygote_goal: default_zygote_goal(),
            pid_max: read_pid_max(),
            scan_interval: Duration::from_millis(250),
        }
    }
}

/// Expected zygote count: separate 32- and 64-bit zygotes coexist on
/// 64-bit systems, 32-bit systems run a single one
pub fn default_zygote_goal() -> usize {
    if cfg!(target_pointer_width = "64") {
        2
    } else {
        1
    }
}

/// Read the system pid ceiling, falling back to [`DEFAULT_PID_MAX`]
pub fn read_pid_max() -> usize {
    fs::read_to_string("/proc/sys/kernel/pid_max")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_PID_MAX)
}
