//! Integration tests for zygote-monitor
//!
//! These run the monitor thread against a temporary filesystem tree, so
//! they exercise the lifecycle, the single-instance gate and the
//! notifier-driven refresh without needing a zygote (or root). The
//! classification and attach-stop branches are covered by the
//! supervisor's unit tests against real child processes.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::unistd::{geteuid, Pid};
use tempfile::TempDir;

use zygote_monitor::{self as monitor, HideDaemon, MonitorConfig, MonitorError, TargetList};

static MONITOR_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Hide daemon double recording every callback
#[derive(Clone, Default)]
struct RecordingDaemon {
    hidden: Arc<Mutex<Vec<Pid>>>,
    hide_state: Arc<Mutex<Vec<bool>>>,
}

impl HideDaemon for RecordingDaemon {
    fn hide(&self, pid: Pid) {
        self.hidden.lock().unwrap().push(pid);
    }

    fn set_hide_state(&self, enabled: bool) {
        self.hide_state.lock().unwrap().push(enabled);
    }
}

fn test_config(root: &Path) -> MonitorConfig {
    MonitorConfig {
        app_data_dir: root.join("data"),
        system_dir: root.join("system"),
        app_process: root.join("app_process"),
        ..Default::default()
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// The monitor starts, refuses a second instance, and stops cleanly
#[test]
fn test_single_instance_lifecycle() {
    let _lock = MONITOR_TEST_LOCK.lock();
    init_logging();

    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("data")).unwrap();
    fs::create_dir_all(tmp.path().join("system")).unwrap();

    let daemon = RecordingDaemon::default();
    let handle = monitor::spawn(
        test_config(tmp.path()),
        TargetList::new(),
        Box::new(daemon.clone()),
    )
    .unwrap();

    let second = monitor::spawn(
        test_config(tmp.path()),
        TargetList::new(),
        Box::new(RecordingDaemon::default()),
    );
    assert!(matches!(second, Err(MonitorError::AlreadyRunning)));

    handle.stop();
    assert_eq!(daemon.hide_state.lock().unwrap().as_slice(), &[false]);

    // The slot is free again.
    let handle = monitor::spawn(
        test_config(tmp.path()),
        TargetList::new(),
        Box::new(RecordingDaemon::default()),
    )
    .unwrap();
    handle.stop();
}

/// A package database write-close triggers a uid-map refresh that picks
/// up a newly installed package
#[test]
fn test_package_db_update_refreshes_targets() {
    let _lock = MONITOR_TEST_LOCK.lock();
    init_logging();

    let tmp = TempDir::new().unwrap();
    let data_dir = tmp.path().join("data");
    let system_dir = tmp.path().join("system");
    fs::create_dir_all(data_dir.join("0")).unwrap();
    fs::create_dir_all(&system_dir).unwrap();

    let targets = TargetList::new();
    targets.add("com.example.target", "com.example.target");

    let handle = monitor::spawn(
        test_config(tmp.path()),
        targets.clone(),
        Box::new(RecordingDaemon::default()),
    )
    .unwrap();

    // The package was not installed at startup.
    let uid = geteuid().as_raw();
    assert!(targets.match_command(uid, "com.example.target").is_none());

    // Install it and close-write the database.
    fs::create_dir_all(data_dir.join("0/com.example.target")).unwrap();
    fs::write(system_dir.join("packages.xml"), "<packages/>").unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            targets.match_command(uid, "com.example.target").is_some()
        }),
        "refresh never picked up the new package"
    );

    handle.stop();
}

/// The monitor resolves the hide set against the data tree at startup
#[test]
fn test_initial_refresh_resolves_hide_set() {
    let _lock = MONITOR_TEST_LOCK.lock();
    init_logging();

    let tmp = TempDir::new().unwrap();
    let data_dir = tmp.path().join("data");
    fs::create_dir_all(data_dir.join("0/com.example.app")).unwrap();
    fs::create_dir_all(tmp.path().join("system")).unwrap();

    let targets = TargetList::new();
    targets.add("com.example.app", "com.example.app");

    let handle = monitor::spawn(
        test_config(tmp.path()),
        targets.clone(),
        Box::new(RecordingDaemon::default()),
    )
    .unwrap();

    let uid = geteuid().as_raw();
    assert!(wait_until(Duration::from_secs(5), || {
        targets.match_command(uid, "com.example.app").is_some()
    }));

    handle.stop();
}

/// Termination empties the hide set and never invokes the hide daemon on
/// a host without zygotes
#[test]
fn test_stop_clears_state() {
    let _lock = MONITOR_TEST_LOCK.lock();
    init_logging();

    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("data")).unwrap();
    fs::create_dir_all(tmp.path().join("system")).unwrap();

    let targets = TargetList::new();
    targets.add("com.example.a", "com.example.a");
    targets.add("com.example.b", "com.example.b:service");

    let daemon = RecordingDaemon::default();
    let handle = monitor::spawn(
        test_config(tmp.path()),
        targets.clone(),
        Box::new(daemon.clone()),
    )
    .unwrap();
    assert_eq!(targets.len(), 2);

    handle.stop();
    assert!(targets.is_empty());
    assert!(daemon.hidden.lock().unwrap().is_empty());
    assert_eq!(daemon.hide_state.lock().unwrap().as_slice(), &[false]);
}
