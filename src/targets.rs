//! Target directory: the hide set and the uid-to-process matching policy
//!
//! The hide set is a controller-supplied set of `(package, process)` pairs.
//! [`TargetDirectory::refresh`] resolves it against the per-user application
//! data tree into a uid-keyed map, rebuilt wholesale on every call. The
//! matching policy ([`TargetDirectory::match_command`]) is pure so the
//! supervisor can apply it under the monitor lock without further IO.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use nix::sys::stat::stat;

/// Package sentinel selecting isolated processes of any package; the
/// process name is then matched as a command-line prefix
pub const ISOLATED_PACKAGE: &str = "isolated";

/// Key of the isolated bucket in the uid map
pub const ISOLATED_UID_KEY: i32 = -1;

/// Command names of zygotes and unspecialised app processes; never targets
pub const UNSPECIALIZED_NAMES: [&str; 5] = ["zygote", "zygote32", "zygote64", "usap32", "usap64"];

/// Whether a uid falls in the Android isolated-process range
pub fn is_isolated_uid(uid: u32) -> bool {
    uid % 100_000 > 90_000
}

/// Whether a command line names a zygote or an unspecialised app process
pub fn is_unspecialized(cmdline: &str) -> bool {
    UNSPECIALIZED_NAMES.contains(&cmdline)
}

/// Outcome of matching a specialised process against the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetMatch {
    /// Exact command-line match; the final target kind
    Process(String),
    /// Exact match on a name ending in `_zygote`
    AppZygote(String),
    /// Prefix match from the isolated bucket
    Isolated(String),
}

/// The hide set and the uid map it resolves to
#[derive(Debug, Default)]
pub struct TargetDirectory {
    hide_set: BTreeSet<(String, String)>,
    uid_map: HashMap<i32, Vec<String>>,
}

impl TargetDirectory {
    /// Add a `(package, process)` pair; returns false if already present
    pub fn add(&mut self, package: &str, process: &str) -> bool {
        self.hide_set
            .insert((package.to_string(), process.to_string()))
    }

    /// Remove a pair; returns false if it was not present
    pub fn remove(&mut self, package: &str, process: &str) -> bool {
        self.hide_set
            .remove(&(package.to_string(), process.to_string()))
    }

    pub fn len(&self) -> usize {
        self.hide_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hide_set.is_empty()
    }

    /// Drop the hide set and the resolved map
    pub fn clear(&mut self) {
        self.hide_set.clear();
        self.uid_map.clear();
    }

    /// Rebuild the uid map from the hide set and the application data tree
    ///
    /// One directory entry per system user; a package resolves to the uid
    /// owning `<data_root>/<user>/<package>`. Isolated patterns land in the
    /// [`ISOLATED_UID_KEY`] bucket once, on the first user iteration.
    /// Wholesale and idempotent: two calls with an unchanged hide set and
    /// filesystem produce identical maps.
    pub fn refresh(&mut self, data_root: &Path) {
        self.uid_map.clear();
        let Ok(entries) = fs::read_dir(data_root) else {
            debug!("target refresh: cannot read {}", data_root.display());
            return;
        };
        let mut first_user = true;
        for entry in entries.flatten() {
            let user_dir = entry.path();
            for (package, process) in &self.hide_set {
                if package == ISOLATED_PACKAGE {
                    if first_user {
                        self.uid_map
                            .entry(ISOLATED_UID_KEY)
                            .or_default()
                            .push(process.clone());
                    }
                    continue;
                }
                let path = user_dir.join(package);
                let Ok(st) = stat(&path) else { continue };
                self.uid_map
                    .entry(st.st_uid as i32)
                    .or_default()
                    .push(process.clone());
            }
            first_user = false;
        }
    }

    /// Seed a resolved entry directly, bypassing the filesystem walk
    #[cfg(test)]
    pub(crate) fn insert_uid_for_testing(&mut self, uid: i32, process: &str) {
        self.uid_map
            .entry(uid)
            .or_default()
            .push(process.to_string());
    }

    /// Match a specialised process against the directory
    ///
    /// Isolated uids consult the prefix bucket first and fall through to
    /// the exact-match path on a miss. Exact matches on names ending in
    /// `_zygote` classify as app zygotes.
    pub fn match_command(&self, uid: u32, cmdline: &str) -> Option<TargetMatch> {
        if is_isolated_uid(uid) {
            if let Some(patterns) = self.uid_map.get(&ISOLATED_UID_KEY) {
                if let Some(pattern) = patterns.iter().find(|p| cmdline.starts_with(p.as_str())) {
                    return Some(TargetMatch::Isolated(pattern.clone()));
                }
            }
        }
        let names = self.uid_map.get(&(uid as i32))?;
        for name in names {
            if name != cmdline {
                continue;
            }
            if name.ends_with("_zygote") {
                return Some(TargetMatch::AppZygote(name.clone()));
            }
            return Some(TargetMatch::Process(name.clone()));
        }
        None
    }
}

/// Shared handle over the target directory; the controller's mutation
/// surface and the supervisor's lookup path, serialised by one lock
#[derive(Debug, Clone, Default)]
pub struct TargetList {
    inner: Arc<Mutex<TargetDirectory>>,
}

impl TargetList {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TargetDirectory> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Add a `(package, process)` pair to the hide set
    pub fn add(&self, package: &str, process: &str) -> bool {
        self.lock().add(package, process)
    }

    /// Remove a pair from the hide set
    pub fn remove(&self, package: &str, process: &str) -> bool {
        self.lock().remove(package, process)
    }

    /// Drop every pair and the resolved map
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Rebuild the uid map against a data root
    pub fn refresh(&self, data_root: &Path) {
        self.lock().refresh(data_root);
    }

    /// Query the resolved map; mainly useful to observe a refresh
    pub fn match_command(&self, uid: u32, cmdline: &str) -> Option<TargetMatch> {
        self.lock().match_command(uid, cmdline)
    }
}
