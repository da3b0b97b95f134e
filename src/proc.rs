//! Pure queries over the procfs tree
//!
//! Every query is a single O(1) filesystem read with no caching. A `None`
//! return means the process vanished between the caller learning the pid
//! and the read, which is an expected condition while tracing.

use std::fs;

use nix::sys::stat::stat;
use nix::unistd::Pid;

/// Mount namespace identity of a process
///
/// Two processes share a mount namespace iff their identities are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MntNamespace {
    pub device: u64,
    pub inode: u64,
}

/// Parent pid from `/proc/<pid>/stat`
///
/// The field is parsed after the last `)` so a comm containing spaces or
/// parentheses cannot shift it.
pub fn parent_pid(pid: Pid) -> Option<Pid> {
    let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let rest = &content[content.rfind(')')? + 1..];
    // STATE PPID PGRP ...
    let ppid: i32 = rest.split_whitespace().nth(1)?.parse().ok()?;
    Some(Pid::from_raw(ppid))
}

/// First nul-terminated argument of `/proc/<pid>/cmdline`
pub fn command_line(pid: Pid) -> Option<String> {
    let bytes = fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let first = bytes.split(|&b| b == 0).next().unwrap_or(&[]);
    Some(String::from_utf8_lossy(first).into_owned())
}

/// Owning uid of `/proc/<pid>`
///
/// Stays 0 until the child applies its application identity.
pub fn owning_uid(pid: Pid) -> Option<u32> {
    let st = stat(format!("/proc/{}", pid).as_str()).ok()?;
    Some(st.st_uid)
}

/// Mount namespace identity from `/proc/<pid>/ns/mnt`
pub fn mount_ns(pid: Pid) -> Option<MntNamespace> {
    let st = stat(format!("/proc/{}/ns/mnt", pid).as_str()).ok()?;
    Some(MntNamespace {
        device: st.st_dev,
        inode: st.st_ino,
    })
}

/// Whether the pid is a thread group leader (`Tgid:` equals the pid)
///
/// False when the pid is dead, which callers treat the same as "thread".
pub fn is_thread_group_leader(pid: Pid) -> bool {
    let Ok(content) = fs::read_to_string(format!("/proc/{}/status", pid)) else {
        return false;
    };
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Tgid:") {
            return rest.trim().parse::<i32>() == Ok(pid.as_raw());
        }
    }
    false
}

/// All pids currently present in procfs
pub fn all_pids() -> Vec<Pid> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .collect()
}
