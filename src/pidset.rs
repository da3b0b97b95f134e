//! Compact pid membership set
//!
//! Marks which pids the monitor expects to classify on their next stop.
//! Sized once from the system pid ceiling; pids outside the range are
//! never marked, so a membership test on them is always false.

use nix::unistd::Pid;

/// Fixed-size bitmap over the valid pid range (pids start at 1)
pub struct PidSet {
    bits: Vec<u64>,
    capacity: usize,
}

impl PidSet {
    /// Create a set covering pids `1..=pid_max`
    pub fn with_capacity(pid_max: usize) -> Self {
        Self {
            bits: vec![0; pid_max.div_ceil(64)],
            capacity: pid_max,
        }
    }

    fn slot(&self, pid: Pid) -> Option<(usize, u64)> {
        let raw = pid.as_raw();
        if raw < 1 || raw as usize > self.capacity {
            return None;
        }
        let index = raw as usize - 1;
        Some((index / 64, 1u64 << (index % 64)))
    }

    /// Mark a pid; out-of-range pids are ignored
    pub fn insert(&mut self, pid: Pid) {
        if let Some((word, mask)) = self.slot(pid) {
            self.bits[word] |= mask;
        }
    }

    /// Unmark a pid
    pub fn remove(&mut self, pid: Pid) {
        if let Some((word, mask)) = self.slot(pid) {
            self.bits[word] &= !mask;
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        match self.slot(pid) {
            Some((word, mask)) => self.bits[word] & mask != 0,
            None => false,
        }
    }

    /// Unmark every pid
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }
}
