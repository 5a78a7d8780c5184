//! Tracks every child process the analyzer spawns.
//!
//! Workers invoke short-lived external tools and normally reap them inline;
//! the supervisor exists for the other exit paths. Each spawn registers the
//! child's pid and holds a [`ChildGuard`] for the duration of the wait, so
//! anything still registered when the owner closes (or panics out of scope)
//! is force-terminated instead of being orphaned.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct Supervisor {
    pids: Mutex<HashSet<u32>>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a live child. The returned guard deregisters it when the
    /// spawner finishes waiting on the child.
    pub fn register(self: &Arc<Self>, pid: u32) -> ChildGuard {
        self.pids.lock().unwrap().insert(pid);
        ChildGuard {
            supervisor: Arc::clone(self),
            pid,
        }
    }

    fn deregister(&self, pid: u32) {
        self.pids.lock().unwrap().remove(&pid);
    }

    /// Number of children currently registered.
    pub fn tracked(&self) -> usize {
        self.pids.lock().unwrap().len()
    }

    /// Force-terminate every still-registered child.
    pub fn kill_all(&self) {
        let pids: Vec<u32> = self.pids.lock().unwrap().drain().collect();
        for pid in pids {
            tracing::debug!(pid, "killing orphaned child process");
            kill_process(pid);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Last line of defense; close() normally gets here first.
        let pids: Vec<u32> = self.pids.lock().unwrap().drain().collect();
        for pid in pids {
            kill_process(pid);
        }
    }
}

#[cfg(unix)]
fn kill_process(pid: u32) {
    // pids that don't fit pid_t would alias kill(2)'s broadcast values.
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: plain syscall; an already-reaped pid just returns ESRCH.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process(_pid: u32) {}

/// RAII registration of one child pid with the supervisor.
pub struct ChildGuard {
    supervisor: Arc<Supervisor>,
    pid: u32,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.supervisor.deregister(self.pid);
    }
}
