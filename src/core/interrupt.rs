//! Interrupt-time cleanup of background processes.
//!
//! Processes that must not outlive the run register their pid here. Whoever
//! removes a pid from the registry first (the normal stop path or the
//! interrupt handler) is the one that signals it. Spawning, reaping and the
//! interrupt sweep all happen under the registry lock, so the handler never
//! sees a live child unregistered or a reaped pid still registered.

use std::collections::HashSet;
use std::process::Child;
use std::sync::{LazyLock, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::proxy::{LibcSignaller, Signaller};

pub const INTERRUPTED_EXIT_CODE: i32 = 130;

static ACTIVE: LazyLock<Registry> = LazyLock::new(Registry::default);

#[derive(Debug, Default)]
pub struct Registry {
    active: Mutex<HashSet<u32>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, pid: u32) {
        self.lock().insert(pid);
    }

    /// Remove `pid`, returning whether it was still registered.
    pub fn release(&self, pid: u32) -> bool {
        self.lock().remove(&pid)
    }

    pub fn is_registered(&self, pid: u32) -> bool {
        self.lock().contains(&pid)
    }

    /// Spawn a child and register its pid before anyone else can look.
    pub fn spawn_registered<F>(&self, spawn: F) -> std::io::Result<Child>
    where
        F: FnOnce() -> std::io::Result<Child>,
    {
        let mut active = self.lock();
        let child = spawn()?;
        active.insert(child.id());
        Ok(child)
    }

    /// Run `reap`; when it reports an exit, `pid` is released in the same
    /// critical section.
    pub fn reap<T, F>(&self, pid: u32, reap: F) -> Option<T>
    where
        F: FnOnce() -> Option<T>,
    {
        let mut active = self.lock();
        let status = reap()?;
        active.remove(&pid);
        Some(status)
    }

    /// Signal every registered process once. Returns how many were signaled.
    pub fn terminate_all(&self, signaller: &dyn Signaller) -> usize {
        let mut active = self.lock();
        let pids: Vec<u32> = active.drain().collect();
        for pid in &pids {
            let outcome = signaller.terminate(*pid);
            tracing::warn!(pid, ?outcome, "Terminated background process on interrupt");
        }
        pids.len()
    }
}

/// The process-wide registry shared with the interrupt handler.
pub fn registry() -> &'static Registry {
    &ACTIVE
}

pub fn release(pid: u32) -> bool {
    registry().release(pid)
}

pub fn is_registered(pid: u32) -> bool {
    registry().is_registered(pid)
}

/// Install a Ctrl+C / SIGTERM handler that cleans up and exits with 130.
pub fn install_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        tracing::warn!("Interrupted, stopping background processes");
        registry().terminate_all(&LibcSignaller);
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
    .map_err(|e| Error::internal_unexpected(format!("Failed to install interrupt handler: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::TerminateOutcome;
    use std::process::Command;

    #[derive(Default)]
    struct RecordingSignaller {
        calls: Mutex<Vec<u32>>,
    }

    impl Signaller for RecordingSignaller {
        fn terminate(&self, pid: u32) -> TerminateOutcome {
            self.calls.lock().unwrap().push(pid);
            TerminateOutcome::Delivered
        }
    }

    #[test]
    fn release_reports_ownership_once() {
        let registry = Registry::default();
        registry.register(41);
        assert!(registry.is_registered(41));
        assert!(registry.release(41));
        assert!(!registry.release(41));
        assert!(!registry.is_registered(41));
    }

    #[test]
    fn terminate_all_signals_each_pid_once() {
        let registry = Registry::default();
        registry.register(101);
        registry.register(102);
        let signaller = RecordingSignaller::default();

        assert_eq!(registry.terminate_all(&signaller), 2);
        let mut calls = signaller.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec![101, 102]);

        assert_eq!(registry.terminate_all(&signaller), 0);
        assert_eq!(signaller.calls.lock().unwrap().len(), 2);
        assert!(!registry.release(101));
    }

    #[test]
    fn released_pid_is_not_signaled_on_interrupt() {
        let registry = Registry::default();
        registry.register(201);
        registry.register(202);
        assert!(registry.release(201));
        let signaller = RecordingSignaller::default();

        registry.terminate_all(&signaller);

        assert_eq!(*signaller.calls.lock().unwrap(), vec![202]);
    }

    #[test]
    fn spawn_registered_records_child_pid() {
        let registry = Registry::default();
        let mut child = registry
            .spawn_registered(|| Command::new("true").spawn())
            .unwrap();
        let pid = child.id();
        assert!(registry.is_registered(pid));

        let status = registry.reap(pid, || child.wait().ok());
        assert!(status.is_some_and(|s| s.success()));
        assert!(!registry.is_registered(pid));
    }

    #[test]
    fn failed_spawn_registers_nothing() {
        let registry = Registry::default();
        let result = registry.spawn_registered(|| Command::new("/nonexistent/proxy").spawn());
        assert!(result.is_err());
        assert!(registry.lock().is_empty());
    }

    #[test]
    fn reap_keeps_pid_while_child_runs() {
        let registry = Registry::default();
        registry.register(301);

        let still_running: Option<()> = registry.reap(301, || None);

        assert!(still_running.is_none());
        assert!(registry.is_registered(301));
    }
}
