//! Registry of in-flight solver processes.
//!
//! Each running solver registers its pid, start time and deadline here for the
//! lifetime of the call. The returned [`Registration`] removes the entry when
//! dropped, so every exit path deregisters. [`ProcessRegistry::cancel_all`]
//! is the hook an interrupt handler calls: it flags every registered job for
//! termination and closes the registry to new dispatches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Snapshot of one registered process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveProcess {
    pub pid: u32,
    pub level: u32,
    pub started: Instant,
    pub deadline: Instant,
}

struct Entry {
    process: ActiveProcess,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<u32, Entry>,
    cancelled: bool,
}

#[derive(Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

/// Live registration of one process; deregisters on drop
pub struct Registration {
    pid: u32,
    cancel: Arc<AtomicBool>,
    registry: Arc<ProcessRegistry>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly spawned process.
    ///
    /// If the batch has already been cancelled the registration comes back
    /// pre-cancelled and the caller terminates the process right away.
    pub fn register(
        self: &Arc<Self>,
        pid: u32,
        level: u32,
        started: Instant,
        timeout: Duration,
    ) -> Registration {
        let mut state = self.lock();
        let cancel = Arc::new(AtomicBool::new(state.cancelled));
        state.active.insert(
            pid,
            Entry {
                process: ActiveProcess {
                    pid,
                    level,
                    started,
                    deadline: started + timeout,
                },
                cancel: Arc::clone(&cancel),
            },
        );
        Registration {
            pid,
            cancel,
            registry: Arc::clone(self),
        }
    }

    /// Flag every registered process for termination and stop further
    /// dispatch. Returns how many processes were flagged.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.lock();
        state.cancelled = true;
        for entry in state.active.values() {
            entry.cancel.store(true, Ordering::SeqCst);
        }
        tracing::warn!(in_flight = state.active.len(), "cancelling batch");
        state.active.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Currently registered processes, oldest first
    pub fn active(&self) -> Vec<ActiveProcess> {
        let mut active: Vec<ActiveProcess> =
            self.lock().active.values().map(|e| e.process).collect();
        active.sort_by_key(|p| p.started);
        active
    }
}

impl Registration {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut state = self.registry.lock();
        // The pid may already belong to a newer registration.
        let ours = state
            .active
            .get(&self.pid)
            .is_some_and(|entry| Arc::ptr_eq(&entry.cancel, &self.cancel));
        if ours {
            state.active.remove(&self.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_drops_entry() {
        let registry = ProcessRegistry::new();
        let now = Instant::now();
        {
            let first = registry.register(10, 1, now, Duration::from_secs(1));
            let _second = registry.register(11, 2, now, Duration::from_secs(1));
            assert_eq!(registry.len(), 2);
            assert_eq!(first.pid(), 10);
            assert_eq!(
                registry.active()[0].deadline,
                now + Duration::from_secs(1)
            );
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_registration_keeps_reused_pid() {
        let registry = ProcessRegistry::new();
        let now = Instant::now();
        let stale = registry.register(10, 1, now, Duration::from_secs(1));
        let fresh = registry.register(10, 2, now, Duration::from_secs(1));

        drop(stale);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active()[0].level, 2);

        assert_eq!(registry.cancel_all(), 1);
        assert!(fresh.is_cancelled());
        drop(fresh);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_all_flags_live_and_future_registrations() {
        let registry = ProcessRegistry::new();
        let now = Instant::now();
        let live = registry.register(10, 1, now, Duration::from_secs(1));
        assert!(!live.is_cancelled());
        assert!(!registry.is_cancelled());

        assert_eq!(registry.cancel_all(), 1);
        assert!(live.is_cancelled());
        assert!(registry.is_cancelled());

        let late = registry.register(11, 2, now, Duration::from_secs(1));
        assert!(late.is_cancelled());

        drop(live);
        drop(late);
        assert!(registry.is_empty());
    }
}
