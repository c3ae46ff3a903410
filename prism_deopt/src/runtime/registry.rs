//! Thread registration and cross-thread synchronization.
//!
//! Two kinds of operations reach other threads' stacks:
//! 1. A handshake runs a closure against every registered thread, one at a
//!    time, each under that thread's state lock.
//! 2. A safepoint makes the calling OS thread the only one allowed to run
//!    operations until its guard drops; inside it, [`ThreadRegistry::threads_do`]
//!    visits the threads directly.
//!
//! Handshakes and safepoints are serialized against each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::thread::{ExecThread, ThreadId, ThreadState};
use crate::guarantee;

// =============================================================================
// Statistics
// =============================================================================

/// Counters describing synchronization activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub handshakes: u64,
    pub safepoints: u64,
    /// Thread visits across all handshakes and safepoint walks.
    pub thread_visits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    handshakes: AtomicU64,
    safepoints: AtomicU64,
    thread_visits: AtomicU64,
    safepoint_nanos: AtomicU64,
}

// =============================================================================
// SafepointGuard
// =============================================================================

/// Keeps the runtime at a safepoint until dropped.
pub struct SafepointGuard<'a> {
    registry: &'a ThreadRegistry,
    _serial: MutexGuard<'a, ()>,
    start_time: Instant,
}

impl SafepointGuard<'_> {
    /// Time since the safepoint began.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        let nanos = u64::try_from(self.start_time.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.registry
            .counters
            .safepoint_nanos
            .fetch_add(nanos, Ordering::Relaxed);
        *self.registry.safepoint_owner.lock() = None;
    }
}

// =============================================================================
// ThreadRegistry
// =============================================================================

/// All execution threads known to the runtime.
#[derive(Default)]
pub struct ThreadRegistry {
    threads: RwLock<Vec<Arc<ExecThread>>>,
    fully_initialized: AtomicBool,
    /// Serializes handshakes and safepoints.
    operation_lock: Mutex<()>,
    safepoint_owner: Mutex<Option<thread::ThreadId>>,
    counters: Counters,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new thread and return its handle.
    pub fn register(&self, id: ThreadId, name: impl Into<String>) -> Arc<ExecThread> {
        let thread = Arc::new(ExecThread::new(id, name));
        self.threads.write().push(Arc::clone(&thread));
        thread
    }

    /// Remove a thread. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ThreadId) -> bool {
        let mut threads = self.threads.write();
        match threads.iter().position(|t| t.id() == id) {
            Some(pos) => {
                threads.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the registered threads.
    pub fn threads(&self) -> Vec<Arc<ExecThread>> {
        self.threads.read().clone()
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<ExecThread>> {
        self.threads.read().iter().find(|t| t.id() == id).cloned()
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    // -------------------------------------------------------------------------
    // Initialization
    // -------------------------------------------------------------------------

    /// Declare the runtime fully initialized.
    pub fn mark_initialized(&self) {
        self.fully_initialized.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_fully_initialized(&self) -> bool {
        self.fully_initialized.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Safepoints
    // -------------------------------------------------------------------------

    /// Bring the runtime to a safepoint owned by the calling OS thread.
    pub fn safepoint(&self) -> SafepointGuard<'_> {
        let serial = self.operation_lock.lock();
        *self.safepoint_owner.lock() = Some(thread::current().id());
        self.counters.safepoints.fetch_add(1, Ordering::Relaxed);
        SafepointGuard {
            registry: self,
            _serial: serial,
            start_time: Instant::now(),
        }
    }

    /// Whether the calling OS thread currently owns a safepoint.
    pub fn is_at_safepoint(&self) -> bool {
        *self.safepoint_owner.lock() == Some(thread::current().id())
    }

    /// Visit every thread from inside a safepoint.
    pub fn threads_do(&self, mut op: impl FnMut(&ExecThread, &mut ThreadState)) {
        guarantee!(self.is_at_safepoint(), "threads_do outside of a safepoint");
        for thread in self.threads() {
            let mut state = thread.state();
            op(&thread, &mut state);
            self.counters.thread_visits.fetch_add(1, Ordering::Relaxed);
        }
    }

    // -------------------------------------------------------------------------
    // Handshakes
    // -------------------------------------------------------------------------

    /// Run `op` against every registered thread and return once all of them
    /// have executed it.
    pub fn handshake_all(&self, mut op: impl FnMut(&ExecThread, &mut ThreadState)) {
        guarantee!(
            !self.is_at_safepoint(),
            "handshake requested from inside a safepoint"
        );
        let _serial = self.operation_lock.lock();
        self.counters.handshakes.fetch_add(1, Ordering::Relaxed);
        for thread in self.threads() {
            let mut state = thread.state();
            debug_assert!(
                !thread.in_no_safepoint_scope(),
                "handshake reached a thread inside a no-safepoint region"
            );
            op(&thread, &mut state);
            self.counters.thread_visits.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(target: "prism_deopt", threads = self.thread_count(), "handshake complete");
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            handshakes: self.counters.handshakes.load(Ordering::Relaxed),
            safepoints: self.counters.safepoints.load(Ordering::Relaxed),
            thread_visits: self.counters.thread_visits.load(Ordering::Relaxed),
        }
    }

    /// Total time spent at safepoints.
    pub fn safepoint_time(&self) -> Duration {
        Duration::from_nanos(self.counters.safepoint_nanos.load(Ordering::Relaxed))
    }
}
