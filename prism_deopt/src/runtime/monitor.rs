//! Object monitors.
//!
//! Every heap object carries a reentrant monitor. Relocking an eliminated
//! lock acquires it on behalf of the thread that owned the compiled frame,
//! which need not be the thread doing the work.

use parking_lot::{Condvar, Mutex};

use super::thread::{ExecThread, ThreadId};

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    /// Extra acquisitions beyond the first.
    recursions: u32,
}

/// Reentrant object monitor.
#[derive(Debug, Default)]
pub struct ObjectMonitor {
    state: Mutex<MonitorState>,
    released: Condvar,
}

impl ObjectMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the monitor for `thread`, waiting while another thread holds it.
    pub fn enter_for(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(thread);
                    state.recursions = 0;
                    return;
                }
                Some(owner) if owner == thread => {
                    state.recursions += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    /// Acquire the monitor for `thread` if it is free or already owned.
    pub fn try_enter(&self, thread: ThreadId) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(thread);
                state.recursions = 0;
                true
            }
            Some(owner) if owner == thread => {
                state.recursions += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one acquisition. Returns `false` if `thread` is not the owner.
    pub fn exit(&self, thread: ThreadId) -> bool {
        let mut state = self.state.lock();
        if state.owner != Some(thread) {
            return false;
        }
        if state.recursions > 0 {
            state.recursions -= 1;
        } else {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
        true
    }

    /// Current owner.
    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    #[inline]
    pub fn is_owned_by(&self, thread: ThreadId) -> bool {
        self.owner() == Some(thread)
    }

    /// Number of times `thread` holds the monitor.
    pub fn hold_count(&self, thread: ThreadId) -> u32 {
        let state = self.state.lock();
        if state.owner == Some(thread) {
            state.recursions + 1
        } else {
            0
        }
    }

    /// Reacquire after a wait, applying relocks deferred while `thread` was
    /// waiting on this monitor.
    pub fn reacquire_after_wait(&self, thread: &ExecThread) {
        self.enter_for(thread.id());
        let deferred = thread.take_relock_count_after_wait();
        if deferred > 0 {
            self.state.lock().recursions += deferred;
        }
    }
}
