//! Per-method profiling data touched by traps.
//!
//! Trap history lives behind the method's extra-data lock. The decompile
//! count is a separate atomic because code invalidation bumps it without
//! taking that lock.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::reason::DeoptReason;
use crate::runtime::MethodId;
use crate::trap_state::TrapState;

// =============================================================================
// Per-location records
// =============================================================================

/// Trap record for one bytecode location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BciData {
    pub trap_state: TrapState,
    pub exception_seen: bool,
}

// =============================================================================
// TrapHistory
// =============================================================================

/// Trap counters of one method. Guarded by [`MethodData::lock`].
#[derive(Debug)]
pub struct TrapHistory {
    trap_counts: [u32; DeoptReason::LIMIT],
    bci_data: FxHashMap<u32, BciData>,
    /// Maximum number of per-location records.
    capacity: usize,
    /// Bytecode indices that start exception handlers, with whether the
    /// handler was entered.
    exception_handlers: FxHashMap<u32, bool>,
    overflow_recompile_count: u32,
    tenure_traps: u32,
}

impl TrapHistory {
    fn new(capacity: usize) -> Self {
        Self {
            trap_counts: [0; DeoptReason::LIMIT],
            bci_data: FxHashMap::default(),
            capacity,
            exception_handlers: FxHashMap::default(),
            overflow_recompile_count: 0,
            tenure_traps: 0,
        }
    }

    /// Traps recorded for `reason`.
    #[inline]
    pub fn trap_count(&self, reason: DeoptReason) -> u32 {
        self.trap_counts[reason as usize]
    }

    /// Count one trap for `reason` and return the new count. Saturates.
    pub fn inc_trap_count(&mut self, reason: DeoptReason) -> u32 {
        let count = &mut self.trap_counts[reason as usize];
        *count = count.saturating_add(1);
        *count
    }

    /// Sum of trap counts over every reason.
    pub fn total_trap_count(&self) -> u64 {
        self.trap_counts.iter().map(|&c| u64::from(c)).sum()
    }

    /// Record for `bci`, if one was allocated.
    #[inline]
    pub fn bci_data(&self, bci: u32) -> Option<&BciData> {
        self.bci_data.get(&bci)
    }

    /// Record for `bci`, allocating it if there is room.
    pub fn allocate_bci_data(&mut self, bci: u32) -> Option<&mut BciData> {
        if !self.bci_data.contains_key(&bci) && self.bci_data.len() >= self.capacity {
            return None;
        }
        Some(self.bci_data.entry(bci).or_default())
    }

    /// Number of allocated per-location records.
    #[inline]
    pub fn bci_data_len(&self) -> usize {
        self.bci_data.len()
    }

    pub fn register_exception_handler(&mut self, bci: u32) {
        self.exception_handlers.entry(bci).or_insert(false);
    }

    /// Mark the handler at `bci` as entered. Returns `false` if no handler
    /// starts there.
    pub fn set_exception_handler_entered(&mut self, bci: u32) -> bool {
        match self.exception_handlers.get_mut(&bci) {
            Some(entered) => {
                *entered = true;
                true
            }
            None => false,
        }
    }

    pub fn exception_handler_entered(&self, bci: u32) -> bool {
        self.exception_handlers.get(&bci).copied().unwrap_or(false)
    }

    #[inline]
    pub fn overflow_recompile_count(&self) -> u32 {
        self.overflow_recompile_count
    }

    pub fn inc_overflow_recompile_count(&mut self) -> u32 {
        self.overflow_recompile_count = self.overflow_recompile_count.saturating_add(1);
        self.overflow_recompile_count
    }

    #[inline]
    pub fn tenure_traps(&self) -> u32 {
        self.tenure_traps
    }

    pub fn inc_tenure_traps(&mut self) {
        self.tenure_traps = self.tenure_traps.saturating_add(1);
    }
}

// =============================================================================
// MethodData
// =============================================================================

/// Profiling data of one method.
#[derive(Debug)]
pub struct MethodData {
    method: MethodId,
    extra_data: Mutex<TrapHistory>,
    decompile_count: AtomicU32,
}

impl MethodData {
    /// Create empty data with room for `slots` per-location records.
    pub fn new(method: MethodId, slots: usize) -> Self {
        Self {
            method,
            extra_data: Mutex::new(TrapHistory::new(slots)),
            decompile_count: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Take the extra-data lock.
    ///
    /// Never acquire the generation lock while holding this guard.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, TrapHistory> {
        self.extra_data.lock()
    }

    /// Traps recorded for `reason`. Takes the lock briefly.
    pub fn trap_count(&self, reason: DeoptReason) -> u32 {
        self.lock().trap_count(reason)
    }

    /// Trap state at `bci`. Takes the lock briefly.
    pub fn trap_state_at(&self, bci: u32) -> Option<TrapState> {
        self.lock().bci_data(bci).map(|d| d.trap_state)
    }

    /// Times compiled code for the method was invalidated.
    #[inline]
    pub fn decompile_count(&self) -> u32 {
        self.decompile_count.load(Ordering::Acquire)
    }

    /// Count one invalidation and return the new count.
    pub fn inc_decompile_count(&self) -> u32 {
        self.decompile_count.fetch_add(1, Ordering::AcqRel) + 1
    }
}
