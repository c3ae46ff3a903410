//! Compiled code regions.
//!
//! A region is the optimized translation of one method. The deoptimization
//! engine never touches its instructions, only three attributes: whether new
//! calls may enter it, whether it is marked for deoptimization, and the
//! generation of that mark.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use super::debug_info::{DebugInfo, PcDesc};
use crate::runtime::{Method, Pc};

// =============================================================================
// States
// =============================================================================

/// Whether new activations may enter the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    InUse = 0,
    NotEntrant = 1,
}

/// Progress of a deoptimization request against the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeoptStatus {
    NotMarked = 0,
    /// Marked; deoptimizing it counts as a decompilation of the method.
    Deoptimize = 1,
    /// Marked without counting a decompilation.
    DeoptimizeNoUpdate = 2,
    /// A commit round made it not entrant and patched its frames.
    Deoptimized = 3,
}

impl DeoptStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Deoptimize,
            2 => Self::DeoptimizeNoUpdate,
            3 => Self::Deoptimized,
            _ => Self::NotMarked,
        }
    }
}

// =============================================================================
// CompiledRegion
// =============================================================================

/// Optimized machine code for one method.
pub struct CompiledRegion {
    compile_id: u32,
    method: Arc<Method>,
    code_begin: Pc,
    code_size: usize,
    deopt_handler_offset: usize,
    /// Words occupied by an activation of this code.
    frame_size_words: usize,
    /// Runtime-injected fields were visible to the compiler.
    sees_injected_fields: bool,
    debug_info: DebugInfo,
    state: AtomicU8,
    status: AtomicU8,
    deopt_generation: AtomicU64,
}

impl CompiledRegion {
    /// Create a region occupying `[code_begin, code_begin + code_size)`.
    pub fn new(compile_id: u32, method: Arc<Method>, code_begin: Pc, code_size: usize) -> Self {
        Self {
            compile_id,
            method,
            code_begin,
            code_size,
            deopt_handler_offset: code_size.saturating_sub(16),
            frame_size_words: 4,
            sees_injected_fields: false,
            debug_info: DebugInfo::default(),
            state: AtomicU8::new(EntryState::InUse as u8),
            status: AtomicU8::new(DeoptStatus::NotMarked as u8),
            deopt_generation: AtomicU64::new(0),
        }
    }

    /// Set the deoptimization handler's offset within the region.
    pub fn with_deopt_handler_offset(mut self, offset: usize) -> Self {
        debug_assert!(offset < self.code_size);
        self.deopt_handler_offset = offset;
        self
    }

    pub fn with_frame_size(mut self, words: usize) -> Self {
        self.frame_size_words = words;
        self
    }

    pub fn with_injected_fields_visible(mut self) -> Self {
        self.sees_injected_fields = true;
        self
    }

    pub fn with_debug_info(mut self, debug_info: DebugInfo) -> Self {
        self.debug_info = debug_info;
        self
    }

    // -------------------------------------------------------------------------
    // Identity and layout
    // -------------------------------------------------------------------------

    #[inline]
    pub fn compile_id(&self) -> u32 {
        self.compile_id
    }

    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    #[inline]
    pub fn code_begin(&self) -> Pc {
        self.code_begin
    }

    #[inline]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Whether `pc` lies inside the region.
    #[inline]
    pub fn contains(&self, pc: Pc) -> bool {
        pc.0 >= self.code_begin.0 && pc.0 < self.code_begin.0 + self.code_size
    }

    /// Address of the instruction at `offset`.
    #[inline]
    pub fn pc_at(&self, offset: u32) -> Pc {
        Pc(self.code_begin.0 + offset as usize)
    }

    /// Entry that re-enters deoptimization when a patched frame returns.
    #[inline]
    pub fn deopt_handler(&self) -> Pc {
        Pc(self.code_begin.0 + self.deopt_handler_offset)
    }

    #[inline]
    pub fn frame_size_words(&self) -> usize {
        self.frame_size_words
    }

    #[inline]
    pub fn sees_injected_fields(&self) -> bool {
        self.sees_injected_fields
    }

    #[inline]
    pub fn debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }

    /// Debug information at `pc_offset`.
    #[inline]
    pub fn pc_desc_at(&self, pc_offset: u32) -> Option<&PcDesc> {
        self.debug_info.pc_desc_at(pc_offset)
    }

    // -------------------------------------------------------------------------
    // Entry state
    // -------------------------------------------------------------------------

    #[inline]
    pub fn entry_state(&self) -> EntryState {
        if self.state.load(Ordering::Acquire) == EntryState::InUse as u8 {
            EntryState::InUse
        } else {
            EntryState::NotEntrant
        }
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.entry_state() == EntryState::InUse
    }

    /// Stop new calls from entering the region.
    ///
    /// Returns `true` only for the call that changed the state.
    pub fn make_not_entrant(&self) -> bool {
        self.state
            .compare_exchange(
                EntryState::InUse as u8,
                EntryState::NotEntrant as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Whether a deoptimization request can still affect the region.
    #[inline]
    pub fn can_be_deoptimized(&self) -> bool {
        self.is_in_use()
    }

    // -------------------------------------------------------------------------
    // Deoptimization mark
    // -------------------------------------------------------------------------

    #[inline]
    pub fn deopt_status(&self) -> DeoptStatus {
        DeoptStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_marked_for_deoptimization(&self) -> bool {
        matches!(
            self.deopt_status(),
            DeoptStatus::Deoptimize | DeoptStatus::DeoptimizeNoUpdate
        )
    }

    #[inline]
    pub fn is_deoptimized(&self) -> bool {
        self.deopt_status() == DeoptStatus::Deoptimized
    }

    /// Generation recorded when the region was marked, zero if never marked.
    #[inline]
    pub fn deopt_generation(&self) -> u64 {
        self.deopt_generation.load(Ordering::Acquire)
    }

    /// Generation of the pending mark, if the region is marked.
    pub fn marked_generation(&self) -> Option<u64> {
        self.is_marked_for_deoptimization()
            .then(|| self.deopt_generation())
    }

    /// Record a mark. Caller holds the generation lock.
    pub(crate) fn set_deopt_mark(&self, count_recompile: bool, generation: u64) {
        let status = if count_recompile {
            DeoptStatus::Deoptimize
        } else {
            DeoptStatus::DeoptimizeNoUpdate
        };
        self.deopt_generation.store(generation, Ordering::Release);
        self.status.store(status as u8, Ordering::Release);
    }

    /// Finish a mark. Returns the status it replaced.
    pub(crate) fn set_deoptimized(&self) -> DeoptStatus {
        DeoptStatus::from_u8(
            self.status
                .swap(DeoptStatus::Deoptimized as u8, Ordering::AcqRel),
        )
    }
}

impl fmt::Debug for CompiledRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRegion")
            .field("compile_id", &self.compile_id)
            .field("method", &self.method.qualified_name())
            .field("code_begin", &self.code_begin)
            .field("state", &self.entry_state())
            .field("status", &self.deopt_status())
            .field("generation", &self.deopt_generation())
            .finish()
    }
}
