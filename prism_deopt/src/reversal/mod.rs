//! Restoring state the compiler optimized away.
//!
//! Before a compiled frame can be replaced by interpreter frames, objects
//! whose allocation was eliminated are reallocated and filled in, and locks
//! whose acquisition was eliminated are taken again for the frame's thread.
//!
//! ```text
//!   realloc_objects ──▶ reassign_fields ──▶ (no safepoint) restore_eliminated_locks
//!          │
//!          └─ failure: pending OutOfMemoryError, objects left null
//! ```
//!
//! A failed reallocation never aborts the other objects. The caller is told
//! that the frame group's locals are unusable and pops its interpreter
//! frames once the frames are unpacked.

pub mod locks;
pub mod objects;

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::code::{ObjectDescriptor, ObjectId};
use crate::config::DeoptConfig;
use crate::frame::{CompiledVFrame, ExecMode};
use crate::runtime::{BoxCaches, ExecThread, Heap, ObjRef, ThrownException};

pub use locks::{relock_objects, restore_eliminated_locks};
pub use objects::{realloc_objects, reassign_fields};

// =============================================================================
// Rematerialized
// =============================================================================

/// Objects reallocated for one compiled frame, by debug-info id.
///
/// An entry of `None` records a failed reallocation.
#[derive(Debug, Clone, Default)]
pub struct Rematerialized {
    objects: FxHashMap<ObjectId, Option<ObjRef>>,
    cached: FxHashSet<ObjectId>,
}

impl Rematerialized {
    pub fn insert(&mut self, id: ObjectId, obj: Option<ObjRef>) {
        self.objects.insert(id, obj);
    }

    /// The object for `id`; `None` if it was never reallocated or failed.
    #[inline]
    pub fn get(&self, id: ObjectId) -> Option<ObjRef> {
        self.objects.get(&id).cloned().flatten()
    }

    #[inline]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Record that `id` was satisfied from a box cache; its fields are
    /// already correct.
    pub fn mark_cached(&mut self, id: ObjectId) {
        self.cached.insert(id);
    }

    #[inline]
    pub fn is_cached(&self, id: ObjectId) -> bool {
        self.cached.contains(&id)
    }

    /// Number of objects whose reallocation failed.
    pub fn failures(&self) -> usize {
        self.objects.values().filter(|o| o.is_none()).count()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

// =============================================================================
// Reversal
// =============================================================================

/// Collaborators used to rebuild eliminated objects.
#[derive(Clone, Copy)]
pub struct ReversalContext<'a> {
    pub heap: &'a dyn Heap,
    pub box_caches: &'a BoxCaches,
    pub config: &'a DeoptConfig,
}

/// Result of restoring one compiled frame's eliminated state.
#[derive(Debug, Default)]
pub struct ReversalOutcome {
    pub objects: Rematerialized,
    /// Some object could not be reallocated.
    pub realloc_failures: bool,
    /// Objects were reallocated or locks retaken.
    pub deoptimized_objects: bool,
}

/// Reallocate the frame group's eliminated objects and fill in their fields.
///
/// `pending` is the pending exception of the thread doing the work. A
/// failure leaves an out-of-memory error there, except in
/// [`ExecMode::None`] where it is cleared and only reported.
pub fn rematerialize_objects(
    ctx: &ReversalContext<'_>,
    pending: &mut Option<ThrownException>,
    exec_mode: ExecMode,
    chain: &[CompiledVFrame<'_>],
    eliminated: &[Arc<ObjectDescriptor>],
) -> ReversalOutcome {
    let mut outcome = ReversalOutcome::default();
    let Some(top) = chain.first() else {
        return outcome;
    };
    if eliminated.is_empty() {
        return outcome;
    }

    let frame = top.frame();
    outcome.realloc_failures = realloc_objects(ctx, frame, eliminated, &mut outcome.objects, pending);
    if exec_mode == ExecMode::None {
        if outcome.realloc_failures {
            pending.take();
        }
        outcome.deoptimized_objects = true;
    }
    reassign_fields(
        frame,
        eliminated,
        &outcome.objects,
        frame.region.sees_injected_fields(),
    );
    tracing::trace!(
        target: "prism_deopt",
        objects = outcome.objects.len(),
        failures = outcome.objects.failures(),
        "rematerialized eliminated objects"
    );
    outcome
}

/// Restore a compiled frame's eliminated objects and locks on behalf of a
/// thread inspecting `deoptee`'s stack. Nothing is unpacked.
///
/// If any reallocation fails no lock is retaken: the frame stays compiled
/// and its unwind restores the whole frame group later.
pub fn reverse(
    ctx: &ReversalContext<'_>,
    deoptee: &ExecThread,
    pending: &mut Option<ThrownException>,
    chain: &[CompiledVFrame<'_>],
    eliminated: &[Arc<ObjectDescriptor>],
) -> ReversalOutcome {
    let mut outcome = if ctx.config.eliminate_allocations || ctx.config.eliminate_auto_box {
        rematerialize_objects(ctx, pending, ExecMode::None, chain, eliminated)
    } else {
        ReversalOutcome::default()
    };

    let _no_safepoint = deoptee.no_safepoint_scope();
    if ctx.config.eliminate_locks && !outcome.realloc_failures {
        let relocked = restore_eliminated_locks(
            chain,
            &outcome.objects,
            deoptee,
            ExecMode::None,
            outcome.realloc_failures,
        );
        outcome.deoptimized_objects |= relocked;
    }
    outcome
}
