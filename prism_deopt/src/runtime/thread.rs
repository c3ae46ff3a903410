//! Execution threads.
//!
//! Everything the deoptimization engine reads or writes on a thread lives in
//! [`ThreadState`] behind one lock. The owning thread holds it while it
//! handles a trap; other threads take it to run handshake operations, so a
//! handshake never observes a half-unwound stack.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use super::heap::ObjRef;
use super::stack::{FrameId, FrameKind, PhysicalFrame, Pc, STACK_BASE};
use crate::frame::VFrameArray;
use crate::reversal::Rematerialized;

/// Identity of an execution thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

/// An exception waiting to be delivered to the interpreter.
#[derive(Clone)]
pub enum ThrownException {
    /// Raised when rematerializing eliminated objects ran out of memory.
    OutOfMemoryRealloc,
    Object(ObjRef),
}

impl ThrownException {
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemoryRealloc)
    }
}

impl fmt::Debug for ThrownException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemoryRealloc => f.write_str("OutOfMemoryError(realloc_objects)"),
            Self::Object(obj) => write!(f, "{}@{}", obj.klass().name(), obj.id()),
        }
    }
}

// =============================================================================
// ThreadState
// =============================================================================

/// Stack and deoptimization bookkeeping of one thread.
#[derive(Default)]
pub struct ThreadState {
    frames: Vec<PhysicalFrame>,
    next_frame_id: u64,
    pub pending_exception: Option<ThrownException>,
    /// Exception the unpacked interpreter frames dispatch on resumption.
    pub exception_oop: Option<ThrownException>,
    /// Plan being unpacked.
    pub(crate) vframe_array_head: Option<Box<VFrameArray>>,
    /// Plan unpacked last; released by the next cleanup.
    pub(crate) vframe_array_last: Option<Box<VFrameArray>>,
    /// Interpreter frames to pop because rematerialization failed.
    pub frames_to_pop_failed_realloc: usize,
    /// Words of arguments preserved by a frame pop request.
    pub popframe_preserved_args_words: usize,
    /// A frame pop forced the caller to re-execute its call.
    pub popframe_forcing_deopt_reexecution: bool,
    /// Objects already rematerialized for frames that are still compiled.
    pub(crate) deferred_objects: FxHashMap<FrameId, Rematerialized>,
}

impl ThreadState {
    // -------------------------------------------------------------------------
    // Frames
    // -------------------------------------------------------------------------

    /// Frames, bottom (oldest) first.
    #[inline]
    pub fn frames(&self) -> &[PhysicalFrame] {
        &self.frames
    }

    #[inline]
    pub fn frames_mut(&mut self) -> &mut [PhysicalFrame] {
        &mut self.frames
    }

    /// Topmost frame.
    #[inline]
    pub fn last_frame(&self) -> Option<&PhysicalFrame> {
        self.frames.last()
    }

    /// Stack pointer of the topmost frame.
    #[inline]
    pub fn sp(&self) -> usize {
        self.frames.last().map_or(STACK_BASE, |f| f.sp)
    }

    /// Push a frame of `size_words` on top of the stack.
    pub fn push_frame(&mut self, size_words: usize, pc: Pc, kind: FrameKind) -> FrameId {
        self.next_frame_id += 1;
        let id = FrameId(self.next_frame_id);
        let sp = self.sp() - size_words;
        self.frames.push(PhysicalFrame {
            id,
            sp,
            size_words,
            pc,
            kind,
        });
        id
    }

    pub fn pop_frame(&mut self) -> Option<PhysicalFrame> {
        self.frames.pop()
    }

    /// Index of the frame with `id`.
    pub fn frame_index(&self, id: FrameId) -> Option<usize> {
        self.frames.iter().rposition(|f| f.id == id)
    }

    pub fn frame(&self, id: FrameId) -> Option<&PhysicalFrame> {
        self.frame_index(id).map(|i| &self.frames[i])
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut PhysicalFrame> {
        self.frame_index(id).map(move |i| &mut self.frames[i])
    }

    /// Caller of the frame at `index`.
    #[inline]
    pub fn caller_of(&self, index: usize) -> Option<&PhysicalFrame> {
        index.checked_sub(1).map(|i| &self.frames[i])
    }

    // -------------------------------------------------------------------------
    // Exceptions
    // -------------------------------------------------------------------------

    #[inline]
    pub fn has_pending_exception(&self) -> bool {
        self.pending_exception.is_some()
    }

    #[inline]
    pub fn clear_pending_exception(&mut self) -> Option<ThrownException> {
        self.pending_exception.take()
    }

    // -------------------------------------------------------------------------
    // Deoptimization bookkeeping
    // -------------------------------------------------------------------------

    /// Plan currently being unpacked.
    #[inline]
    pub fn vframe_array_head(&self) -> Option<&VFrameArray> {
        self.vframe_array_head.as_deref()
    }

    /// Plan unpacked by the last completed deoptimization.
    #[inline]
    pub fn vframe_array_last(&self) -> Option<&VFrameArray> {
        self.vframe_array_last.as_deref()
    }

    /// Whether eliminated objects of `frame` were already restored.
    #[inline]
    pub fn objs_are_deoptimized(&self, frame: FrameId) -> bool {
        self.deferred_objects.contains_key(&frame)
    }

    /// Forget pop-frame requests.
    pub fn clear_popframe_condition(&mut self) {
        self.popframe_preserved_args_words = 0;
        self.popframe_forcing_deopt_reexecution = false;
    }
}

// =============================================================================
// ExecThread
// =============================================================================

/// A managed execution thread as seen by the runtime.
pub struct ExecThread {
    id: ThreadId,
    name: String,
    state: Mutex<ThreadState>,
    /// Monitor whose `wait` the thread is blocked in.
    waiting_on: Mutex<Option<ObjRef>>,
    relock_count_after_wait: AtomicU32,
    in_deopt_handler: AtomicU32,
    no_safepoint_depth: AtomicU32,
}

impl ExecThread {
    pub fn new(id: ThreadId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: Mutex::new(ThreadState::default()),
            waiting_on: Mutex::new(None),
            relock_count_after_wait: AtomicU32::new(0),
            in_deopt_handler: AtomicU32::new(0),
            no_safepoint_depth: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the thread's stack and bookkeeping.
    #[inline]
    pub fn state(&self) -> MutexGuard<'_, ThreadState> {
        self.state.lock()
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    /// Record that the thread is blocked waiting on `obj`'s monitor.
    pub fn set_waiting_on(&self, obj: Option<ObjRef>) {
        *self.waiting_on.lock() = obj;
    }

    pub fn waiting_on(&self) -> Option<ObjRef> {
        self.waiting_on.lock().clone()
    }

    /// Whether the thread is blocked waiting on exactly `obj`.
    pub fn is_waiting_on(&self, obj: &ObjRef) -> bool {
        self.waiting_on.lock().as_ref().is_some_and(|w| w.is(obj))
    }

    /// Defer one relock until the thread reacquires the monitor it waits on.
    #[inline]
    pub fn inc_relock_count_after_wait(&self) {
        self.relock_count_after_wait.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn relock_count_after_wait(&self) -> u32 {
        self.relock_count_after_wait.load(Ordering::Acquire)
    }

    /// Take the deferred relocks, resetting the count.
    #[inline]
    pub fn take_relock_count_after_wait(&self) -> u32 {
        self.relock_count_after_wait.swap(0, Ordering::AcqRel)
    }

    // -------------------------------------------------------------------------
    // Deopt handler and safepoint bookkeeping
    // -------------------------------------------------------------------------

    #[inline]
    pub fn inc_in_deopt_handler(&self) {
        self.in_deopt_handler.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn dec_in_deopt_handler(&self) {
        let prev = self.in_deopt_handler.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced deopt handler exit");
    }

    /// Number of deoptimizations this thread is in the middle of.
    #[inline]
    pub fn in_deopt_handler(&self) -> u32 {
        self.in_deopt_handler.load(Ordering::Acquire)
    }

    /// Enter a region in which the thread must not reach a safepoint.
    pub fn no_safepoint_scope(&self) -> NoSafepointScope<'_> {
        self.no_safepoint_depth.fetch_add(1, Ordering::AcqRel);
        NoSafepointScope { thread: self }
    }

    #[inline]
    pub fn in_no_safepoint_scope(&self) -> bool {
        self.no_safepoint_depth.load(Ordering::Acquire) > 0
    }
}

impl fmt::Debug for ExecThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Guard for a region without safepoints. Ends on drop.
pub struct NoSafepointScope<'a> {
    thread: &'a ExecThread,
}

impl Drop for NoSafepointScope<'_> {
    fn drop(&mut self) {
        self.thread.no_safepoint_depth.fetch_sub(1, Ordering::AcqRel);
    }
}
