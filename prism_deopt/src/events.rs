//! Trap event reporting.
//!
//! Events are one-way: the engine hands them to a [`DeoptEventSink`] and never
//! looks at what the sink does with them.

use std::fmt;

use crate::frame::ExecMode;
use crate::reason::{DeoptAction, DeoptReason};

// =============================================================================
// Events
// =============================================================================

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptEventKind {
    /// Compiled code hit an uncommon trap.
    UncommonTrap,
    /// A single frame was patched to deoptimize on return.
    FrameDeoptimized,
    /// An unwind plan was produced for the frame at the top of a thread.
    Unrolled(ExecMode),
    /// Eliminated objects and locks of a frame were restored for an inspector.
    ObjectsDeoptimized,
}

/// One structured deoptimization event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapEvent {
    pub kind: DeoptEventKind,
    pub reason: DeoptReason,
    pub action: DeoptAction,
    /// Qualified name of the method whose code trapped.
    pub method: String,
    /// Bytecode index of the trap.
    pub bci: Option<u32>,
    /// Compile id of the code region.
    pub compile_id: Option<u32>,
    /// Thread that owns the frame.
    pub thread: u64,
}

impl fmt::Display for TrapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} thread={} reason={} action={} method={}",
            self.kind, self.thread, self.reason, self.action, self.method
        )?;
        if let Some(bci) = self.bci {
            write!(f, " bci={bci}")?;
        }
        if let Some(id) = self.compile_id {
            write!(f, " compile_id={id}")?;
        }
        Ok(())
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Consumer of trap events.
pub trait DeoptEventSink: Send + Sync {
    fn record(&self, event: &TrapEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DeoptEventSink for TracingSink {
    fn record(&self, event: &TrapEvent) {
        tracing::debug!(
            target: "prism_deopt::events",
            kind = ?event.kind,
            reason = event.reason.name(),
            action = event.action.name(),
            method = %event.method,
            bci = ?event.bci,
            compile_id = ?event.compile_id,
            thread = event.thread,
            "deoptimization event"
        );
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DeoptEventSink for NullSink {
    #[inline]
    fn record(&self, _event: &TrapEvent) {}
}
