//! Physical frames of an execution thread.
//!
//! A thread's stack is a vector of [`PhysicalFrame`]s stored bottom to top.
//! The stack grows down from [`STACK_BASE`]; every frame records its stack
//! pointer and its size in words so unpacking can be checked against the
//! plan that produced it.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::code::CompiledRegion;
use crate::frame::StackValue;
use crate::runtime::{Method, ObjRef};

/// Highest address of a thread stack, in words.
pub const STACK_BASE: usize = 1 << 20;

// =============================================================================
// Identifiers
// =============================================================================

/// Identity of a physical frame, unique within its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

/// A code address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pc(pub usize);

impl fmt::Debug for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Compiled frames
// =============================================================================

/// Contents of one machine word in a compiled frame or register.
#[derive(Clone, Debug)]
pub enum SlotValue {
    Raw(i64),
    Oop(Option<ObjRef>),
}

impl SlotValue {
    #[inline]
    pub fn raw(&self) -> i64 {
        match self {
            Self::Raw(v) => *v,
            Self::Oop(_) => 0,
        }
    }
}

impl Default for SlotValue {
    fn default() -> Self {
        Self::Raw(0)
    }
}

/// Register file saved when compiled code left to the runtime.
pub type RegisterFile = SmallVec<[SlotValue; 8]>;

/// An activation of optimized code.
#[derive(Debug, Clone)]
pub struct CompiledFrame {
    pub region: Arc<CompiledRegion>,
    pub stack_slots: Vec<SlotValue>,
    pub registers: RegisterFile,
    /// Reference returned by the call this frame is stopped at.
    pub saved_oop_result: Option<ObjRef>,
    /// Pc before the frame was patched to return into the deopt handler.
    pub original_pc: Option<Pc>,
}

impl CompiledFrame {
    pub fn new(region: Arc<CompiledRegion>) -> Self {
        let slots = region.frame_size_words();
        Self {
            region,
            stack_slots: vec![SlotValue::default(); slots],
            registers: RegisterFile::new(),
            saved_oop_result: None,
            original_pc: None,
        }
    }

    pub fn with_stack_slots(mut self, slots: Vec<SlotValue>) -> Self {
        self.stack_slots = slots;
        self
    }

    pub fn with_registers(mut self, registers: impl IntoIterator<Item = SlotValue>) -> Self {
        self.registers = registers.into_iter().collect();
        self
    }

    pub fn with_saved_oop_result(mut self, result: Option<ObjRef>) -> Self {
        self.saved_oop_result = result;
        self
    }

    /// Whether the frame was patched and will deoptimize on return.
    #[inline]
    pub fn is_deopt_pending(&self) -> bool {
        self.original_pc.is_some()
    }
}

// =============================================================================
// Interpreted frames
// =============================================================================

/// A monitor slot of an interpreter frame.
#[derive(Debug, Clone, Default)]
pub struct BasicObjectLock {
    pub obj: Option<ObjRef>,
}

/// An activation of the bytecode interpreter.
#[derive(Debug, Clone)]
pub struct InterpretedFrame {
    pub method: Arc<Method>,
    pub bci: u32,
    pub locals: Vec<StackValue>,
    pub expressions: Vec<StackValue>,
    pub monitors: Vec<BasicObjectLock>,
    /// Resume by re-executing the bytecode at `bci`.
    pub reexecute: bool,
}

impl InterpretedFrame {
    pub fn new(method: Arc<Method>, bci: u32) -> Self {
        let locals = vec![StackValue::ZERO; method.max_locals() as usize];
        Self {
            method,
            bci,
            locals,
            expressions: Vec::new(),
            monitors: Vec::new(),
            reexecute: false,
        }
    }

    pub fn with_expressions(mut self, expressions: Vec<StackValue>) -> Self {
        self.expressions = expressions;
        self
    }
}

// =============================================================================
// PhysicalFrame
// =============================================================================

/// Runtime stubs that own a frame while they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    DeoptBlob,
    UncommonTrapBlob,
}

/// What occupies a physical frame.
#[derive(Debug, Clone)]
pub enum FrameKind {
    /// Native entry into managed code. Neither interpreted nor compiled.
    Entry,
    Interpreted(InterpretedFrame),
    Compiled(CompiledFrame),
    Stub(StubKind),
}

/// One frame on a thread stack.
#[derive(Debug, Clone)]
pub struct PhysicalFrame {
    pub id: FrameId,
    /// Lowest word address of the frame.
    pub sp: usize,
    pub size_words: usize,
    /// Where execution continues in this frame.
    pub pc: Pc,
    pub kind: FrameKind,
}

impl PhysicalFrame {
    #[inline]
    pub fn is_compiled(&self) -> bool {
        matches!(self.kind, FrameKind::Compiled(_))
    }

    #[inline]
    pub fn is_interpreted(&self) -> bool {
        matches!(self.kind, FrameKind::Interpreted(_))
    }

    #[inline]
    pub fn as_compiled(&self) -> Option<&CompiledFrame> {
        match &self.kind {
            FrameKind::Compiled(cf) => Some(cf),
            _ => None,
        }
    }

    #[inline]
    pub fn as_compiled_mut(&mut self) -> Option<&mut CompiledFrame> {
        match &mut self.kind {
            FrameKind::Compiled(cf) => Some(cf),
            _ => None,
        }
    }

    #[inline]
    pub fn as_interpreted(&self) -> Option<&InterpretedFrame> {
        match &self.kind {
            FrameKind::Interpreted(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_interpreted_mut(&mut self) -> Option<&mut InterpretedFrame> {
        match &mut self.kind {
            FrameKind::Interpreted(f) => Some(f),
            _ => None,
        }
    }

    /// Highest word address of the frame, which is its caller's `sp`.
    #[inline]
    pub fn caller_sp(&self) -> usize {
        self.sp + self.size_words
    }

    /// Patch a compiled frame so that returning into it enters the
    /// deoptimization handler. Returns `false` for other frames and frames
    /// that are already patched.
    pub fn patch_for_deopt(&mut self) -> bool {
        let pc = self.pc;
        let FrameKind::Compiled(cf) = &mut self.kind else {
            return false;
        };
        if cf.is_deopt_pending() {
            return false;
        }
        cf.original_pc = Some(pc);
        self.pc = cf.region.deopt_handler();
        true
    }

    /// Pc used to look up debug information: the pre-patch pc for patched
    /// compiled frames.
    #[inline]
    pub fn logical_pc(&self) -> Pc {
        match &self.kind {
            FrameKind::Compiled(cf) => cf.original_pc.unwrap_or(self.pc),
            _ => self.pc,
        }
    }
}
