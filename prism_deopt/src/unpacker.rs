//! Writing interpreter frames from a packed frame array.
//!
//! The planner decides sizes and return addresses; an unpacker lays the
//! frames down. [`InterpreterUnpacker`] replaces the deoptimized compiled
//! frame on an [`ExecThread`](crate::runtime::ExecThread) stack with one
//! interpreter frame per logical frame.

use std::sync::Arc;

use crate::frame::{ExecMode, StackValue, UnrollBlock, VFrameArray, WORD_BYTES};
use crate::guarantee;
use crate::runtime::{
    BasicType, FrameKind, InterpretedFrame, Pc, SlotValue, ThreadState,
};

/// Interpreter address that resumes a frame rebuilt by deoptimization.
pub const INTERPRETER_DEOPT_ENTRY: Pc = Pc(0x0010_0000);

/// Lays interpreter frames onto a thread stack.
pub trait StackUnpacker: Send + Sync {
    /// Replace the compiled frame `array` was packed from, together with
    /// any runtime stub above it, by interpreter frames.
    fn unpack(&self, state: &mut ThreadState, array: &VFrameArray, exec_mode: ExecMode);
}

/// Unpacker for the bytecode interpreter.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterpreterUnpacker;

impl InterpreterUnpacker {
    fn return_value(block: &UnrollBlock) -> Option<StackValue> {
        match block.return_type() {
            BasicType::Void | BasicType::Illegal => None,
            ty if ty.is_reference() => Some(StackValue::Obj(block.saved_oop_result().cloned())),
            _ => Some(StackValue::Int(
                block.register_block().first().map_or(0, SlotValue::raw),
            )),
        }
    }
}

impl StackUnpacker for InterpreterUnpacker {
    fn unpack(&self, state: &mut ThreadState, array: &VFrameArray, exec_mode: ExecMode) {
        let Some(block) = array.unroll_block() else {
            crate::error::fatal(format_args!("frame array of {:?} has no unroll block", array.original()));
        };

        while state
            .last_frame()
            .is_some_and(|f| matches!(f.kind, FrameKind::Stub(_)))
        {
            state.pop_frame();
        }
        let deoptee = state.pop_frame();
        guarantee!(
            deoptee.as_ref().is_some_and(|f| f.id == array.original()),
            "top frame {:?} is not the deoptimized frame {:?}",
            deoptee.map(|f| f.id),
            array.original()
        );

        let frames = array.frames();
        for (slot, element) in array.elements().iter().rev().enumerate() {
            let is_top = slot + 1 == frames;
            let mut words = block.frame_words(slot);
            if slot == 0 {
                words += block.caller_adjustment() / WORD_BYTES;
            }

            let mut iframe = InterpretedFrame::new(Arc::clone(element.method()), element.bci());
            let mut locals = element.locals().to_vec();
            if locals.len() < iframe.locals.len() {
                locals.resize(iframe.locals.len(), StackValue::ZERO);
            }
            iframe.locals = locals;
            iframe.expressions = element.expressions().to_vec();
            iframe.monitors = element.monitors().to_vec();
            iframe.reexecute = element.should_reexecute() || (is_top && exec_mode == ExecMode::Reexecute);

            if is_top && exec_mode == ExecMode::Plain && !iframe.reexecute {
                if let Some(value) = Self::return_value(block) {
                    iframe.expressions.push(value);
                }
            }

            state.push_frame(words, block.frame_pcs()[slot + 1], FrameKind::Interpreted(iframe));
        }

        tracing::trace!(
            target: "prism_deopt",
            frames,
            words = block.total_frame_sizes() / WORD_BYTES,
            mode = exec_mode.name(),
            "unpacked interpreter frames"
        );
    }
}
