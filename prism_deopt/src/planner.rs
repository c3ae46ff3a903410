//! Frame unroll planner.
//!
//! Turns the compiled frame on top of a thread into a plan for the
//! interpreter frames that replace it, then drives the unpacker and cleans
//! up afterwards.
//!
//! ```text
//!   fetch_unroll_info            unpack_frames
//!   ─────────────────            ─────────────
//!   logical frames               unpacker lays frames down
//!   reversal (objects, locks)    return kind for the caller
//!   VFrameArray + UnrollBlock ─▶ cleanup: head → last
//!                                optional stack verification
//! ```
//!
//! Frame sizes and pcs are ordered outermost first, the reverse of the
//! frame array. Each frame is sized with the parameter and local counts of
//! the frame it calls, since a callee's parameters live in its caller's
//! expression stack.

use crate::code::PcDesc;
use crate::frame::layout::last_frame_adjust;
use crate::frame::{ExecMode, UnrollBlock, VFrameArray, WORD_BYTES, virtual_frames};
use crate::guarantee;
use crate::reversal::{
    Rematerialized, ReversalContext, rematerialize_objects, restore_eliminated_locks,
};
use crate::runtime::{
    BasicType, ExecThread, FrameKind, Instruction, InterpretedFrame, PhysicalFrame, ThreadState,
    ThrownException,
};
use crate::unpacker::{INTERPRETER_DEOPT_ENTRY, StackUnpacker};

// =============================================================================
// Planning
// =============================================================================

/// Debug information at the logical pc of a compiled frame.
pub(crate) fn pc_desc_for(frame: &PhysicalFrame) -> &PcDesc {
    let Some(cf) = frame.as_compiled() else {
        crate::error::fatal(format_args!("deoptee {:?} is not a compiled frame", frame.id));
    };
    let region = &cf.region;
    let pc = frame.logical_pc();
    guarantee!(
        region.contains(pc),
        "pc {:?} outside code of {}",
        pc,
        region.method().qualified_name()
    );
    let offset = (pc.0 - region.code_begin().0) as u32;
    match region.pc_desc_at(offset) {
        Some(desc) => desc,
        None => crate::error::fatal(format_args!(
            "no debug info at pc offset {offset:#x} of {}",
            region.method().qualified_name()
        )),
    }
}

/// Whether the interpreted frame is stopped at a call that passes a
/// trailing member-name argument.
fn calls_with_member_arg(frame: &InterpretedFrame) -> bool {
    frame
        .method
        .code_at(frame.bci)
        .and_then(Instruction::as_invoke)
        .is_some_and(|invoke| invoke.has_member_arg)
}

/// Plan the replacement of the compiled frame on top of `thread`.
///
/// Restores eliminated objects and locks, packs the logical frames into a
/// [`VFrameArray`] installed as the thread's pending array, and returns the
/// plan. The mode may be upgraded to [`ExecMode::Exception`] when the frame
/// rethrows or reallocation failed.
pub fn fetch_unroll_info(
    ctx: &ReversalContext<'_>,
    thread: &ExecThread,
    exec_mode: ExecMode,
) -> UnrollBlock {
    thread.inc_in_deopt_handler();
    let mut state = thread.state();
    let mut exec_mode = exec_mode;

    let Some(index) = state
        .frames()
        .iter()
        .rposition(|f| !matches!(f.kind, FrameKind::Stub(_)))
    else {
        crate::error::fatal(format_args!("thread {} has no frame to deoptimize", thread.name()));
    };
    // Snapshot: the thread state is updated while the debug info is read.
    let deoptee = state.frames()[index].clone();
    let Some(caller) = state.caller_of(index).cloned() else {
        crate::error::fatal(format_args!("compiled frame {:?} has no caller", deoptee.id));
    };
    let pc_desc = pc_desc_for(&deoptee);
    let Some(cf) = deoptee.as_compiled() else {
        crate::error::fatal(format_args!("deoptee {:?} is not a compiled frame", deoptee.id));
    };
    let chain = virtual_frames(cf, pc_desc);

    let save_oop_result =
        pc_desc.return_oop && !state.popframe_forcing_deopt_reexecution && exec_mode == ExecMode::Plain;
    let saved_oop_result = if save_oop_result {
        cf.saved_oop_result.clone()
    } else {
        None
    };

    let deferred = state.deferred_objects.remove(&deoptee.id);
    let restored = deferred.is_some();
    let (objects, realloc_failures) = match deferred {
        Some(objects) => (objects, false),
        None if ctx.config.eliminate_allocations || ctx.config.eliminate_auto_box => {
            let outcome = rematerialize_objects(
                ctx,
                &mut state.pending_exception,
                exec_mode,
                &chain,
                &pc_desc.objects,
            );
            (outcome.objects, outcome.realloc_failures)
        }
        None => (Rematerialized::default(), false),
    };

    // Fields of rematerialized objects are final from here on.
    let no_safepoint = thread.no_safepoint_scope();
    if ctx.config.eliminate_locks && !restored {
        restore_eliminated_locks(&chain, &objects, thread, exec_mode, realloc_failures);
    }

    let mut exception = None;
    if pc_desc.rethrow_exception {
        let expressions = chain[0].expressions(&objects);
        guarantee!(!expressions.is_empty(), "must have exception to throw");
        match expressions.last().and_then(|v| v.as_obj()) {
            Some(obj) => exception = Some(ThrownException::Object(obj.clone())),
            None => crate::error::fatal(format_args!("exception oop can not be null")),
        }
    }

    let mut array = Box::new(VFrameArray::allocate(
        thread.id(),
        &deoptee,
        &chain,
        &objects,
        realloc_failures,
    ));
    if realloc_failures {
        state.frames_to_pop_failed_realloc = array.pop_frames_failed_reallocs();
    }
    guarantee!(
        state.vframe_array_head.is_none(),
        "pending deoptimization on thread {}",
        thread.name()
    );
    drop(no_safepoint);

    let frames = array.frames();
    let mut frame_sizes = vec![0; frames];
    let mut frame_pcs = vec![INTERPRETER_DEOPT_ENTRY; frames + 1];
    let mut extra_args = if state.popframe_forcing_deopt_reexecution {
        state.popframe_preserved_args_words
    } else {
        0
    };
    let mut callee_parameters = 0;
    let mut callee_locals = 0;
    for (i, element) in array.elements().iter().enumerate() {
        frame_sizes[frames - 1 - i] =
            WORD_BYTES * element.on_stack_size(callee_parameters, callee_locals, i == 0, extra_args);
        callee_parameters = usize::from(element.method().size_of_parameters());
        callee_locals = usize::from(element.method().max_locals());
        extra_args = 0;
    }

    let innermost = array.element(0);
    let return_type = innermost
        .method()
        .code_at(innermost.bci())
        .and_then(Instruction::as_invoke)
        .map_or(BasicType::Illegal, |invoke| invoke.result);

    // A compiled caller has no interpreter parameter area to reuse.
    let caller_was_method_handle = caller.as_interpreted().is_some_and(calls_with_member_arg);
    let caller_adjustment = if !caller.is_interpreted() || caller_was_method_handle {
        last_frame_adjust(0, callee_locals)
    } else if callee_locals > callee_parameters {
        last_frame_adjust(callee_parameters, callee_locals)
    } else {
        0
    };
    // A patched caller keeps returning into its deopt handler.
    frame_pcs[0] = caller.pc;

    if let Some(exception) = exception {
        state.exception_oop = Some(exception);
        exec_mode = ExecMode::Exception;
    }
    if state.frames_to_pop_failed_realloc > 0 && exec_mode != ExecMode::UncommonTrap {
        guarantee!(state.has_pending_exception(), "failed reallocation left no exception");
        state.exception_oop = state.clear_pending_exception();
        exec_mode = ExecMode::Exception;
    }

    let caller_actual_parameters = caller.is_interpreted().then(|| {
        if caller_was_method_handle {
            0
        } else {
            callee_parameters as u16
        }
    });

    let block = UnrollBlock::new(
        array.frame_size() * WORD_BYTES,
        caller_adjustment * WORD_BYTES,
        caller_actual_parameters,
        frame_sizes,
        frame_pcs,
        cf.registers.clone(),
        return_type,
        exec_mode,
    )
    .with_saved_oop_result(saved_oop_result);
    array.set_unroll_block(block.clone());
    state.vframe_array_head = Some(array);

    tracing::debug!(
        target: "prism_deopt",
        thread = thread.id().0,
        method = %cf.region.method().qualified_name(),
        compile_id = cf.region.compile_id(),
        frames,
        mode = exec_mode.name(),
        realloc_failures,
        "fetched unroll info"
    );
    block
}

// =============================================================================
// Unpacking
// =============================================================================

/// Lay down the planned interpreter frames and finish the deoptimization.
///
/// Returns the kind of value the caller of the unpacked frames should treat
/// as the result: always a reference in exception mode so the pending
/// exception is not overwritten.
pub fn unpack_frames(
    thread: &ExecThread,
    exec_mode: ExecMode,
    unpacker: &dyn StackUnpacker,
    verify_stack: bool,
) -> BasicType {
    let mut state = thread.state();
    let Some(array) = state.vframe_array_head.take() else {
        crate::error::fatal(format_args!("no deoptimization in progress on {}", thread.name()));
    };
    let Some(block) = array.unroll_block() else {
        crate::error::fatal(format_args!("frame array of {:?} was never planned", array.original()));
    };
    let return_type = if exec_mode == ExecMode::Exception {
        BasicType::Object
    } else {
        block.return_type()
    };

    unpacker.unpack(&mut state, &array, exec_mode);
    state.vframe_array_head = Some(array);
    cleanup_deopt_info(thread, &mut state);

    if verify_stack {
        verify_unpacked_frames(&state, exec_mode);
    }
    return_type
}

/// Retire the pending frame array: it becomes the last array and the one
/// before it is released. Clears frame-pop requests and leaves the deopt
/// handler.
pub fn cleanup_deopt_info(thread: &ExecThread, state: &mut ThreadState) {
    let head = state.vframe_array_head.take();
    guarantee!(head.is_some(), "no frame array to clean up on {}", thread.name());
    state.vframe_array_last = head;
    state.clear_popframe_condition();
    thread.dec_in_deopt_handler();
}

// =============================================================================
// Verification
// =============================================================================

fn depth_matches(
    frame: &InterpretedFrame,
    is_top: bool,
    reexecute: bool,
    exec_mode: ExecMode,
) -> bool {
    let Some(declared) = frame.method.stack_depth_at(frame.bci) else {
        return true;
    };
    let declared = usize::from(declared);
    let depth = frame.expressions.len();
    let invoke = frame
        .method
        .code_at(frame.bci)
        .and_then(Instruction::as_invoke)
        .copied();

    if reexecute || depth == declared {
        return depth == declared;
    }
    if is_top && exec_mode == ExecMode::Exception && depth == 0 {
        return true;
    }
    let Some(invoke) = invoke else {
        return false;
    };
    // Arguments of the call live in the callee's locals.
    let after_args = declared.saturating_sub(usize::from(invoke.parameter_slots));
    if depth == after_args {
        return true;
    }
    let returns_value = !matches!(invoke.result, BasicType::Void | BasicType::Illegal);
    is_top && exec_mode == ExecMode::Plain && returns_value && depth == after_args + 1
}

/// Check the frames just unpacked against the array they came from.
fn verify_unpacked_frames(state: &ThreadState, exec_mode: ExecMode) {
    let Some(array) = state.vframe_array_last() else {
        crate::error::fatal(format_args!("no unpacked frame array to verify"));
    };
    let Some(block) = array.unroll_block() else {
        crate::error::fatal(format_args!("unpacked frame array has no unroll block"));
    };
    let frames = state.frames();
    guarantee!(
        frames.len() >= array.frames(),
        "expected {} unpacked frames, stack has {}",
        array.frames(),
        frames.len()
    );
    let planned = block.total_frame_sizes() / WORD_BYTES;
    guarantee!(
        state.sp() + planned == array.caller_sp(),
        "unpacked frames occupy {} words, planned {}",
        array.caller_sp().saturating_sub(state.sp()),
        planned
    );

    for (i, element) in array.elements().iter().enumerate() {
        let physical = &frames[frames.len() - 1 - i];
        let Some(iframe) = physical.as_interpreted() else {
            crate::error::fatal(format_args!("unpacked frame {:?} is not interpreted", physical.id));
        };
        guarantee!(
            std::sync::Arc::ptr_eq(&iframe.method, element.method()) && iframe.bci == element.bci(),
            "unpacked frame {} is {}@{}, expected {}@{}",
            i,
            iframe.method.qualified_name(),
            iframe.bci,
            element.method().qualified_name(),
            element.bci()
        );
        guarantee!(
            depth_matches(iframe, i == 0, iframe.reexecute, exec_mode),
            "wrong number of expression stack elements during deopt: {} has {} at bci {}",
            iframe.method.qualified_name(),
            iframe.expressions.len(),
            iframe.bci
        );
    }
}
