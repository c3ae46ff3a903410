//! Interpreter frame geometry.
//!
//! An interpreter activation holds a fixed header, the locals its callee
//! does not share with its own expression stack, a monitor block and an
//! expression stack. Parameters live in the caller's expression stack, so
//! each frame is sized with its callee's parameter and local counts.

/// Bytes per stack word.
pub const WORD_BYTES: usize = 8;

/// Fixed words of every interpreter frame: return address, saved frame
/// pointer, method, bytecode pointer, locals pointer, constant cache,
/// monitor block top, expression stack bottom, sender sp and mirror.
pub const FRAME_OVERHEAD_WORDS: usize = 10;

/// Words of one monitor slot: the displaced header and the object.
pub const MONITOR_WORDS: usize = 2;

/// Words of an interpreter activation.
///
/// The innermost frame reserves its method's full `max_stack`; the others
/// only need their live expression temporaries.
pub fn size_activation(
    max_stack: usize,
    temps: usize,
    extra_args: usize,
    monitors: usize,
    callee_params: usize,
    callee_locals: usize,
    is_top: bool,
) -> usize {
    let stack = if is_top { max_stack } else { temps } + extra_args;
    FRAME_OVERHEAD_WORDS
        + callee_locals.saturating_sub(callee_params)
        + monitors * MONITOR_WORDS
        + stack
}

/// Words the caller of the outermost frame must grow by.
#[inline]
pub fn last_frame_adjust(callee_params: usize, callee_locals: usize) -> usize {
    callee_locals.saturating_sub(callee_params)
}
