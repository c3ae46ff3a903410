//! The unroll plan handed to the stack unpacker.

use std::fmt;

use crate::frame::layout::WORD_BYTES;
use crate::runtime::{BasicType, ObjRef, Pc, RegisterFile};

// =============================================================================
// ExecMode
// =============================================================================

/// How the interpreter resumes after unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecMode {
    /// A patched frame returned into the deopt handler.
    Plain,
    /// An exception is being dispatched into the deoptimized frame.
    Exception,
    /// Compiled code hit an uncommon trap.
    UncommonTrap,
    /// The top frame re-executes its current bytecode.
    Reexecute,
    /// Objects are restored for an inspecting thread; nothing is unpacked.
    None,
}

impl ExecMode {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Exception => "exception",
            Self::UncommonTrap => "uncommon_trap",
            Self::Reexecute => "reexecute",
            Self::None => "none",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// UnrollBlock
// =============================================================================

/// Everything the unpacker needs to replace one compiled frame with
/// interpreter frames.
///
/// Frame sizes are in bytes and ordered outermost first. `frame_pcs` has one
/// more entry than `frame_sizes`: entry `0` is the return address into the
/// caller and entry `n` is where the innermost interpreter frame resumes.
#[derive(Debug, Clone)]
pub struct UnrollBlock {
    size_of_deoptimized_frame: usize,
    caller_adjustment: usize,
    caller_actual_parameters: Option<u16>,
    frame_sizes: Box<[usize]>,
    frame_pcs: Box<[Pc]>,
    register_block: RegisterFile,
    return_type: BasicType,
    exec_mode: ExecMode,
    total_frame_sizes: usize,
    saved_oop_result: Option<ObjRef>,
}

impl UnrollBlock {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        size_of_deoptimized_frame: usize,
        caller_adjustment: usize,
        caller_actual_parameters: Option<u16>,
        frame_sizes: Vec<usize>,
        frame_pcs: Vec<Pc>,
        register_block: RegisterFile,
        return_type: BasicType,
        exec_mode: ExecMode,
    ) -> Self {
        debug_assert_eq!(frame_pcs.len(), frame_sizes.len() + 1);
        let total_frame_sizes = caller_adjustment + frame_sizes.iter().sum::<usize>();
        Self {
            size_of_deoptimized_frame,
            caller_adjustment,
            caller_actual_parameters,
            frame_sizes: frame_sizes.into_boxed_slice(),
            frame_pcs: frame_pcs.into_boxed_slice(),
            register_block,
            return_type,
            exec_mode,
            total_frame_sizes,
            saved_oop_result: None,
        }
    }

    pub(crate) fn with_saved_oop_result(mut self, result: Option<ObjRef>) -> Self {
        self.saved_oop_result = result;
        self
    }

    /// Bytes of the compiled frame being replaced.
    #[inline]
    pub fn size_of_deoptimized_frame(&self) -> usize {
        self.size_of_deoptimized_frame
    }

    /// Bytes the caller's frame grows by to hold the outermost frame's
    /// non-parameter locals.
    #[inline]
    pub fn caller_adjustment(&self) -> usize {
        self.caller_adjustment
    }

    /// Arguments the interpreted caller actually pushed. `None` when the
    /// caller is not interpreted.
    #[inline]
    pub fn caller_actual_parameters(&self) -> Option<u16> {
        self.caller_actual_parameters
    }

    #[inline]
    pub fn number_of_frames(&self) -> usize {
        self.frame_sizes.len()
    }

    #[inline]
    pub fn frame_sizes(&self) -> &[usize] {
        &self.frame_sizes
    }

    #[inline]
    pub fn frame_pcs(&self) -> &[Pc] {
        &self.frame_pcs
    }

    /// Registers of the compiled frame at the time of the trap.
    #[inline]
    pub fn register_block(&self) -> &RegisterFile {
        &self.register_block
    }

    #[inline]
    pub fn return_type(&self) -> BasicType {
        self.return_type
    }

    #[inline]
    pub fn exec_mode(&self) -> ExecMode {
        self.exec_mode
    }

    /// Reference result of the call the frame stopped at, preserved across
    /// rematerialization.
    #[inline]
    pub fn saved_oop_result(&self) -> Option<&ObjRef> {
        self.saved_oop_result.as_ref()
    }

    /// Caller adjustment plus every frame size, in bytes.
    #[inline]
    pub fn total_frame_sizes(&self) -> usize {
        self.total_frame_sizes
    }

    /// Frame size `index` in words.
    #[inline]
    pub fn frame_words(&self, index: usize) -> usize {
        self.frame_sizes[index] / WORD_BYTES
    }
}

impl fmt::Display for UnrollBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UnrollBlock")?;
        writeln!(
            f,
            "  size_of_deoptimized_frame = {}",
            self.size_of_deoptimized_frame
        )?;
        write!(f, "  frame_sizes:")?;
        for size in self.frame_sizes.iter() {
            write!(f, " {size}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> UnrollBlock {
        UnrollBlock::new(
            48,
            16,
            Some(2),
            vec![96, 128],
            vec![Pc(0x10), Pc(0x20), Pc(0x30)],
            RegisterFile::new(),
            BasicType::Int,
            ExecMode::UncommonTrap,
        )
    }

    #[test]
    fn test_total_includes_caller_adjustment() {
        let b = block();
        assert_eq!(b.number_of_frames(), 2);
        assert_eq!(b.total_frame_sizes(), 16 + 96 + 128);
        assert_eq!(b.frame_words(1), 16);
        assert_eq!(b.frame_pcs().len(), 3);
    }

    #[test]
    fn test_display() {
        let text = block().to_string();
        assert!(text.contains("size_of_deoptimized_frame = 48"));
        assert!(text.ends_with("frame_sizes: 96 128"));
    }

    #[test]
    fn test_exec_mode_names() {
        assert_eq!(ExecMode::UncommonTrap.to_string(), "uncommon_trap");
        assert_eq!(ExecMode::None.name(), "none");
    }
}
