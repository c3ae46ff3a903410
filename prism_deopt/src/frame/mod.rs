//! Logical frames, their packed form and the unroll plan.

pub mod array;
pub mod layout;
pub mod unroll;
pub mod value;
pub mod vframe;

pub use array::{VFrameArray, VFrameArrayElement};
pub use layout::{FRAME_OVERHEAD_WORDS, MONITOR_WORDS, WORD_BYTES};
pub use unroll::{ExecMode, UnrollBlock};
pub use value::StackValue;
pub use vframe::{CompiledVFrame, MonitorInfo, read_location, resolve_value, virtual_frames};
