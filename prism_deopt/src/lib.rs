//! Deoptimization engine for Prism.
//!
//! Moves execution from optimized compiled code back to the interpreter when
//! an assumption the compiler made stops holding:
//! - Trap policy with per-location and per-method trap history
//! - Generation-based batching of code invalidation across threads
//! - Rematerialization of scalar-replaced objects and eliminated locks
//! - Planning and unpacking of interpreter frames for inlined scopes
#![deny(unsafe_op_in_unsafe_fn)]
pub mod code;
pub mod config;
pub mod deoptimizer;
pub mod error;
pub mod events;
pub mod frame;
pub mod generation;
pub mod planner;
pub mod policy;
pub mod profile;
pub mod reason;
pub mod reversal;
pub mod runtime;
pub mod stats;
pub mod trap_state;
pub mod unpacker;

pub use config::DeoptConfig;
pub use deoptimizer::{Deoptimizer, ObjectDeoptOutcome};
pub use error::{DeoptError, DeoptResult};
pub use frame::{ExecMode, UnrollBlock};
pub use generation::{DeoptimizationScope, GenerationCoordinator, GenerationState};
pub use reason::{DeoptAction, DeoptReason, TrapRequest};
pub use stats::DeoptStats;
pub use trap_state::TrapState;
