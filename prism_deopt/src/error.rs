//! Deoptimization error types.
//!
//! Only conditions a caller can act on surface as [`DeoptError`]. Allocation
//! and resolution failures met while unwinding a frame are converted into
//! deferred exceptions on the thread instead, and corrupted runtime state is
//! reported through [`guarantee!`], which aborts the process.

use std::path::PathBuf;

// =============================================================================
// DeoptError
// =============================================================================

/// Recoverable errors raised by the deoptimization engine.
#[derive(Debug, thiserror::Error)]
pub enum DeoptError {
    /// The configuration file could not be read.
    #[error("failed to read deoptimization config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::DeoptConfig`].
    #[error("invalid deoptimization config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A configuration value is outside its accepted range.
    #[error("config value `{name}` = {value} is out of range: {reason}")]
    ConfigRange {
        name: &'static str,
        value: u64,
        reason: &'static str,
    },

    /// An environment override could not be parsed.
    #[error("environment override {key}={value} is not a valid value")]
    ConfigEnv { key: String, value: String },

    /// A class referenced from a constant pool could not be resolved.
    #[error("class `{class}` could not be resolved: {reason}")]
    Resolution { class: String, reason: String },

    /// The heap could not satisfy an allocation.
    #[error("heap exhausted while allocating {klass} ({bytes} bytes)")]
    OutOfMemory { klass: String, bytes: usize },
}

/// Result alias for deoptimization operations.
pub type DeoptResult<T> = Result<T, DeoptError>;

// =============================================================================
// Fatal invariants
// =============================================================================

/// Abort on a violated runtime invariant.
///
/// Continuing after a frame-shape, generation-ordering or stack-depth
/// mismatch would resume execution from an inconsistent frame, so the
/// diagnostic is logged and the process aborts. Other threads must not
/// observe a half-unwound stack or a commit round that never finishes.
/// Unit tests of this crate panic instead so they can assert the message.
#[macro_export]
macro_rules! guarantee {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::fatal(format_args!($($arg)+));
        }
    };
}

#[doc(hidden)]
#[cold]
#[track_caller]
pub fn fatal(message: std::fmt::Arguments<'_>) -> ! {
    tracing::error!(target: "prism_deopt", "fatal deoptimization error: {message}");
    if cfg!(test) {
        panic!("fatal deoptimization error: {message}");
    }
    eprintln!("fatal deoptimization error: {message} at {}", std::panic::Location::caller());
    std::process::abort()
}
