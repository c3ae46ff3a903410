//! Deoptimization reasons, actions and trap requests.
//!
//! Compiled code names a trap with a single `i32` trap request. A negative
//! request packs a reason and an action; a non-negative request is the
//! constant-pool index of a class that was unresolved at compile time.

use std::fmt;

// =============================================================================
// DeoptReason
// =============================================================================

/// Why compiled code gave up and returned to the interpreter.
///
/// The first block of reasons, up to [`DeoptReason::ProfilePredicate`], is
/// recorded per bytecode location in the method's profiling data. The rest are
/// recorded per method only, some of them under a stand-in per-location reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeoptReason {
    None = 0,
    NullCheck = 1,
    NullAssert = 2,
    RangeCheck = 3,
    ClassCheck = 4,
    ArrayCheck = 5,
    Intrinsic = 6,
    Bimorphic = 7,
    ProfilePredicate = 8,
    AutoVectorizationCheck = 9,
    Unloaded = 10,
    Uninitialized = 11,
    Initialized = 12,
    Unreached = 13,
    Unhandled = 14,
    Constraint = 15,
    Div0Check = 16,
    Age = 17,
    Predicate = 18,
    LoopLimitCheck = 19,
    SpeculateClassCheck = 20,
    SpeculateNullCheck = 21,
    SpeculateNullAssert = 22,
    UnstableIf = 23,
    UnstableFusedIf = 24,
    ReceiverConstraint = 25,
    ShortRunningLoop = 26,
    Tenured = 27,
}

impl DeoptReason {
    /// Number of distinct reasons.
    pub const LIMIT: usize = 28;

    /// Highest reason recorded per bytecode location.
    pub const RECORDED_LIMIT: DeoptReason = DeoptReason::ProfilePredicate;

    /// Every reason, in discriminant order.
    pub const ALL: [DeoptReason; Self::LIMIT] = [
        Self::None,
        Self::NullCheck,
        Self::NullAssert,
        Self::RangeCheck,
        Self::ClassCheck,
        Self::ArrayCheck,
        Self::Intrinsic,
        Self::Bimorphic,
        Self::ProfilePredicate,
        Self::AutoVectorizationCheck,
        Self::Unloaded,
        Self::Uninitialized,
        Self::Initialized,
        Self::Unreached,
        Self::Unhandled,
        Self::Constraint,
        Self::Div0Check,
        Self::Age,
        Self::Predicate,
        Self::LoopLimitCheck,
        Self::SpeculateClassCheck,
        Self::SpeculateNullCheck,
        Self::SpeculateNullAssert,
        Self::UnstableIf,
        Self::UnstableFusedIf,
        Self::ReceiverConstraint,
        Self::ShortRunningLoop,
        Self::Tenured,
    ];

    /// Convert from raw u8 value.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        if (value as usize) < Self::LIMIT {
            Some(Self::ALL[value as usize])
        } else {
            None
        }
    }

    /// Look a reason up by its diagnostic name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.name() == name)
    }

    /// Diagnostic name, as used in logs and statistics filters.
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NullCheck => "null_check",
            Self::NullAssert => "null_assert",
            Self::RangeCheck => "range_check",
            Self::ClassCheck => "class_check",
            Self::ArrayCheck => "array_check",
            Self::Intrinsic => "intrinsic",
            Self::Bimorphic => "bimorphic",
            Self::ProfilePredicate => "profile_predicate",
            Self::AutoVectorizationCheck => "auto_vectorization_check",
            Self::Unloaded => "unloaded",
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Unreached => "unreached",
            Self::Unhandled => "unhandled",
            Self::Constraint => "constraint",
            Self::Div0Check => "div0_check",
            Self::Age => "age",
            Self::Predicate => "predicate",
            Self::LoopLimitCheck => "loop_limit_check",
            Self::SpeculateClassCheck => "speculate_class_check",
            Self::SpeculateNullCheck => "speculate_null_check",
            Self::SpeculateNullAssert => "speculate_null_assert",
            Self::UnstableIf => "unstable_if",
            Self::UnstableFusedIf => "unstable_fused_if",
            Self::ReceiverConstraint => "receiver_constraint",
            Self::ShortRunningLoop => "short_running_loop",
            Self::Tenured => "tenured",
        }
    }

    /// Whether traps for this reason are recorded per bytecode location.
    #[inline]
    pub fn is_recorded_per_bytecode(self) -> bool {
        self > Self::None && self <= Self::RECORDED_LIMIT
    }

    /// The per-location reason this reason is recorded under, if any.
    ///
    /// Several method-level reasons share a per-location slot with a close
    /// relative, e.g. a division-by-zero check is recorded as a null check.
    pub fn recorded_per_bytecode_if_any(self) -> Option<Self> {
        if self.is_recorded_per_bytecode() {
            return Some(self);
        }
        match self {
            Self::Div0Check | Self::SpeculateNullCheck => Some(Self::NullCheck),
            Self::SpeculateClassCheck => Some(Self::ClassCheck),
            Self::SpeculateNullAssert => Some(Self::NullAssert),
            Self::UnstableIf => Some(Self::Intrinsic),
            Self::UnstableFusedIf => Some(Self::RangeCheck),
            _ => None,
        }
    }

    /// Whether the trap was guarded by a type or nullness speculation.
    #[inline]
    pub fn is_speculate(self) -> bool {
        matches!(
            self,
            Self::SpeculateClassCheck | Self::SpeculateNullCheck | Self::SpeculateNullAssert
        )
    }
}

impl fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// DeoptAction
// =============================================================================

/// What the runtime should do with the compiled code after a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeoptAction {
    /// Just interpret, do not invalidate the code.
    None = 0,
    /// Recompile the method if counters warrant it.
    MaybeRecompile = 1,
    /// Invalidate the code and reset profiling before recompiling.
    Reinterpret = 2,
    /// Invalidate the code and recompile.
    MakeNotEntrant = 3,
    /// Invalidate the code and never compile the method again.
    MakeNotCompilable = 4,
}

impl DeoptAction {
    /// Number of distinct actions.
    pub const LIMIT: usize = 5;

    /// Every action, in discriminant order.
    pub const ALL: [DeoptAction; Self::LIMIT] = [
        Self::None,
        Self::MaybeRecompile,
        Self::Reinterpret,
        Self::MakeNotEntrant,
        Self::MakeNotCompilable,
    ];

    /// Convert from raw u8 value.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        if (value as usize) < Self::LIMIT {
            Some(Self::ALL[value as usize])
        } else {
            None
        }
    }

    /// Look an action up by its diagnostic name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.name() == name)
    }

    /// Diagnostic name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::MaybeRecompile => "maybe_recompile",
            Self::Reinterpret => "reinterpret",
            Self::MakeNotEntrant => "make_not_entrant",
            Self::MakeNotCompilable => "make_not_compilable",
        }
    }
}

impl fmt::Display for DeoptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// TrapRequest
// =============================================================================

const ACTION_BITS: u32 = 3;
const REASON_BITS: u32 = 5;
const ACTION_SHIFT: u32 = 0;
const REASON_SHIFT: u32 = ACTION_SHIFT + ACTION_BITS;

const _: () = assert!((1usize << ACTION_BITS) >= DeoptAction::LIMIT);
const _: () = assert!((1usize << REASON_BITS) >= DeoptReason::LIMIT);

/// Action taken for a trap on an unresolved constant-pool class.
pub const UNLOADED_ACTION: DeoptAction = DeoptAction::Reinterpret;

/// A trap request as emitted by compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrapRequest(i32);

impl TrapRequest {
    /// Pack a reason and an action.
    #[inline]
    pub const fn new(reason: DeoptReason, action: DeoptAction) -> Self {
        Self(!(((reason as i32) << REASON_SHIFT) + ((action as i32) << ACTION_SHIFT)))
    }

    /// A trap on the unresolved class at constant-pool `index`.
    #[inline]
    pub const fn unloaded(index: u32) -> Self {
        Self((index & i32::MAX as u32) as i32)
    }

    /// Rebuild a request from its raw encoding.
    ///
    /// Returns `None` if the packed reason or action is out of range.
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw >= 0 {
            return Some(Self(raw));
        }
        let bits = !raw;
        let reason = ((bits >> REASON_SHIFT) & ((1 << REASON_BITS) - 1)) as u8;
        let action = ((bits >> ACTION_SHIFT) & ((1 << ACTION_BITS) - 1)) as u8;
        DeoptReason::from_u8(reason)?;
        DeoptAction::from_u8(action)?;
        Some(Self(raw))
    }

    /// Raw encoding.
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Decoded reason.
    pub fn reason(self) -> DeoptReason {
        if self.0 < 0 {
            let bits = ((!self.0) >> REASON_SHIFT) & ((1 << REASON_BITS) - 1);
            DeoptReason::from_u8(bits as u8).unwrap_or(DeoptReason::None)
        } else {
            DeoptReason::Unloaded
        }
    }

    /// Decoded action.
    pub fn action(self) -> DeoptAction {
        if self.0 < 0 {
            let bits = ((!self.0) >> ACTION_SHIFT) & ((1 << ACTION_BITS) - 1);
            DeoptAction::from_u8(bits as u8).unwrap_or(DeoptAction::None)
        } else {
            UNLOADED_ACTION
        }
    }

    /// Constant-pool index of the unresolved class, if any.
    #[inline]
    pub fn unloaded_index(self) -> Option<u32> {
        (self.0 >= 0).then_some(self.0 as u32)
    }
}

impl fmt::Display for TrapRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reason='{}' action='{}'", self.reason(), self.action())?;
        if let Some(index) = self.unloaded_index() {
            write!(f, " index='{index}'")?;
        }
        Ok(())
    }
}
