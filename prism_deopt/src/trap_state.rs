//! Per-location trap state lattice.
//!
//! Each profiled bytecode location carries a few bits recording which trap
//! reason has been seen there and whether the location ever caused a
//! recompilation.
//!
//! ```text
//!   bit:   4            3..0
//!        ┌───────────┬───────────────────────────────┐
//!        │ recompile │ reason (0 = none, 0xF = many) │
//!        └───────────┴───────────────────────────────┘
//!
//!   none ──add(r)──▶ r ──add(r' ≠ r)──▶ many (bottom)
//! ```
//!
//! The reason field only ever tracks one known cause. A second, different
//! cause drops the state to `many`, which answers every query conservatively.

use std::fmt;

use crate::reason::DeoptReason;

// =============================================================================
// Constants
// =============================================================================

/// Width of the trap state field in the profiling record.
pub const TRAP_BITS: u32 = 5;

/// Mask covering the whole trap state.
pub const TRAP_MASK: u8 = ((1u16 << TRAP_BITS) - 1) as u8;

/// Mask of the reason field; the all-ones value is the `many` sentinel.
pub const REASON_MASK: u8 = TRAP_MASK >> 1;

/// The "recompiled at this location" bit.
pub const RECOMPILE_BIT: u8 = TRAP_MASK - REASON_MASK;

// Every per-location reason must fit below the `many` sentinel.
const _: () = assert!(REASON_MASK as usize > DeoptReason::RECORDED_LIMIT as usize);
const _: () = assert!(REASON_MASK & RECOMPILE_BIT == 0);

// =============================================================================
// StateReason / HasReason
// =============================================================================

/// The reason component of a decoded trap state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateReason {
    /// No trap recorded yet.
    None,
    /// Exactly one reason recorded.
    One(DeoptReason),
    /// More than one distinct reason recorded.
    Many,
}

impl StateReason {
    /// Diagnostic name.
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::One(reason) => reason.name(),
            Self::Many => "many",
        }
    }
}

/// Answer to "has this reason been seen here?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasReason {
    /// The reason has not been recorded.
    No,
    /// The reason is the single recorded reason.
    Yes,
    /// The state is at the lattice bottom, so the reason may have occurred.
    Conservatively,
}

impl HasReason {
    /// Collapse the ternary answer to a boolean, treating bottom as true.
    #[inline]
    pub fn as_bool(self) -> bool {
        !matches!(self, Self::No)
    }
}

// =============================================================================
// TrapState
// =============================================================================

/// Packed trap state for one bytecode location.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TrapState(u8);

impl TrapState {
    /// No reason recorded, never recompiled.
    pub const NONE: TrapState = TrapState(0);

    /// Lattice bottom without the recompile bit.
    pub const MANY: TrapState = TrapState(REASON_MASK);

    /// Wrap raw bits. Bits outside [`TRAP_MASK`] are discarded.
    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & TRAP_MASK)
    }

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    fn reason_bits(self) -> u8 {
        self.0 & REASON_MASK
    }

    /// Decode the reason component.
    pub fn reason(self) -> StateReason {
        match self.reason_bits() {
            0 => StateReason::None,
            REASON_MASK => StateReason::Many,
            bits => match DeoptReason::from_u8(bits) {
                Some(reason) => StateReason::One(reason),
                None => StateReason::Many,
            },
        }
    }

    /// Ternary membership test for a per-location reason.
    pub fn has_reason(self, reason: DeoptReason) -> HasReason {
        debug_assert!(reason.is_recorded_per_bytecode(), "{reason} is not per-bytecode");
        match self.reason_bits() {
            REASON_MASK => HasReason::Conservatively,
            bits if bits == reason as u8 => HasReason::Yes,
            _ => HasReason::No,
        }
    }

    /// Record `reason` at this location.
    ///
    /// Idempotent for a reason already recorded; a second distinct reason
    /// collapses the state to `many`. The recompile bit is preserved.
    #[must_use]
    pub fn add_reason(self, reason: DeoptReason) -> Self {
        debug_assert!(reason.is_recorded_per_bytecode(), "{reason} is not per-bytecode");
        self.add_reason_bits(reason as u8)
    }

    /// Record the `many` sentinel directly.
    #[must_use]
    pub fn add_many(self) -> Self {
        self.add_reason_bits(REASON_MASK)
    }

    fn add_reason_bits(self, reason: u8) -> Self {
        let recompile = self.0 & RECOMPILE_BIT;
        let state = self.0 & !RECOMPILE_BIT;
        let next = if state == REASON_MASK || state == reason {
            state
        } else if state == 0 {
            reason
        } else {
            REASON_MASK
        };
        Self(next | recompile)
    }

    /// Whether this location has caused a recompilation.
    #[inline]
    pub fn is_recompiled(self) -> bool {
        self.0 & RECOMPILE_BIT != 0
    }

    /// Set or clear the recompile bit.
    #[must_use]
    #[inline]
    pub fn set_recompiled(self, recompiled: bool) -> Self {
        if recompiled {
            Self(self.0 | RECOMPILE_BIT)
        } else {
            Self(self.0 & !RECOMPILE_BIT)
        }
    }

    /// Rebuild the state from its decoded parts.
    ///
    /// Equal to `self` for every state reachable through the lattice
    /// operations.
    pub fn reencode(self) -> Self {
        let mut decoded = Self::NONE;
        match self.reason() {
            StateReason::One(reason) if reason.is_recorded_per_bytecode() => {
                decoded = decoded.add_reason(reason);
            }
            StateReason::Many => decoded = decoded.add_many(),
            _ => {}
        }
        decoded.set_recompiled(self.is_recompiled())
    }
}

impl fmt::Display for TrapState {
    /// Symbolic form such as `class_check recompiled`, or `#N` for a bit
    /// pattern that does not decode cleanly.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reencode() != *self {
            return write!(f, "#{}", self.0);
        }
        f.write_str(self.reason().name())?;
        if self.is_recompiled() {
            f.write_str(" recompiled")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrapState({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded() -> impl Iterator<Item = DeoptReason> {
        DeoptReason::ALL
            .into_iter()
            .filter(|r| r.is_recorded_per_bytecode())
    }

    #[test]
    fn test_constants() {
        assert_eq!(TRAP_MASK, 0x1F);
        assert_eq!(REASON_MASK, 0x0F);
        assert_eq!(RECOMPILE_BIT, 0x10);
    }

    #[test]
    fn test_add_reason_from_none() {
        let state = TrapState::NONE.add_reason(DeoptReason::RangeCheck);
        assert_eq!(state.reason(), StateReason::One(DeoptReason::RangeCheck));
        assert_eq!(state.has_reason(DeoptReason::RangeCheck), HasReason::Yes);
        assert_eq!(state.has_reason(DeoptReason::NullCheck), HasReason::No);
    }

    #[test]
    fn test_add_reason_idempotent() {
        for r in recorded() {
            let once = TrapState::NONE.add_reason(r);
            assert_eq!(once.add_reason(r), once);
            let recompiled = once.set_recompiled(true);
            assert_eq!(recompiled.add_reason(r), recompiled);
        }
    }

    #[test]
    fn test_distinct_reasons_collapse_to_many() {
        for r1 in recorded() {
            for r2 in recorded().filter(|r| *r != r1) {
                let state = TrapState::NONE.add_reason(r1).add_reason(r2);
                assert_eq!(state, TrapState::MANY);
                assert_eq!(state.has_reason(r1), HasReason::Conservatively);
                assert!(state.has_reason(r2).as_bool());
            }
        }
    }

    #[test]
    fn test_many_is_absorbing() {
        let state = TrapState::MANY.set_recompiled(true);
        for r in recorded() {
            assert_eq!(state.add_reason(r), state);
        }
    }

    #[test]
    fn test_recompile_bit_is_orthogonal() {
        let state = TrapState::NONE.set_recompiled(true);
        assert!(state.is_recompiled());
        assert_eq!(state.reason(), StateReason::None);

        let state = state.add_reason(DeoptReason::Bimorphic);
        assert!(state.is_recompiled());
        assert_eq!(state.reason(), StateReason::One(DeoptReason::Bimorphic));

        let cleared = state.set_recompiled(false);
        assert!(!cleared.is_recompiled());
        assert_eq!(cleared.reason(), state.reason());
    }

    #[test]
    fn test_reencode_reachable_states() {
        let mut reachable = vec![TrapState::NONE, TrapState::MANY];
        reachable.extend(recorded().map(|r| TrapState::NONE.add_reason(r)));
        for state in reachable {
            for recompiled in [false, true] {
                let s = state.set_recompiled(recompiled);
                assert_eq!(s.reencode(), s);
                assert_eq!(s.reencode().bits(), s.bits());
            }
        }
    }

    #[test]
    fn test_format() {
        assert_eq!(TrapState::NONE.to_string(), "none");
        assert_eq!(
            TrapState::NONE
                .add_reason(DeoptReason::ClassCheck)
                .set_recompiled(true)
                .to_string(),
            "class_check recompiled"
        );
        assert_eq!(TrapState::MANY.to_string(), "many");
        // reason 12 is not recorded per bytecode, so it cannot re-encode
        assert_eq!(TrapState::from_bits(12).to_string(), "#12");
    }
}
