//! Trap policy.
//!
//! Decides what happens to compiled code after an uncommon trap. The
//! compiler's hinted action is the starting point; the method's trap
//! history can only escalate it:
//!
//! | Hint                  | Code                | Profile                 |
//! |-----------------------|---------------------|-------------------------|
//! | `none`                | left as is          | read only               |
//! | `maybe_recompile`     | left entrant        | counted                 |
//! | `reinterpret`         | made not entrant    | counters reset          |
//! | `make_not_entrant`    | made not entrant    | counted                 |
//! | `make_not_compilable` | made not entrant    | method never recompiled |
//!
//! A location that keeps trapping for the same reason escalates to
//! invalidation, a location that keeps causing recompiles escalates to
//! giving up on the method, and a method whose code traps too often for one
//! reason is invalidated wherever the traps come from.

use crate::config::DeoptConfig;
use crate::profile::{MethodData, TrapHistory};
use crate::reason::{DeoptAction, DeoptReason};
use crate::trap_state::HasReason;

// =============================================================================
// History queries
// =============================================================================

/// What the trap history says about one trap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistorySnapshot {
    /// Traps for the reason in the method, including this one when counted.
    pub this_trap_count: u32,
    /// The location may have trapped for the reason before.
    pub maybe_prior_trap: bool,
    /// The location may already have caused a recompilation.
    pub maybe_prior_recompile: bool,
    /// A per-location record exists for the trap's bytecode.
    pub has_bci_data: bool,
}

/// Record a trap in `history` and report what was known before it.
///
/// With `update_total_trap_count` the per-method counter is bumped and the
/// per-method history estimates the per-location answers. The per-location
/// record then sharpens them: a location that never saw the reason, or was
/// never recompiled, clears the estimate. Reasons without a per-location
/// stand-in only touch the per-method counter.
pub fn query_update_method_data(
    history: &mut TrapHistory,
    decompile_count: u32,
    bci: u32,
    reason: DeoptReason,
    update_total_trap_count: bool,
) -> HistorySnapshot {
    let mut snapshot = HistorySnapshot::default();
    if update_total_trap_count {
        let prior = history.trap_count(reason);
        snapshot.this_trap_count = history.inc_trap_count(reason);
        snapshot.maybe_prior_trap = prior != 0;
        snapshot.maybe_prior_recompile = decompile_count != 0;
    }

    let Some(per_bc_reason) = reason.recorded_per_bytecode_if_any() else {
        return snapshot;
    };
    match history.allocate_bci_data(bci) {
        Some(data) => {
            let before = data.trap_state;
            if before.has_reason(per_bc_reason) == HasReason::No {
                snapshot.maybe_prior_trap = false;
            }
            if !before.is_recompiled() {
                snapshot.maybe_prior_recompile = false;
            }
            data.trap_state = before.add_reason(per_bc_reason);
            snapshot.has_bci_data = true;
        }
        None => {
            // Out of records: keep the pessimistic per-method estimate.
            tracing::warn!(target: "prism_deopt", bci, reason = reason.name(), "no room for trap record");
        }
    }
    snapshot
}

/// Read the trap history for a trap that will not be recorded.
pub fn peek_method_data(
    history: &TrapHistory,
    decompile_count: u32,
    bci: u32,
    reason: DeoptReason,
) -> HistorySnapshot {
    let count = history.trap_count(reason);
    let mut snapshot = HistorySnapshot {
        this_trap_count: count,
        maybe_prior_trap: count != 0,
        maybe_prior_recompile: decompile_count != 0,
        has_bci_data: false,
    };
    if let Some(per_bc_reason) = reason.recorded_per_bytecode_if_any() {
        match history.bci_data(bci) {
            Some(data) => {
                snapshot.has_bci_data = true;
                snapshot.maybe_prior_trap &= data.trap_state.has_reason(per_bc_reason).as_bool();
                snapshot.maybe_prior_recompile &= data.trap_state.is_recompiled();
            }
            None => {
                snapshot.maybe_prior_trap = false;
                snapshot.maybe_prior_recompile = false;
            }
        }
    }
    snapshot
}

/// Record a trap the interpreter observed at `bci` without counting it
/// against the method.
pub fn update_method_data_from_interpreter(mdo: &MethodData, bci: u32, reason: DeoptReason) {
    let decompile_count = mdo.decompile_count();
    let mut history = mdo.lock();
    query_update_method_data(&mut history, decompile_count, bci, reason, false);
}

// =============================================================================
// Decision
// =============================================================================

/// Effects a trap has on its compiled code and method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapDecision {
    pub make_not_entrant: bool,
    pub make_not_compilable: bool,
    /// Reset invocation counters so the interpreter profiles again.
    pub reprofile: bool,
    /// Count a recompilation caused by the trapping location.
    pub inc_recompile_count: bool,
}

impl TrapDecision {
    /// The action the decision amounts to, for reporting.
    pub fn effective_action(&self, hinted: DeoptAction) -> DeoptAction {
        if self.make_not_compilable {
            DeoptAction::MakeNotCompilable
        } else if self.make_not_entrant && self.reprofile {
            DeoptAction::Reinterpret
        } else if self.make_not_entrant {
            DeoptAction::MakeNotEntrant
        } else {
            hinted
        }
    }
}

/// Combine the hinted action with the trap history.
///
/// `history` is `None` when traps are not profiled; the hint is then taken
/// as is.
pub fn decide(
    reason: DeoptReason,
    action: DeoptAction,
    history: Option<&HistorySnapshot>,
    config: &DeoptConfig,
) -> TrapDecision {
    let mut decision = TrapDecision::default();
    match action {
        DeoptAction::None | DeoptAction::MaybeRecompile => {}
        DeoptAction::Reinterpret => {
            decision.make_not_entrant = true;
            decision.reprofile = true;
        }
        DeoptAction::MakeNotEntrant => decision.make_not_entrant = true,
        DeoptAction::MakeNotCompilable => {
            decision.make_not_entrant = true;
            decision.make_not_compilable = true;
        }
    }

    let Some(history) = history else {
        return decision;
    };

    if reason.recorded_per_bytecode_if_any().is_some() {
        if history.maybe_prior_trap && history.this_trap_count > config.per_bytecode_trap_limit {
            decision.make_not_entrant = true;
        }
        if decision.make_not_entrant && history.maybe_prior_recompile {
            decision.inc_recompile_count = history.maybe_prior_trap;
        }
    } else if action != DeoptAction::None {
        // No per-location history to wait for.
        decision.make_not_entrant = true;
    }

    if history.this_trap_count > config.per_method_trap_limit_for(reason) {
        decision.make_not_entrant = true;
    }

    if decision.make_not_entrant && history.maybe_prior_recompile && history.maybe_prior_trap {
        decision.reprofile = true;
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::MethodData;
    use crate::runtime::MethodId;

    fn config() -> DeoptConfig {
        DeoptConfig::for_testing()
    }

    fn snapshot(count: u32, prior_trap: bool, prior_recompile: bool) -> HistorySnapshot {
        HistorySnapshot {
            this_trap_count: count,
            maybe_prior_trap: prior_trap,
            maybe_prior_recompile: prior_recompile,
            has_bci_data: true,
        }
    }

    // =========================================================================
    // Hinted actions
    // =========================================================================

    #[test]
    fn test_hint_table_without_history() {
        let c = config();
        let r = DeoptReason::NullCheck;
        assert_eq!(decide(r, DeoptAction::None, None, &c), TrapDecision::default());
        assert_eq!(decide(r, DeoptAction::MaybeRecompile, None, &c), TrapDecision::default());

        let reinterpret = decide(r, DeoptAction::Reinterpret, None, &c);
        assert!(reinterpret.make_not_entrant && reinterpret.reprofile);

        let not_entrant = decide(r, DeoptAction::MakeNotEntrant, None, &c);
        assert!(not_entrant.make_not_entrant && !not_entrant.reprofile);

        let give_up = decide(r, DeoptAction::MakeNotCompilable, None, &c);
        assert!(give_up.make_not_entrant && give_up.make_not_compilable);
        assert_eq!(give_up.effective_action(DeoptAction::MakeNotCompilable), DeoptAction::MakeNotCompilable);
    }

    #[test]
    fn test_first_trap_keeps_hint() {
        let d = decide(
            DeoptReason::ClassCheck,
            DeoptAction::MaybeRecompile,
            Some(&snapshot(1, false, false)),
            &config(),
        );
        assert!(!d.make_not_entrant);
        assert_eq!(d.effective_action(DeoptAction::MaybeRecompile), DeoptAction::MaybeRecompile);
    }

    // =========================================================================
    // Escalation
    // =========================================================================

    #[test]
    fn test_per_bytecode_limit_escalates() {
        let c = config();
        let at_limit = decide(
            DeoptReason::NullCheck,
            DeoptAction::MaybeRecompile,
            Some(&snapshot(c.per_bytecode_trap_limit, true, false)),
            &c,
        );
        assert!(!at_limit.make_not_entrant);

        let over = decide(
            DeoptReason::NullCheck,
            DeoptAction::MaybeRecompile,
            Some(&snapshot(c.per_bytecode_trap_limit + 1, true, false)),
            &c,
        );
        assert!(over.make_not_entrant);
        assert_eq!(over.effective_action(DeoptAction::MaybeRecompile), DeoptAction::MakeNotEntrant);
    }

    #[test]
    fn test_per_method_limit_escalates() {
        let c = config();
        let d = decide(
            DeoptReason::RangeCheck,
            DeoptAction::MaybeRecompile,
            Some(&snapshot(c.per_method_trap_limit + 1, false, false)),
            &c,
        );
        assert!(d.make_not_entrant);

        // Speculative reasons get the larger limit.
        let speculative = decide(
            DeoptReason::SpeculateClassCheck,
            DeoptAction::MaybeRecompile,
            Some(&snapshot(c.per_method_trap_limit + 1, false, false)),
            &c,
        );
        assert!(!speculative.make_not_entrant);
    }

    #[test]
    fn test_unrecorded_reason_invalidates() {
        let d = decide(
            DeoptReason::Unloaded,
            DeoptAction::MaybeRecompile,
            Some(&snapshot(1, false, false)),
            &config(),
        );
        assert!(d.make_not_entrant);

        let none = decide(
            DeoptReason::Unloaded,
            DeoptAction::None,
            Some(&snapshot(1, true, false)),
            &config(),
        );
        assert!(!none.make_not_entrant);
    }

    #[test]
    fn test_repeated_recompile_counts_and_reprofiles() {
        let d = decide(
            DeoptReason::NullCheck,
            DeoptAction::MakeNotEntrant,
            Some(&snapshot(2, true, true)),
            &config(),
        );
        assert!(d.make_not_entrant);
        assert!(d.inc_recompile_count);
        assert!(d.reprofile);
        assert_eq!(d.effective_action(DeoptAction::MakeNotEntrant), DeoptAction::Reinterpret);
    }

    // =========================================================================
    // History queries
    // =========================================================================

    #[test]
    fn test_query_update_records_location() {
        let mdo = MethodData::new(MethodId(1), 4);
        let mut history = mdo.lock();

        let first = query_update_method_data(&mut history, 0, 7, DeoptReason::NullCheck, true);
        assert_eq!(first.this_trap_count, 1);
        assert!(!first.maybe_prior_trap);
        assert!(first.has_bci_data);

        let second = query_update_method_data(&mut history, 0, 7, DeoptReason::NullCheck, true);
        assert_eq!(second.this_trap_count, 2);
        assert!(second.maybe_prior_trap);

        // Same reason elsewhere: the method saw it, this location did not.
        let other = query_update_method_data(&mut history, 0, 9, DeoptReason::NullCheck, true);
        assert!(!other.maybe_prior_trap);
    }

    #[test]
    fn test_query_update_stand_in_reason() {
        let mdo = MethodData::new(MethodId(1), 4);
        let mut history = mdo.lock();
        query_update_method_data(&mut history, 0, 3, DeoptReason::Div0Check, true);
        let state = history.bci_data(3).unwrap().trap_state;
        assert_eq!(state.has_reason(DeoptReason::NullCheck), HasReason::Yes);
        assert_eq!(history.trap_count(DeoptReason::Div0Check), 1);
        assert_eq!(history.trap_count(DeoptReason::NullCheck), 0);
    }

    #[test]
    fn test_query_update_without_room_stays_pessimistic() {
        let mdo = MethodData::new(MethodId(1), 1);
        let mut history = mdo.lock();
        query_update_method_data(&mut history, 0, 1, DeoptReason::RangeCheck, true);
        let snap = query_update_method_data(&mut history, 1, 2, DeoptReason::RangeCheck, true);
        assert!(!snap.has_bci_data);
        assert!(snap.maybe_prior_trap);
        assert!(snap.maybe_prior_recompile);
    }

    #[test]
    fn test_recompiled_bit_gates_prior_recompile() {
        let mdo = MethodData::new(MethodId(1), 4);
        let mut history = mdo.lock();
        query_update_method_data(&mut history, 0, 5, DeoptReason::ClassCheck, true);
        let snap = query_update_method_data(&mut history, 3, 5, DeoptReason::ClassCheck, true);
        assert!(!snap.maybe_prior_recompile);

        let data = history.allocate_bci_data(5).unwrap();
        data.trap_state = data.trap_state.set_recompiled(true);
        let snap = query_update_method_data(&mut history, 3, 5, DeoptReason::ClassCheck, true);
        assert!(snap.maybe_prior_recompile);
    }

    #[test]
    fn test_peek_does_not_record() {
        let mdo = MethodData::new(MethodId(1), 4);
        let mut history = mdo.lock();
        for _ in 0..3 {
            query_update_method_data(&mut history, 0, 4, DeoptReason::NullCheck, true);
        }
        let peeked = peek_method_data(&history, 0, 4, DeoptReason::NullCheck);
        assert_eq!(peeked.this_trap_count, 3);
        assert!(peeked.maybe_prior_trap);
        assert_eq!(history.trap_count(DeoptReason::NullCheck), 3);

        let elsewhere = peek_method_data(&history, 0, 10, DeoptReason::NullCheck);
        assert!(!elsewhere.maybe_prior_trap);
        assert_eq!(history.bci_data_len(), 1);
    }

    #[test]
    fn test_interpreter_update_skips_total() {
        let mdo = MethodData::new(MethodId(1), 4);
        update_method_data_from_interpreter(&mdo, 6, DeoptReason::RangeCheck);
        assert_eq!(mdo.trap_count(DeoptReason::RangeCheck), 0);
        let state = mdo.trap_state_at(6).unwrap();
        assert_eq!(state.has_reason(DeoptReason::RangeCheck), HasReason::Yes);
    }
}
