//! Reacquiring eliminated locks.

use crate::frame::{CompiledVFrame, ExecMode, MonitorInfo};
use crate::reversal::Rematerialized;
use crate::runtime::ExecThread;

/// Reacquire the eliminated monitors of one logical frame for `deoptee`.
///
/// When only inspecting the stack ([`ExecMode::None`]) and `deoptee` is
/// waiting on the owner, the reacquisition is deferred: the thread retakes
/// the lock itself once the wait returns. Owners whose reallocation failed
/// are skipped. Returns whether any monitor was eliminated.
pub fn relock_objects(
    monitors: &[MonitorInfo],
    deoptee: &ExecThread,
    exec_mode: ExecMode,
    realloc_failures: bool,
) -> bool {
    let mut relocked = false;
    for mon in monitors.iter().filter(|m| m.eliminated) {
        relocked = true;
        if mon.owner_is_scalar_replaced {
            debug_assert!(realloc_failures, "eliminated owner was not reallocated");
            continue;
        }
        let Some(obj) = &mon.owner else {
            continue;
        };
        if exec_mode == ExecMode::None && deoptee.is_waiting_on(obj) {
            deoptee.inc_relock_count_after_wait();
            tracing::debug!(
                target: "prism_deopt",
                thread = deoptee.id().0,
                object = obj.id(),
                "relock deferred until wait returns"
            );
            continue;
        }
        obj.monitor().enter_for(deoptee.id());
    }
    relocked
}

/// Reacquire eliminated monitors across a frame group, outermost frame
/// first so that lock order matches the original acquisition order.
pub fn restore_eliminated_locks(
    chain: &[CompiledVFrame<'_>],
    objects: &Rematerialized,
    deoptee: &ExecThread,
    exec_mode: ExecMode,
    realloc_failures: bool,
) -> bool {
    let mut relocked = false;
    for vf in chain.iter().rev() {
        let monitors = vf.monitors(objects);
        if monitors.is_empty() {
            continue;
        }
        relocked |= relock_objects(&monitors, deoptee, exec_mode, realloc_failures);
    }
    relocked
}
