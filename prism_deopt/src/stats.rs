//! Deoptimization statistics.
//!
//! A histogram of traps keyed by reason, action and the bytecode that
//! trapped. Each cell packs the bytecode into its low bits and the count into
//! the rest, so a handful of cells per (reason, action) pair can track the
//! most common bytecodes without a map.

use std::fmt::Write as _;

use parking_lot::Mutex;

use crate::reason::{DeoptAction, DeoptReason};
use crate::runtime::Opcode;

// =============================================================================
// Constants
// =============================================================================

/// Bytecode cells per (reason, action) pair. The last cell doubles as the
/// overflow bucket.
pub const BC_CASE_LIMIT: usize = 4;

/// Bits of each cell holding the bytecode.
pub const LSB_BITS: u32 = 8;

const LSB_MASK: u32 = (1 << LSB_BITS) - 1;

const ACTION_SLOTS: usize = 1 + DeoptAction::LIMIT;

type Histogram = [[[u32; BC_CASE_LIMIT]; ACTION_SLOTS]; DeoptReason::LIMIT];

// =============================================================================
// DeoptStats
// =============================================================================

/// Process-wide trap counters.
///
/// Slot `[reason][0][0]` holds the per-reason total, `[None][0][0]` the grand
/// total. Action `a` lives in slot `1 + a`.
#[derive(Debug)]
pub struct DeoptStats {
    hist: Mutex<Box<Histogram>>,
}

impl Default for DeoptStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DeoptStats {
    /// Create empty statistics.
    pub fn new() -> Self {
        Self {
            hist: Mutex::new(Box::new([[[0; BC_CASE_LIMIT]; ACTION_SLOTS]; DeoptReason::LIMIT])),
        }
    }

    /// Count one trap.
    pub fn gather(&self, reason: DeoptReason, action: DeoptAction, bc: Option<Opcode>) {
        let mut hist = self.hist.lock();
        hist[DeoptReason::None as usize][0][0] += 1;
        hist[reason as usize][0][0] += 1;

        let cases = &mut hist[reason as usize][1 + action as usize];
        let mut slot = None;
        if let Some(bc) = bc {
            let code = bc.code() as u32;
            for (i, &counter) in cases.iter().enumerate() {
                if (counter == 0 && slot.is_none()) || counter & LSB_MASK == code {
                    slot = Some((i, counter | code));
                }
            }
        }
        let (index, counter) = slot.unwrap_or_else(|| {
            let last = BC_CASE_LIMIT - 1;
            (last, cases[last] & !LSB_MASK)
        });
        cases[index] = counter.wrapping_add(1 << LSB_BITS);
    }

    /// Total number of traps seen.
    pub fn total_count(&self) -> u32 {
        self.hist.lock()[DeoptReason::None as usize][0][0]
    }

    /// Number of traps seen for one reason, across all actions.
    pub fn reason_count(&self, reason: DeoptReason) -> u32 {
        self.hist.lock()[reason as usize][0][0]
    }

    /// Traps matching a reason and action name. `None` matches anything.
    ///
    /// Unknown names match nothing.
    pub fn count(&self, reason: Option<&str>, action: Option<&str>) -> u32 {
        if reason.is_none() && action.is_none() {
            return self.total_count();
        }
        let hist = self.hist.lock();
        let mut total = 0u32;
        for r in DeoptReason::ALL {
            if reason.is_some_and(|name| name != r.name()) {
                continue;
            }
            for a in DeoptAction::ALL {
                if action.is_some_and(|name| name != a.name()) {
                    continue;
                }
                total += hist[r as usize][1 + a as usize]
                    .iter()
                    .map(|c| c >> LSB_BITS)
                    .sum::<u32>();
            }
        }
        total
    }

    /// Render the histogram, one line per non-empty cell.
    pub fn report(&self) -> String {
        let hist = self.hist.lock();
        let total = hist[DeoptReason::None as usize][0][0];
        let mut out = String::new();
        if total == 0 {
            return out;
        }
        let pct = |n: u32| n as f64 * 100.0 / total as f64;
        let _ = writeln!(out, "Deoptimization traps recorded:");
        let _ = writeln!(out, "  {:4} ({:4.1}%) total", total, 100.0);

        let mut account = total;
        for r in DeoptReason::ALL {
            for a in DeoptAction::ALL {
                for &counter in &hist[r as usize][1 + a as usize] {
                    if counter == 0 {
                        continue;
                    }
                    let bc = Opcode::from_code((counter & LSB_MASK) as u8)
                        .map_or("other", Opcode::name);
                    let n = counter >> LSB_BITS;
                    let name = format!("{}/{}/{}", r.name(), a.name(), bc);
                    let _ = writeln!(out, "  {:>40}: {} ({:.1}%)", name, n, pct(n));
                    account = account.saturating_sub(n);
                }
            }
        }
        if account != 0 {
            let _ = writeln!(out, "  {:4} ({:4.1}%) unaccounted", account, pct(account));
        }
        out
    }

    /// Log the histogram at info level.
    pub fn print_statistics(&self) {
        let report = self.report();
        if !report.is_empty() {
            tracing::info!(target: "prism_deopt::stats", "\n{report}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty() {
        let stats = DeoptStats::new();
        assert_eq!(stats.total_count(), 0);
        assert_eq!(stats.count(None, None), 0);
        assert!(stats.report().is_empty());
    }

    #[test]
    fn test_gather_and_filter() {
        let stats = DeoptStats::new();
        stats.gather(DeoptReason::NullCheck, DeoptAction::MaybeRecompile, Some(Opcode::GetField));
        stats.gather(DeoptReason::NullCheck, DeoptAction::MaybeRecompile, Some(Opcode::GetField));
        stats.gather(DeoptReason::NullCheck, DeoptAction::Reinterpret, Some(Opcode::Invoke));
        stats.gather(DeoptReason::ClassCheck, DeoptAction::MaybeRecompile, None);

        assert_eq!(stats.total_count(), 4);
        assert_eq!(stats.reason_count(DeoptReason::NullCheck), 3);
        assert_eq!(stats.count(Some("null_check"), None), 3);
        assert_eq!(stats.count(None, Some("maybe_recompile")), 3);
        assert_eq!(stats.count(Some("null_check"), Some("reinterpret")), 1);
        assert_eq!(stats.count(Some("class_check"), Some("maybe_recompile")), 1);
        assert_eq!(stats.count(Some("no_such_reason"), None), 0);
    }

    #[test]
    fn test_overflow_bucket() {
        let stats = DeoptStats::new();
        let codes = [
            Opcode::GetField,
            Opcode::PutField,
            Opcode::Invoke,
            Opcode::CheckCast,
            Opcode::New,
            Opcode::ArrayLoad,
        ];
        for bc in codes {
            stats.gather(DeoptReason::RangeCheck, DeoptAction::None, Some(bc));
        }
        // cells overflow into the last one but nothing is lost
        assert_eq!(stats.count(Some("range_check"), Some("none")), codes.len() as u32);
    }

    #[test]
    fn test_report_lines() {
        let stats = DeoptStats::new();
        stats.gather(DeoptReason::Unloaded, DeoptAction::Reinterpret, Some(Opcode::New));
        let report = stats.report();
        assert!(report.contains("Deoptimization traps recorded:"));
        assert!(report.contains("unloaded/reinterpret/new: 1 (100.0%)"));
        assert!(!report.contains("unaccounted"));
    }

    #[test]
    fn test_concurrent_gather() {
        let stats = Arc::new(DeoptStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..250 {
                        stats.gather(DeoptReason::Age, DeoptAction::MakeNotEntrant, None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.total_count(), 1000);
        assert_eq!(stats.count(Some("age"), Some("make_not_entrant")), 1000);
    }
}
