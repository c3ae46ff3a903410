//! Deoptimization generations.
//!
//! Requests to stop compiled code are batched into numbered rounds. A region
//! is marked with the generation that is active when it is marked; a
//! [`DeoptimizationScope`] remembers the highest generation it depends on,
//! and its commit returns once that generation has been committed, which
//! means every frame running the marked regions has been patched.
//!
//! ```text
//!   mark ──▶ region.generation = active
//!   commit ─▶ claim round: target = active, active += 1
//!             handshake: patch frames of regions marked <= target
//!             committed = max(committed, target)
//! ```
//!
//! Concurrent committers ride the round in flight instead of starting their
//! own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::code::{CodeCache, CompiledRegion};
use crate::config::DeoptConfig;
use crate::deoptimizer::deoptimize_single_frame;
use crate::guarantee;
use crate::reason::DeoptReason;
use crate::runtime::ThreadRegistry;
use crate::stats::DeoptStats;

// =============================================================================
// GenerationState
// =============================================================================

/// The process-wide generation pair and the round flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationState {
    /// Highest generation whose frames are known to be deoptimized.
    pub committed: u64,
    /// Generation new marks are tagged with.
    pub active: u64,
    /// A commit round is running.
    pub in_flight: bool,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            committed: 0,
            active: 1,
            in_flight: false,
        }
    }
}

/// Outcome of trying to start a commit round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// The required generation is already committed.
    Satisfied,
    /// Another thread's round is in flight.
    Busy,
    /// This thread owns a round committing the given generation.
    Claimed(u64),
}

// =============================================================================
// GenerationCoordinator
// =============================================================================

/// Owner of the generation state.
pub struct GenerationCoordinator {
    state: Mutex<GenerationState>,
    code_cache: Arc<CodeCache>,
    threads: Arc<ThreadRegistry>,
    stats: Arc<DeoptStats>,
    recompilation_cutoff: u32,
    rounds: AtomicU64,
}

impl GenerationCoordinator {
    pub fn new(
        code_cache: Arc<CodeCache>,
        threads: Arc<ThreadRegistry>,
        stats: Arc<DeoptStats>,
        config: &DeoptConfig,
    ) -> Self {
        Self {
            state: Mutex::new(GenerationState::default()),
            code_cache,
            threads,
            stats,
            recompilation_cutoff: config.per_method_recompilation_cutoff,
            rounds: AtomicU64::new(0),
        }
    }

    /// Snapshot of the generation state.
    pub fn state(&self) -> GenerationState {
        *self.state.lock()
    }

    /// Number of region-wide deoptimization rounds performed.
    #[inline]
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn code_cache(&self) -> &Arc<CodeCache> {
        &self.code_cache
    }

    #[inline]
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    /// Start a request. The scope must be committed before it is dropped.
    pub fn open_scope(&self) -> DeoptimizationScope<'_> {
        let committed = self.state.lock().committed;
        DeoptimizationScope {
            coordinator: self,
            required: committed,
            committed: false,
        }
    }

    /// Invalidate `region` without waiting for other threads.
    ///
    /// Used by a thread trapping out of its own code. Returns `false` if the
    /// region was already not entrant.
    pub fn make_not_entrant(&self, region: &CompiledRegion) -> bool {
        let _state = self.state.lock();
        self.code_cache
            .make_not_entrant(region, self.recompilation_cutoff)
    }

    /// Make every region marked at or below `generation` not entrant and
    /// patch every frame running marked code, on every thread.
    pub fn deoptimize_all_marked(&self, generation: u64) {
        let regions = self
            .code_cache
            .make_marked_deoptimized(generation, self.recompilation_cutoff);
        self.rounds.fetch_add(1, Ordering::Relaxed);

        let stats = &self.stats;
        let mut patched = 0usize;
        let op = |thread: &crate::runtime::ExecThread, state: &mut crate::runtime::ThreadState| {
            for frame in state.frames_mut() {
                let marked = frame
                    .as_compiled()
                    .is_some_and(|cf| cf.region.is_deoptimized() || cf.region.is_marked_for_deoptimization());
                if marked && deoptimize_single_frame(thread.id(), frame, DeoptReason::Constraint, stats) {
                    patched += 1;
                }
            }
        };
        if self.threads.is_at_safepoint() {
            self.threads.threads_do(op);
        } else {
            self.threads.handshake_all(op);
        }
        tracing::debug!(
            target: "prism_deopt",
            generation,
            regions,
            frames = patched,
            "deoptimized marked code"
        );
    }

    // -------------------------------------------------------------------------
    // Commit protocol
    // -------------------------------------------------------------------------

    fn commit_scope(&self, required: u64) {
        if !self.threads.is_fully_initialized() {
            return;
        }

        if self.threads.is_at_safepoint() {
            let target = {
                let mut state = self.state.lock();
                state.committed = state.active;
                state.active += 1;
                state.committed
            };
            self.deoptimize_all_marked(target);
            return;
        }

        loop {
            match self.try_claim_round(required) {
                Claim::Satisfied => return,
                Claim::Busy => thread::yield_now(),
                Claim::Claimed(target) => {
                    self.deoptimize_all_marked(target);
                    self.finish_round(target);
                    let committed = self.state.lock().committed;
                    guarantee!(
                        committed >= required,
                        "committed generation {} below required {}",
                        committed,
                        required
                    );
                    return;
                }
            }
        }
    }

    fn try_claim_round(&self, required: u64) -> Claim {
        let mut state = self.state.lock();
        if state.committed >= required {
            return Claim::Satisfied;
        }
        if state.in_flight {
            return Claim::Busy;
        }
        let target = state.active;
        state.active += 1;
        state.in_flight = true;
        Claim::Claimed(target)
    }

    fn finish_round(&self, target: u64) {
        let mut state = self.state.lock();
        if state.committed < target {
            state.committed = target;
        }
        state.in_flight = false;
        debug_assert!(state.committed < state.active);
    }
}

// =============================================================================
// DeoptimizationScope
// =============================================================================

/// A single-use request to deoptimize a set of regions.
///
/// Call [`commit`](Self::commit) exactly once. Dropping an uncommitted scope
/// is a programming error and asserts in debug builds.
pub struct DeoptimizationScope<'a> {
    coordinator: &'a GenerationCoordinator,
    required: u64,
    committed: bool,
}

impl DeoptimizationScope<'_> {
    /// Generation that must be committed before this request is satisfied.
    #[inline]
    pub fn required_generation(&self) -> u64 {
        self.required
    }

    /// Mark `region` for deoptimization.
    ///
    /// A region that is already marked only raises the required generation
    /// to the region's generation. Regions that cannot be deoptimized are
    /// ignored.
    pub fn mark(&mut self, region: &CompiledRegion, count_recompile: bool) {
        if !region.can_be_deoptimized() {
            return;
        }
        let state = self.coordinator.state.lock();
        if region.is_marked_for_deoptimization() {
            self.required = self.required.max(region.deopt_generation());
            return;
        }
        guarantee!(
            state.committed < state.active,
            "active generation {} not ahead of committed {}",
            state.active,
            state.committed
        );
        region.set_deopt_mark(count_recompile, state.active);
        self.required = state.active;
    }

    /// Depend on a region someone else marked.
    pub fn dependent(&mut self, region: &CompiledRegion) {
        let _state = self.coordinator.state.lock();
        self.required = self.required.max(region.deopt_generation());
    }

    /// Deoptimize everything this scope depends on.
    pub fn commit(mut self) {
        self.committed = true;
        self.coordinator.commit_scope(self.required);
    }
}

impl Drop for DeoptimizationScope<'_> {
    fn drop(&mut self) {
        debug_assert!(
            self.committed || thread::panicking(),
            "deoptimization scope dropped without commit"
        );
    }
}
