//! The deoptimization service.
//!
//! [`Deoptimizer`] wires the trap policy, the generation coordinator, the
//! reversal engine and the unroll planner together behind the entry points
//! a runtime calls:
//!
//! - [`Deoptimizer::uncommon_trap`] when compiled code bails out,
//! - [`Deoptimizer::deoptimize_frame`] to make one frame deoptimize on return,
//! - [`Deoptimizer::deoptimize_objects`] when another thread needs to see a
//!   frame's eliminated objects and locks,
//! - [`Deoptimizer::fetch_unroll_info`] and [`Deoptimizer::unpack_frames`]
//!   for the two halves of unwinding a patched frame.

use std::sync::Arc;

use crate::code::{CodeCache, CompiledRegion};
use crate::config::DeoptConfig;
use crate::events::{DeoptEventKind, DeoptEventSink, TracingSink, TrapEvent};
use crate::frame::{ExecMode, UnrollBlock, virtual_frames};
use crate::generation::GenerationCoordinator;
use crate::planner::{self, pc_desc_for};
use crate::policy::{self, HistorySnapshot, TrapDecision};
use crate::reason::{DeoptAction, DeoptReason, TrapRequest};
use crate::reversal::{ReversalContext, reverse};
use crate::runtime::{
    BasicType, BoxCaches, ClassResolver, ClassTable, ExecThread, FrameId, FrameKind, Heap, Method,
    PhysicalFrame, SimpleHeap, ThreadId, ThreadRegistry,
};
use crate::stats::DeoptStats;
use crate::unpacker::{InterpreterUnpacker, StackUnpacker};

// =============================================================================
// Single-frame deoptimization
// =============================================================================

/// Patch `frame` so that returning into it enters the deopt handler.
///
/// Frames that are not compiled or already patched are left alone. Counted
/// in `stats` as a trap with action `none`.
pub(crate) fn deoptimize_single_frame(
    thread: ThreadId,
    frame: &mut PhysicalFrame,
    reason: DeoptReason,
    stats: &DeoptStats,
) -> bool {
    let Some(cf) = frame.as_compiled() else {
        return false;
    };
    if cf.is_deopt_pending() {
        return false;
    }
    let region = Arc::clone(&cf.region);
    stats.gather(reason, DeoptAction::None, None);
    let patched = frame.patch_for_deopt();
    tracing::debug!(
        target: "prism_deopt",
        thread = thread.0,
        frame = frame.id.0,
        method = %region.method().qualified_name(),
        compile_id = region.compile_id(),
        reason = reason.name(),
        "deoptimizing frame"
    );
    patched
}

/// Result of [`Deoptimizer::deoptimize_objects`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectDeoptOutcome {
    /// The frame has no eliminated objects or locks.
    NothingEliminated,
    /// Eliminated state is restored and kept for the frame's unwind.
    Restored,
    /// Some eliminated object could not be reallocated; nothing is kept.
    ReallocFailed,
}

/// What an uncommon trap needs to know about the trapping frame.
struct TrapSite {
    region: Arc<CompiledRegion>,
    trap_method: Arc<Method>,
    trap_bci: u32,
    scope_methods: Vec<Arc<Method>>,
}

// =============================================================================
// Deoptimizer
// =============================================================================

/// Deoptimization entry points for one runtime.
pub struct Deoptimizer {
    config: DeoptConfig,
    code_cache: Arc<CodeCache>,
    threads: Arc<ThreadRegistry>,
    stats: Arc<DeoptStats>,
    generations: GenerationCoordinator,
    heap: Arc<dyn Heap>,
    box_caches: BoxCaches,
    resolver: Arc<dyn ClassResolver>,
    sink: Arc<dyn DeoptEventSink>,
    unpacker: Arc<dyn StackUnpacker>,
}

impl Deoptimizer {
    /// A deoptimizer over `code_cache` and `threads` with an unbounded heap,
    /// an empty class table, the tracing sink and the interpreter unpacker.
    pub fn new(config: DeoptConfig, code_cache: Arc<CodeCache>, threads: Arc<ThreadRegistry>) -> Self {
        let stats = Arc::new(DeoptStats::new());
        let generations = GenerationCoordinator::new(
            Arc::clone(&code_cache),
            Arc::clone(&threads),
            Arc::clone(&stats),
            &config,
        );
        Self {
            config,
            code_cache,
            threads,
            stats,
            generations,
            heap: Arc::new(SimpleHeap::new()),
            box_caches: BoxCaches::new(),
            resolver: Arc::new(ClassTable::new()),
            sink: Arc::new(TracingSink),
            unpacker: Arc::new(InterpreterUnpacker),
        }
    }

    pub fn with_heap(mut self, heap: Arc<dyn Heap>) -> Self {
        self.heap = heap;
        self
    }

    pub fn with_box_caches(mut self, box_caches: BoxCaches) -> Self {
        self.box_caches = box_caches;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ClassResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DeoptEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_unpacker(mut self, unpacker: Arc<dyn StackUnpacker>) -> Self {
        self.unpacker = unpacker;
        self
    }

    #[inline]
    pub fn config(&self) -> &DeoptConfig {
        &self.config
    }

    #[inline]
    pub fn code_cache(&self) -> &Arc<CodeCache> {
        &self.code_cache
    }

    #[inline]
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    #[inline]
    pub fn stats(&self) -> &Arc<DeoptStats> {
        &self.stats
    }

    #[inline]
    pub fn generations(&self) -> &GenerationCoordinator {
        &self.generations
    }

    #[inline]
    pub fn heap(&self) -> &Arc<dyn Heap> {
        &self.heap
    }

    #[inline]
    pub fn box_caches(&self) -> &BoxCaches {
        &self.box_caches
    }

    fn reversal_context(&self) -> ReversalContext<'_> {
        ReversalContext {
            heap: self.heap.as_ref(),
            box_caches: &self.box_caches,
            config: &self.config,
        }
    }

    fn emit(
        &self,
        kind: DeoptEventKind,
        reason: DeoptReason,
        action: DeoptAction,
        site: Option<(&Method, Option<u32>, u32)>,
        thread: ThreadId,
    ) {
        let (method, bci, compile_id) = match site {
            Some((method, bci, compile_id)) => (method.qualified_name(), bci, Some(compile_id)),
            None => (String::new(), None, None),
        };
        self.sink.record(&TrapEvent {
            kind,
            reason,
            action,
            method,
            bci,
            compile_id,
            thread: thread.0,
        });
    }

    // -------------------------------------------------------------------------
    // Uncommon traps
    // -------------------------------------------------------------------------

    fn trap_site(thread: &ExecThread) -> TrapSite {
        let state = thread.state();
        let Some(frame) = state
            .frames()
            .iter()
            .rev()
            .find(|f| !matches!(f.kind, FrameKind::Stub(_)))
        else {
            crate::error::fatal(format_args!("uncommon trap on {} without a frame", thread.name()));
        };
        let pc_desc = pc_desc_for(frame);
        let Some(trap_scope) = pc_desc.innermost() else {
            crate::error::fatal(format_args!("uncommon trap at pc offset {:#x} without scope", pc_desc.pc_offset));
        };
        let Some(cf) = frame.as_compiled() else {
            crate::error::fatal(format_args!("uncommon trap from frame {:?} that is not compiled", frame.id));
        };
        TrapSite {
            region: Arc::clone(&cf.region),
            trap_method: Arc::clone(&trap_scope.method),
            trap_bci: trap_scope.bci,
            scope_methods: pc_desc.scopes.iter().map(|s| Arc::clone(&s.method)).collect(),
        }
    }

    /// Handle an uncommon trap raised by the compiled frame on top of
    /// `thread`, then plan its unwind.
    ///
    /// Records the trap in the trapping method's profile, decides whether
    /// the code survives, applies the decision and returns the unroll plan.
    pub fn uncommon_trap(&self, thread: &ExecThread, request: TrapRequest) -> UnrollBlock {
        self.uncommon_trap_inner(thread, request);
        self.fetch_unroll_info(thread, ExecMode::UncommonTrap)
    }

    fn uncommon_trap_inner(&self, thread: &ExecThread, request: TrapRequest) {
        let reason = request.reason();
        let action = request.action();
        let site = Self::trap_site(thread);
        let trap_method = &site.trap_method;
        let trap_bci = site.trap_bci;
        let nm_method = site.region.method();

        if let Some(index) = request.unloaded_index() {
            if !trap_method.constants().is_resolved_class(index) {
                // The interpreter retries the resolution when it re-executes.
                if let Err(err) = trap_method.constants().klass_at(index, self.resolver.as_ref()) {
                    tracing::warn!(target: "prism_deopt", index, error = %err, "class resolution failed during uncommon trap");
                }
            }
        }

        let trap_bc = trap_method.code_at(trap_bci).map(|insn| insn.opcode());
        self.stats.gather(reason, action, trap_bc);

        let mdo = if self.config.profile_traps {
            Some(Arc::clone(trap_method.ensure_method_data(self.config.extra_data_slots as usize)))
        } else {
            trap_method.method_data().cloned()
        };

        let update_trap_state = reason != DeoptReason::Tenured && action != DeoptAction::None;
        let snapshot: Option<HistorySnapshot> = mdo.as_ref().and_then(|mdo| {
            let decompile_count = mdo.decompile_count();
            let mut history = mdo.lock();
            if update_trap_state {
                Some(policy::query_update_method_data(&mut history, decompile_count, trap_bci, reason, true))
            } else if action == DeoptAction::None && reason != DeoptReason::Tenured {
                Some(policy::peek_method_data(&history, decompile_count, trap_bci, reason))
            } else {
                None
            }
        });
        let mut decision: TrapDecision = policy::decide(reason, action, snapshot.as_ref(), &self.config);

        // The profile lock is released before the generation lock is taken.
        if decision.make_not_entrant {
            if !self.generations.make_not_entrant(&site.region) {
                tracing::debug!(
                    target: "prism_deopt",
                    compile_id = site.region.compile_id(),
                    "code already not entrant"
                );
                self.report_trap(thread, &site, reason, decision.effective_action(action));
                return;
            }
            if let Some(mdo) = &mdo {
                let mut history = mdo.lock();
                if update_trap_state {
                    if let Some(data) = history.allocate_bci_data(trap_bci) {
                        data.trap_state = data.trap_state.set_recompiled(true);
                    }
                }
                if reason == DeoptReason::Tenured {
                    history.inc_tenure_traps();
                }
            }
        }

        if decision.inc_recompile_count {
            if let Some(mdo) = &mdo {
                let overflow = mdo.lock().inc_overflow_recompile_count();
                if overflow > self.config.per_bytecode_recompilation_cutoff {
                    if Arc::ptr_eq(trap_method, nm_method) {
                        decision.make_not_compilable = true;
                    } else {
                        // The enclosing method keeps its chance.
                        trap_method.set_not_compilable("overflow_recompile_count > per_bytecode_recompilation_cutoff");
                    }
                }
            }
        }

        if decision.reprofile {
            for method in &site.scope_methods {
                method.reset_counters();
            }
        }

        if decision.make_not_compilable && !nm_method.is_not_compilable() {
            debug_assert!(decision.make_not_entrant);
            nm_method.set_not_compilable("give up compiling");
        }

        if let Some(mdo) = &mdo {
            let mut history = mdo.lock();
            if history.set_exception_handler_entered(trap_bci) {
                tracing::trace!(target: "prism_deopt", bci = trap_bci, "exception handler entered");
            }
        }

        self.report_trap(thread, &site, reason, decision.effective_action(action));
    }

    fn report_trap(&self, thread: &ExecThread, site: &TrapSite, reason: DeoptReason, action: DeoptAction) {
        tracing::debug!(
            target: "prism_deopt",
            thread = thread.id().0,
            method = %site.trap_method.qualified_name(),
            bci = site.trap_bci,
            compile_id = site.region.compile_id(),
            reason = reason.name(),
            action = action.name(),
            "uncommon trap"
        );
        self.emit(
            DeoptEventKind::UncommonTrap,
            reason,
            action,
            Some((&*site.trap_method, Some(site.trap_bci), site.region.compile_id())),
            thread.id(),
        );
    }

    // -------------------------------------------------------------------------
    // Frame and object deoptimization
    // -------------------------------------------------------------------------

    /// Make the compiled frame `frame` of `thread` deoptimize when control
    /// returns into it. Returns `false` if the frame does not exist, is not
    /// compiled or is already patched.
    pub fn deoptimize_frame(&self, thread: &ExecThread, frame: FrameId, reason: DeoptReason) -> bool {
        let mut state = thread.state();
        let Some(physical) = state.frame_mut(frame) else {
            return false;
        };
        let site = physical
            .as_compiled()
            .map(|cf| (Arc::clone(cf.region.method()), cf.region.compile_id()));
        let patched = deoptimize_single_frame(thread.id(), physical, reason, &self.stats);
        drop(state);
        if patched {
            self.emit(
                DeoptEventKind::FrameDeoptimized,
                reason,
                DeoptAction::None,
                site.as_ref().map(|(method, compile_id)| (&**method, None, *compile_id)),
                thread.id(),
            );
        }
        patched
    }

    /// Restore the eliminated objects and locks of compiled frame `frame`
    /// of `deoptee` so that another thread can inspect them.
    ///
    /// The frame is patched to deoptimize on return, and the restored
    /// objects are kept for that unwind so it neither reallocates nor
    /// relocks them again. A relock on a monitor `deoptee` is waiting on is
    /// left to the wait to complete.
    pub fn deoptimize_objects(&self, deoptee: &ExecThread, frame: FrameId) -> ObjectDeoptOutcome {
        let mut state = deoptee.state();
        if state.objs_are_deoptimized(frame) {
            return ObjectDeoptOutcome::Restored;
        }
        let Some(physical) = state.frame(frame).cloned() else {
            crate::error::fatal(format_args!("frame {:?} not found on {}", frame, deoptee.name()));
        };
        let Some(cf) = physical.as_compiled() else {
            crate::error::fatal(format_args!("frame {:?} of {} is not compiled", frame, deoptee.name()));
        };
        let pc_desc = pc_desc_for(&physical);
        let chain = virtual_frames(cf, pc_desc);
        let has_eliminated_locks = pc_desc.scopes.iter().any(|s| s.monitors.iter().any(|m| m.eliminated));
        if pc_desc.objects.is_empty() && !has_eliminated_locks {
            return ObjectDeoptOutcome::NothingEliminated;
        }

        // Failures are reported to the inspector, not raised in the deoptee.
        let mut pending = None;
        let outcome = reverse(&self.reversal_context(), deoptee, &mut pending, &chain, &pc_desc.objects);
        if outcome.realloc_failures {
            tracing::debug!(
                target: "prism_deopt",
                thread = deoptee.id().0,
                frame = frame.0,
                failures = outcome.objects.failures(),
                "object deoptimization failed to reallocate"
            );
            return ObjectDeoptOutcome::ReallocFailed;
        }

        if let Some(physical) = state.frame_mut(frame) {
            deoptimize_single_frame(deoptee.id(), physical, DeoptReason::Constraint, &self.stats);
        }
        state.deferred_objects.insert(frame, outcome.objects);
        drop(state);

        self.emit(
            DeoptEventKind::ObjectsDeoptimized,
            DeoptReason::Constraint,
            DeoptAction::None,
            Some((&**cf.region.method(), Some(chain[0].bci()), cf.region.compile_id())),
            deoptee.id(),
        );
        ObjectDeoptOutcome::Restored
    }

    // -------------------------------------------------------------------------
    // Unwinding
    // -------------------------------------------------------------------------

    /// Plan the unwind of the patched compiled frame on top of `thread`.
    pub fn fetch_unroll_info(&self, thread: &ExecThread, exec_mode: ExecMode) -> UnrollBlock {
        let block = planner::fetch_unroll_info(&self.reversal_context(), thread, exec_mode);
        self.emit(
            DeoptEventKind::Unrolled(block.exec_mode()),
            DeoptReason::None,
            DeoptAction::None,
            None,
            thread.id(),
        );
        block
    }

    /// Lay the planned interpreter frames onto `thread` and finish the
    /// deoptimization. Returns the kind of the value the frames return.
    pub fn unpack_frames(&self, thread: &ExecThread, exec_mode: ExecMode) -> BasicType {
        planner::unpack_frames(thread, exec_mode, self.unpacker.as_ref(), self.config.verify_stack)
    }

    // -------------------------------------------------------------------------
    // Profiling
    // -------------------------------------------------------------------------

    /// Record a trap the interpreter took at `bci` of `method`.
    pub fn update_method_data_from_interpreter(&self, method: &Method, bci: u32, reason: DeoptReason) {
        let mdo = if self.config.profile_traps {
            Some(method.ensure_method_data(self.config.extra_data_slots as usize))
        } else {
            method.method_data()
        };
        if let Some(mdo) = mdo {
            policy::update_method_data_from_interpreter(mdo, bci, reason);
        }
    }

    /// Log the deoptimization histogram.
    pub fn print_statistics(&self) {
        self.stats.print_statistics();
    }
}

impl std::fmt::Debug for Deoptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deoptimizer")
            .field("config", &self.config)
            .field("generation", &self.generations.state())
            .field("traps", &self.stats.total_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use crate::code::{
        DebugInfo, Location, LocationType, MonitorValue, ObjectDescriptor, ObjectId, PcDesc,
        ScopeDesc, ScopeValue,
    };
    use crate::runtime::{
        CompiledFrame, ConstantPool, CpEntry, FieldDesc, Instruction, Klass, MethodId, ObjRef,
        Opcode, Pc, SlotValue, StubKind,
    };

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<TrapEvent>>,
    }

    impl DeoptEventSink for RecordingSink {
        fn record(&self, event: &TrapEvent) {
            self.events.lock().push(event.clone());
        }
    }

    struct Fixture {
        deopt: Deoptimizer,
        sink: Arc<RecordingSink>,
        heap: Arc<SimpleHeap>,
        method: Arc<Method>,
        region: Arc<CompiledRegion>,
        thread: Arc<ExecThread>,
    }

    fn method(constants: ConstantPool) -> Arc<Method> {
        Arc::new(
            Method::new(MethodId(1), "T", "run")
                .with_frame(1, 3, 4)
                .with_code(vec![
                    Instruction::Simple(Opcode::Nop),
                    Instruction::Indexed(Opcode::GetField, 0),
                    Instruction::Simple(Opcode::Return),
                ])
                .with_stack_depths(vec![0, 1, 0])
                .with_constants(constants),
        )
    }

    fn fixture_with(pc: impl FnOnce(&Arc<Method>) -> PcDesc, heap: SimpleHeap) -> Fixture {
        let method = method(ConstantPool::new(vec![CpEntry::UnresolvedClass("Missing".to_string())]));
        let cache = Arc::new(CodeCache::new());
        let threads = Arc::new(ThreadRegistry::new());
        let begin = cache.reserve(0x100);
        let region = cache.install(
            CompiledRegion::new(1, Arc::clone(&method), begin, 0x100)
                .with_frame_size(4)
                .with_debug_info(DebugInfo::new(vec![pc(&method)])),
        );
        let sink = Arc::new(RecordingSink::default());
        let heap = Arc::new(heap);
        let deopt = Deoptimizer::new(DeoptConfig::for_testing(), cache, Arc::clone(&threads))
            .with_sink(Arc::clone(&sink) as Arc<dyn DeoptEventSink>)
            .with_heap(Arc::clone(&heap) as Arc<dyn Heap>);
        let thread = threads.register(ThreadId(1), "main");
        Fixture {
            deopt,
            sink,
            heap,
            method,
            region,
            thread,
        }
    }

    fn trap_pc(method: &Arc<Method>) -> PcDesc {
        PcDesc::new(
            0x10,
            vec![ScopeDesc::new(Arc::clone(method), 1)
                .with_reexecute()
                .with_locals(vec![ScopeValue::Location(Location::stack(0, LocationType::Int))])
                .with_expressions(vec![ScopeValue::ConstOop(None)])],
        )
    }

    fn fixture() -> Fixture {
        fixture_with(trap_pc, SimpleHeap::new())
    }

    impl Fixture {
        /// Entry frame, the compiled frame and the trap stub.
        fn push_trapping_frame(&self) -> FrameId {
            let mut state = self.thread.state();
            state.push_frame(4, Pc(0x40), FrameKind::Entry);
            let cf = CompiledFrame::new(Arc::clone(&self.region))
                .with_stack_slots(vec![SlotValue::Raw(7), SlotValue::Raw(0), SlotValue::Raw(0), SlotValue::Raw(0)]);
            let id = state.push_frame(4, self.region.pc_at(0x10), FrameKind::Compiled(cf));
            state.push_frame(2, Pc(0x90), FrameKind::Stub(StubKind::UncommonTrapBlob));
            id
        }

        fn trap(&self, request: TrapRequest) -> UnrollBlock {
            self.push_trapping_frame();
            let block = self.deopt.uncommon_trap(&self.thread, request);
            self.deopt.unpack_frames(&self.thread, block.exec_mode());
            let mut state = self.thread.state();
            while state.pop_frame().is_some() {}
            block
        }

        fn last_action(&self) -> DeoptAction {
            self.sink
                .events
                .lock()
                .iter()
                .rev()
                .find(|e| e.kind == DeoptEventKind::UncommonTrap)
                .map(|e| e.action)
                .unwrap()
        }
    }

    // =========================================================================
    // Uncommon traps
    // =========================================================================

    #[test]
    fn test_repeated_trap_escalates_to_not_entrant() {
        let f = fixture();
        let request = TrapRequest::new(DeoptReason::NullCheck, DeoptAction::MaybeRecompile);
        let limit = f.deopt.config().per_bytecode_trap_limit;

        for _ in 0..limit {
            f.trap(request);
            assert!(f.region.is_in_use());
            assert_eq!(f.last_action(), DeoptAction::MaybeRecompile);
        }
        f.trap(request);
        assert!(!f.region.is_in_use());
        assert_eq!(f.last_action(), DeoptAction::MakeNotEntrant);

        let mdo = f.method.method_data().unwrap();
        assert_eq!(mdo.trap_count(DeoptReason::NullCheck), limit + 1);
        assert!(mdo.trap_state_at(1).unwrap().is_recompiled());
        assert_eq!(mdo.decompile_count(), 1);
        assert_eq!(f.deopt.stats().count(Some("null_check"), Some("maybe_recompile")), limit + 1);
    }

    #[test]
    fn test_trap_unpacks_interpreter_frame() {
        let f = fixture();
        f.push_trapping_frame();
        let block = f
            .deopt
            .uncommon_trap(&f.thread, TrapRequest::new(DeoptReason::RangeCheck, DeoptAction::MaybeRecompile));
        assert_eq!(block.exec_mode(), ExecMode::UncommonTrap);
        assert_eq!(block.number_of_frames(), 1);
        assert_eq!(f.deopt.unpack_frames(&f.thread, ExecMode::UncommonTrap), BasicType::Illegal);

        let state = f.thread.state();
        let top = state.last_frame().unwrap().as_interpreted().unwrap();
        assert_eq!(top.bci, 1);
        assert!(top.reexecute);
        assert_eq!(top.locals[0].as_int(), 7);
        assert_eq!(f.thread.in_deopt_handler(), 0);
    }

    #[test]
    fn test_unresolved_class_failure_is_swallowed() {
        let f = fixture();
        f.trap(TrapRequest::unloaded(0));
        assert!(!f.method.constants().is_resolved_class(0));
        assert!(!f.region.is_in_use());
        assert_eq!(f.last_action(), DeoptAction::Reinterpret);
    }

    #[test]
    fn test_unresolved_class_is_loaded() {
        let table = Arc::new(ClassTable::new());
        table.define(Arc::new(Klass::instance("Missing", None, Vec::new())));
        let mut f = fixture();
        f.deopt = f.deopt.with_resolver(table);
        f.trap(TrapRequest::unloaded(0));
        assert!(f.method.constants().is_resolved_class(0));
    }

    #[test]
    fn test_reinterpret_resets_counters() {
        let f = fixture();
        f.method.record_invocation();
        f.method.record_backedge();
        f.trap(TrapRequest::new(DeoptReason::ClassCheck, DeoptAction::Reinterpret));
        assert!(!f.region.is_in_use());
        assert_eq!(f.method.counters(), (0, 0));
        assert_eq!(f.last_action(), DeoptAction::Reinterpret);
    }

    #[test]
    fn test_make_not_compilable_hint() {
        let f = fixture();
        f.trap(TrapRequest::new(DeoptReason::Unhandled, DeoptAction::MakeNotCompilable));
        assert!(!f.region.is_in_use());
        assert!(f.method.is_not_compilable());
        assert_eq!(f.last_action(), DeoptAction::MakeNotCompilable);
    }

    #[test]
    fn test_none_hint_keeps_code_and_history() {
        let f = fixture();
        f.trap(TrapRequest::new(DeoptReason::NullCheck, DeoptAction::None));
        assert!(f.region.is_in_use());
        let mdo = f.method.method_data().unwrap();
        assert_eq!(mdo.trap_count(DeoptReason::NullCheck), 0);
        assert!(mdo.trap_state_at(1).is_none());
        assert_eq!(f.deopt.stats().count(Some("null_check"), Some("none")), 1);
    }

    #[test]
    fn test_tenured_counts_tenure_traps_only() {
        let f = fixture();
        f.trap(TrapRequest::new(DeoptReason::Tenured, DeoptAction::MakeNotEntrant));
        assert!(!f.region.is_in_use());
        let mdo = f.method.method_data().unwrap();
        assert_eq!(mdo.lock().tenure_traps(), 1);
        assert_eq!(mdo.trap_count(DeoptReason::Tenured), 0);
    }

    #[test]
    fn test_second_trap_on_dead_code_changes_nothing() {
        let f = fixture();
        let request = TrapRequest::new(DeoptReason::Unhandled, DeoptAction::MakeNotEntrant);
        f.trap(request);
        f.trap(request);
        assert_eq!(f.method.method_data().unwrap().decompile_count(), 1);
        assert_eq!(f.deopt.stats().total_count(), 2);
    }

    #[test]
    fn test_unprofiled_traps_follow_hint() {
        let mut f = fixture();
        let mut config = DeoptConfig::for_testing();
        config.profile_traps = false;
        f.deopt.config = config;
        let request = TrapRequest::new(DeoptReason::NullCheck, DeoptAction::MaybeRecompile);
        for _ in 0..5 {
            f.trap(request);
        }
        assert!(f.region.is_in_use());
        assert!(f.method.method_data().is_none());
    }

    // =========================================================================
    // Frame deoptimization
    // =========================================================================

    #[test]
    fn test_deoptimize_frame_patches_once() {
        let f = fixture();
        let id = f.push_trapping_frame();
        assert!(f.deopt.deoptimize_frame(&f.thread, id, DeoptReason::Constraint));
        assert!(!f.deopt.deoptimize_frame(&f.thread, id, DeoptReason::Constraint));
        {
            let state = f.thread.state();
            let frame = state.frame(id).unwrap();
            assert_eq!(frame.pc, f.region.deopt_handler());
            assert_eq!(frame.logical_pc(), f.region.pc_at(0x10));
        }
        assert_eq!(f.deopt.stats().count(Some("constraint"), Some("none")), 1);
        assert!(!f.deopt.deoptimize_frame(&f.thread, FrameId(99), DeoptReason::Constraint));
    }

    #[test]
    fn test_patched_frame_unwinds_in_plain_mode() {
        let f = fixture();
        let id = {
            let mut state = f.thread.state();
            state.push_frame(4, Pc(0x40), FrameKind::Entry);
            let cf = CompiledFrame::new(Arc::clone(&f.region)).with_stack_slots(vec![SlotValue::Raw(3); 4]);
            state.push_frame(4, f.region.pc_at(0x10), FrameKind::Compiled(cf))
        };
        f.deopt.deoptimize_frame(&f.thread, id, DeoptReason::Constraint);
        let block = f.deopt.fetch_unroll_info(&f.thread, ExecMode::Plain);
        assert_eq!(block.exec_mode(), ExecMode::Plain);
        f.deopt.unpack_frames(&f.thread, ExecMode::Plain);
        let state = f.thread.state();
        assert!(state.last_frame().unwrap().is_interpreted());
        assert!(f.sink.events.lock().iter().any(|e| e.kind == DeoptEventKind::Unrolled(ExecMode::Plain)));
    }

    // =========================================================================
    // Object deoptimization
    // =========================================================================

    fn eliminated_pc(method: &Arc<Method>) -> PcDesc {
        let klass = Arc::new(Klass::instance("Cell", None, vec![FieldDesc::new("v", crate::runtime::BasicType::Int)]));
        PcDesc::new(
            0x10,
            vec![ScopeDesc::new(Arc::clone(method), 1)
                .with_reexecute()
                .with_locals(vec![ScopeValue::Object(ObjectId(0))])
                .with_expressions(vec![ScopeValue::ConstInt(0)])
                .with_monitors(vec![MonitorValue::new(ScopeValue::Object(ObjectId(0)), true)])],
        )
        .with_objects(vec![ObjectDescriptor::new(ObjectId(0), klass, vec![ScopeValue::ConstInt(42)])])
    }

    fn local_obj(f: &Fixture) -> ObjRef {
        let state = f.thread.state();
        let top = state.last_frame().unwrap().as_interpreted().unwrap();
        top.locals[0].as_obj().cloned().unwrap()
    }

    #[test]
    fn test_deoptimize_objects_kept_for_unwind() {
        let f = fixture_with(eliminated_pc, SimpleHeap::new());
        let id = f.push_trapping_frame();
        assert_eq!(f.deopt.deoptimize_objects(&f.thread, id), ObjectDeoptOutcome::Restored);
        assert!(f.thread.state().objs_are_deoptimized(id));
        assert_eq!(f.deopt.deoptimize_objects(&f.thread, id), ObjectDeoptOutcome::Restored);
        assert_eq!(f.heap.allocation_count(), 1);

        // The frame is patched; unwinding reuses the restored object.
        f.thread.state().pop_frame();
        f.deopt.fetch_unroll_info(&f.thread, ExecMode::Plain);
        f.deopt.unpack_frames(&f.thread, ExecMode::Plain);
        assert_eq!(f.heap.allocation_count(), 1);
        let obj = local_obj(&f);
        assert_eq!(obj.prim_field(0), 42);
        assert_eq!(obj.monitor().hold_count(ThreadId(1)), 1);
        assert!(!f.thread.state().objs_are_deoptimized(id));
    }

    #[test]
    fn test_deoptimize_objects_without_eliminated_state() {
        let f = fixture();
        let id = f.push_trapping_frame();
        assert_eq!(f.deopt.deoptimize_objects(&f.thread, id), ObjectDeoptOutcome::NothingEliminated);
        assert!(!f.thread.state().objs_are_deoptimized(id));
    }

    #[test]
    fn test_deoptimize_objects_realloc_failure() {
        let f = fixture_with(eliminated_pc, SimpleHeap::new().with_allocation_limit(0));
        let id = f.push_trapping_frame();
        assert_eq!(f.deopt.deoptimize_objects(&f.thread, id), ObjectDeoptOutcome::ReallocFailed);
        let state = f.thread.state();
        assert!(!state.objs_are_deoptimized(id));
        assert!(!state.has_pending_exception());
        assert!(!state.frame(id).unwrap().as_compiled().unwrap().is_deopt_pending());
    }

    #[test]
    fn test_failed_realloc_takes_no_locks() {
        let lock_klass = Arc::new(Klass::instance("Lock", None, Vec::new()));
        let lock = SimpleHeap::new().allocate_instance(&lock_klass).unwrap();
        let owner = Arc::clone(&lock);
        let f = fixture_with(
            move |method| {
                let mut pc = eliminated_pc(method);
                pc.scopes[0]
                    .monitors
                    .insert(0, MonitorValue::new(ScopeValue::ConstOop(Some(owner)), true));
                pc
            },
            SimpleHeap::new().with_allocation_limit(0),
        );
        let id = f.push_trapping_frame();

        for _ in 0..2 {
            assert_eq!(f.deopt.deoptimize_objects(&f.thread, id), ObjectDeoptOutcome::ReallocFailed);
            assert_eq!(lock.monitor().hold_count(ThreadId(1)), 0);
        }
        assert!(lock.monitor().owner().is_none());
        assert!(!f.thread.state().objs_are_deoptimized(id));
    }

    #[test]
    fn test_deferred_relock_when_waiting() {
        let lock_klass = Arc::new(Klass::instance("Lock", None, Vec::new()));
        let lock = SimpleHeap::new().allocate_instance(&lock_klass).unwrap();
        let owner = Arc::clone(&lock);
        let f = fixture_with(
            move |method| {
                PcDesc::new(
                    0x10,
                    vec![ScopeDesc::new(Arc::clone(method), 1)
                        .with_reexecute()
                        .with_expressions(vec![ScopeValue::ConstInt(0)])
                        .with_monitors(vec![MonitorValue::new(ScopeValue::ConstOop(Some(owner)), true)])],
                )
            },
            SimpleHeap::new(),
        );
        let id = f.push_trapping_frame();
        f.thread.set_waiting_on(Some(Arc::clone(&lock)));

        assert_eq!(f.deopt.deoptimize_objects(&f.thread, id), ObjectDeoptOutcome::Restored);
        assert!(lock.monitor().owner().is_none());
        assert_eq!(f.thread.relock_count_after_wait(), 1);
    }

    // =========================================================================
    // Interpreter profiling
    // =========================================================================

    #[test]
    fn test_interpreter_trap_updates_state_not_count() {
        let f = fixture();
        f.deopt
            .update_method_data_from_interpreter(&f.method, 1, DeoptReason::RangeCheck);
        let mdo = f.method.method_data().unwrap();
        assert_eq!(mdo.trap_count(DeoptReason::RangeCheck), 0);
        let state = mdo.trap_state_at(1).unwrap();
        assert!(state.has_reason(DeoptReason::RangeCheck).as_bool());
    }
}
