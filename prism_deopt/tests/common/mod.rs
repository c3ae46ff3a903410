//! Shared runtime builder for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use prism_deopt::code::{CodeCache, CompiledRegion, DebugInfo, PcDesc};
use prism_deopt::runtime::{
    BasicType, CompiledFrame, ExecThread, FrameId, FrameKind, Heap, Instruction, InvokeInfo,
    InterpretedFrame, Method, MethodId, Pc, SimpleHeap, SlotValue, StubKind, ThreadId,
    ThreadRegistry,
};
use prism_deopt::{DeoptConfig, Deoptimizer};

/// Install a subscriber once so `RUST_LOG=prism_deopt=trace` shows engine logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn invoke(parameter_slots: u16, result: BasicType) -> Instruction {
    Instruction::Invoke(InvokeInfo {
        parameter_slots,
        result,
        has_member_arg: false,
    })
}

/// A method with the given frame shape, code and per-bci stack depths.
pub fn method(
    id: u32,
    name: &str,
    frame: (u16, u16, u16),
    code: Vec<Instruction>,
    depths: Vec<u16>,
) -> Arc<Method> {
    let (params, locals, max_stack) = frame;
    Arc::new(
        Method::new(MethodId(id), "Test", name)
            .with_frame(params, locals, max_stack)
            .with_code(code)
            .with_stack_depths(depths),
    )
}

/// A deoptimizer with its code cache, thread registry and heap.
pub struct Runtime {
    pub deopt: Deoptimizer,
    pub cache: Arc<CodeCache>,
    pub threads: Arc<ThreadRegistry>,
    pub heap: Arc<SimpleHeap>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with(DeoptConfig::for_testing(), SimpleHeap::new())
    }

    pub fn with(config: DeoptConfig, heap: SimpleHeap) -> Self {
        init_tracing();
        let cache = Arc::new(CodeCache::new());
        let threads = Arc::new(ThreadRegistry::new());
        threads.mark_initialized();
        let heap = Arc::new(heap);
        let deopt = Deoptimizer::new(config, Arc::clone(&cache), Arc::clone(&threads))
            .with_heap(Arc::clone(&heap) as Arc<dyn Heap>);
        Self {
            deopt,
            cache,
            threads,
            heap,
        }
    }

    /// Install code for `method` with debug info at `pcs`.
    pub fn install(&self, compile_id: u32, method: &Arc<Method>, pcs: Vec<PcDesc>) -> Arc<CompiledRegion> {
        let begin = self.cache.reserve(0x200);
        self.cache.install(
            CompiledRegion::new(compile_id, Arc::clone(method), begin, 0x200)
                .with_frame_size(8)
                .with_debug_info(DebugInfo::new(pcs)),
        )
    }

    pub fn thread(&self, id: u64) -> Arc<ExecThread> {
        self.threads.register(ThreadId(id), format!("worker-{id}"))
    }
}

/// What sits below the compiled frame.
pub enum Caller {
    Entry,
    Interpreted(Arc<Method>, u32),
    /// Whatever the test already pushed.
    Existing,
}

/// Push the caller, a compiled frame of `region` stopped at `pc_offset`,
/// and optionally the uncommon trap stub. Returns the compiled frame's id.
pub fn push_compiled(
    thread: &ExecThread,
    caller: Caller,
    region: &Arc<CompiledRegion>,
    pc_offset: u32,
    slots: Vec<SlotValue>,
    with_trap_stub: bool,
) -> FrameId {
    let mut state = thread.state();
    match caller {
        Caller::Entry => {
            state.push_frame(4, Pc(0x40), FrameKind::Entry);
        }
        Caller::Interpreted(method, bci) => {
            let words = 10 + usize::from(method.max_locals()) + usize::from(method.max_stack());
            state.push_frame(words, Pc(0x44), FrameKind::Interpreted(InterpretedFrame::new(method, bci)));
        }
        Caller::Existing => {}
    }
    let words = slots.len().max(region.frame_size_words());
    let cf = CompiledFrame::new(Arc::clone(region)).with_stack_slots(slots);
    let id = state.push_frame(words, region.pc_at(pc_offset), FrameKind::Compiled(cf));
    if with_trap_stub {
        state.push_frame(2, Pc(0x90), FrameKind::Stub(StubKind::UncommonTrapBlob));
    }
    id
}

/// Unwind whatever the thread has on its stack.
pub fn clear_stack(thread: &ExecThread) {
    let mut state = thread.state();
    while state.pop_frame().is_some() {}
}
