//! Planning and laying down interpreter frames for inlined code.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use common::{Caller, Runtime, invoke, method, push_compiled};
use prism_deopt::code::{Location, LocationType, MonitorValue, PcDesc, ScopeDesc, ScopeValue};
use prism_deopt::events::{DeoptEventKind, DeoptEventSink, TrapEvent};
use prism_deopt::frame::{VFrameArray, WORD_BYTES};
use prism_deopt::runtime::{
    BasicType, CompiledFrame, FrameKind, Heap, Instruction, Klass, Method, ObjRef, Opcode, Pc,
    SimpleHeap, SlotValue, ThreadId, ThreadState,
};
use prism_deopt::unpacker::{INTERPRETER_DEOPT_ENTRY, InterpreterUnpacker, StackUnpacker};
use prism_deopt::{DeoptAction, DeoptReason, ExecMode, TrapRequest};

const TRAP_PC: u32 = 0x30;
const CALL_PC: u32 = 0x18;

struct Chain {
    main: Arc<Method>,
    outer: Arc<Method>,
    mid: Arc<Method>,
    leaf: Arc<Method>,
}

/// `main` calls `outer`, which inlines `mid`, which inlines `leaf`.
fn chain() -> Chain {
    Chain {
        main: method(
            1,
            "main",
            (0, 1, 2),
            vec![invoke(1, BasicType::Void), Instruction::Simple(Opcode::Return)],
            vec![1, 0],
        ),
        outer: method(
            2,
            "outer",
            (1, 2, 4),
            vec![Instruction::Simple(Opcode::Nop), invoke(1, BasicType::Int), Instruction::Simple(Opcode::Return)],
            vec![0, 2, 0],
        ),
        mid: method(
            3,
            "mid",
            (1, 4, 5),
            vec![
                Instruction::Simple(Opcode::Nop),
                Instruction::Simple(Opcode::Nop),
                invoke(2, BasicType::Int),
                Instruction::Simple(Opcode::Return),
            ],
            vec![0, 0, 3, 0],
        ),
        leaf: method(
            4,
            "leaf",
            (2, 3, 3),
            vec![
                Instruction::Simple(Opcode::Nop),
                Instruction::Simple(Opcode::ArrayLoad),
                Instruction::Simple(Opcode::Return),
            ],
            vec![0, 2, 0],
        ),
    }
}

fn trap_point(c: &Chain, lock: &ObjRef) -> PcDesc {
    PcDesc::new(
        TRAP_PC,
        vec![
            ScopeDesc::new(Arc::clone(&c.leaf), 1)
                .with_reexecute()
                .with_locals(vec![
                    ScopeValue::Location(Location::stack(0, LocationType::Int)),
                    ScopeValue::ConstInt(6),
                    ScopeValue::ConstInt(0),
                ])
                .with_expressions(vec![ScopeValue::ConstOop(None), ScopeValue::ConstInt(1)]),
            ScopeDesc::new(Arc::clone(&c.mid), 2)
                .with_locals(vec![ScopeValue::ConstInt(3)])
                .with_expressions(vec![ScopeValue::Location(Location::stack(1, LocationType::Int))]),
            ScopeDesc::new(Arc::clone(&c.outer), 1)
                .with_locals(vec![ScopeValue::ConstOop(Some(Arc::clone(lock))), ScopeValue::ConstInt(0)])
                .with_expressions(vec![ScopeValue::ConstInt(9)])
                .with_monitors(vec![MonitorValue::new(ScopeValue::ConstOop(Some(Arc::clone(lock))), false)]),
        ],
    )
}

fn lock_object() -> ObjRef {
    SimpleHeap::new()
        .allocate_instance(&Arc::new(Klass::instance("Lock", None, Vec::new())))
        .unwrap()
}

fn slots() -> Vec<SlotValue> {
    vec![SlotValue::Raw(5), SlotValue::Raw(8), SlotValue::Raw(0), SlotValue::Raw(0)]
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<TrapEvent>>,
}

impl DeoptEventSink for RecordingSink {
    fn record(&self, event: &TrapEvent) {
        self.events.lock().push(event.clone());
    }
}

// =============================================================================
// Planning
// =============================================================================

#[test]
fn test_three_inlined_frames_under_interpreted_caller() {
    let c = chain();
    let lock = lock_object();
    lock.monitor().enter_for(ThreadId(1));
    let mut rt = Runtime::new();
    let sink = Arc::new(RecordingSink::default());
    rt.deopt = rt.deopt.with_sink(Arc::clone(&sink) as Arc<dyn DeoptEventSink>);
    let region = rt.install(1, &c.outer, vec![trap_point(&c, &lock)]);
    let thread = rt.thread(1);
    push_compiled(&thread, Caller::Interpreted(Arc::clone(&c.main), 0), &region, TRAP_PC, slots(), true);

    let block = rt
        .deopt
        .uncommon_trap(&thread, TrapRequest::new(DeoptReason::RangeCheck, DeoptAction::MaybeRecompile));

    assert_eq!(block.number_of_frames(), 3);
    // outer: one callee-only local, a monitor and two temporaries
    // mid: one callee-only local and three temporaries
    // leaf: full max_stack
    let words: Vec<usize> = block.frame_sizes().iter().map(|b| b / WORD_BYTES).collect();
    assert_eq!(words, vec![17, 14, 13]);
    assert_eq!(block.caller_adjustment(), WORD_BYTES);
    assert_eq!(block.caller_actual_parameters(), Some(1));
    assert_eq!(block.total_frame_sizes(), WORD_BYTES * (17 + 14 + 13 + 1));
    assert_eq!(block.frame_pcs()[0], Pc(0x44));
    assert!(block.frame_pcs()[1..].iter().all(|&pc| pc == INTERPRETER_DEOPT_ENTRY));
    assert_eq!(block.return_type(), BasicType::Illegal);
    assert_eq!(rt.deopt.stats().count(Some("range_check"), None), 1);

    assert_eq!(rt.deopt.unpack_frames(&thread, ExecMode::UncommonTrap), BasicType::Illegal);
    let state = thread.state();
    let frames = state.frames();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[1].size_words, 18);
    assert_eq!(frames[2].size_words, 14);
    assert_eq!(frames[3].size_words, 13);

    let outer = frames[1].as_interpreted().unwrap();
    assert!(Arc::ptr_eq(&outer.method, &c.outer));
    assert!(outer.monitors[0].obj.as_ref().unwrap().is(&lock));
    let mid = frames[2].as_interpreted().unwrap();
    assert_eq!(mid.expressions[0].as_int(), 8);
    assert!(!mid.reexecute);
    let leaf = frames[3].as_interpreted().unwrap();
    assert!(leaf.reexecute);
    assert_eq!(leaf.locals[0].as_int(), 5);
    assert_eq!(leaf.expressions.len(), 2);
    drop(state);

    // Nothing was eliminated, so the lock is held exactly once.
    assert_eq!(lock.monitor().hold_count(ThreadId(1)), 1);
    let kinds: Vec<DeoptEventKind> = sink.events.lock().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![DeoptEventKind::UncommonTrap, DeoptEventKind::Unrolled(ExecMode::UncommonTrap)]);
}

#[test]
fn test_compiled_caller_gets_full_local_area() {
    let c = chain();
    let lock = lock_object();
    lock.monitor().enter_for(ThreadId(1));
    let rt = Runtime::new();
    let region = rt.install(1, &c.outer, vec![trap_point(&c, &lock)]);
    let thread = rt.thread(1);
    push_compiled(&thread, Caller::Entry, &region, TRAP_PC, slots(), true);

    let block = rt
        .deopt
        .uncommon_trap(&thread, TrapRequest::new(DeoptReason::RangeCheck, DeoptAction::MaybeRecompile));
    assert_eq!(block.caller_adjustment(), WORD_BYTES * 2);
    assert_eq!(block.caller_actual_parameters(), None);
    rt.deopt.unpack_frames(&thread, ExecMode::UncommonTrap);
    assert_eq!(thread.state().frames()[1].size_words, 17 + 2);
}

#[test]
fn test_deoptimized_compiled_caller_resumes_in_its_handler() {
    let c = chain();
    let lock = lock_object();
    lock.monitor().enter_for(ThreadId(1));
    let rt = Runtime::new();
    let caller_region = rt.install(
        2,
        &c.main,
        vec![PcDesc::new(CALL_PC, vec![ScopeDesc::new(Arc::clone(&c.main), 0)])],
    );
    let region = rt.install(1, &c.outer, vec![trap_point(&c, &lock)]);
    let thread = rt.thread(1);

    let caller = {
        let mut state = thread.state();
        state.push_frame(4, Pc(0x40), FrameKind::Entry);
        let cf = CompiledFrame::new(Arc::clone(&caller_region)).with_stack_slots(vec![SlotValue::Raw(0); 8]);
        state.push_frame(8, caller_region.pc_at(CALL_PC), FrameKind::Compiled(cf))
    };
    push_compiled(&thread, Caller::Existing, &region, TRAP_PC, slots(), true);

    // The caller is invalidated while its callee is still running.
    assert!(rt.deopt.deoptimize_frame(&thread, caller, DeoptReason::Constraint));

    let block = rt
        .deopt
        .uncommon_trap(&thread, TrapRequest::new(DeoptReason::RangeCheck, DeoptAction::MaybeRecompile));
    assert_eq!(block.frame_pcs()[0], caller_region.deopt_handler());
    assert_ne!(block.frame_pcs()[0], caller_region.pc_at(CALL_PC));
    // No interpreter parameter area: outer's two locals come from the caller.
    assert_eq!(block.caller_adjustment(), WORD_BYTES * 2);
    assert_eq!(block.caller_actual_parameters(), None);

    rt.deopt.unpack_frames(&thread, ExecMode::UncommonTrap);
    let state = thread.state();
    let frames = state.frames();
    assert_eq!(frames.len(), 5);
    assert!(frames[1].is_compiled());
    assert_eq!(frames[1].pc, caller_region.deopt_handler());
    assert_eq!(frames[2].size_words, 17 + 2);
    assert!(frames[2..].iter().all(|f| f.as_interpreted().is_some()));
}

// =============================================================================
// Custom unpackers
// =============================================================================

/// Delegates to the interpreter unpacker and remembers what it laid down.
#[derive(Default)]
struct TracingUnpacker {
    unpacked: Mutex<Vec<(String, u32)>>,
}

impl StackUnpacker for TracingUnpacker {
    fn unpack(&self, state: &mut ThreadState, array: &VFrameArray, exec_mode: ExecMode) {
        InterpreterUnpacker.unpack(state, array, exec_mode);
        let mut unpacked = self.unpacked.lock();
        for element in array.elements().iter().rev() {
            unpacked.push((element.method().name().to_string(), element.bci()));
        }
    }
}

#[test]
fn test_custom_unpacker_sees_outermost_first() {
    let c = chain();
    let lock = lock_object();
    lock.monitor().enter_for(ThreadId(1));
    let unpacker = Arc::new(TracingUnpacker::default());
    let mut rt = Runtime::new();
    rt.deopt = rt.deopt.with_unpacker(Arc::clone(&unpacker) as Arc<dyn StackUnpacker>);
    let region = rt.install(1, &c.outer, vec![trap_point(&c, &lock)]);
    let thread = rt.thread(1);
    push_compiled(&thread, Caller::Interpreted(Arc::clone(&c.main), 0), &region, TRAP_PC, slots(), true);

    rt.deopt
        .uncommon_trap(&thread, TrapRequest::new(DeoptReason::NullCheck, DeoptAction::MaybeRecompile));
    rt.deopt.unpack_frames(&thread, ExecMode::UncommonTrap);

    let unpacked = unpacker.unpacked.lock();
    assert_eq!(
        *unpacked,
        vec![("outer".to_string(), 1), ("mid".to_string(), 2), ("leaf".to_string(), 1)]
    );
    assert!(thread.state().vframe_array_last().is_some());
    assert_eq!(thread.in_deopt_handler(), 0);
}
