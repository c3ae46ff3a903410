//! Runtime collaborators of the deoptimization engine.
//!
//! Methods and classes, a heap, object monitors, execution threads with
//! their physical stacks, and the registry that synchronizes them.

pub mod heap;
pub mod method;
pub mod monitor;
pub mod registry;
pub mod stack;
pub mod thread;

pub use heap::{BoxCaches, BoxLookup, FieldValue, Heap, HeapObject, ObjRef, ObjectBody, SimpleHeap};
pub use method::{
    BasicType, ClassResolver, ClassTable, ConstantPool, CpEntry, FieldDesc, FieldSlot,
    Instruction, InvokeInfo, Klass, KlassKind, Method, MethodId, Opcode,
};
pub use monitor::ObjectMonitor;
pub use registry::{RegistryStats, SafepointGuard, ThreadRegistry};
pub use stack::{
    BasicObjectLock, CompiledFrame, FrameId, FrameKind, InterpretedFrame, Pc, PhysicalFrame,
    RegisterFile, STACK_BASE, SlotValue, StubKind,
};
pub use thread::{ExecThread, NoSafepointScope, ThreadId, ThreadState, ThrownException};
