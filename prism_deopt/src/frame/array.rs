//! Packed logical frames awaiting unpacking.
//!
//! A [`VFrameArray`] is a self-contained copy of a compiled frame's logical
//! frames: resolved locals, expression stacks and monitors. It outlives the
//! compiled frame and is what the unpacker turns into interpreter frames.

use std::sync::Arc;

use crate::frame::layout::size_activation;
use crate::frame::vframe::CompiledVFrame;
use crate::frame::{StackValue, UnrollBlock};
use crate::reversal::Rematerialized;
use crate::runtime::{BasicObjectLock, FrameId, Method, Pc, PhysicalFrame, ThreadId};

// =============================================================================
// VFrameArrayElement
// =============================================================================

/// One packed logical frame.
#[derive(Debug, Clone)]
pub struct VFrameArrayElement {
    method: Arc<Method>,
    bci: u32,
    reexecute: bool,
    locals: Vec<StackValue>,
    expressions: Vec<StackValue>,
    monitors: Vec<BasicObjectLock>,
    removed_monitors: bool,
}

impl VFrameArrayElement {
    pub(crate) fn fill_in(vf: &CompiledVFrame<'_>, objects: &Rematerialized) -> Self {
        let monitors = vf
            .monitors(objects)
            .into_iter()
            .map(|m| BasicObjectLock {
                obj: if m.owner_is_scalar_replaced { None } else { m.owner },
            })
            .collect();
        Self {
            method: Arc::clone(vf.method()),
            bci: vf.bci(),
            reexecute: vf.should_reexecute(),
            locals: vf.locals(objects),
            expressions: vf.expressions(objects),
            monitors,
            removed_monitors: false,
        }
    }

    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    #[inline]
    pub fn bci(&self) -> u32 {
        self.bci
    }

    #[inline]
    pub fn should_reexecute(&self) -> bool {
        self.reexecute
    }

    #[inline]
    pub fn locals(&self) -> &[StackValue] {
        &self.locals
    }

    #[inline]
    pub fn expressions(&self) -> &[StackValue] {
        &self.expressions
    }

    #[inline]
    pub fn monitors(&self) -> &[BasicObjectLock] {
        &self.monitors
    }

    /// Whether monitors were released after a failed reallocation.
    #[inline]
    pub fn removed_monitors(&self) -> bool {
        self.removed_monitors
    }

    /// Words of the interpreter frame this element unpacks into.
    ///
    /// `callee_params` and `callee_locals` describe the next inner frame,
    /// whose arguments this frame's expression stack holds.
    pub fn on_stack_size(
        &self,
        callee_params: usize,
        callee_locals: usize,
        is_top: bool,
        extra_args: usize,
    ) -> usize {
        size_activation(
            usize::from(self.method.max_stack()),
            self.expressions.len() + callee_params,
            extra_args,
            self.monitors.len(),
            callee_params,
            callee_locals,
            is_top,
        )
    }

    fn free_monitors(&mut self) {
        self.monitors.clear();
        self.removed_monitors = true;
    }
}

// =============================================================================
// VFrameArray
// =============================================================================

/// Logical frames of one compiled frame, innermost first.
#[derive(Debug)]
pub struct VFrameArray {
    owner: ThreadId,
    original: FrameId,
    original_pc: Pc,
    unextended_sp: usize,
    caller_sp: usize,
    elements: Vec<VFrameArrayElement>,
    realloc_failures: bool,
    unroll_block: Option<UnrollBlock>,
}

impl VFrameArray {
    pub(crate) fn allocate(
        owner: ThreadId,
        deoptee: &PhysicalFrame,
        chunk: &[CompiledVFrame<'_>],
        objects: &Rematerialized,
        realloc_failures: bool,
    ) -> Self {
        let elements = chunk
            .iter()
            .map(|vf| VFrameArrayElement::fill_in(vf, objects))
            .collect();
        let array = Self {
            owner,
            original: deoptee.id,
            original_pc: deoptee.logical_pc(),
            unextended_sp: deoptee.sp,
            caller_sp: deoptee.caller_sp(),
            elements,
            realloc_failures,
            unroll_block: None,
        };
        debug_assert!(array.structural_compare(chunk));
        array
    }

    /// Thread whose frame was packed.
    #[inline]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Id of the compiled frame this array replaces.
    #[inline]
    pub fn original(&self) -> FrameId {
        self.original
    }

    /// Pc of the compiled frame before it was patched.
    #[inline]
    pub fn original_pc(&self) -> Pc {
        self.original_pc
    }

    #[inline]
    pub fn unextended_sp(&self) -> usize {
        self.unextended_sp
    }

    #[inline]
    pub fn caller_sp(&self) -> usize {
        self.caller_sp
    }

    /// Size of the compiled frame in words.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.caller_sp - self.unextended_sp
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.elements.len()
    }

    #[inline]
    pub fn element(&self, index: usize) -> &VFrameArrayElement {
        &self.elements[index]
    }

    #[inline]
    pub fn elements(&self) -> &[VFrameArrayElement] {
        &self.elements
    }

    #[inline]
    pub fn realloc_failures(&self) -> bool {
        self.realloc_failures
    }

    #[inline]
    pub fn unroll_block(&self) -> Option<&UnrollBlock> {
        self.unroll_block.as_ref()
    }

    pub(crate) fn set_unroll_block(&mut self, block: UnrollBlock) {
        self.unroll_block = Some(block);
    }

    /// Same methods and bcis as the logical frames it was packed from.
    pub fn structural_compare(&self, chunk: &[CompiledVFrame<'_>]) -> bool {
        self.elements.len() == chunk.len()
            && self
                .elements
                .iter()
                .zip(chunk)
                .all(|(e, vf)| Arc::ptr_eq(&e.method, vf.method()) && e.bci == vf.bci())
    }

    /// Release every monitor of every element, innermost monitor of each
    /// frame first, and return the number of frames to pop.
    ///
    /// Used when some eliminated object could not be reallocated: the
    /// interpreter must not see a mix of held and missing locks.
    pub(crate) fn pop_frames_failed_reallocs(&mut self) -> usize {
        let thread = self.owner;
        for element in &mut self.elements {
            for lock in element.monitors.iter().rev() {
                if let Some(obj) = &lock.obj {
                    let released = obj.monitor().exit(thread);
                    debug_assert!(released, "monitor of {obj:?} not held by {thread:?}");
                }
            }
            element.free_monitors();
        }
        self.elements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CompiledRegion, MonitorValue, ObjectId, PcDesc, ScopeDesc, ScopeValue};
    use crate::frame::vframe::virtual_frames;
    use crate::runtime::{
        CompiledFrame, FrameKind, Heap, Klass, MethodId, SimpleHeap, SlotValue, STACK_BASE,
    };

    struct Fixture {
        frame: PhysicalFrame,
        pc: PcDesc,
        obj: crate::runtime::ObjRef,
    }

    fn fixture() -> Fixture {
        let inner = Arc::new(Method::new(MethodId(1), "A", "inner").with_frame(1, 3, 4));
        let outer = Arc::new(Method::new(MethodId(2), "A", "outer").with_frame(2, 5, 6));
        let region = Arc::new(
            CompiledRegion::new(1, Arc::clone(&outer), Pc(0x4000), 0x80).with_frame_size(6),
        );
        let heap = SimpleHeap::new();
        let obj = heap
            .allocate_instance(&Arc::new(Klass::instance("L", None, Vec::new())))
            .unwrap();
        let cf = CompiledFrame::new(region).with_stack_slots(vec![SlotValue::Raw(9); 6]);
        let frame = PhysicalFrame {
            id: FrameId(7),
            sp: STACK_BASE - 16,
            size_words: 6,
            pc: Pc(0x4010),
            kind: FrameKind::Compiled(cf),
        };
        let pc = PcDesc::new(
            0x10,
            vec![
                ScopeDesc::new(inner, 2)
                    .with_locals(vec![ScopeValue::ConstInt(1)])
                    .with_monitors(vec![
                        MonitorValue::new(ScopeValue::ConstOop(Some(Arc::clone(&obj))), false),
                        MonitorValue::new(ScopeValue::Object(ObjectId(3)), true),
                    ]),
                ScopeDesc::new(outer, 5).with_expressions(vec![ScopeValue::ConstInt(4)]),
            ],
        );
        Fixture { frame, pc, obj }
    }

    #[test]
    fn test_allocate_packs_elements() {
        let f = fixture();
        let cf = f.frame.as_compiled().unwrap();
        let chunk = virtual_frames(cf, &f.pc);
        let array = VFrameArray::allocate(
            ThreadId(1),
            &f.frame,
            &chunk,
            &Rematerialized::default(),
            false,
        );
        assert_eq!(array.frames(), 2);
        assert_eq!(array.original(), FrameId(7));
        assert_eq!(array.frame_size(), 6);
        assert_eq!(array.element(0).bci(), 2);
        assert_eq!(array.element(0).locals()[0].as_int(), 1);
        assert_eq!(array.element(1).expressions().len(), 1);
        assert!(array.element(0).monitors()[0].obj.as_ref().unwrap().is(&f.obj));
        assert!(array.element(0).monitors()[1].obj.is_none());
        assert!(array.structural_compare(&chunk));
    }

    #[test]
    fn test_on_stack_size() {
        let f = fixture();
        let cf = f.frame.as_compiled().unwrap();
        let chunk = virtual_frames(cf, &f.pc);
        let array = VFrameArray::allocate(
            ThreadId(1),
            &f.frame,
            &chunk,
            &Rematerialized::default(),
            false,
        );
        // inner: top, max_stack 4, two monitors
        assert_eq!(array.element(0).on_stack_size(0, 0, true, 0), 10 + 4 + 4);
        // outer: callee has 1 param and 3 locals, one temp
        assert_eq!(array.element(1).on_stack_size(1, 3, false, 0), 10 + 2 + 2);
    }

    #[test]
    fn test_pop_frames_failed_reallocs_unlocks() {
        let f = fixture();
        f.obj.monitor().enter_for(ThreadId(1));
        let cf = f.frame.as_compiled().unwrap();
        let chunk = virtual_frames(cf, &f.pc);
        let mut array = VFrameArray::allocate(
            ThreadId(1),
            &f.frame,
            &chunk,
            &Rematerialized::default(),
            true,
        );
        assert_eq!(array.pop_frames_failed_reallocs(), 2);
        assert!(f.obj.monitor().owner().is_none());
        assert!(array.elements().iter().all(|e| e.monitors().is_empty()));
        assert!(array.element(0).removed_monitors());
    }
}
