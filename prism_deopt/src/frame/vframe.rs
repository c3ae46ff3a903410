//! Logical frames of a compiled activation.
//!
//! One compiled frame can stand for several inlined calls. Each
//! [`CompiledVFrame`] pairs the physical frame with one scope of its debug
//! information and resolves the scope's value sources on demand, after
//! eliminated objects have been rematerialized.

use std::sync::Arc;

use crate::code::{Location, LocationKind, LocationType, PcDesc, ScopeDesc, ScopeValue};
use crate::frame::StackValue;
use crate::guarantee;
use crate::reversal::Rematerialized;
use crate::runtime::{CompiledFrame, Method, ObjRef, SlotValue};

// =============================================================================
// Value resolution
// =============================================================================

fn read_slot<'f>(frame: &'f CompiledFrame, loc: &Location) -> &'f SlotValue {
    let slot = match loc.kind {
        LocationKind::Stack(index) => frame.stack_slots.get(index as usize),
        LocationKind::Register(reg) => frame.registers.get(reg as usize),
    };
    match slot {
        Some(slot) => slot,
        None => crate::error::fatal(format_args!(
            "location {:?} outside frame of {}",
            loc.kind,
            frame.region.method().qualified_name()
        )),
    }
}

/// Read the value at `loc` in `frame`.
pub fn read_location(frame: &CompiledFrame, loc: &Location) -> StackValue {
    if loc.ty == LocationType::Invalid {
        return StackValue::ZERO;
    }
    let slot = read_slot(frame, loc);
    match (loc.ty, slot) {
        (LocationType::Oop, SlotValue::Oop(obj)) => StackValue::Obj(obj.clone()),
        (LocationType::Oop, SlotValue::Raw(0)) => StackValue::NULL,
        (LocationType::Oop, SlotValue::Raw(bits)) => crate::error::fatal(format_args!(
            "reference location {:?} holds raw word {bits:#x}",
            loc.kind
        )),
        (LocationType::Int, slot) => StackValue::Int(slot.raw() as i32 as i64),
        (_, slot) => StackValue::Int(slot.raw()),
    }
}

/// Resolve one value source of a scope or eliminated object.
///
/// Eliminated objects resolve to their rematerialized instance, or null if
/// reallocation failed.
pub fn resolve_value(
    value: &ScopeValue,
    frame: &CompiledFrame,
    objects: &Rematerialized,
) -> StackValue {
    match value {
        ScopeValue::ConstInt(v) => StackValue::Int(i64::from(*v)),
        ScopeValue::ConstLong(v) => StackValue::Int(*v),
        ScopeValue::ConstDouble(v) => StackValue::Int(v.to_bits() as i64),
        ScopeValue::ConstOop(obj) => StackValue::Obj(obj.clone()),
        ScopeValue::Location(loc) => read_location(frame, loc),
        ScopeValue::Object(id) => StackValue::Obj(objects.get(*id)),
        ScopeValue::Marker | ScopeValue::Illegal => StackValue::ZERO,
    }
}

// =============================================================================
// MonitorInfo
// =============================================================================

/// A monitor held by a logical frame, with its owner resolved.
#[derive(Debug, Clone)]
pub struct MonitorInfo {
    pub owner: Option<ObjRef>,
    /// The compiler removed the locking; it must be redone on unwind.
    pub eliminated: bool,
    /// The owner was an eliminated object that could not be reallocated.
    pub owner_is_scalar_replaced: bool,
}

// =============================================================================
// CompiledVFrame
// =============================================================================

/// One logical frame of a compiled activation.
#[derive(Clone, Copy)]
pub struct CompiledVFrame<'a> {
    frame: &'a CompiledFrame,
    scope: &'a ScopeDesc,
    depth: usize,
}

impl<'a> CompiledVFrame<'a> {
    #[inline]
    pub fn method(&self) -> &'a Arc<Method> {
        &self.scope.method
    }

    #[inline]
    pub fn bci(&self) -> u32 {
        self.scope.bci
    }

    #[inline]
    pub fn should_reexecute(&self) -> bool {
        self.scope.reexecute
    }

    #[inline]
    pub fn scope(&self) -> &'a ScopeDesc {
        self.scope
    }

    #[inline]
    pub fn frame(&self) -> &'a CompiledFrame {
        self.frame
    }

    /// Inlining depth; `0` is the innermost frame.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn is_top(&self) -> bool {
        self.depth == 0
    }

    pub fn locals(&self, objects: &Rematerialized) -> Vec<StackValue> {
        self.scope
            .locals
            .iter()
            .map(|v| resolve_value(v, self.frame, objects))
            .collect()
    }

    pub fn expressions(&self, objects: &Rematerialized) -> Vec<StackValue> {
        self.scope
            .expressions
            .iter()
            .map(|v| resolve_value(v, self.frame, objects))
            .collect()
    }

    pub fn monitors(&self, objects: &Rematerialized) -> Vec<MonitorInfo> {
        self.scope
            .monitors
            .iter()
            .map(|mv| match mv.owner.as_object() {
                Some(id) => {
                    let owner = objects.get(id);
                    MonitorInfo {
                        owner_is_scalar_replaced: owner.is_none(),
                        owner,
                        eliminated: mv.eliminated,
                    }
                }
                None => MonitorInfo {
                    owner: resolve_value(&mv.owner, self.frame, objects)
                        .as_obj()
                        .cloned(),
                    eliminated: mv.eliminated,
                    owner_is_scalar_replaced: false,
                },
            })
            .collect()
    }
}

/// Logical frames recorded at `pc_desc`, innermost first.
pub fn virtual_frames<'a>(frame: &'a CompiledFrame, pc_desc: &'a PcDesc) -> Vec<CompiledVFrame<'a>> {
    guarantee!(
        !pc_desc.scopes.is_empty(),
        "no scopes at pc offset {:#x} of {}",
        pc_desc.pc_offset,
        frame.region.method().qualified_name()
    );
    pc_desc
        .scopes
        .iter()
        .enumerate()
        .map(|(depth, scope)| CompiledVFrame {
            frame,
            scope,
            depth,
        })
        .collect()
}
