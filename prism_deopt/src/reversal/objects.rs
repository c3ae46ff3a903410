//! Reallocation and field reassignment of eliminated objects.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use crate::code::{ObjectDescriptor, ScopeValue};
use crate::frame::resolve_value;
use crate::reversal::{Rematerialized, ReversalContext};
use crate::runtime::{
    BasicType, BoxLookup, CompiledFrame, FieldSlot, FieldValue, KlassKind, ObjRef, ObjectBody,
    ThrownException,
};

// =============================================================================
// Reallocation
// =============================================================================

/// Allocate every eliminated object of a frame group.
///
/// Boxes of small values come from the box caches when enabled. Every
/// descriptor is attempted even after a failure; failed objects are
/// recorded as `None`. On failure an out-of-memory error replaces whatever
/// was pending, otherwise the pending exception is left untouched.
/// Returns whether anything failed.
pub fn realloc_objects(
    ctx: &ReversalContext<'_>,
    frame: &CompiledFrame,
    objects: &[Arc<ObjectDescriptor>],
    table: &mut Rematerialized,
    pending: &mut Option<ThrownException>,
) -> bool {
    let saved = pending.take();
    let mut failures = false;

    for desc in objects {
        crate::guarantee!(
            !table.contains(desc.id),
            "redundant reallocation of object {:?}",
            desc.id
        );
        let klass = &desc.klass;
        let mut obj: Option<ObjRef> = None;
        let mut cache_error = false;

        let allocated = match klass.kind() {
            KlassKind::Instance { .. } => {
                if desc.auto_box && ctx.config.eliminate_auto_box {
                    match cached_box(desc, frame, table, ctx) {
                        BoxLookup::Hit(boxed) => {
                            table.mark_cached(desc.id);
                            obj = Some(boxed);
                        }
                        BoxLookup::Unavailable => cache_error = true,
                        BoxLookup::Miss => {}
                    }
                }
                if obj.is_none() && !cache_error {
                    Some(ctx.heap.allocate_instance(klass))
                } else {
                    None
                }
            }
            KlassKind::TypeArray(ty) => {
                let slots = ty.slots().max(1);
                crate::guarantee!(
                    desc.field_size() % slots == 0,
                    "non-integral array length for {:?}",
                    desc.id
                );
                Some(ctx.heap.allocate_array(klass, desc.field_size() / slots))
            }
            KlassKind::ObjArray => Some(ctx.heap.allocate_array(klass, desc.field_size())),
        };

        match allocated {
            Some(Ok(new_obj)) => obj = Some(new_obj),
            Some(Err(err)) => {
                tracing::debug!(target: "prism_deopt", object = ?desc.id, %err, "reallocation failed");
            }
            None => {}
        }
        if obj.is_none() {
            failures = true;
        }
        table.insert(desc.id, obj);
    }

    if failures {
        *pending = Some(ThrownException::OutOfMemoryRealloc);
    } else {
        *pending = saved;
    }
    failures
}

fn cached_box(
    desc: &ObjectDescriptor,
    frame: &CompiledFrame,
    table: &Rematerialized,
    ctx: &ReversalContext<'_>,
) -> BoxLookup {
    let Some(ty) = desc.klass.box_type() else {
        return BoxLookup::Miss;
    };
    let index = if ty == BasicType::Long { 1 } else { 0 };
    let Some(source) = desc.field_values.get(index) else {
        return BoxLookup::Miss;
    };
    let value = resolve_value(source, frame, table).as_int();
    ctx.box_caches.lookup(ty, value)
}

// =============================================================================
// Field reassignment
// =============================================================================

fn source_at<'d>(desc: &'d ObjectDescriptor, index: usize) -> &'d ScopeValue {
    match desc.field_values.get(index) {
        Some(value) => value,
        None => crate::error::fatal(format_args!(
            "object {:?} of {} has no value source {index}",
            desc.id,
            desc.klass.name()
        )),
    }
}

/// An int source that carries a 64-bit value split over two int slots.
fn is_big_value(desc: &ObjectDescriptor, index: usize) -> bool {
    match source_at(desc, index) {
        ScopeValue::Location(_) => source_at(desc, index).is_wide(),
        ScopeValue::ConstInt(_) => matches!(
            desc.field_values.get(index + 1),
            Some(ScopeValue::ConstLong(_) | ScopeValue::ConstDouble(_))
        ),
        _ => false,
    }
}

/// Fill in every reallocated object from its value sources, then publish
/// the stores.
///
/// Objects that failed to reallocate or came from a box cache are skipped.
pub fn reassign_fields(
    frame: &CompiledFrame,
    objects: &[Arc<ObjectDescriptor>],
    table: &Rematerialized,
    sees_injected_fields: bool,
) {
    for desc in objects {
        if table.is_cached(desc.id) {
            continue;
        }
        let Some(obj) = table.get(desc.id) else {
            continue;
        };
        match desc.klass.kind() {
            KlassKind::Instance { .. } => {
                reassign_instance_fields(frame, desc, &obj, table, sees_injected_fields)
            }
            KlassKind::TypeArray(ty) => reassign_type_array(frame, desc, &obj, table, *ty),
            KlassKind::ObjArray => reassign_object_array(frame, desc, &obj, table),
        }
    }
    // Rematerialized objects become reachable from interpreter frames next.
    fence(Ordering::Release);
}

fn reassign_instance_fields(
    frame: &CompiledFrame,
    desc: &ObjectDescriptor,
    obj: &ObjRef,
    table: &Rematerialized,
    sees_injected_fields: bool,
) {
    let fields: Vec<FieldSlot<'_>> = desc
        .klass
        .instance_fields()
        .into_iter()
        .filter(|f| sees_injected_fields || !f.field.is_injected)
        .collect();
    let mut body = obj.body_mut();
    let ObjectBody::Instance(slots) = &mut *body else {
        crate::error::fatal(format_args!("{} is not an instance", desc.klass.name()));
    };
    let value_at = |index: usize| resolve_value(source_at(desc, index), frame, table);

    let mut sv = 0;
    let mut i = 0;
    while i < fields.len() {
        let field = fields[i];
        match field.field.ty {
            BasicType::Object | BasicType::Array => {
                slots[field.slot] = FieldValue::Ref(value_at(sv).as_obj().cloned());
                sv += 1;
                i += 1;
            }
            BasicType::Int | BasicType::Float => {
                let next_is_int = fields
                    .get(i + 1)
                    .is_some_and(|f| f.field.ty == BasicType::Int);
                if next_is_int && is_big_value(desc, sv) {
                    let value = value_at(sv + 1).as_int();
                    slots[field.slot] = FieldValue::Prim(i64::from(value as i32));
                    slots[fields[i + 1].slot] = FieldValue::Prim(i64::from((value >> 32) as i32));
                    sv += 2;
                    i += 2;
                } else {
                    slots[field.slot] = FieldValue::Prim(i64::from(value_at(sv).as_int() as i32));
                    sv += 1;
                    i += 1;
                }
            }
            BasicType::Long | BasicType::Double => {
                slots[field.slot] = FieldValue::Prim(value_at(sv + 1).as_int());
                sv += 2;
                i += 1;
            }
            ty @ (BasicType::Short | BasicType::Char | BasicType::Byte | BasicType::Boolean) => {
                slots[field.slot] = FieldValue::Prim(ty.truncate(value_at(sv).as_int()));
                sv += 1;
                i += 1;
            }
            ty @ (BasicType::Void | BasicType::Illegal) => crate::error::fatal(format_args!(
                "field {} of {} has type {ty:?}",
                field.field.name,
                desc.klass.name()
            )),
        }
    }
    debug_assert_eq!(sv, desc.field_size(), "unused value sources for {:?}", desc.id);
}

/// Number of bytes a byte-array source covers: itself plus the markers that
/// follow it.
fn byte_count_at(desc: &ObjectDescriptor, index: usize) -> usize {
    1 + desc.field_values[index + 1..]
        .iter()
        .take_while(|v| v.is_marker())
        .count()
}

fn reassign_type_array(
    frame: &CompiledFrame,
    desc: &ObjectDescriptor,
    obj: &ObjRef,
    table: &Rematerialized,
    ty: BasicType,
) {
    let mut body = obj.body_mut();
    let ObjectBody::TypeArray(elems) = &mut *body else {
        crate::error::fatal(format_args!("{} is not a primitive array", desc.klass.name()));
    };
    let value_at = |index: usize| resolve_value(source_at(desc, index), frame, table);

    let mut index = 0;
    let mut i = 0;
    while i < desc.field_size() {
        match ty {
            BasicType::Long | BasicType::Double => {
                elems[index] = value_at(i + 1).as_int();
                i += 2;
                index += 1;
            }
            BasicType::Int | BasicType::Float => {
                if ty == BasicType::Int && i + 1 < desc.field_size() && is_big_value(desc, i) {
                    let value = value_at(i + 1).as_int();
                    elems[index] = i64::from(value as i32);
                    elems[index + 1] = i64::from((value >> 32) as i32);
                    i += 2;
                    index += 2;
                } else {
                    elems[index] = i64::from(value_at(i).as_int() as i32);
                    i += 1;
                    index += 1;
                }
            }
            BasicType::Byte => {
                let count = byte_count_at(desc, i);
                crate::guarantee!(
                    matches!(count, 1 | 2 | 4 | 8),
                    "invalid byte run of {} at element {}",
                    count,
                    index
                );
                let value = value_at(i).as_int();
                for k in 0..count {
                    elems[index + k] = BasicType::Byte.truncate(value >> (8 * k));
                }
                i += count;
                index += count;
            }
            BasicType::Short | BasicType::Char | BasicType::Boolean => {
                elems[index] = ty.truncate(value_at(i).as_int());
                i += 1;
                index += 1;
            }
            other => crate::error::fatal(format_args!("unexpected array element type {other:?}")),
        }
    }
}

fn reassign_object_array(
    frame: &CompiledFrame,
    desc: &ObjectDescriptor,
    obj: &ObjRef,
    table: &Rematerialized,
) {
    let mut body = obj.body_mut();
    let ObjectBody::ObjArray(elems) = &mut *body else {
        crate::error::fatal(format_args!("{} is not a reference array", desc.klass.name()));
    };
    for (i, source) in desc.field_values.iter().enumerate() {
        elems[i] = resolve_value(source, frame, table).as_obj().cloned();
    }
}
