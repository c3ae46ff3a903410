//! Heap objects and allocation.
//!
//! Objects are reference counted; identity is pointer identity of the
//! [`ObjRef`]. The heap only has to answer one question for
//! deoptimization: can it allocate this object right now.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;

use super::method::{BasicType, Klass, KlassKind};
use super::monitor::ObjectMonitor;
use crate::error::{DeoptError, DeoptResult};

/// Shared handle to a heap object.
pub type ObjRef = Arc<HeapObject>;

// =============================================================================
// HeapObject
// =============================================================================

/// One slot of an instance body.
#[derive(Clone, Default)]
pub enum FieldValue {
    #[default]
    Zero,
    Prim(i64),
    Ref(Option<ObjRef>),
}

impl FieldValue {
    /// Primitive bits; references and zero read as 0.
    #[inline]
    pub fn as_prim(&self) -> i64 {
        match self {
            Self::Prim(v) => *v,
            _ => 0,
        }
    }

    #[inline]
    pub fn as_obj(&self) -> Option<&ObjRef> {
        match self {
            Self::Ref(r) => r.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => f.write_str("0"),
            Self::Prim(v) => write!(f, "{v}"),
            Self::Ref(None) => f.write_str("null"),
            Self::Ref(Some(obj)) => write!(f, "{}@{}", obj.klass().name(), obj.id()),
        }
    }
}

/// Storage of an object.
#[derive(Debug)]
pub enum ObjectBody {
    Instance(Vec<FieldValue>),
    /// Primitive array elements, already truncated to the element type.
    TypeArray(Vec<i64>),
    ObjArray(Vec<Option<ObjRef>>),
}

/// A heap object.
pub struct HeapObject {
    id: u64,
    klass: Arc<Klass>,
    body: RwLock<ObjectBody>,
    monitor: ObjectMonitor,
}

impl HeapObject {
    fn new(id: u64, klass: Arc<Klass>, length: usize) -> Self {
        let body = match klass.kind() {
            KlassKind::Instance { .. } => {
                ObjectBody::Instance(vec![FieldValue::Zero; klass.instance_slot_count()])
            }
            KlassKind::TypeArray(_) => ObjectBody::TypeArray(vec![0; length]),
            KlassKind::ObjArray => ObjectBody::ObjArray(vec![None; length]),
        };
        Self {
            id,
            klass,
            body: RwLock::new(body),
            monitor: ObjectMonitor::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn klass(&self) -> &Arc<Klass> {
        &self.klass
    }

    #[inline]
    pub fn monitor(&self) -> &ObjectMonitor {
        &self.monitor
    }

    #[inline]
    pub fn body(&self) -> RwLockReadGuard<'_, ObjectBody> {
        self.body.read()
    }

    #[inline]
    pub fn body_mut(&self) -> RwLockWriteGuard<'_, ObjectBody> {
        self.body.write()
    }

    /// Read an instance slot.
    pub fn field(&self, slot: usize) -> FieldValue {
        match &*self.body.read() {
            ObjectBody::Instance(fields) => fields.get(slot).cloned().unwrap_or_default(),
            _ => FieldValue::Zero,
        }
    }

    /// Primitive value of an instance slot.
    #[inline]
    pub fn prim_field(&self, slot: usize) -> i64 {
        self.field(slot).as_prim()
    }

    /// Reference value of an instance slot.
    #[inline]
    pub fn obj_field(&self, slot: usize) -> Option<ObjRef> {
        self.field(slot).as_obj().cloned()
    }

    /// Array length, or `None` for instances.
    pub fn array_length(&self) -> Option<usize> {
        match &*self.body.read() {
            ObjectBody::Instance(_) => None,
            ObjectBody::TypeArray(elems) => Some(elems.len()),
            ObjectBody::ObjArray(elems) => Some(elems.len()),
        }
    }

    /// Primitive array element.
    pub fn prim_at(&self, index: usize) -> Option<i64> {
        match &*self.body.read() {
            ObjectBody::TypeArray(elems) => elems.get(index).copied(),
            _ => None,
        }
    }

    /// Reference array element.
    pub fn obj_at(&self, index: usize) -> Option<ObjRef> {
        match &*self.body.read() {
            ObjectBody::ObjArray(elems) => elems.get(index).cloned().flatten(),
            _ => None,
        }
    }

    /// Whether `other` is this very object.
    #[inline]
    pub fn is(self: &Arc<Self>, other: &ObjRef) -> bool {
        Arc::ptr_eq(self, other)
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.klass.name(), self.id)
    }
}

// =============================================================================
// Heap
// =============================================================================

/// Allocation interface used when rematerializing objects.
pub trait Heap: Send + Sync {
    /// Allocate a zeroed instance of `klass`.
    fn allocate_instance(&self, klass: &Arc<Klass>) -> DeoptResult<ObjRef>;

    /// Allocate a zeroed array of `length` elements.
    fn allocate_array(&self, klass: &Arc<Klass>, length: usize) -> DeoptResult<ObjRef>;
}

/// Bump-counting heap with an optional byte budget and allocation budget.
#[derive(Debug)]
pub struct SimpleHeap {
    next_id: AtomicU64,
    used_bytes: AtomicUsize,
    capacity_bytes: usize,
    allocations: AtomicUsize,
    max_allocations: usize,
}

impl Default for SimpleHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleHeap {
    /// An effectively unbounded heap.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            used_bytes: AtomicUsize::new(0),
            capacity_bytes: usize::MAX,
            allocations: AtomicUsize::new(0),
            max_allocations: usize::MAX,
        }
    }

    /// Limit the total bytes handed out.
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    /// Fail every allocation after the first `count`.
    pub fn with_allocation_limit(mut self, count: usize) -> Self {
        self.max_allocations = count;
        self
    }

    /// Bytes allocated so far.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// Successful allocations so far.
    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    fn reserve(&self, klass: &Klass, bytes: usize) -> DeoptResult<()> {
        let oom = || DeoptError::OutOfMemory {
            klass: klass.name().to_string(),
            bytes,
        };
        self.allocations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_allocations).then_some(n + 1)
            })
            .map_err(|_| oom())?;
        let reserved = self
            .used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.capacity_bytes)
            });
        if reserved.is_err() {
            self.allocations.fetch_sub(1, Ordering::AcqRel);
            return Err(oom());
        }
        Ok(())
    }

    fn make(&self, klass: &Arc<Klass>, length: usize) -> ObjRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(HeapObject::new(id, Arc::clone(klass), length))
    }
}

impl Heap for SimpleHeap {
    fn allocate_instance(&self, klass: &Arc<Klass>) -> DeoptResult<ObjRef> {
        debug_assert!(klass.is_instance());
        self.reserve(klass, klass.allocation_bytes(0))?;
        Ok(self.make(klass, 0))
    }

    fn allocate_array(&self, klass: &Arc<Klass>, length: usize) -> DeoptResult<ObjRef> {
        debug_assert!(!klass.is_instance());
        self.reserve(klass, klass.allocation_bytes(length))?;
        Ok(self.make(klass, length))
    }
}

// =============================================================================
// Box caches
// =============================================================================

/// Result of looking a boxed value up in its cache.
#[derive(Debug, Clone)]
pub enum BoxLookup {
    /// The canonical box for the value.
    Hit(ObjRef),
    /// No cache for the type, or the value is outside its range.
    Miss,
    /// The cache failed to initialize; the box cannot be produced.
    Unavailable,
}

#[derive(Debug)]
enum BoxCache {
    Ready { low: i64, boxes: Vec<ObjRef> },
    Failed,
}

/// Canonical box instances for small primitive values.
#[derive(Debug, Default)]
pub struct BoxCaches {
    caches: RwLock<FxHashMap<BasicType, BoxCache>>,
}

impl BoxCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default cached range for a boxed primitive.
    pub fn default_range(ty: BasicType) -> Option<(i64, i64)> {
        match ty {
            BasicType::Int | BasicType::Long | BasicType::Short | BasicType::Byte => {
                Some((-128, 127))
            }
            BasicType::Char => Some((0, 127)),
            BasicType::Boolean => Some((0, 1)),
            _ => None,
        }
    }

    /// Populate the cache for `klass`'s box type.
    ///
    /// On allocation failure the cache is left in the failed state and the
    /// error is returned.
    pub fn install(&self, heap: &dyn Heap, klass: &Arc<Klass>) -> DeoptResult<()> {
        let Some(ty) = klass.box_type() else {
            return Ok(());
        };
        let Some((low, high)) = Self::default_range(ty) else {
            return Ok(());
        };
        let value_slot = klass
            .instance_fields()
            .iter()
            .find(|f| f.field.ty == ty)
            .map_or(0, |f| f.slot);

        let mut boxes = Vec::with_capacity((high - low + 1) as usize);
        for value in low..=high {
            match heap.allocate_instance(klass) {
                Ok(obj) => {
                    if let ObjectBody::Instance(fields) = &mut *obj.body_mut() {
                        if let Some(f) = fields.get_mut(value_slot) {
                            *f = FieldValue::Prim(value);
                        }
                    }
                    boxes.push(obj);
                }
                Err(err) => {
                    self.caches.write().insert(ty, BoxCache::Failed);
                    return Err(err);
                }
            }
        }
        self.caches.write().insert(ty, BoxCache::Ready { low, boxes });
        Ok(())
    }

    /// Record that the cache for `ty` could not be initialized.
    pub fn mark_failed(&self, ty: BasicType) {
        self.caches.write().insert(ty, BoxCache::Failed);
    }

    /// The canonical box for `value`, if cached.
    pub fn lookup(&self, ty: BasicType, value: i64) -> BoxLookup {
        match self.caches.read().get(&ty) {
            None => BoxLookup::Miss,
            Some(BoxCache::Failed) => BoxLookup::Unavailable,
            Some(BoxCache::Ready { low, boxes }) => value
                .checked_sub(*low)
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| boxes.get(i))
                .map_or(BoxLookup::Miss, |obj| BoxLookup::Hit(Arc::clone(obj))),
        }
    }
}
