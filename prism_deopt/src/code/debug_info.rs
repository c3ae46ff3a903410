//! Debug information attached to compiled code.
//!
//! At every point where compiled code can deoptimize, the compiler records
//! the chain of inlined scopes live at that point and where each scope's
//! locals, expression stack and monitors can be found. Values come from a
//! closed set of sources, see [`ScopeValue`].

use std::sync::Arc;

use crate::runtime::{Klass, Method, ObjRef};

// =============================================================================
// Locations
// =============================================================================

/// Where a value lives in the compiled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Register(u16),
    /// Stack slot index within the compiled frame.
    Stack(u32),
}

/// How the bits at a location are to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationType {
    /// A full machine word.
    Normal,
    /// A reference.
    Oop,
    /// A 32-bit integer in the low half of the word.
    Int,
    /// A 64-bit long.
    Lng,
    /// A 64-bit double.
    Dbl,
    /// Dead value.
    Invalid,
}

/// A compiled-frame location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub kind: LocationKind,
    pub ty: LocationType,
}

impl Location {
    #[inline]
    pub const fn stack(slot: u32, ty: LocationType) -> Self {
        Self {
            kind: LocationKind::Stack(slot),
            ty,
        }
    }

    #[inline]
    pub const fn register(reg: u16, ty: LocationType) -> Self {
        Self {
            kind: LocationKind::Register(reg),
            ty,
        }
    }
}

// =============================================================================
// ScopeValue
// =============================================================================

/// Identifier of an eliminated object within one debug-info record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// Source of one value in a logical frame or eliminated object.
#[derive(Debug, Clone)]
pub enum ScopeValue {
    ConstInt(i32),
    ConstLong(i64),
    ConstDouble(f64),
    ConstOop(Option<ObjRef>),
    Location(Location),
    /// An object the compiler eliminated; rematerialized on deoptimization.
    Object(ObjectId),
    /// Placeholder for bytes covered by a preceding wide byte-array store.
    Marker,
    /// No value (dead or conflicting).
    Illegal,
}

impl ScopeValue {
    /// Whether this source supplies a full 64-bit value on its own.
    pub fn is_wide(&self) -> bool {
        match self {
            Self::ConstLong(_) | Self::ConstDouble(_) => true,
            Self::Location(loc) => matches!(loc.ty, LocationType::Lng | LocationType::Dbl),
            _ => false,
        }
    }

    #[inline]
    pub fn is_constant_int(&self) -> bool {
        matches!(self, Self::ConstInt(_))
    }

    #[inline]
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Marker)
    }

    #[inline]
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Self::Object(id) => Some(*id),
            _ => None,
        }
    }
}

// =============================================================================
// Eliminated objects and monitors
// =============================================================================

/// An object whose allocation the compiler removed.
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub id: ObjectId,
    pub klass: Arc<Klass>,
    /// One source per field slot (instances) or per element slot (arrays).
    /// Longs and doubles take two slots.
    pub field_values: Vec<ScopeValue>,
    /// The object is a boxed primitive that may come from a box cache.
    pub auto_box: bool,
}

impl ObjectDescriptor {
    pub fn new(id: ObjectId, klass: Arc<Klass>, field_values: Vec<ScopeValue>) -> Self {
        Self {
            id,
            klass,
            field_values,
            auto_box: false,
        }
    }

    pub fn with_auto_box(mut self) -> Self {
        self.auto_box = true;
        self
    }

    #[inline]
    pub fn field_size(&self) -> usize {
        self.field_values.len()
    }
}

/// A monitor held by a logical frame.
#[derive(Debug, Clone)]
pub struct MonitorValue {
    pub owner: ScopeValue,
    /// The compiler removed the lock operation.
    pub eliminated: bool,
}

impl MonitorValue {
    pub fn new(owner: ScopeValue, eliminated: bool) -> Self {
        Self { owner, eliminated }
    }
}

// =============================================================================
// Scopes
// =============================================================================

/// One logical (possibly inlined) frame at a deoptimization point.
#[derive(Debug, Clone)]
pub struct ScopeDesc {
    pub method: Arc<Method>,
    pub bci: u32,
    /// The interpreter must re-execute the bytecode at `bci`.
    pub reexecute: bool,
    pub locals: Vec<ScopeValue>,
    pub expressions: Vec<ScopeValue>,
    pub monitors: Vec<MonitorValue>,
}

impl ScopeDesc {
    pub fn new(method: Arc<Method>, bci: u32) -> Self {
        Self {
            method,
            bci,
            reexecute: false,
            locals: Vec::new(),
            expressions: Vec::new(),
            monitors: Vec::new(),
        }
    }

    pub fn with_reexecute(mut self) -> Self {
        self.reexecute = true;
        self
    }

    pub fn with_locals(mut self, locals: Vec<ScopeValue>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_expressions(mut self, expressions: Vec<ScopeValue>) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn with_monitors(mut self, monitors: Vec<MonitorValue>) -> Self {
        self.monitors = monitors;
        self
    }
}

/// Debug information for one deoptimization point.
#[derive(Debug, Clone)]
pub struct PcDesc {
    pub pc_offset: u32,
    /// Logical frames, innermost first.
    pub scopes: Vec<ScopeDesc>,
    /// Objects eliminated at this point.
    pub objects: Vec<Arc<ObjectDescriptor>>,
    /// The call at this point returns a reference in the result register.
    pub return_oop: bool,
    /// The innermost frame rethrows the exception on top of its stack.
    pub rethrow_exception: bool,
}

impl PcDesc {
    pub fn new(pc_offset: u32, scopes: Vec<ScopeDesc>) -> Self {
        Self {
            pc_offset,
            scopes,
            objects: Vec::new(),
            return_oop: false,
            rethrow_exception: false,
        }
    }

    pub fn with_objects(mut self, objects: Vec<ObjectDescriptor>) -> Self {
        self.objects = objects.into_iter().map(Arc::new).collect();
        self
    }

    pub fn with_return_oop(mut self) -> Self {
        self.return_oop = true;
        self
    }

    pub fn with_rethrow_exception(mut self) -> Self {
        self.rethrow_exception = true;
        self
    }

    /// Innermost logical frame.
    #[inline]
    pub fn innermost(&self) -> Option<&ScopeDesc> {
        self.scopes.first()
    }
}

/// All deoptimization points of one compiled region, sorted by offset.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    pcs: Box<[PcDesc]>,
}

impl DebugInfo {
    pub fn new(mut pcs: Vec<PcDesc>) -> Self {
        pcs.sort_by_key(|pc| pc.pc_offset);
        pcs.dedup_by_key(|pc| pc.pc_offset);
        Self {
            pcs: pcs.into_boxed_slice(),
        }
    }

    /// Debug information recorded at exactly `pc_offset`.
    pub fn pc_desc_at(&self, pc_offset: u32) -> Option<&PcDesc> {
        self.pcs
            .binary_search_by_key(&pc_offset, |pc| pc.pc_offset)
            .ok()
            .map(|i| &self.pcs[i])
    }

    #[inline]
    pub fn pc_descs(&self) -> &[PcDesc] {
        &self.pcs
    }
}
