//! Methods, bytecodes and class layouts.
//!
//! Just enough of the managed runtime's metadata for deoptimization: the
//! size of a method's interpreter frame, what bytecode sits at a location,
//! how an instance lays out its fields, and which classes a constant pool
//! still has to resolve.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{DeoptError, DeoptResult};
use crate::profile::MethodData;

// =============================================================================
// BasicType
// =============================================================================

/// Value kinds as seen by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
    Object,
    Array,
    Void,
    Illegal,
}

impl BasicType {
    /// Interpreter stack slots taken by a value of this type.
    #[inline]
    pub const fn slots(self) -> usize {
        match self {
            Self::Long | Self::Double => 2,
            Self::Void | Self::Illegal => 0,
            _ => 1,
        }
    }

    /// Whether values of this type are references.
    #[inline]
    pub const fn is_reference(self) -> bool {
        matches!(self, Self::Object | Self::Array)
    }

    /// Element size in bytes when stored in an array.
    pub const fn array_element_bytes(self) -> usize {
        match self {
            Self::Boolean | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
            Self::Object | Self::Array => 8,
            Self::Void | Self::Illegal => 0,
        }
    }

    /// Sign- or zero-extend the low bits of `raw` the way a field or array
    /// store of this type truncates it.
    pub fn truncate(self, raw: i64) -> i64 {
        match self {
            Self::Boolean => raw & 1,
            Self::Byte => raw as i8 as i64,
            Self::Char => raw as u16 as i64,
            Self::Short => raw as i16 as i64,
            Self::Int | Self::Float => raw as i32 as i64,
            _ => raw,
        }
    }
}

// =============================================================================
// Opcodes and instructions
// =============================================================================

/// Bytecode operations. Codes start at 1 so that 0 means "no bytecode".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 1,
    Const = 2,
    Load = 3,
    Store = 4,
    Arith = 5,
    ArrayLoad = 6,
    ArrayStore = 7,
    GetField = 8,
    PutField = 9,
    GetStatic = 10,
    PutStatic = 11,
    New = 12,
    NewArray = 13,
    CheckCast = 14,
    InstanceOf = 15,
    Ldc = 16,
    Invoke = 17,
    If = 18,
    Goto = 19,
    Return = 20,
    Throw = 21,
    MonitorEnter = 22,
    MonitorExit = 23,
}

impl Opcode {
    const ALL: [Opcode; 23] = [
        Self::Nop,
        Self::Const,
        Self::Load,
        Self::Store,
        Self::Arith,
        Self::ArrayLoad,
        Self::ArrayStore,
        Self::GetField,
        Self::PutField,
        Self::GetStatic,
        Self::PutStatic,
        Self::New,
        Self::NewArray,
        Self::CheckCast,
        Self::InstanceOf,
        Self::Ldc,
        Self::Invoke,
        Self::If,
        Self::Goto,
        Self::Return,
        Self::Throw,
        Self::MonitorEnter,
        Self::MonitorExit,
    ];

    /// Numeric code.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        code.checked_sub(1)
            .and_then(|i| Self::ALL.get(i as usize))
            .copied()
    }

    /// Mnemonic.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Const => "const",
            Self::Load => "load",
            Self::Store => "store",
            Self::Arith => "arith",
            Self::ArrayLoad => "array_load",
            Self::ArrayStore => "array_store",
            Self::GetField => "getfield",
            Self::PutField => "putfield",
            Self::GetStatic => "getstatic",
            Self::PutStatic => "putstatic",
            Self::New => "new",
            Self::NewArray => "newarray",
            Self::CheckCast => "checkcast",
            Self::InstanceOf => "instanceof",
            Self::Ldc => "ldc",
            Self::Invoke => "invoke",
            Self::If => "if",
            Self::Goto => "goto",
            Self::Return => "return",
            Self::Throw => "throw",
            Self::MonitorEnter => "monitorenter",
            Self::MonitorExit => "monitorexit",
        }
    }
}

/// Decoded operands of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeInfo {
    /// Argument slots popped by the call, receiver included.
    pub parameter_slots: u16,
    /// Kind of the returned value.
    pub result: BasicType,
    /// The call passes a trailing member-name argument (method handle linker).
    pub has_member_arg: bool,
}

/// One bytecode instruction. A method's bytecode index is its position in
/// the instruction array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Simple(Opcode),
    /// An instruction naming a constant-pool entry.
    Indexed(Opcode, u16),
    Invoke(InvokeInfo),
}

impl Instruction {
    /// Opcode of the instruction.
    #[inline]
    pub fn opcode(&self) -> Opcode {
        match *self {
            Self::Simple(op) | Self::Indexed(op, _) => op,
            Self::Invoke(_) => Opcode::Invoke,
        }
    }

    /// Call-site details, if this is a call.
    #[inline]
    pub fn as_invoke(&self) -> Option<&InvokeInfo> {
        match self {
            Self::Invoke(info) => Some(info),
            _ => None,
        }
    }
}

// =============================================================================
// Klass
// =============================================================================

/// Declared field of an instance class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: String,
    pub ty: BasicType,
    pub is_static: bool,
    /// Added by the runtime rather than declared in the class file.
    pub is_injected: bool,
}

impl FieldDesc {
    pub fn new(name: impl Into<String>, ty: BasicType) -> Self {
        Self {
            name: name.into(),
            ty,
            is_static: false,
            is_injected: false,
        }
    }

    pub fn with_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn with_injected(mut self) -> Self {
        self.is_injected = true;
        self
    }
}

/// Shape of a class.
#[derive(Debug)]
pub enum KlassKind {
    Instance {
        super_klass: Option<Arc<Klass>>,
        fields: Vec<FieldDesc>,
    },
    TypeArray(BasicType),
    ObjArray,
}

/// A loaded class.
#[derive(Debug)]
pub struct Klass {
    name: String,
    kind: KlassKind,
    /// Primitive boxed by this class, for the standard box classes.
    box_type: Option<BasicType>,
}

/// An instance field with its slot in the object body.
#[derive(Debug, Clone, Copy)]
pub struct FieldSlot<'a> {
    pub slot: usize,
    pub field: &'a FieldDesc,
}

impl Klass {
    /// An instance class.
    pub fn instance(
        name: impl Into<String>,
        super_klass: Option<Arc<Klass>>,
        fields: Vec<FieldDesc>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: KlassKind::Instance {
                super_klass,
                fields,
            },
            box_type: None,
        }
    }

    /// An array of primitives.
    pub fn type_array(element: BasicType) -> Self {
        Self {
            name: format!("[{element:?}"),
            kind: KlassKind::TypeArray(element),
            box_type: None,
        }
    }

    /// An array of references.
    pub fn obj_array(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KlassKind::ObjArray,
            box_type: None,
        }
    }

    /// Mark this class as the box class of `ty`.
    pub fn with_box_type(mut self, ty: BasicType) -> Self {
        self.box_type = Some(ty);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> &KlassKind {
        &self.kind
    }

    #[inline]
    pub fn box_type(&self) -> Option<BasicType> {
        self.box_type
    }

    #[inline]
    pub fn is_instance(&self) -> bool {
        matches!(self.kind, KlassKind::Instance { .. })
    }

    /// Element type for primitive arrays.
    #[inline]
    pub fn type_array_element(&self) -> Option<BasicType> {
        match self.kind {
            KlassKind::TypeArray(ty) => Some(ty),
            _ => None,
        }
    }

    /// Non-static fields in layout order: superclass fields first, each class
    /// in declaration order.
    pub fn instance_fields(&self) -> Vec<FieldSlot<'_>> {
        let mut chain = Vec::new();
        let mut cur = Some(self);
        while let Some(k) = cur {
            chain.push(k);
            cur = match &k.kind {
                KlassKind::Instance { super_klass, .. } => super_klass.as_deref(),
                _ => None,
            };
        }
        let mut out = Vec::new();
        for k in chain.into_iter().rev() {
            if let KlassKind::Instance { fields, .. } = &k.kind {
                for field in fields.iter().filter(|f| !f.is_static) {
                    out.push(FieldSlot {
                        slot: out.len(),
                        field,
                    });
                }
            }
        }
        out
    }

    /// Number of slots in an instance body.
    pub fn instance_slot_count(&self) -> usize {
        self.instance_fields().len()
    }

    /// Allocation size in bytes for an instance or an array of `length`.
    pub fn allocation_bytes(&self, length: usize) -> usize {
        const HEADER: usize = 16;
        match &self.kind {
            KlassKind::Instance { .. } => HEADER + 8 * self.instance_slot_count(),
            KlassKind::TypeArray(ty) => HEADER + length * ty.array_element_bytes(),
            KlassKind::ObjArray => HEADER + length * 8,
        }
    }
}

// =============================================================================
// Class resolution
// =============================================================================

/// Loads classes by name on behalf of a constant pool.
pub trait ClassResolver: Send + Sync {
    fn resolve(&self, name: &str) -> DeoptResult<Arc<Klass>>;
}

/// A fixed table of loadable classes.
#[derive(Debug, Default)]
pub struct ClassTable {
    classes: RwLock<FxHashMap<String, Arc<Klass>>>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a class loadable.
    pub fn define(&self, klass: Arc<Klass>) {
        self.classes.write().insert(klass.name().to_string(), klass);
    }
}

impl ClassResolver for ClassTable {
    fn resolve(&self, name: &str) -> DeoptResult<Arc<Klass>> {
        self.classes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DeoptError::Resolution {
                class: name.to_string(),
                reason: "no such class".to_string(),
            })
    }
}

/// One constant-pool slot.
#[derive(Debug, Clone)]
pub enum CpEntry {
    UnresolvedClass(String),
    Class(Arc<Klass>),
    Other,
}

/// A method's constant pool. Class entries resolve in place.
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: RwLock<Vec<CpEntry>>,
}

impl ConstantPool {
    pub fn new(entries: Vec<CpEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Whether the entry at `index` is a resolved class.
    pub fn is_resolved_class(&self, index: u32) -> bool {
        matches!(self.entries.read().get(index as usize), Some(CpEntry::Class(_)))
    }

    /// Resolve the class entry at `index`, caching the result.
    pub fn klass_at(&self, index: u32, resolver: &dyn ClassResolver) -> DeoptResult<Arc<Klass>> {
        let name = match self.entries.read().get(index as usize) {
            Some(CpEntry::Class(klass)) => return Ok(Arc::clone(klass)),
            Some(CpEntry::UnresolvedClass(name)) => name.clone(),
            _ => {
                return Err(DeoptError::Resolution {
                    class: format!("#{index}"),
                    reason: "not a class entry".to_string(),
                });
            }
        };
        let klass = resolver.resolve(&name)?;
        if let Some(entry) = self.entries.write().get_mut(index as usize) {
            *entry = CpEntry::Class(Arc::clone(&klass));
        }
        Ok(klass)
    }
}

// =============================================================================
// Method
// =============================================================================

/// Identity of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// A bytecode method.
pub struct Method {
    id: MethodId,
    holder: String,
    name: String,
    size_of_parameters: u16,
    max_locals: u16,
    max_stack: u16,
    code: Box<[Instruction]>,
    /// Operand-stack depth before each instruction, when known.
    stack_depths: Option<Box<[u16]>>,
    constants: ConstantPool,
    not_compilable: AtomicBool,
    invocation_counter: AtomicU32,
    backedge_counter: AtomicU32,
    method_data: OnceLock<Arc<MethodData>>,
}

impl Method {
    /// Create a method with no parameters or locals.
    pub fn new(id: MethodId, holder: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            holder: holder.into(),
            name: name.into(),
            size_of_parameters: 0,
            max_locals: 0,
            max_stack: 0,
            code: Box::new([]),
            stack_depths: None,
            constants: ConstantPool::default(),
            not_compilable: AtomicBool::new(false),
            invocation_counter: AtomicU32::new(0),
            backedge_counter: AtomicU32::new(0),
            method_data: OnceLock::new(),
        }
    }

    /// Set parameter and local slot counts. Locals include parameters.
    pub fn with_frame(mut self, parameters: u16, locals: u16, max_stack: u16) -> Self {
        debug_assert!(locals >= parameters);
        self.size_of_parameters = parameters;
        self.max_locals = locals;
        self.max_stack = max_stack;
        self
    }

    pub fn with_code(mut self, code: Vec<Instruction>) -> Self {
        self.code = code.into_boxed_slice();
        self
    }

    /// Declare the operand-stack depth before each instruction.
    pub fn with_stack_depths(mut self, depths: Vec<u16>) -> Self {
        self.stack_depths = Some(depths.into_boxed_slice());
        self
    }

    pub fn with_constants(mut self, constants: ConstantPool) -> Self {
        self.constants = constants;
        self
    }

    #[inline]
    pub fn id(&self) -> MethodId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// `Holder.name`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.holder, self.name)
    }

    #[inline]
    pub fn size_of_parameters(&self) -> u16 {
        self.size_of_parameters
    }

    #[inline]
    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    #[inline]
    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    #[inline]
    pub fn code_at(&self, bci: u32) -> Option<&Instruction> {
        self.code.get(bci as usize)
    }

    #[inline]
    pub fn stack_depth_at(&self, bci: u32) -> Option<u16> {
        self.stack_depths.as_ref()?.get(bci as usize).copied()
    }

    #[inline]
    pub fn constants(&self) -> &ConstantPool {
        &self.constants
    }

    // -------------------------------------------------------------------------
    // Compilation state
    // -------------------------------------------------------------------------

    #[inline]
    pub fn is_not_compilable(&self) -> bool {
        self.not_compilable.load(Ordering::Acquire)
    }

    /// Forbid further compilation of this method.
    pub fn set_not_compilable(&self, reason: &str) {
        if !self.not_compilable.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                target: "prism_deopt",
                method = %self.qualified_name(),
                reason,
                "method made not compilable"
            );
        }
    }

    /// Count one invocation.
    #[inline]
    pub fn record_invocation(&self) {
        self.invocation_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one loop backedge.
    #[inline]
    pub fn record_backedge(&self) {
        self.backedge_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// `(invocations, backedges)` since the last reset.
    pub fn counters(&self) -> (u32, u32) {
        (
            self.invocation_counter.load(Ordering::Relaxed),
            self.backedge_counter.load(Ordering::Relaxed),
        )
    }

    /// Reset invocation and backedge counters so profiling starts over.
    pub fn reset_counters(&self) {
        self.invocation_counter.store(0, Ordering::Relaxed);
        self.backedge_counter.store(0, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Profiling data
    // -------------------------------------------------------------------------

    /// Profiling data, if it has been created.
    #[inline]
    pub fn method_data(&self) -> Option<&Arc<MethodData>> {
        self.method_data.get()
    }

    /// Profiling data, created with room for `slots` per-location records if
    /// it does not exist yet.
    pub fn ensure_method_data(&self, slots: usize) -> &Arc<MethodData> {
        self.method_data
            .get_or_init(|| Arc::new(MethodData::new(self.id, slots)))
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.qualified_name())
            .field("parameters", &self.size_of_parameters)
            .field("locals", &self.max_locals)
            .field("max_stack", &self.max_stack)
            .finish_non_exhaustive()
    }
}
