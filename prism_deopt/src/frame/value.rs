//! Values held in interpreter frame slots.

use std::fmt;

use crate::runtime::ObjRef;

/// Contents of one interpreter local or expression-stack slot.
#[derive(Clone)]
pub enum StackValue {
    /// A primitive, stored as a machine word.
    Int(i64),
    /// A reference.
    Obj(Option<ObjRef>),
}

impl StackValue {
    /// The zero word.
    pub const ZERO: StackValue = StackValue::Int(0);

    /// The null reference.
    pub const NULL: StackValue = StackValue::Obj(None);

    /// Primitive word; references read as 0.
    #[inline]
    pub fn as_int(&self) -> i64 {
        match self {
            Self::Int(v) => *v,
            Self::Obj(_) => 0,
        }
    }

    /// Reference, if this slot holds a non-null one.
    #[inline]
    pub fn as_obj(&self) -> Option<&ObjRef> {
        match self {
            Self::Obj(obj) => obj.as_ref(),
            Self::Int(_) => None,
        }
    }

    #[inline]
    pub fn is_obj(&self) -> bool {
        matches!(self, Self::Obj(_))
    }

    /// Same contents: equal words, or the same object identity.
    pub fn same_as(&self, other: &StackValue) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Obj(None), Self::Obj(None)) => true,
            (Self::Obj(Some(a)), Self::Obj(Some(b))) => a.is(b),
            _ => false,
        }
    }
}

impl fmt::Debug for StackValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v:#x}"),
            Self::Obj(None) => f.write_str("null"),
            Self::Obj(Some(obj)) => write!(f, "{obj:?}"),
        }
    }
}
