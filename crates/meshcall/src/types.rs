//! # Type Tags
//!
//! The static type vocabulary shared by descriptors, values and the wire codec.

use std::fmt;
use std::sync::Arc;

/// Fully-qualified name of an externally defined (catalog) type.
pub type TypeName = Arc<str>;

/// Wire codes for type tags.
pub mod code {
    pub const I8: u8 = 0x01;
    pub const U8: u8 = 0x02;
    pub const I16: u8 = 0x03;
    pub const U16: u8 = 0x04;
    pub const I32: u8 = 0x05;
    pub const U32: u8 = 0x06;
    pub const I64: u8 = 0x07;
    pub const U64: u8 = 0x08;
    pub const F32: u8 = 0x09;
    pub const F64: u8 = 0x0A;
    pub const DECIMAL: u8 = 0x0B;
    pub const BOOL: u8 = 0x0C;
    pub const CHAR: u8 = 0x0D;
    pub const STRING: u8 = 0x0E;
    pub const DATETIME: u8 = 0x0F;
    pub const ANY: u8 = 0x10;
    pub const VOID: u8 = 0x11;

    pub const ARRAY: u8 = 0x20;
    pub const NULLABLE: u8 = 0x21;
    pub const REGISTERED: u8 = 0x22;
    pub const UNREGISTERED: u8 = 0x23;
}

/// A static type.
///
/// Primitives have fixed wire codes. Composite tags wrap an element tag, and
/// external types are named and resolved through the `Catalog`/`TypeRegistry`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Decimal,
    Bool,
    Char,
    String,
    DateTime,
    /// Boxed slot; the value carries its own tag on the wire.
    Any,
    /// Result type of members that return nothing.
    Void,
    Array(Box<TypeTag>),
    Nullable(Box<TypeTag>),
    External(TypeName),
}

impl TypeTag {
    pub fn array(elem: TypeTag) -> Self {
        TypeTag::Array(Box::new(elem))
    }

    pub fn nullable(elem: TypeTag) -> Self {
        TypeTag::Nullable(Box::new(elem))
    }

    pub fn external(name: &str) -> Self {
        TypeTag::External(Arc::from(name))
    }

    /// Returns the primitive tag for a wire code.
    pub fn from_primitive_code(c: u8) -> Option<Self> {
        Some(match c {
            code::I8 => TypeTag::I8,
            code::U8 => TypeTag::U8,
            code::I16 => TypeTag::I16,
            code::U16 => TypeTag::U16,
            code::I32 => TypeTag::I32,
            code::U32 => TypeTag::U32,
            code::I64 => TypeTag::I64,
            code::U64 => TypeTag::U64,
            code::F32 => TypeTag::F32,
            code::F64 => TypeTag::F64,
            code::DECIMAL => TypeTag::Decimal,
            code::BOOL => TypeTag::Bool,
            code::CHAR => TypeTag::Char,
            code::STRING => TypeTag::String,
            code::DATETIME => TypeTag::DateTime,
            code::ANY => TypeTag::Any,
            code::VOID => TypeTag::Void,
            _ => return None,
        })
    }

    /// Returns the wire code of a primitive tag, `None` for composites.
    pub fn primitive_code(&self) -> Option<u8> {
        Some(match self {
            TypeTag::I8 => code::I8,
            TypeTag::U8 => code::U8,
            TypeTag::I16 => code::I16,
            TypeTag::U16 => code::U16,
            TypeTag::I32 => code::I32,
            TypeTag::U32 => code::U32,
            TypeTag::I64 => code::I64,
            TypeTag::U64 => code::U64,
            TypeTag::F32 => code::F32,
            TypeTag::F64 => code::F64,
            TypeTag::Decimal => code::DECIMAL,
            TypeTag::Bool => code::BOOL,
            TypeTag::Char => code::CHAR,
            TypeTag::String => code::STRING,
            TypeTag::DateTime => code::DATETIME,
            TypeTag::Any => code::ANY,
            TypeTag::Void => code::VOID,
            TypeTag::Array(_) | TypeTag::Nullable(_) | TypeTag::External(_) => return None,
        })
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            TypeTag::I8 | TypeTag::U8 | TypeTag::I16 | TypeTag::U16 |
            TypeTag::I32 | TypeTag::U32 | TypeTag::I64 | TypeTag::U64
        )
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, TypeTag::F32 | TypeTag::F64 | TypeTag::Decimal)
    }

    /// True if a slot of this type can hold null.
    pub fn is_nullable(&self) -> bool {
        matches!(
            self,
            TypeTag::String | TypeTag::Any | TypeTag::Array(_) |
            TypeTag::Nullable(_) | TypeTag::External(_)
        )
    }

    /// The element type of an array or nullable tag.
    pub fn element(&self) -> Option<&TypeTag> {
        match self {
            TypeTag::Array(e) | TypeTag::Nullable(e) => Some(e),
            _ => None,
        }
    }

    /// Strips one level of `Nullable`.
    pub fn underlying(&self) -> &TypeTag {
        match self {
            TypeTag::Nullable(e) => e,
            other => other,
        }
    }

    /// Overload compatibility: can an argument of static type `arg` bind to a
    /// parameter of this type? `None` is an argument of unknown type (e.g. null).
    pub fn accepts(&self, arg: Option<&TypeTag>) -> bool {
        let Some(arg) = arg else { return self.is_nullable() };
        if self == arg || *self == TypeTag::Any || *arg == TypeTag::Any {
            return true;
        }
        match (self, arg) {
            (TypeTag::Nullable(inner), other) => inner.as_ref() == other.underlying(),
            (TypeTag::Array(p), TypeTag::Array(_)) => **p == TypeTag::Any,
            _ => false,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::I8 => write!(f, "i8"),
            TypeTag::U8 => write!(f, "u8"),
            TypeTag::I16 => write!(f, "i16"),
            TypeTag::U16 => write!(f, "u16"),
            TypeTag::I32 => write!(f, "i32"),
            TypeTag::U32 => write!(f, "u32"),
            TypeTag::I64 => write!(f, "i64"),
            TypeTag::U64 => write!(f, "u64"),
            TypeTag::F32 => write!(f, "f32"),
            TypeTag::F64 => write!(f, "f64"),
            TypeTag::Decimal => write!(f, "decimal"),
            TypeTag::Bool => write!(f, "bool"),
            TypeTag::Char => write!(f, "char"),
            TypeTag::String => write!(f, "string"),
            TypeTag::DateTime => write!(f, "datetime"),
            TypeTag::Any => write!(f, "any"),
            TypeTag::Void => write!(f, "void"),
            TypeTag::Array(e) => write!(f, "{}[]", e),
            TypeTag::Nullable(e) => write!(f, "{}?", e),
            TypeTag::External(name) => write!(f, "{}", name),
        }
    }
}
