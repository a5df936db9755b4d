//! # Runtime Values
//!
//! The value model shared by the codec and the evaluator.
//!
//! Scalars are stored at their exact width so arithmetic can honor signedness
//! and overflow rules. Arrays and objects are shared references: cloning a
//! `Value` never deep-copies them.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::decimal::Decimal;
use crate::descriptor::Descriptor;
use crate::descriptor::Param;
use crate::error::Error;
use crate::error::Result;
use crate::types::TypeName;
use crate::types::TypeTag;

/// An opaque 64-bit binary timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DateTime(pub i64);

/// Upper bound on the element count of any array built from wire input,
/// whether decoded or constructed by the evaluator.
pub const MAX_ARRAY_LEN: usize = 1 << 20;

/// A shared, mutable, fixed-length array.
#[derive(Clone)]
pub struct ArrayRef {
    elem: TypeTag,
    items: Arc<Mutex<Vec<Value>>>,
}

impl ArrayRef {
    pub fn new(elem: TypeTag, items: Vec<Value>) -> Self {
        Self { elem, items: Arc::new(Mutex::new(items)) }
    }

    /// An array of `len` default values of the element type.
    pub fn with_len(elem: TypeTag, len: usize) -> Self {
        let fill = Value::default_for(&elem);
        Self::new(elem, vec![fill; len])
    }

    pub fn elem(&self) -> &TypeTag {
        &self.elem
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<Value> {
        let items = self.items.lock();
        items.get(index).cloned().ok_or(Error::IndexOutOfRange { index, len: items.len() })
    }

    pub fn set(&self, index: usize, value: Value) -> Result<()> {
        let mut items = self.items.lock();
        let len = items.len();
        let slot = items.get_mut(index).ok_or(Error::IndexOutOfRange { index, len })?;
        *slot = value;
        Ok(())
    }

    /// Snapshot of the current elements.
    pub fn to_vec(&self) -> Vec<Value> {
        self.items.lock().clone()
    }

    pub fn ptr_eq(&self, other: &ArrayRef) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }
}

/// A live instance of a catalog type.
#[derive(Clone)]
pub struct ObjectRef {
    ty: TypeName,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ObjectRef {
    pub fn new<T: Any + Send + Sync>(ty: TypeName, value: T) -> Self {
        Self { ty, inner: Arc::new(value) }
    }

    pub fn from_arc<T: Any + Send + Sync>(ty: TypeName, value: Arc<T>) -> Self {
        Self { ty, inner: value }
    }

    pub fn type_name(&self) -> &TypeName {
        &self.ty
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A lambda value: parameters, body, and the bindings in scope at creation.
pub struct Closure {
    pub params: Vec<Param>,
    pub body: Arc<Descriptor>,
    pub captured: Vec<(Param, Value)>,
}

/// An asynchronous result produced by an invoker. Taken at most once.
#[derive(Clone)]
pub struct PendingValue(Arc<Mutex<Option<BoxFuture<'static, Result<Value>>>>>);

impl PendingValue {
    pub fn new(fut: impl Future<Output = Result<Value>> + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Some(Box::pin(fut)))))
    }

    pub fn take(&self) -> Option<BoxFuture<'static, Result<Value>>> {
        self.0.lock().take()
    }
}

type BoxIter = Box<dyn Iterator<Item = Value> + Send>;

/// A lazily produced sequence. Materialized at most once.
#[derive(Clone)]
pub struct SequenceValue {
    elem: TypeTag,
    iter: Arc<Mutex<Option<BoxIter>>>,
}

impl SequenceValue {
    pub fn new<I>(elem: TypeTag, items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        let iter: BoxIter = Box::new(items.into_iter());
        Self { elem, iter: Arc::new(Mutex::new(Some(iter))) }
    }

    pub fn elem(&self) -> &TypeTag {
        &self.elem
    }

    pub fn take(&self) -> Option<BoxIter> {
        self.iter.lock().take()
    }
}

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    Null,
    /// Result of a member returning nothing.
    Unit,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Char(char),
    String(Arc<str>),
    DateTime(DateTime),
    Array(ArrayRef),
    Object(ObjectRef),
    Closure(Arc<Closure>),
    Pending(PendingValue),
    Sequence(SequenceValue),
}

impl Value {
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn array(elem: TypeTag, items: Vec<Value>) -> Self {
        Value::Array(ArrayRef::new(elem, items))
    }

    pub fn object<T: Any + Send + Sync>(ty: &str, value: T) -> Self {
        Value::Object(ObjectRef::new(Arc::from(ty), value))
    }

    pub fn pending(fut: impl Future<Output = Result<Value>> + Send + 'static) -> Self {
        Value::Pending(PendingValue::new(fut))
    }

    pub fn sequence<I>(elem: TypeTag, items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Value::Sequence(SequenceValue::new(elem, items))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The zero value a fresh slot of `ty` holds.
    pub fn default_for(ty: &TypeTag) -> Self {
        match ty {
            TypeTag::I8 => Value::I8(0),
            TypeTag::U8 => Value::U8(0),
            TypeTag::I16 => Value::I16(0),
            TypeTag::U16 => Value::U16(0),
            TypeTag::I32 => Value::I32(0),
            TypeTag::U32 => Value::U32(0),
            TypeTag::I64 => Value::I64(0),
            TypeTag::U64 => Value::U64(0),
            TypeTag::F32 => Value::F32(0.0),
            TypeTag::F64 => Value::F64(0.0),
            TypeTag::Decimal => Value::Decimal(Decimal::ZERO),
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Char => Value::Char('\0'),
            TypeTag::DateTime => Value::DateTime(DateTime(0)),
            TypeTag::Void => Value::Unit,
            TypeTag::String | TypeTag::Any | TypeTag::Array(_) |
            TypeTag::Nullable(_) | TypeTag::External(_) => Value::Null,
        }
    }

    /// The dynamic type of the value; `None` for null.
    pub fn runtime_type(&self) -> Option<TypeTag> {
        Some(match self {
            Value::Null => return None,
            Value::Unit => TypeTag::Void,
            Value::Bool(_) => TypeTag::Bool,
            Value::I8(_) => TypeTag::I8,
            Value::U8(_) => TypeTag::U8,
            Value::I16(_) => TypeTag::I16,
            Value::U16(_) => TypeTag::U16,
            Value::I32(_) => TypeTag::I32,
            Value::U32(_) => TypeTag::U32,
            Value::I64(_) => TypeTag::I64,
            Value::U64(_) => TypeTag::U64,
            Value::F32(_) => TypeTag::F32,
            Value::F64(_) => TypeTag::F64,
            Value::Decimal(_) => TypeTag::Decimal,
            Value::Char(_) => TypeTag::Char,
            Value::String(_) => TypeTag::String,
            Value::DateTime(_) => TypeTag::DateTime,
            Value::Array(a) => TypeTag::array(a.elem().clone()),
            Value::Object(o) => TypeTag::External(o.type_name().clone()),
            Value::Closure(_) | Value::Pending(_) => TypeTag::Any,
            Value::Sequence(s) => TypeTag::array(s.elem().clone()),
        })
    }

    /// Short type description for error messages.
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".into(),
            Value::Closure(_) => "closure".into(),
            Value::Pending(_) => "pending".into(),
            Value::Sequence(s) => format!("sequence<{}>", s.elem()),
            other => other.runtime_type().map(|t| t.to_string()).unwrap_or_default(),
        }
    }

    /// Identity comparison: by value for scalars, by reference for arrays and objects.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp_value(*b).is_eq(),
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.ptr_eq(b) || (a.elem() == b.elem() && a.to_vec() == b.to_vec())
            }
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Pending(a), Value::Pending(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Value::Sequence(a), Value::Sequence(b)) => Arc::ptr_eq(&a.iter, &b.iter),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Unit => write!(f, "Unit"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::I8(v) => write!(f, "I8({})", v),
            Value::U8(v) => write!(f, "U8({})", v),
            Value::I16(v) => write!(f, "I16({})", v),
            Value::U16(v) => write!(f, "U16({})", v),
            Value::I32(v) => write!(f, "I32({})", v),
            Value::U32(v) => write!(f, "U32({})", v),
            Value::I64(v) => write!(f, "I64({})", v),
            Value::U64(v) => write!(f, "U64({})", v),
            Value::F32(v) => write!(f, "F32({})", v),
            Value::F64(v) => write!(f, "F64({})", v),
            Value::Decimal(v) => write!(f, "Decimal({})", v),
            Value::Char(v) => write!(f, "Char({:?})", v),
            Value::String(v) => write!(f, "String({:?})", v),
            Value::DateTime(v) => write!(f, "DateTime({})", v.0),
            Value::Array(a) => write!(f, "Array<{}>({:?})", a.elem(), a.to_vec()),
            Value::Object(o) => write!(f, "Object({})", o.type_name()),
            Value::Closure(c) => write!(f, "Closure({} params)", c.params.len()),
            Value::Pending(_) => write!(f, "Pending"),
            Value::Sequence(s) => write!(f, "Sequence<{}>", s.elem()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null | Value::Unit => Ok(()),
            Value::Bool(v) => write!(f, "{}", if *v { "True" } else { "False" }),
            Value::I8(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
            Value::DateTime(v) => write!(f, "{}", v.0),
            other => write!(f, "{}", other.type_name()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self { Value::$variant(v) }
            }
        )*
    };
}

value_from! {
    bool => Bool, i8 => I8, u8 => U8, i16 => I16, u16 => U16,
    i32 => I32, u32 => U32, i64 => I64, u64 => U64,
    f32 => F32, f64 => F64, char => Char,
    Decimal => Decimal, DateTime => DateTime,
    ArrayRef => Array, ObjectRef => Object,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(Arc::from(v)) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::String(Arc::from(v)) }
}

impl From<()> for Value {
    fn from(_: ()) -> Self { Value::Unit }
}

/// Typed extraction of a `Value`.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch<T>(expected: &str, found: &Value) -> Result<T> {
    Err(Error::TypeMismatch { expected: expected.into(), found: found.type_name() })
}

macro_rules! from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => mismatch(stringify!($ty), &other),
                    }
                }
            }
        )*
    };
}

from_value! {
    bool => Bool, i8 => I8, u8 => U8, i16 => I16, u16 => U16,
    i32 => I32, u32 => U32, i64 => I64, u64 => U64,
    f32 => F32, f64 => F64, char => Char,
    Decimal => Decimal, DateTime => DateTime,
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Unit | Value::Null => Ok(()),
            other => mismatch("void", &other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s.to_string()),
            other => mismatch("string", &other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(a) => a.to_vec().into_iter().map(T::from_value).collect(),
            other => mismatch("array", &other),
        }
    }
}
