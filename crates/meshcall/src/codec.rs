//! # Codec
//!
//! The translation layer between descriptors/values and the `meshpack` wire format.
//!
//! ## Invariants
//! - **Recursion Safety**: All recursive operations are bounded by `MAX_RECURSION_DEPTH`.
//! - **Scope Balance**: The binding scope has the same length after every node
//!   as before it, on success and on error.
//! - **Fail Closed**: Unknown kind, operator or type codes are decode errors.
//!   External types resolve only through the registry or the catalog.

use std::sync::Arc;

use meshpack::Decoder;
use meshpack::Encoder;

use crate::catalog::AllowAll;
use crate::catalog::Catalog;
use crate::decimal::Decimal;
use crate::descriptor::ArrayInit;
use crate::descriptor::BinaryOp;
use crate::descriptor::Descriptor;
use crate::descriptor::Param;
use crate::descriptor::UnaryOp;
use crate::error::Error;
use crate::error::Result;
use crate::eval;
use crate::registry::TypeRegistry;
use crate::types::code;
use crate::types::TypeTag;
use crate::value::ArrayRef;
use crate::value::DateTime;
use crate::value::MAX_ARRAY_LEN;
use crate::value::Value;

/// The maximum nesting depth for descriptors, types and values.
pub const MAX_RECURSION_DEPTH: usize = 256;

/// Descriptor node kind codes.
pub mod kind {
    pub const CONSTANT: u8 = 0x01;
    pub const PARAMETER: u8 = 0x02;
    pub const BINARY: u8 = 0x03;
    pub const UNARY: u8 = 0x04;
    pub const MEMBER: u8 = 0x05;
    pub const INDEX: u8 = 0x06;
    pub const CONDITIONAL: u8 = 0x07;
    pub const INVOKE: u8 = 0x08;
    pub const CALL: u8 = 0x09;
    pub const NEW: u8 = 0x0A;
    pub const NEW_ARRAY_BOUNDS: u8 = 0x0B;
    pub const NEW_ARRAY_INIT: u8 = 0x0C;
    pub const BLOCK: u8 = 0x0D;
    pub const LAMBDA: u8 = 0x0E;
}

/// Everything the codec resolves external types and members against.
#[derive(Clone, Copy)]
pub struct CodecContext<'a> {
    pub registry: &'a TypeRegistry,
    pub catalog: &'a Catalog,
}

impl<'a> CodecContext<'a> {
    pub fn new(registry: &'a TypeRegistry, catalog: &'a Catalog) -> Self {
        Self { registry, catalog }
    }
}

fn deeper(depth: usize) -> Result<usize> {
    if depth >= MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }
    Ok(depth + 1)
}

fn count_u8(n: usize, what: &str) -> Result<u8> {
    u8::try_from(n).map_err(|_| Error::Decode(format!("too many {}: {}", what, n)))
}

fn count_u16(n: usize, what: &str) -> Result<u16> {
    u16::try_from(n).map_err(|_| Error::Decode(format!("too many {}: {}", what, n)))
}

// ==== DESCRIPTORS ====

/// Encodes a descriptor. `scope` holds the bindings already in scope; it is
/// restored before returning.
pub fn encode(ctx: CodecContext<'_>, d: &Descriptor, scope: &mut Vec<Param>) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_into(ctx, &mut enc, d, scope)?;
    Ok(enc.into_bytes()?)
}

pub fn encode_into(ctx: CodecContext<'_>, enc: &mut Encoder, d: &Descriptor, scope: &mut Vec<Param>) -> Result<()> {
    let mark = scope.len();
    let result = encode_node(ctx, enc, d, scope, 0);
    scope.truncate(mark);
    result
}

/// Decodes a descriptor, rejecting trailing bytes.
pub fn decode(ctx: CodecContext<'_>, bytes: &[u8], scope: &mut Vec<Param>) -> Result<Descriptor> {
    let mut dec = Decoder::new(bytes);
    let d = decode_from(ctx, &mut dec, scope)?;
    dec.finish()?;
    Ok(d)
}

pub fn decode_from(ctx: CodecContext<'_>, dec: &mut Decoder<'_>, scope: &mut Vec<Param>) -> Result<Descriptor> {
    let mark = scope.len();
    let result = decode_node(ctx, dec, scope, 0);
    scope.truncate(mark);
    result
}

fn encode_params(ctx: CodecContext<'_>, enc: &mut Encoder, params: &[Param], scope: &mut Vec<Param>) -> Result<()> {
    enc.u8(count_u8(params.len(), "bindings")?);
    for p in params {
        enc.str(&p.name)?;
        encode_type(ctx, enc, &p.ty)?;
        scope.push(p.clone());
    }
    Ok(())
}

fn decode_params(ctx: CodecContext<'_>, dec: &mut Decoder<'_>, scope: &mut Vec<Param>) -> Result<Vec<Param>> {
    let n = dec.u8()? as usize;
    let mut params = Vec::with_capacity(n);
    for _ in 0..n {
        let name = dec.str()?;
        let ty = decode_type(ctx, dec)?;
        let p = Param { name: Arc::from(name), ty };
        scope.push(p.clone());
        params.push(p);
    }
    Ok(params)
}

fn encode_list(
    ctx: CodecContext<'_>,
    enc: &mut Encoder,
    items: &[Descriptor],
    scope: &mut Vec<Param>,
    depth: usize,
) -> Result<()> {
    for item in items {
        encode_node(ctx, enc, item, scope, depth)?;
    }
    Ok(())
}

fn decode_list(
    ctx: CodecContext<'_>,
    dec: &mut Decoder<'_>,
    n: usize,
    scope: &mut Vec<Param>,
    depth: usize,
) -> Result<Vec<Descriptor>> {
    let mut out = Vec::with_capacity(n.min(dec.remaining()));
    for _ in 0..n {
        out.push(decode_node(ctx, dec, scope, depth)?);
    }
    Ok(out)
}

/// A member read whose receiver chain bottoms out in a constant.
fn is_constant_chain(d: &Descriptor) -> bool {
    match d {
        Descriptor::Constant { .. } => true,
        Descriptor::Member { target: Some(t), .. } => is_constant_chain(t),
        _ => false,
    }
}

/// Evaluates a constant member chain at encode time. `None` when the chain
/// cannot be folded; the node is then encoded as written.
fn fold_member(ctx: CodecContext<'_>, d: &Descriptor) -> Option<Descriptor> {
    let Descriptor::Member { target: Some(t), declaring, member } = d else { return None };
    if !is_constant_chain(t) {
        return None;
    }
    let value = eval::evaluate(d, &[], ctx.catalog, &AllowAll).ok()?;
    let ty = ctx
        .catalog
        .find_property(declaring, member, false)
        .map(|p| p.ty.clone())
        .or_else(|| value.runtime_type())
        .unwrap_or(TypeTag::Any);
    tracing::trace!(member = %member, "folded constant member access");
    Some(Descriptor::Constant { ty, value })
}

fn encode_node(
    ctx: CodecContext<'_>,
    enc: &mut Encoder,
    d: &Descriptor,
    scope: &mut Vec<Param>,
    depth: usize,
) -> Result<()> {
    let depth = deeper(depth)?;
    match d {
        Descriptor::Constant { ty, value } => {
            enc.u8(kind::CONSTANT);
            encode_type(ctx, enc, ty)?;
            encode_value(ctx, enc, ty, value)?;
        }
        Descriptor::Parameter(p) => {
            let index = scope
                .iter()
                .rposition(|q| q == p)
                .ok_or_else(|| Error::Resolution(format!("parameter {} is not in scope", p.name)))?;
            enc.u8(kind::PARAMETER);
            enc.u16(count_u16(index, "bindings")?);
        }
        Descriptor::Binary { op, left, right } => {
            enc.u8(kind::BINARY);
            enc.u8(*op as u8);
            encode_node(ctx, enc, left, scope, depth)?;
            encode_node(ctx, enc, right, scope, depth)?;
        }
        Descriptor::Unary { op, ty, operand } => {
            enc.u8(kind::UNARY);
            enc.u8(*op as u8);
            encode_type(ctx, enc, ty)?;
            encode_node(ctx, enc, operand, scope, depth)?;
        }
        Descriptor::Member { target, declaring, member } => {
            if let Some(folded) = fold_member(ctx, d) {
                return encode_node(ctx, enc, &folded, scope, depth);
            }
            enc.u8(kind::MEMBER);
            enc.bool(target.is_some());
            if let Some(t) = target {
                encode_node(ctx, enc, t, scope, depth)?;
            }
            encode_type(ctx, enc, declaring)?;
            enc.str(member)?;
        }
        Descriptor::Index { target, indexes } => {
            enc.u8(kind::INDEX);
            encode_node(ctx, enc, target, scope, depth)?;
            enc.u8(count_u8(indexes.len(), "indexes")?);
            encode_list(ctx, enc, indexes, scope, depth)?;
        }
        Descriptor::Conditional { ty, test, if_true, if_false } => {
            enc.u8(kind::CONDITIONAL);
            encode_type(ctx, enc, ty)?;
            encode_node(ctx, enc, test, scope, depth)?;
            encode_node(ctx, enc, if_true, scope, depth)?;
            encode_node(ctx, enc, if_false, scope, depth)?;
        }
        Descriptor::Invoke { callee, args } => {
            enc.u8(kind::INVOKE);
            encode_node(ctx, enc, callee, scope, depth)?;
            enc.u8(count_u8(args.len(), "arguments")?);
            encode_list(ctx, enc, args, scope, depth)?;
        }
        Descriptor::Call { target, declaring, method, args, generic_args } => {
            enc.u8(kind::CALL);
            enc.bool(target.is_some());
            if let Some(t) = target {
                encode_node(ctx, enc, t, scope, depth)?;
            }
            encode_type(ctx, enc, declaring)?;
            enc.str(method)?;
            enc.u8(count_u8(generic_args.len(), "generic arguments")?);
            for g in generic_args {
                encode_type(ctx, enc, g)?;
            }
            enc.u8(count_u8(args.len(), "arguments")?);
            encode_list(ctx, enc, args, scope, depth)?;
        }
        Descriptor::New { ty, args } => {
            enc.u8(kind::NEW);
            encode_type(ctx, enc, ty)?;
            enc.u8(count_u8(args.len(), "arguments")?);
            encode_list(ctx, enc, args, scope, depth)?;
        }
        Descriptor::NewArray { elem, init: ArrayInit::Bounds(bounds) } => {
            enc.u8(kind::NEW_ARRAY_BOUNDS);
            encode_type(ctx, enc, elem)?;
            enc.u8(count_u8(bounds.len(), "array bounds")?);
            encode_list(ctx, enc, bounds, scope, depth)?;
        }
        Descriptor::NewArray { elem, init: ArrayInit::Elements(items) } => {
            enc.u8(kind::NEW_ARRAY_INIT);
            encode_type(ctx, enc, elem)?;
            enc.u16(count_u16(items.len(), "array elements")?);
            encode_list(ctx, enc, items, scope, depth)?;
        }
        Descriptor::Block { locals, body } => {
            enc.u8(kind::BLOCK);
            let mark = scope.len();
            let result = encode_params(ctx, enc, locals, scope).and_then(|_| {
                enc.u16(count_u16(body.len(), "block expressions")?);
                encode_list(ctx, enc, body, scope, depth)
            });
            scope.truncate(mark);
            result?;
        }
        Descriptor::Lambda { params, body } => {
            enc.u8(kind::LAMBDA);
            let mark = scope.len();
            let result = encode_params(ctx, enc, params, scope)
                .and_then(|_| encode_node(ctx, enc, body, scope, depth));
            scope.truncate(mark);
            result?;
        }
    }
    Ok(())
}

fn decode_node(ctx: CodecContext<'_>, dec: &mut Decoder<'_>, scope: &mut Vec<Param>, depth: usize) -> Result<Descriptor> {
    let depth = deeper(depth)?;
    let tag = dec.u8()?;
    let boxed = |d: Descriptor| Box::new(d);
    Ok(match tag {
        kind::CONSTANT => {
            let ty = decode_type(ctx, dec)?;
            let value = decode_value(ctx, dec, &ty)?;
            Descriptor::Constant { ty, value }
        }
        kind::PARAMETER => {
            let index = dec.u16()? as usize;
            let p = scope
                .get(index)
                .ok_or_else(|| Error::Decode(format!("parameter index {} out of scope ({})", index, scope.len())))?;
            Descriptor::Parameter(p.clone())
        }
        kind::BINARY => {
            let raw = dec.u8()?;
            let op = BinaryOp::from_u8(raw)
                .ok_or_else(|| Error::Decode(format!("unknown binary operator 0x{:02x}", raw)))?;
            let left = decode_node(ctx, dec, scope, depth)?;
            let right = decode_node(ctx, dec, scope, depth)?;
            Descriptor::Binary { op, left: boxed(left), right: boxed(right) }
        }
        kind::UNARY => {
            let raw = dec.u8()?;
            let op = UnaryOp::from_u8(raw)
                .ok_or_else(|| Error::Decode(format!("unknown unary operator 0x{:02x}", raw)))?;
            let ty = decode_type(ctx, dec)?;
            let operand = decode_node(ctx, dec, scope, depth)?;
            Descriptor::Unary { op, ty, operand: boxed(operand) }
        }
        kind::MEMBER => {
            let target = if dec.bool()? { Some(boxed(decode_node(ctx, dec, scope, depth)?)) } else { None };
            let declaring = decode_type(ctx, dec)?;
            let member = Arc::from(dec.str()?);
            Descriptor::Member { target, declaring, member }
        }
        kind::INDEX => {
            let target = decode_node(ctx, dec, scope, depth)?;
            let n = dec.u8()? as usize;
            let indexes = decode_list(ctx, dec, n, scope, depth)?;
            Descriptor::Index { target: boxed(target), indexes }
        }
        kind::CONDITIONAL => {
            let ty = decode_type(ctx, dec)?;
            let test = decode_node(ctx, dec, scope, depth)?;
            let if_true = decode_node(ctx, dec, scope, depth)?;
            let if_false = decode_node(ctx, dec, scope, depth)?;
            Descriptor::Conditional { ty, test: boxed(test), if_true: boxed(if_true), if_false: boxed(if_false) }
        }
        kind::INVOKE => {
            let callee = decode_node(ctx, dec, scope, depth)?;
            let n = dec.u8()? as usize;
            let args = decode_list(ctx, dec, n, scope, depth)?;
            Descriptor::Invoke { callee: boxed(callee), args }
        }
        kind::CALL => {
            let target = if dec.bool()? { Some(boxed(decode_node(ctx, dec, scope, depth)?)) } else { None };
            let declaring = decode_type(ctx, dec)?;
            let method: Arc<str> = Arc::from(dec.str()?);
            let generic_count = dec.u8()? as usize;
            let mut generic_args = Vec::with_capacity(generic_count);
            for _ in 0..generic_count {
                generic_args.push(decode_type(ctx, dec)?);
            }
            let n = dec.u8()? as usize;
            let args = decode_list(ctx, dec, n, scope, depth)?;

            // Method handles do not cross processes: re-resolve by signature.
            let arg_types: Vec<_> = args.iter().map(|a| Some(a.static_type(ctx.catalog))).collect();
            ctx.catalog
                .resolve_method(&declaring, &method, &arg_types, generic_args.len(), target.is_none())?;

            Descriptor::Call { target, declaring, method, args, generic_args }
        }
        kind::NEW => {
            let ty = decode_type(ctx, dec)?;
            let n = dec.u8()? as usize;
            let args = decode_list(ctx, dec, n, scope, depth)?;
            Descriptor::New { ty, args }
        }
        kind::NEW_ARRAY_BOUNDS => {
            let elem = decode_type(ctx, dec)?;
            let n = dec.u8()? as usize;
            let bounds = decode_list(ctx, dec, n, scope, depth)?;
            Descriptor::NewArray { elem, init: ArrayInit::Bounds(bounds) }
        }
        kind::NEW_ARRAY_INIT => {
            let elem = decode_type(ctx, dec)?;
            let n = dec.u16()? as usize;
            let items = decode_list(ctx, dec, n, scope, depth)?;
            Descriptor::NewArray { elem, init: ArrayInit::Elements(items) }
        }
        kind::BLOCK => {
            let mark = scope.len();
            let result = decode_params(ctx, dec, scope).and_then(|locals| {
                let n = dec.u16()? as usize;
                let body = decode_list(ctx, dec, n, scope, depth)?;
                Ok(Descriptor::Block { locals, body })
            });
            scope.truncate(mark);
            result?
        }
        kind::LAMBDA => {
            let mark = scope.len();
            let result = decode_params(ctx, dec, scope).and_then(|params| {
                let body = decode_node(ctx, dec, scope, depth)?;
                Ok(Descriptor::Lambda { params, body: boxed(body) })
            });
            scope.truncate(mark);
            result?
        }
        other => return Err(Error::Decode(format!("unknown descriptor kind 0x{:02x}", other))),
    })
}

// ==== TYPE TAGS ====

pub fn encode_type(ctx: CodecContext<'_>, enc: &mut Encoder, ty: &TypeTag) -> Result<()> {
    encode_type_impl(ctx, enc, ty, 0)
}

fn encode_type_impl(ctx: CodecContext<'_>, enc: &mut Encoder, ty: &TypeTag, depth: usize) -> Result<()> {
    let depth = deeper(depth)?;
    if let Some(c) = ty.primitive_code() {
        enc.u8(c);
        return Ok(());
    }
    match ty {
        TypeTag::Array(elem) => {
            enc.u8(code::ARRAY);
            encode_type_impl(ctx, enc, elem, depth)
        }
        TypeTag::Nullable(elem) => {
            enc.u8(code::NULLABLE);
            encode_type_impl(ctx, enc, elem, depth)
        }
        TypeTag::External(name) => {
            match ctx.registry.id_of(name) {
                Some(id) => {
                    enc.u8(code::REGISTERED);
                    enc.u32(id);
                }
                None => {
                    enc.u8(code::UNREGISTERED);
                    enc.str(name)?;
                }
            }
            Ok(())
        }
        _ => Err(Error::Decode(format!("type {} has no wire code", ty))),
    }
}

pub fn decode_type(ctx: CodecContext<'_>, dec: &mut Decoder<'_>) -> Result<TypeTag> {
    decode_type_impl(ctx, dec, 0)
}

fn decode_type_impl(ctx: CodecContext<'_>, dec: &mut Decoder<'_>, depth: usize) -> Result<TypeTag> {
    let depth = deeper(depth)?;
    let c = dec.u8()?;
    if let Some(ty) = TypeTag::from_primitive_code(c) {
        return Ok(ty);
    }
    match c {
        code::ARRAY => Ok(TypeTag::array(decode_type_impl(ctx, dec, depth)?)),
        code::NULLABLE => Ok(TypeTag::nullable(decode_type_impl(ctx, dec, depth)?)),
        code::REGISTERED => {
            let id = dec.u32()?;
            let name = ctx
                .registry
                .name_of(id)
                .ok_or_else(|| Error::Decode(format!("unknown registered type id {}", id)))?;
            Ok(TypeTag::External(name))
        }
        code::UNREGISTERED => {
            let name = dec.str()?;
            Ok(TypeTag::External(ctx.registry.resolve_unregistered(&name, ctx.catalog)?))
        }
        other => Err(Error::Decode(format!("unknown type code 0x{:02x}", other))),
    }
}

// ==== VALUES ====

/// Encodes `value` as a slot of static type `ty`.
pub fn encode_value(ctx: CodecContext<'_>, enc: &mut Encoder, ty: &TypeTag, value: &Value) -> Result<()> {
    encode_value_impl(ctx, enc, ty, value, 0)
}

/// Encodes a self-describing value (an `Any` slot).
pub fn encode_any(ctx: CodecContext<'_>, enc: &mut Encoder, value: &Value) -> Result<()> {
    encode_value_impl(ctx, enc, &TypeTag::Any, value, 0)
}

fn encode_value_impl(
    ctx: CodecContext<'_>,
    enc: &mut Encoder,
    ty: &TypeTag,
    value: &Value,
    depth: usize,
) -> Result<()> {
    let depth = deeper(depth)?;
    match (ty, value) {
        (_, Value::Closure(_)) => return Err(Error::NotSerializable("lambda".into())),
        (_, Value::Pending(_)) => return Err(Error::NotSerializable("pending result".into())),
        (_, Value::Sequence(_)) => return Err(Error::NotSerializable("unmaterialized sequence".into())),

        (TypeTag::I8, Value::I8(v)) => enc.i8(*v),
        (TypeTag::U8, Value::U8(v)) => enc.u8(*v),
        (TypeTag::I16, Value::I16(v)) => enc.i16(*v),
        (TypeTag::U16, Value::U16(v)) => enc.u16(*v),
        (TypeTag::I32, Value::I32(v)) => enc.i32(*v),
        (TypeTag::U32, Value::U32(v)) => enc.u32(*v),
        (TypeTag::I64, Value::I64(v)) => enc.i64(*v),
        (TypeTag::U64, Value::U64(v)) => enc.u64(*v),
        (TypeTag::F32, Value::F32(v)) => enc.f32(*v),
        (TypeTag::F64, Value::F64(v)) => enc.f64(*v),
        (TypeTag::Decimal, Value::Decimal(v)) => enc.raw(&v.to_bytes()),
        (TypeTag::Bool, Value::Bool(v)) => enc.bool(*v),
        (TypeTag::Char, Value::Char(v)) => enc.char(*v),
        (TypeTag::DateTime, Value::DateTime(v)) => enc.i64(v.0),
        (TypeTag::String, Value::String(s)) => enc.str(s)?,
        (TypeTag::String, Value::Null) => enc.opt_str(None)?,
        (TypeTag::Void, Value::Unit | Value::Null) => {}

        (TypeTag::Any, Value::Null) => enc.bool(false),
        (TypeTag::Any, v) => {
            let inner = v
                .runtime_type()
                .ok_or_else(|| Error::NotSerializable(v.type_name()))?;
            enc.bool(true);
            encode_type(ctx, enc, &inner)?;
            encode_value_impl(ctx, enc, &inner, v, depth)?;
        }

        (TypeTag::Nullable(_), Value::Null) => enc.bool(false),
        (TypeTag::Nullable(inner), v) => {
            enc.bool(true);
            encode_value_impl(ctx, enc, inner, v, depth)?;
        }

        (TypeTag::Array(_), Value::Null) => enc.length(None)?,
        (TypeTag::Array(elem), Value::Array(a)) => {
            let items = a.to_vec();
            enc.length(Some(items.len()))?;
            for item in &items {
                encode_value_impl(ctx, enc, elem, item, depth)?;
            }
        }

        (TypeTag::External(_), Value::Null) => enc.bool(false),
        (TypeTag::External(name), Value::Object(obj)) if obj.type_name() == name => {
            enc.bool(true);
            ctx.catalog.encode_data(obj, enc)?;
        }

        (ty, v) => {
            return Err(Error::TypeMismatch { expected: ty.to_string(), found: v.type_name() });
        }
    }
    Ok(())
}

pub fn decode_value(ctx: CodecContext<'_>, dec: &mut Decoder<'_>, ty: &TypeTag) -> Result<Value> {
    decode_value_impl(ctx, dec, ty, 0)
}

pub fn decode_any(ctx: CodecContext<'_>, dec: &mut Decoder<'_>) -> Result<Value> {
    decode_value_impl(ctx, dec, &TypeTag::Any, 0)
}

fn decode_value_impl(ctx: CodecContext<'_>, dec: &mut Decoder<'_>, ty: &TypeTag, depth: usize) -> Result<Value> {
    let depth = deeper(depth)?;
    Ok(match ty {
        TypeTag::I8 => Value::I8(dec.i8()?),
        TypeTag::U8 => Value::U8(dec.u8()?),
        TypeTag::I16 => Value::I16(dec.i16()?),
        TypeTag::U16 => Value::U16(dec.u16()?),
        TypeTag::I32 => Value::I32(dec.i32()?),
        TypeTag::U32 => Value::U32(dec.u32()?),
        TypeTag::I64 => Value::I64(dec.i64()?),
        TypeTag::U64 => Value::U64(dec.u64()?),
        TypeTag::F32 => Value::F32(dec.f32()?),
        TypeTag::F64 => Value::F64(dec.f64()?),
        TypeTag::Decimal => {
            let raw = dec.raw(16)?;
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(raw);
            Value::Decimal(Decimal::from_bytes(bytes)?)
        }
        TypeTag::Bool => Value::Bool(dec.bool()?),
        TypeTag::Char => Value::Char(dec.char()?),
        TypeTag::DateTime => Value::DateTime(DateTime(dec.i64()?)),
        TypeTag::String => match dec.opt_str()? {
            Some(s) => Value::string(s),
            None => Value::Null,
        },
        TypeTag::Void => Value::Unit,
        TypeTag::Any => {
            if !dec.bool()? {
                return Ok(Value::Null);
            }
            let inner = decode_type(ctx, dec)?;
            decode_value_impl(ctx, dec, &inner, depth)?
        }
        TypeTag::Nullable(inner) => {
            if !dec.bool()? {
                return Ok(Value::Null);
            }
            decode_value_impl(ctx, dec, inner, depth)?
        }
        TypeTag::Array(elem) => match dec.length()? {
            None => Value::Null,
            Some(n) => {
                if n > MAX_ARRAY_LEN {
                    return Err(Error::Decode(format!("array length {} exceeds {}", n, MAX_ARRAY_LEN)));
                }
                // Every element takes at least one byte unless it is void.
                if **elem != TypeTag::Void && n > dec.remaining() {
                    return Err(Error::Pack(meshpack::Error::UnexpectedEnd));
                }
                let mut items = Vec::with_capacity(n.min(dec.remaining()));
                for _ in 0..n {
                    items.push(decode_value_impl(ctx, dec, elem, depth)?);
                }
                Value::Array(ArrayRef::new((**elem).clone(), items))
            }
        },
        TypeTag::External(name) => {
            if !dec.bool()? {
                return Ok(Value::Null);
            }
            Value::Object(ctx.catalog.decode_data(name, dec)?)
        }
    })
}

// ==== HELPERS ====

/// Encodes a value as a standalone `Any` payload.
pub fn value_to_bytes(ctx: CodecContext<'_>, value: &Value) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_any(ctx, &mut enc, value)?;
    Ok(enc.into_bytes()?)
}

/// Decodes a standalone `Any` payload.
pub fn value_from_bytes(ctx: CodecContext<'_>, bytes: &[u8]) -> Result<Value> {
    let mut dec = Decoder::new(bytes);
    let v = decode_any(ctx, &mut dec)?;
    dec.finish()?;
    Ok(v)
}
