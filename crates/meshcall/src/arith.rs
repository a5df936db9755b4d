//! # Arithmetic
//!
//! Operator semantics for the evaluator.
//!
//! ## Invariants
//! - Integer operators run at the operands' own width and signedness. Mixed
//!   widths are a `TypeMismatch`; descriptors carry explicit conversions.
//! - Checked variants raise `Overflow`; unchecked variants wrap.
//! - Division by zero is `DivideByZero` in either mode. `MIN / -1` is `Overflow`.
//! - Decimal arithmetic is always checked.
//! - A null operand lifts arithmetic to null; ordered comparisons with null are false.

use std::cmp::Ordering;

use crate::decimal::Decimal;
use crate::descriptor::BinaryOp;
use crate::descriptor::UnaryOp;
use crate::error::Error;
use crate::error::Result;
use crate::types::TypeTag;
use crate::value::Value;

trait Int: Copy + Ord {
    fn one() -> Self;
    fn is_zero(self) -> bool;
    fn checked_add(self, o: Self) -> Option<Self>;
    fn wrapping_add(self, o: Self) -> Self;
    fn checked_sub(self, o: Self) -> Option<Self>;
    fn wrapping_sub(self, o: Self) -> Self;
    fn checked_mul(self, o: Self) -> Option<Self>;
    fn wrapping_mul(self, o: Self) -> Self;
    fn checked_div(self, o: Self) -> Option<Self>;
    fn checked_rem(self, o: Self) -> Option<Self>;
    fn checked_pow(self, e: u32) -> Option<Self>;
    fn checked_neg(self) -> Option<Self>;
    fn wrapping_neg(self) -> Self;
    fn wrapping_shl(self, n: u32) -> Self;
    fn wrapping_shr(self, n: u32) -> Self;
    fn and(self, o: Self) -> Self;
    fn or(self, o: Self) -> Self;
    fn xor(self, o: Self) -> Self;
    fn not(self) -> Self;
}

macro_rules! impl_int {
    ($($t:ty),*) => {
        $(
            impl Int for $t {
                fn one() -> Self { 1 }
                fn is_zero(self) -> bool { self == 0 }
                fn checked_add(self, o: Self) -> Option<Self> { <$t>::checked_add(self, o) }
                fn wrapping_add(self, o: Self) -> Self { <$t>::wrapping_add(self, o) }
                fn checked_sub(self, o: Self) -> Option<Self> { <$t>::checked_sub(self, o) }
                fn wrapping_sub(self, o: Self) -> Self { <$t>::wrapping_sub(self, o) }
                fn checked_mul(self, o: Self) -> Option<Self> { <$t>::checked_mul(self, o) }
                fn wrapping_mul(self, o: Self) -> Self { <$t>::wrapping_mul(self, o) }
                fn checked_div(self, o: Self) -> Option<Self> { <$t>::checked_div(self, o) }
                fn checked_rem(self, o: Self) -> Option<Self> { <$t>::checked_rem(self, o) }
                fn checked_pow(self, e: u32) -> Option<Self> { <$t>::checked_pow(self, e) }
                fn checked_neg(self) -> Option<Self> { <$t>::checked_neg(self) }
                fn wrapping_neg(self) -> Self { <$t>::wrapping_neg(self) }
                fn wrapping_shl(self, n: u32) -> Self { <$t>::wrapping_shl(self, n) }
                fn wrapping_shr(self, n: u32) -> Self { <$t>::wrapping_shr(self, n) }
                fn and(self, o: Self) -> Self { self & o }
                fn or(self, o: Self) -> Self { self | o }
                fn xor(self, o: Self) -> Self { self ^ o }
                fn not(self) -> Self { !self }
            }
        )*
    };
}

impl_int!(i8, u8, i16, u16, i32, u32, i64, u64);

fn int_binary<T: Int>(op: BinaryOp, a: T, b: T) -> Result<Option<T>> {
    let checked = |r: Option<T>| r.ok_or(Error::Overflow).map(Some);
    match op {
        BinaryOp::Add => Ok(Some(a.wrapping_add(b))),
        BinaryOp::AddChecked => checked(a.checked_add(b)),
        BinaryOp::Subtract => Ok(Some(a.wrapping_sub(b))),
        BinaryOp::SubtractChecked => checked(a.checked_sub(b)),
        BinaryOp::Multiply => Ok(Some(a.wrapping_mul(b))),
        BinaryOp::MultiplyChecked => checked(a.checked_mul(b)),
        BinaryOp::Divide | BinaryOp::Modulo if b.is_zero() => Err(Error::DivideByZero),
        BinaryOp::Divide => checked(a.checked_div(b)),
        BinaryOp::Modulo => checked(a.checked_rem(b)),
        BinaryOp::And => Ok(Some(a.and(b))),
        BinaryOp::Or => Ok(Some(a.or(b))),
        BinaryOp::ExclusiveOr => Ok(Some(a.xor(b))),
        _ => Ok(None),
    }
}

fn int_pow<T: Int>(base: T, exp: i64) -> Result<T> {
    let exp = u32::try_from(exp).map_err(|_| Error::Overflow)?;
    base.checked_pow(exp).ok_or(Error::Overflow)
}

fn ordering_result(op: BinaryOp, ord: Option<Ordering>) -> Value {
    let b = match (op, ord) {
        (_, None) => op == BinaryOp::NotEqual,
        (BinaryOp::Equal, Some(o)) => o == Ordering::Equal,
        (BinaryOp::NotEqual, Some(o)) => o != Ordering::Equal,
        (BinaryOp::LessThan, Some(o)) => o == Ordering::Less,
        (BinaryOp::LessThanOrEqual, Some(o)) => o != Ordering::Greater,
        (BinaryOp::GreaterThan, Some(o)) => o == Ordering::Greater,
        (BinaryOp::GreaterThanOrEqual, Some(o)) => o != Ordering::Less,
        _ => false,
    };
    Value::Bool(b)
}

/// Integer operand as `i64` for shift counts and powers.
pub(crate) fn small_int(v: &Value) -> Option<i64> {
    Some(match v {
        Value::I8(x) => *x as i64,
        Value::U8(x) => *x as i64,
        Value::I16(x) => *x as i64,
        Value::U16(x) => *x as i64,
        Value::I32(x) => *x as i64,
        Value::U32(x) => *x as i64,
        Value::I64(x) => *x,
        Value::U64(x) => i64::try_from(*x).ok()?,
        _ => return None,
    })
}

fn mismatch(op: impl std::fmt::Debug, l: &Value, r: &Value) -> Error {
    Error::TypeMismatch {
        expected: format!("matching operands for {:?}", op),
        found: format!("{}, {}", l.type_name(), r.type_name()),
    }
}

/// Applies a non-assigning, non-short-circuit binary operator.
pub fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if op.is_comparison() {
        return compare(op, l, r);
    }
    if matches!(op, BinaryOp::LeftShift | BinaryOp::RightShift) {
        return shift(op, l, r);
    }
    if matches!(op, BinaryOp::Add | BinaryOp::AddChecked)
        && (matches!(l, Value::String(_)) || matches!(r, Value::String(_)))
    {
        return Ok(Value::string(format!("{}{}", l, r)));
    }
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }

    macro_rules! int_arms {
        ($($variant:ident),*) => {
            match (l, r) {
                $(
                    (Value::$variant(a), Value::$variant(b)) => {
                        if op == BinaryOp::Power {
                            let exp = small_int(r).ok_or_else(|| mismatch(op, l, r))?;
                            return int_pow(*a, exp).map(Value::$variant);
                        }
                        return match int_binary(op, *a, *b)? {
                            Some(v) => Ok(Value::$variant(v)),
                            None => Err(Error::NotImplemented(format!("{:?} on {}", op, l.type_name()))),
                        };
                    }
                )*
                _ => {}
            }
        };
    }
    int_arms!(I8, U8, I16, U16, I32, U32, I64, U64);

    match (l, r) {
        (Value::F64(a), Value::F64(b)) => float_binary(op, *a, *b).map(Value::F64),
        (Value::F32(a), Value::F32(b)) => float_binary(op, *a as f64, *b as f64).map(|v| Value::F32(v as f32)),
        (Value::Decimal(a), Value::Decimal(b)) => decimal_binary(op, *a, *b).map(Value::Decimal),
        (Value::Bool(a), Value::Bool(b)) => match op {
            BinaryOp::And => Ok(Value::Bool(*a & *b)),
            BinaryOp::Or => Ok(Value::Bool(*a | *b)),
            BinaryOp::ExclusiveOr => Ok(Value::Bool(*a ^ *b)),
            _ => Err(Error::NotImplemented(format!("{:?} on bool", op))),
        },
        _ => Err(mismatch(op, l, r)),
    }
}

fn float_binary(op: BinaryOp, a: f64, b: f64) -> Result<f64> {
    Ok(match op {
        BinaryOp::Add | BinaryOp::AddChecked => a + b,
        BinaryOp::Subtract | BinaryOp::SubtractChecked => a - b,
        BinaryOp::Multiply | BinaryOp::MultiplyChecked => a * b,
        BinaryOp::Divide => a / b,
        BinaryOp::Modulo => a % b,
        BinaryOp::Power => a.powf(b),
        _ => return Err(Error::NotImplemented(format!("{:?} on float", op))),
    })
}

fn decimal_binary(op: BinaryOp, a: Decimal, b: Decimal) -> Result<Decimal> {
    let zero_divisor = b.cmp_value(Decimal::ZERO) == Ordering::Equal;
    let r = match op {
        BinaryOp::Add | BinaryOp::AddChecked => a.checked_add(b),
        BinaryOp::Subtract | BinaryOp::SubtractChecked => a.checked_sub(b),
        BinaryOp::Multiply | BinaryOp::MultiplyChecked => a.checked_mul(b),
        BinaryOp::Divide | BinaryOp::Modulo if zero_divisor => return Err(Error::DivideByZero),
        BinaryOp::Divide => a.checked_div(b),
        BinaryOp::Modulo => a.checked_rem(b),
        _ => return Err(Error::NotImplemented(format!("{:?} on decimal", op))),
    };
    r.ok_or(Error::Overflow)
}

fn shift(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    // The count is masked to the operand width.
    let n = small_int(r).ok_or_else(|| mismatch(op, l, r))? as u32;
    macro_rules! shift_arms {
        ($($variant:ident),*) => {
            match l {
                $(
                    Value::$variant(a) => Ok(Value::$variant(if op == BinaryOp::LeftShift {
                        Int::wrapping_shl(*a, n)
                    } else {
                        Int::wrapping_shr(*a, n)
                    })),
                )*
                _ => Err(mismatch(op, l, r)),
            }
        };
    }
    shift_arms!(I8, U8, I16, U16, I32, U32, I64, U64)
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    if matches!(op, BinaryOp::Equal | BinaryOp::NotEqual) {
        let eq = match (l, r) {
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            _ => l.same(r),
        };
        return Ok(Value::Bool(if op == BinaryOp::Equal { eq } else { !eq }));
    }
    if l.is_null() || r.is_null() {
        return Ok(Value::Bool(false));
    }
    let ord = match (l, r) {
        (Value::I8(a), Value::I8(b)) => a.partial_cmp(b),
        (Value::U8(a), Value::U8(b)) => a.partial_cmp(b),
        (Value::I16(a), Value::I16(b)) => a.partial_cmp(b),
        (Value::U16(a), Value::U16(b)) => a.partial_cmp(b),
        (Value::I32(a), Value::I32(b)) => a.partial_cmp(b),
        (Value::U32(a), Value::U32(b)) => a.partial_cmp(b),
        (Value::I64(a), Value::I64(b)) => a.partial_cmp(b),
        (Value::U64(a), Value::U64(b)) => a.partial_cmp(b),
        (Value::F32(a), Value::F32(b)) => a.partial_cmp(b),
        (Value::F64(a), Value::F64(b)) => a.partial_cmp(b),
        (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp_value(*b)),
        (Value::Char(a), Value::Char(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => a.partial_cmp(b),
        (Value::DateTime(a), Value::DateTime(b)) => a.partial_cmp(b),
        _ => return Err(mismatch(op, l, r)),
    };
    // NaN compares false on every ordered operator.
    Ok(match ord {
        Some(_) => ordering_result(op, ord),
        None => Value::Bool(false),
    })
}

/// Applies a unary operator that does not write back. Conversions are handled by `convert`.
pub fn unary(op: UnaryOp, v: &Value) -> Result<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    macro_rules! int_arms {
        ($($variant:ident),*) => {
            match v {
                $(
                    Value::$variant(a) => {
                        let a = *a;
                        return Ok(Value::$variant(match op {
                            UnaryOp::Negate => Int::wrapping_neg(a),
                            UnaryOp::NegateChecked => Int::checked_neg(a).ok_or(Error::Overflow)?,
                            UnaryOp::UnaryPlus => a,
                            UnaryOp::Not | UnaryOp::OnesComplement => Int::not(a),
                            UnaryOp::Increment => Int::wrapping_add(a, <_ as Int>::one()),
                            UnaryOp::Decrement => Int::wrapping_sub(a, <_ as Int>::one()),
                            _ => return Err(Error::NotImplemented(format!("{:?} on {}", op, v.type_name()))),
                        }));
                    }
                )*
                _ => {}
            }
        };
    }
    int_arms!(I8, U8, I16, U16, I32, U32, I64, U64);

    let one = Decimal::from(1);
    match (op, v) {
        (UnaryOp::Negate | UnaryOp::NegateChecked, Value::F64(a)) => Ok(Value::F64(-a)),
        (UnaryOp::Negate | UnaryOp::NegateChecked, Value::F32(a)) => Ok(Value::F32(-a)),
        (UnaryOp::Negate | UnaryOp::NegateChecked, Value::Decimal(a)) => {
            a.checked_neg().map(Value::Decimal).ok_or(Error::Overflow)
        }
        (UnaryOp::UnaryPlus, Value::F64(_) | Value::F32(_) | Value::Decimal(_)) => Ok(v.clone()),
        (UnaryOp::Increment, Value::F64(a)) => Ok(Value::F64(a + 1.0)),
        (UnaryOp::Decrement, Value::F64(a)) => Ok(Value::F64(a - 1.0)),
        (UnaryOp::Increment, Value::F32(a)) => Ok(Value::F32(a + 1.0)),
        (UnaryOp::Decrement, Value::F32(a)) => Ok(Value::F32(a - 1.0)),
        (UnaryOp::Increment, Value::Decimal(a)) => a.checked_add(one).map(Value::Decimal).ok_or(Error::Overflow),
        (UnaryOp::Decrement, Value::Decimal(a)) => a.checked_sub(one).map(Value::Decimal).ok_or(Error::Overflow),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::IsTrue, Value::Bool(b)) => Ok(Value::Bool(*b)),
        (UnaryOp::IsFalse, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::ArrayLength, Value::Array(a)) => Ok(Value::I32(a.len() as i32)),
        _ => Err(Error::TypeMismatch { expected: format!("operand for {:?}", op), found: v.type_name() }),
    }
}

/// A numeric operand widened for conversion.
enum Num {
    Int(i128),
    Float(f64),
    Dec(Decimal),
}

fn as_num(v: &Value) -> Option<Num> {
    Some(match v {
        Value::I8(x) => Num::Int(*x as i128),
        Value::U8(x) => Num::Int(*x as i128),
        Value::I16(x) => Num::Int(*x as i128),
        Value::U16(x) => Num::Int(*x as i128),
        Value::I32(x) => Num::Int(*x as i128),
        Value::U32(x) => Num::Int(*x as i128),
        Value::I64(x) => Num::Int(*x as i128),
        Value::U64(x) => Num::Int(*x as i128),
        Value::Char(c) => Num::Int(*c as u32 as i128),
        Value::F32(x) => Num::Float(*x as f64),
        Value::F64(x) => Num::Float(*x),
        Value::Decimal(d) => Num::Dec(*d),
        _ => return None,
    })
}

/// Integer part of a numeric operand. Unchecked float conversions saturate.
fn to_i128(n: &Num, checked: bool) -> Result<i128> {
    match n {
        Num::Int(i) => Ok(*i),
        Num::Dec(d) => Ok(d.trunc()),
        Num::Float(f) => {
            if checked && (!f.is_finite() || f.trunc() < i128::MIN as f64 || f.trunc() >= i128::MAX as f64) {
                return Err(Error::Overflow);
            }
            Ok(*f as i128)
        }
    }
}

fn convert_num(n: Num, target: &TypeTag, checked: bool) -> Result<Value> {
    macro_rules! to_int {
        ($t:ty, $variant:ident) => {{
            let i = to_i128(&n, checked)?;
            if checked {
                Value::$variant(<$t>::try_from(i).map_err(|_| Error::Overflow)?)
            } else {
                Value::$variant(i as $t)
            }
        }};
    }
    Ok(match target {
        TypeTag::I8 => to_int!(i8, I8),
        TypeTag::U8 => to_int!(u8, U8),
        TypeTag::I16 => to_int!(i16, I16),
        TypeTag::U16 => to_int!(u16, U16),
        TypeTag::I32 => to_int!(i32, I32),
        TypeTag::U32 => to_int!(u32, U32),
        TypeTag::I64 => to_int!(i64, I64),
        TypeTag::U64 => to_int!(u64, U64),
        TypeTag::F32 | TypeTag::F64 => {
            let f = match n {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
                Num::Dec(d) => d.to_f64(),
            };
            if *target == TypeTag::F32 { Value::F32(f as f32) } else { Value::F64(f) }
        }
        TypeTag::Decimal => Value::Decimal(match n {
            Num::Int(i) => Decimal::new(i, 0).ok_or(Error::Overflow)?,
            Num::Float(f) => Decimal::from_f64(f).ok_or(Error::Overflow)?,
            Num::Dec(d) => d,
        }),
        TypeTag::Char => {
            let i = to_i128(&n, checked)?;
            let code = if checked { u32::try_from(i).map_err(|_| Error::Overflow)? } else { i as u32 };
            Value::Char(char::from_u32(code).ok_or(Error::Overflow)?)
        }
        other => {
            return Err(Error::TypeMismatch { expected: other.to_string(), found: "number".into() });
        }
    })
}

/// `Convert`/`ConvertChecked`: numeric conversions, nullable wrapping and reference casts.
pub fn convert(v: &Value, target: &TypeTag, checked: bool) -> Result<Value> {
    match target {
        TypeTag::Any => return Ok(v.clone()),
        TypeTag::Nullable(inner) => {
            return if v.is_null() { Ok(Value::Null) } else { convert(v, inner, checked) };
        }
        TypeTag::Void => return Ok(Value::Unit),
        _ => {}
    }
    if v.is_null() {
        return if target.is_nullable() {
            Ok(Value::Null)
        } else {
            Err(Error::NullReference(format!("conversion of null to {}", target)))
        };
    }
    if v.runtime_type().as_ref() == Some(target) {
        return Ok(v.clone());
    }
    if target.is_numeric() || *target == TypeTag::Char {
        if let Some(n) = as_num(v) {
            return convert_num(n, target, checked);
        }
    }
    match (target, v) {
        (TypeTag::Array(elem), Value::Array(_)) if **elem == TypeTag::Any => Ok(v.clone()),
        _ => Err(Error::TypeMismatch { expected: target.to_string(), found: v.type_name() }),
    }
}

/// `TypeAs`: the value if its runtime type fits, otherwise null.
pub fn type_as(v: &Value, target: &TypeTag) -> Value {
    match v.runtime_type() {
        Some(t) if target.accepts(Some(&t)) => v.clone(),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_wraps_or_overflows() {
        assert_eq!(binary(BinaryOp::Add, &Value::U8(250), &Value::U8(10)).unwrap(), Value::U8(4));
        assert_eq!(binary(BinaryOp::AddChecked, &Value::U8(250), &Value::U8(10)), Err(Error::Overflow));
    }

    #[test]
    fn test_every_width_wraps_and_checks() {
        let cases = [
            (Value::I8(i8::MAX), Value::I8(1), Value::I8(i8::MIN)),
            (Value::I16(i16::MAX), Value::I16(1), Value::I16(i16::MIN)),
            (Value::U16(u16::MAX), Value::U16(1), Value::U16(0)),
            (Value::I32(i32::MAX), Value::I32(1), Value::I32(i32::MIN)),
            (Value::U32(u32::MAX), Value::U32(1), Value::U32(0)),
            (Value::I64(i64::MAX), Value::I64(1), Value::I64(i64::MIN)),
            (Value::U64(u64::MAX), Value::U64(1), Value::U64(0)),
        ];
        for (a, b, wrapped) in cases {
            assert_eq!(binary(BinaryOp::Add, &a, &b).unwrap(), wrapped);
            assert_eq!(binary(BinaryOp::AddChecked, &a, &b), Err(Error::Overflow));
        }
    }

    #[test]
    fn test_division_edges() {
        assert_eq!(binary(BinaryOp::Divide, &Value::I32(1), &Value::I32(0)), Err(Error::DivideByZero));
        assert_eq!(binary(BinaryOp::Divide, &Value::I32(i32::MIN), &Value::I32(-1)), Err(Error::Overflow));
        assert_eq!(binary(BinaryOp::Modulo, &Value::I64(7), &Value::I64(3)).unwrap(), Value::I64(1));
    }

    #[test]
    fn test_mixed_width_is_mismatch() {
        let err = binary(BinaryOp::Add, &Value::I32(1), &Value::I64(1)).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_shift_masks_count() {
        assert_eq!(binary(BinaryOp::LeftShift, &Value::I32(1), &Value::I32(33)).unwrap(), Value::I32(2));
        assert_eq!(binary(BinaryOp::RightShift, &Value::U8(0x80), &Value::I32(7)).unwrap(), Value::U8(1));
    }

    #[test]
    fn test_convert_checked_and_unchecked() {
        assert_eq!(convert(&Value::I32(300), &TypeTag::U8, false).unwrap(), Value::U8(44));
        assert_eq!(convert(&Value::I32(300), &TypeTag::U8, true), Err(Error::Overflow));
        assert_eq!(convert(&Value::F64(2.9), &TypeTag::I32, true).unwrap(), Value::I32(2));
        assert_eq!(convert(&Value::Null, &TypeTag::nullable(TypeTag::I32), true).unwrap(), Value::Null);
        assert!(matches!(convert(&Value::Null, &TypeTag::I32, false), Err(Error::NullReference(_))));
    }

    #[test]
    fn test_string_concat_and_compare() {
        let s = binary(BinaryOp::Add, &Value::from("n="), &Value::I32(3)).unwrap();
        assert_eq!(s, Value::from("n=3"));
        assert_eq!(binary(BinaryOp::LessThan, &Value::from("a"), &Value::from("b")).unwrap(), Value::Bool(true));
        assert_eq!(binary(BinaryOp::GreaterThan, &Value::F64(f64::NAN), &Value::F64(0.0)).unwrap(), Value::Bool(false));
    }
}
