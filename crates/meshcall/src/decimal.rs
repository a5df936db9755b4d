//! 96-bit scaled decimal with the 16-byte `lo, mid, hi, flags` layout.
//!
//! Arithmetic is always checked: results that do not fit 96 bits at scale 0
//! return `None`. Excess fractional digits are truncated.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Error;
use crate::error::Result;

const MAX_SCALE: u32 = 28;
const MAX_MANTISSA: u128 = (1u128 << 96) - 1;
const SIGN_BIT: u32 = 0x8000_0000;
const RESERVED_BITS: u32 = 0x7F00_FFFF;

/// A decimal number `mantissa * 10^-scale`.
///
/// Equality is representational: `1.0` and `1.00` are different values.
/// Use `cmp_value` for numeric ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Decimal {
    lo: u32,
    mid: u32,
    hi: u32,
    flags: u32,
}

impl Decimal {
    pub const ZERO: Decimal = Decimal { lo: 0, mid: 0, hi: 0, flags: 0 };

    /// Creates a decimal; `None` if the mantissa exceeds 96 bits or scale exceeds 28.
    pub fn new(mantissa: i128, scale: u32) -> Option<Self> {
        if scale > MAX_SCALE {
            return None;
        }
        let mag = mantissa.unsigned_abs();
        if mag > MAX_MANTISSA {
            return None;
        }
        let sign = if mantissa < 0 { SIGN_BIT } else { 0 };
        Some(Decimal {
            lo: mag as u32,
            mid: (mag >> 32) as u32,
            hi: (mag >> 64) as u32,
            flags: (scale << 16) | sign,
        })
    }

    /// Reads the raw 16-byte layout. The scale must not exceed 28 and the
    /// reserved flag bits must be clear.
    pub fn from_bytes(b: [u8; 16]) -> Result<Self> {
        let word = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        let flags = word(12);
        if flags & RESERVED_BITS != 0 {
            return Err(Error::Decode(format!("decimal flags {:#010x} set reserved bits", flags)));
        }
        let d = Decimal { lo: word(0), mid: word(4), hi: word(8), flags };
        if d.scale() > MAX_SCALE {
            return Err(Error::Decode(format!("decimal scale {} exceeds {}", d.scale(), MAX_SCALE)));
        }
        Ok(d)
    }

    /// Writes the raw 16-byte layout.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.lo.to_le_bytes());
        out[4..8].copy_from_slice(&self.mid.to_le_bytes());
        out[8..12].copy_from_slice(&self.hi.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn scale(self) -> u32 {
        (self.flags >> 16) & 0xFF
    }

    pub fn is_negative(self) -> bool {
        self.flags & SIGN_BIT != 0
    }

    fn magnitude(self) -> u128 {
        (self.hi as u128) << 64 | (self.mid as u128) << 32 | self.lo as u128
    }

    pub fn mantissa(self) -> i128 {
        let mag = self.magnitude() as i128;
        if self.is_negative() { -mag } else { mag }
    }

    /// Drops fractional digits until the value fits.
    fn fit(mut m: i128, mut scale: u32) -> Option<Self> {
        while (m.unsigned_abs() > MAX_MANTISSA || scale > MAX_SCALE) && scale > 0 {
            m /= 10;
            scale -= 1;
        }
        Self::new(m, scale)
    }

    /// Brings both operands to a common scale, giving up low digits on overflow.
    fn align(a: Self, b: Self) -> (i128, i128, u32) {
        let (mut ma, mut sa) = (a.mantissa(), a.scale());
        let (mut mb, mut sb) = (b.mantissa(), b.scale());
        while sa != sb {
            if sa < sb {
                match ma.checked_mul(10) {
                    Some(v) => { ma = v; sa += 1; }
                    None => { mb /= 10; sb -= 1; }
                }
            } else {
                match mb.checked_mul(10) {
                    Some(v) => { mb = v; sb += 1; }
                    None => { ma /= 10; sa -= 1; }
                }
            }
        }
        (ma, mb, sa)
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        let (a, b, s) = Self::align(self, other);
        Self::fit(a.checked_add(b)?, s)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        let (a, b, s) = Self::align(self, other);
        Self::fit(a.checked_sub(b)?, s)
    }

    pub fn checked_mul(self, other: Self) -> Option<Self> {
        let (mut ma, mut sa) = (self.mantissa(), self.scale());
        let (mut mb, mut sb) = (other.mantissa(), other.scale());
        loop {
            if let Some(p) = ma.checked_mul(mb) {
                return Self::fit(p, sa + sb);
            }
            if sa >= sb && sa > 0 {
                ma /= 10;
                sa -= 1;
            } else if sb > 0 {
                mb /= 10;
                sb -= 1;
            } else {
                return None;
            }
        }
    }

    /// Division; `None` on a zero divisor or overflow.
    pub fn checked_div(self, other: Self) -> Option<Self> {
        let divisor = other.mantissa();
        if divisor == 0 {
            return None;
        }
        let mut n = self.mantissa();
        let mut s = self.scale() as i32 - other.scale() as i32;
        while s < MAX_SCALE as i32 {
            match n.checked_mul(10) {
                Some(v) => { n = v; s += 1; }
                None => break,
            }
        }
        let mut q = n / divisor;
        while s < 0 {
            q = q.checked_mul(10)?;
            s += 1;
        }
        while s > 0 && q % 10 == 0 {
            q /= 10;
            s -= 1;
        }
        Self::fit(q, s as u32)
    }

    pub fn checked_rem(self, other: Self) -> Option<Self> {
        let (a, b, s) = Self::align(self, other);
        if b == 0 {
            return None;
        }
        Self::fit(a % b, s)
    }

    pub fn checked_neg(self) -> Option<Self> {
        Self::new(-self.mantissa(), self.scale())
    }

    /// Numeric ordering, independent of scale.
    pub fn cmp_value(self, other: Self) -> Ordering {
        let (a, b, _) = Self::align(self, other);
        a.cmp(&b)
    }

    /// Integer part, truncated toward zero.
    pub fn trunc(self) -> i128 {
        match 10i128.checked_pow(self.scale()) {
            Some(p) => self.mantissa() / p,
            None => 0,
        }
    }

    pub fn to_f64(self) -> f64 {
        self.mantissa() as f64 / 10f64.powi(self.scale() as i32)
    }

    pub fn from_f64(v: f64) -> Option<Self> {
        if !v.is_finite() {
            return None;
        }
        // Largest scale that keeps the mantissa representable, capped at 15 significant fractional digits.
        for scale in (0..=15u32).rev() {
            let scaled = (v * 10f64.powi(scale as i32)).round();
            if scaled.abs() < MAX_MANTISSA as f64 {
                let mut m = scaled as i128;
                let mut s = scale;
                while s > 0 && m % 10 == 0 {
                    m /= 10;
                    s -= 1;
                }
                return Self::new(m, s);
            }
        }
        None
    }
}

impl From<i64> for Decimal {
    fn from(v: i64) -> Self {
        Decimal::new(v as i128, 0).unwrap_or(Decimal::ZERO)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.magnitude().to_string();
        let scale = self.scale() as usize;
        let sign = if self.is_negative() { "-" } else { "" };
        if scale == 0 {
            return write!(f, "{}{}", sign, digits);
        }
        let padded = format!("{:0>width$}", digits, width = scale + 1);
        let (int, frac) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, int, frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(m: i128, s: u32) -> Decimal {
        Decimal::new(m, s).unwrap()
    }

    #[test]
    fn test_layout_roundtrip() {
        let v = d(-1234567890123456789012345, 7);
        assert_eq!(Decimal::from_bytes(v.to_bytes()), Ok(v));
        assert_eq!(v.scale(), 7);
        assert!(v.is_negative());
    }

    #[test]
    fn test_layout_rejects_bad_scale_and_reserved_bits() {
        let mut bytes = d(1, 0).to_bytes();
        bytes[14] = 29;
        assert!(matches!(Decimal::from_bytes(bytes), Err(Error::Decode(_))));
        bytes[14] = 60;
        assert!(matches!(Decimal::from_bytes(bytes), Err(Error::Decode(_))));

        let mut bytes = d(1, 0).to_bytes();
        bytes[12] = 1;
        assert!(matches!(Decimal::from_bytes(bytes), Err(Error::Decode(_))));

        let mut bytes = d(-7, 28).to_bytes();
        assert_eq!(Decimal::from_bytes(bytes), Ok(d(-7, 28)));
        bytes[15] |= 0x01;
        assert!(Decimal::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_trunc() {
        assert_eq!(d(-12345, 2).trunc(), -123);
        assert_eq!(d(MAX_MANTISSA as i128, 28).trunc(), 7);
    }

    #[test]
    fn test_add_aligns_scale() {
        assert_eq!(d(15, 1).checked_add(d(25, 2)), Some(d(175, 2)));
        assert_eq!(d(1, 0).checked_sub(d(3, 0)), Some(d(-2, 0)));
    }

    #[test]
    fn test_overflow_is_none() {
        let max = d(MAX_MANTISSA as i128, 0);
        assert_eq!(max.checked_add(d(1, 0)), None);
        assert_eq!(max.checked_mul(d(2, 0)), None);
    }

    #[test]
    fn test_div() {
        assert_eq!(d(10, 0).checked_div(d(4, 0)), Some(d(25, 1)));
        assert_eq!(d(1, 0).checked_div(Decimal::ZERO), None);
    }

    #[test]
    fn test_display_and_compare() {
        assert_eq!(d(-5, 3).to_string(), "-0.005");
        assert_eq!(d(12345, 2).to_string(), "123.45");
        assert_eq!(d(10, 1).cmp_value(d(100, 2)), Ordering::Equal);
        assert_ne!(d(10, 1), d(100, 2));
    }
}
