//! # Meshpack
//!
//! A small, bounded byte codec for the hub mesh wire format.
//!
//! ## Philosophy
//!
//! - **Fixed Layout**: No self-description. Every reader knows the field order it expects;
//!   the only framing is explicit length prefixes.
//! - **Bounded**: Encoders track open sections explicitly and back-patch their sizes.
//!   Decoders are zero-copy, bounds-checked views.
//!
//! ## Format
//!
//! - **Scalars**: little-endian fixed widths (`u8` .. `u64`, IEEE floats).
//! - **Strings**: `[Len: i32][UTF-16 code units: Len * 2]`, `Len == -1` is null.
//! - **Sized sections**: `[Len: u16][Body: Len]`, used for nested packets and payloads.


/// Meshpack encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// String data is not valid UTF-16.
    InvalidUtf16,
    /// A `char` field does not hold a Unicode scalar value.
    InvalidChar(u32),
    /// A `bool` field holds something other than 0 or 1.
    InvalidBool(u8),
    /// A length prefix is negative and not the null marker.
    NegativeLength(i32),
    /// A sized section or length prefix does not fit its width.
    SectionTooLarge(usize),
    /// Closing a section when none is open.
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open sections.
    ScopeStillOpen,
    /// Bytes were left over after a complete read.
    TrailingBytes(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidChar(v) => write!(f, "Invalid char scalar: {:#x}", v),
            Error::InvalidBool(b) => write!(f, "Invalid bool byte: {:#04x}", b),
            Error::NegativeLength(n) => write!(f, "Negative length prefix: {}", n),
            Error::SectionTooLarge(n) => write!(f, "Section of {} bytes exceeds its length prefix", n),
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after complete read", n),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for Meshpack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The marker written in place of a length for null strings and arrays.
pub const NULL_LENGTH: i32 = -1;

/// The largest body a `u16` sized section can carry.
pub const MAX_SECTION: usize = u16::MAX as usize;

/// A bounded encoder.
///
/// The Encoder keeps a stack of open sized sections and back-patches each
/// section's `u16` length when it is closed.
///
/// # Structural Invariants
///
/// 1. Every `sized_begin()` must be matched by a `sized_end()`.
/// 2. A section body longer than `u16::MAX` fails on close.
/// 3. The buffer can only be finalized once every section is closed.
pub struct Encoder {
    buf: Vec<u8>,
    /// Start offsets (after the length placeholder) of open sections.
    stack: Vec<usize>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates a new encoder with default capacity.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            stack: Vec::with_capacity(4),
        }
    }

    /// Number of bytes written so far, including open sections.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the encoder and returns the final byte vector.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if a section is still open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if !self.stack.is_empty() {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    /// Returns a view of the current buffer.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if a section is still open.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        if !self.stack.is_empty() {
            return Err(Error::ScopeStillOpen);
        }
        Ok(&self.buf)
    }

    /// Encodes an unsigned 8-bit integer.
    pub fn u8(&mut self, v: u8) { self.buf.push(v); }
    /// Encodes a signed 8-bit integer.
    pub fn i8(&mut self, v: i8) { self.buf.push(v as u8); }
    /// Encodes a bool as a single 0/1 byte.
    pub fn bool(&mut self, v: bool) { self.buf.push(v as u8); }

    /// Encodes an unsigned 16-bit integer (LE).
    pub fn u16(&mut self, v: u16) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Encodes a signed 16-bit integer (LE).
    pub fn i16(&mut self, v: i16) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Encodes an unsigned 32-bit integer (LE).
    pub fn u32(&mut self, v: u32) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Encodes a signed 32-bit integer (LE).
    pub fn i32(&mut self, v: i32) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Encodes an unsigned 64-bit integer (LE).
    pub fn u64(&mut self, v: u64) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Encodes a signed 64-bit integer (LE).
    pub fn i64(&mut self, v: i64) { self.buf.extend_from_slice(&v.to_le_bytes()); }

    /// Encodes a 32-bit float as its IEEE bit pattern (LE).
    pub fn f32(&mut self, v: f32) { self.u32(v.to_bits()); }
    /// Encodes a 64-bit float as its IEEE bit pattern (LE).
    pub fn f64(&mut self, v: f64) { self.u64(v.to_bits()); }

    /// Encodes a char as its scalar value (u32 LE).
    pub fn char(&mut self, v: char) { self.u32(v as u32); }

    /// Appends raw bytes with no prefix.
    pub fn raw(&mut self, v: &[u8]) { self.buf.extend_from_slice(v); }

    /// Encodes an `i32` length prefix, or the null marker for `None`.
    pub fn length(&mut self, len: Option<usize>) -> Result<()> {
        match len {
            None => self.i32(NULL_LENGTH),
            Some(n) => {
                let n = i32::try_from(n).map_err(|_| Error::SectionTooLarge(n))?;
                self.i32(n);
            }
        }
        Ok(())
    }

    /// Encodes a string as length-prefixed UTF-16 code units.
    pub fn str(&mut self, v: &str) -> Result<()> {
        let units: Vec<u16> = v.encode_utf16().collect();
        self.length(Some(units.len()))?;
        for unit in units {
            self.u16(unit);
        }
        Ok(())
    }

    /// Encodes an optional string; `None` is written as the null marker.
    pub fn opt_str(&mut self, v: Option<&str>) -> Result<()> {
        match v {
            Some(s) => self.str(s),
            None => self.length(None),
        }
    }

    /// Encodes a byte blob inside a `u16` sized section.
    pub fn blob(&mut self, v: &[u8]) -> Result<()> {
        if v.len() > MAX_SECTION {
            return Err(Error::SectionTooLarge(v.len()));
        }
        self.u16(v.len() as u16);
        self.raw(v);
        Ok(())
    }

    /// Begins a sized section.
    ///
    /// # Invariants
    /// - Must be closed via `sized_end()`.
    pub fn sized_begin(&mut self) {
        self.buf.extend_from_slice(&[0, 0]); // Length placeholder
        self.stack.push(self.buf.len());
    }

    /// Ends the innermost sized section and patches its length.
    pub fn sized_end(&mut self) -> Result<()> {
        let start = self.stack.pop().ok_or(Error::ScopeUnderflow)?;
        let body_len = self.buf.len() - start;

        if body_len > MAX_SECTION {
            return Err(Error::SectionTooLarge(body_len));
        }

        let len_bytes = (body_len as u16).to_le_bytes();
        self.buf[start - 2..start].copy_from_slice(&len_bytes);
        Ok(())
    }
}

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// Reading advances the cursor. Sized sections return a new `Decoder`
/// restricted to the section body.
///
/// # Errors
/// All read operations return `Error::UnexpectedEnd` if the buffer is exhausted.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the remaining bytes in the view.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if the view is exhausted.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::TrailingBytes(self.buf.len()))
        }
    }

    /// Peeks the next byte without advancing.
    pub fn peek_u8(&self) -> Result<u8> {
        self.buf.first().copied().ok_or(Error::UnexpectedEnd)
    }

    /// Reads `n` raw bytes.
    pub fn raw(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() { return Err(Error::UnexpectedEnd); }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.raw(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Decodes u8.
    pub fn u8(&mut self) -> Result<u8> { Ok(self.array::<1>()?[0]) }
    /// Decodes i8.
    pub fn i8(&mut self) -> Result<i8> { Ok(self.u8()? as i8) }

    /// Decodes a 0/1 bool byte.
    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(Error::InvalidBool(b)),
        }
    }

    /// Decodes u16 (LE).
    pub fn u16(&mut self) -> Result<u16> { Ok(u16::from_le_bytes(self.array()?)) }
    /// Decodes i16 (LE).
    pub fn i16(&mut self) -> Result<i16> { Ok(i16::from_le_bytes(self.array()?)) }
    /// Decodes u32 (LE).
    pub fn u32(&mut self) -> Result<u32> { Ok(u32::from_le_bytes(self.array()?)) }
    /// Decodes i32 (LE).
    pub fn i32(&mut self) -> Result<i32> { Ok(i32::from_le_bytes(self.array()?)) }
    /// Decodes u64 (LE).
    pub fn u64(&mut self) -> Result<u64> { Ok(u64::from_le_bytes(self.array()?)) }
    /// Decodes i64 (LE).
    pub fn i64(&mut self) -> Result<i64> { Ok(i64::from_le_bytes(self.array()?)) }

    /// Decodes f32 from its bit pattern (LE).
    pub fn f32(&mut self) -> Result<f32> { Ok(f32::from_bits(self.u32()?)) }
    /// Decodes f64 from its bit pattern (LE).
    pub fn f64(&mut self) -> Result<f64> { Ok(f64::from_bits(self.u64()?)) }

    /// Decodes a char scalar (u32 LE).
    pub fn char(&mut self) -> Result<char> {
        let v = self.u32()?;
        char::from_u32(v).ok_or(Error::InvalidChar(v))
    }

    /// Decodes an `i32` length prefix; the null marker yields `None`.
    pub fn length(&mut self) -> Result<Option<usize>> {
        match self.i32()? {
            NULL_LENGTH => Ok(None),
            n if n < 0 => Err(Error::NegativeLength(n)),
            n => Ok(Some(n as usize)),
        }
    }

    /// Decodes an optional UTF-16 string.
    pub fn opt_str(&mut self) -> Result<Option<String>> {
        let Some(len) = self.length()? else { return Ok(None) };
        // Bound the allocation by what is actually left in the buffer.
        if len.saturating_mul(2) > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let mut units = Vec::with_capacity(len);
        for _ in 0..len {
            units.push(self.u16()?);
        }
        String::from_utf16(&units).map(Some).map_err(|_| Error::InvalidUtf16)
    }

    /// Decodes a UTF-16 string; null is rendered as an empty string.
    pub fn str(&mut self) -> Result<String> {
        Ok(self.opt_str()?.unwrap_or_default())
    }

    /// Decodes a blob written by `Encoder::blob`.
    pub fn blob(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.raw(len)
    }

    /// Enters a sized section and returns a decoder over its body.
    pub fn sized(&mut self) -> Result<Decoder<'a>> {
        Ok(Decoder::new(self.blob()?))
    }
}
