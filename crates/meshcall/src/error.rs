//! # Error Definitions
//!
//! The central ledger of codec, resolution and evaluation failures.

use meshpack::Error as PackError;

/// Failures raised while encoding, decoding or evaluating call descriptors.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The underlying byte codec failed (truncated or malformed input).
    Pack(PackError),
    /// A descriptor or type tag is malformed or unsupported.
    Decode(String),
    /// A value cannot be placed on the wire (closures, pending results, objects without a codec).
    NotSerializable(String),
    /// Unknown method, member, constructor or type; generic arity mismatch.
    Resolution(String),
    /// The access hook refused a member.
    AccessDenied(String),
    /// The evaluator has no semantics for this node or operator/operand combination.
    NotImplemented(String),
    /// A checked operation overflowed.
    Overflow,
    /// Integer or decimal division by zero.
    DivideByZero,
    /// The operand types do not fit the operation.
    TypeMismatch { expected: String, found: String },
    /// A member was accessed through a null receiver.
    NullReference(String),
    IndexOutOfRange { index: usize, len: usize },
    /// Nesting exceeded the safety limit.
    RecursionLimitExceeded,
    /// A registered invoker reported a failure.
    Invocation(String),
    /// The evaluator broke one of its own invariants.
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Pack(e) => write!(f, "Malformed input: {}", e),
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::NotSerializable(what) => write!(f, "Not serializable: {}", what),
            Error::Resolution(msg) => write!(f, "Resolution error: {}", msg),
            Error::AccessDenied(member) => write!(f, "Access denied: {}", member),
            Error::NotImplemented(what) => write!(f, "Not implemented: {}", what),
            Error::Overflow => write!(f, "Arithmetic operation resulted in an overflow"),
            Error::DivideByZero => write!(f, "Attempted to divide by zero"),
            Error::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {}, found {}", expected, found)
            }
            Error::NullReference(what) => write!(f, "Null reference: {}", what),
            Error::IndexOutOfRange { index, len } => {
                write!(f, "Index {} out of range for length {}", index, len)
            }
            Error::RecursionLimitExceeded => write!(f, "Recursion limit exceeded"),
            Error::Invocation(msg) => write!(f, "{}", msg),
            Error::Internal(msg) => write!(f, "Internal evaluator error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self {
        Self::Pack(e)
    }
}

/// A specialized Result type for descriptor operations.
pub type Result<T> = std::result::Result<T, Error>;
