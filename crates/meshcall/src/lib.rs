//! # MeshCall
//!
//! Serializable descriptions of "what to call with what arguments".
//!
//! ## Architecture
//!
//! A `Descriptor` is an immutable expression tree: constants, parameter
//! references, operators, member reads, method calls, construction, blocks and
//! lambdas. The `codec` turns it into `meshpack` bytes and back, naming types
//! through a scoped `TypeRegistry`. The `eval` stack machine runs it against
//! live objects, resolving every member through an explicit `Catalog` and
//! asking an `AccessPolicy` before anything is invoked.

pub mod arith;
pub mod catalog;
pub mod codec;
pub mod decimal;
pub mod descriptor;
pub mod error;
pub mod eval;
pub mod registry;
pub mod types;
pub mod value;

mod builtins;

#[cfg(test)]
mod tests;

pub use catalog::Access;
pub use catalog::AccessPolicy;
pub use catalog::AllowAll;
pub use catalog::Catalog;
pub use catalog::MemberInfo;
pub use catalog::RemoteOnly;
pub use catalog::WireData;
pub use codec::CodecContext;
pub use decimal::Decimal;
pub use descriptor::ArrayInit;
pub use descriptor::BinaryOp;
pub use descriptor::Descriptor;
pub use descriptor::Param;
pub use descriptor::UnaryOp;
pub use error::Error;
pub use error::Result;
pub use eval::Evaluator;
pub use registry::TypeRegistry;
pub use types::TypeName;
pub use types::TypeTag;
pub use value::DateTime;
pub use value::FromValue;
pub use value::Value;
