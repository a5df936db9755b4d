//! # Call Descriptors
//!
//! An immutable expression tree describing what to call with what arguments.
//!
//! ## Scoping
//!
//! Parameters and block locals are lexical. Every encode, decode and
//! evaluation pass keeps an ordered list of in-scope `Param`s: entering a
//! `Block` or `Lambda` pushes its bindings, leaving pops exactly that many.
//! A `Parameter` node refers to the innermost binding equal to it.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::types::TypeTag;
use crate::value::Value;

/// A named, typed binding slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Param {
    pub name: Arc<str>,
    pub ty: TypeTag,
}

impl Param {
    pub fn new(name: &str, ty: TypeTag) -> Self {
        Self { name: Arc::from(name), ty }
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $code),*
        }

        impl $name {
            pub fn from_u8(b: u8) -> Option<Self> {
                match b {
                    $($code => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// Binary operator kinds.
    BinaryOp {
        Add = 0x01,
        AddChecked = 0x02,
        Subtract = 0x03,
        SubtractChecked = 0x04,
        Multiply = 0x05,
        MultiplyChecked = 0x06,
        Divide = 0x07,
        Modulo = 0x08,
        Power = 0x09,
        And = 0x0A,
        Or = 0x0B,
        ExclusiveOr = 0x0C,
        AndAlso = 0x0D,
        OrElse = 0x0E,
        LeftShift = 0x0F,
        RightShift = 0x10,
        Equal = 0x11,
        NotEqual = 0x12,
        LessThan = 0x13,
        LessThanOrEqual = 0x14,
        GreaterThan = 0x15,
        GreaterThanOrEqual = 0x16,
        Coalesce = 0x17,
        ArrayIndex = 0x18,
        Assign = 0x20,
        AddAssign = 0x21,
        AddAssignChecked = 0x22,
        SubtractAssign = 0x23,
        SubtractAssignChecked = 0x24,
        MultiplyAssign = 0x25,
        MultiplyAssignChecked = 0x26,
        DivideAssign = 0x27,
        ModuloAssign = 0x28,
        PowerAssign = 0x29,
        AndAssign = 0x2A,
        OrAssign = 0x2B,
        ExclusiveOrAssign = 0x2C,
        LeftShiftAssign = 0x2D,
        RightShiftAssign = 0x2E,
    }
}

impl BinaryOp {
    /// True for `Assign` and every compound-assignment form.
    pub fn is_assign(self) -> bool {
        self as u8 >= BinaryOp::Assign as u8
    }

    /// The arithmetic operator a compound assignment combines with.
    /// `None` for plain `Assign` and non-assigning operators.
    pub fn combining(self) -> Option<BinaryOp> {
        Some(match self {
            BinaryOp::AddAssign => BinaryOp::Add,
            BinaryOp::AddAssignChecked => BinaryOp::AddChecked,
            BinaryOp::SubtractAssign => BinaryOp::Subtract,
            BinaryOp::SubtractAssignChecked => BinaryOp::SubtractChecked,
            BinaryOp::MultiplyAssign => BinaryOp::Multiply,
            BinaryOp::MultiplyAssignChecked => BinaryOp::MultiplyChecked,
            BinaryOp::DivideAssign => BinaryOp::Divide,
            BinaryOp::ModuloAssign => BinaryOp::Modulo,
            BinaryOp::PowerAssign => BinaryOp::Power,
            BinaryOp::AndAssign => BinaryOp::And,
            BinaryOp::OrAssign => BinaryOp::Or,
            BinaryOp::ExclusiveOrAssign => BinaryOp::ExclusiveOr,
            BinaryOp::LeftShiftAssign => BinaryOp::LeftShift,
            BinaryOp::RightShiftAssign => BinaryOp::RightShift,
            _ => return None,
        })
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal | BinaryOp::NotEqual |
            BinaryOp::LessThan | BinaryOp::LessThanOrEqual |
            BinaryOp::GreaterThan | BinaryOp::GreaterThanOrEqual
        )
    }
}

wire_enum! {
    /// Unary operator kinds.
    UnaryOp {
        Negate = 0x01,
        NegateChecked = 0x02,
        UnaryPlus = 0x03,
        Not = 0x04,
        OnesComplement = 0x05,
        Convert = 0x06,
        ConvertChecked = 0x07,
        TypeAs = 0x08,
        ArrayLength = 0x09,
        IsTrue = 0x0A,
        IsFalse = 0x0B,
        Increment = 0x0C,
        Decrement = 0x0D,
        PreIncrementAssign = 0x10,
        PreDecrementAssign = 0x11,
        PostIncrementAssign = 0x12,
        PostDecrementAssign = 0x13,
    }
}

impl UnaryOp {
    pub fn is_assign(self) -> bool {
        self as u8 >= UnaryOp::PreIncrementAssign as u8
    }
}

/// How a `NewArray` node is sized.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayInit {
    /// One length per dimension; elements start at their default value.
    Bounds(Vec<Descriptor>),
    /// Explicit one-dimensional elements.
    Elements(Vec<Descriptor>),
}

/// A call descriptor node.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Constant {
        ty: TypeTag,
        value: Value,
    },
    Parameter(Param),
    Binary {
        op: BinaryOp,
        left: Box<Descriptor>,
        right: Box<Descriptor>,
    },
    Unary {
        op: UnaryOp,
        /// Result type; the conversion target for `Convert`/`TypeAs`.
        ty: TypeTag,
        operand: Box<Descriptor>,
    },
    /// Field or property read. `target == None` reads a static member.
    Member {
        target: Option<Box<Descriptor>>,
        declaring: TypeTag,
        member: Arc<str>,
    },
    Index {
        target: Box<Descriptor>,
        indexes: Vec<Descriptor>,
    },
    Conditional {
        ty: TypeTag,
        test: Box<Descriptor>,
        if_true: Box<Descriptor>,
        if_false: Box<Descriptor>,
    },
    /// Invocation of a lambda value.
    Invoke {
        callee: Box<Descriptor>,
        args: Vec<Descriptor>,
    },
    /// Method call. `target == None` calls a static method.
    Call {
        target: Option<Box<Descriptor>>,
        declaring: TypeTag,
        method: Arc<str>,
        args: Vec<Descriptor>,
        generic_args: Vec<TypeTag>,
    },
    New {
        ty: TypeTag,
        args: Vec<Descriptor>,
    },
    NewArray {
        elem: TypeTag,
        init: ArrayInit,
    },
    Block {
        locals: Vec<Param>,
        body: Vec<Descriptor>,
    },
    Lambda {
        params: Vec<Param>,
        body: Box<Descriptor>,
    },
}

impl Descriptor {
    /// A constant whose type tag is the value's own runtime type.
    pub fn constant(value: impl Into<Value>) -> Self {
        let value = value.into();
        let ty = value.runtime_type().unwrap_or(TypeTag::Any);
        Descriptor::Constant { ty, value }
    }

    pub fn typed_constant(ty: TypeTag, value: impl Into<Value>) -> Self {
        Descriptor::Constant { ty, value: value.into() }
    }

    pub fn param(p: &Param) -> Self {
        Descriptor::Parameter(p.clone())
    }

    pub fn binary(op: BinaryOp, left: Descriptor, right: Descriptor) -> Self {
        Descriptor::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn unary(op: UnaryOp, ty: TypeTag, operand: Descriptor) -> Self {
        Descriptor::Unary { op, ty, operand: Box::new(operand) }
    }

    pub fn convert(ty: TypeTag, operand: Descriptor) -> Self {
        Self::unary(UnaryOp::Convert, ty, operand)
    }

    pub fn member(target: Descriptor, declaring: TypeTag, member: &str) -> Self {
        Descriptor::Member { target: Some(Box::new(target)), declaring, member: Arc::from(member) }
    }

    pub fn static_member(declaring: TypeTag, member: &str) -> Self {
        Descriptor::Member { target: None, declaring, member: Arc::from(member) }
    }

    pub fn index(target: Descriptor, indexes: Vec<Descriptor>) -> Self {
        Descriptor::Index { target: Box::new(target), indexes }
    }

    pub fn conditional(ty: TypeTag, test: Descriptor, if_true: Descriptor, if_false: Descriptor) -> Self {
        Descriptor::Conditional {
            ty,
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        }
    }

    pub fn invoke(callee: Descriptor, args: Vec<Descriptor>) -> Self {
        Descriptor::Invoke { callee: Box::new(callee), args }
    }

    pub fn call(target: Descriptor, declaring: TypeTag, method: &str, args: Vec<Descriptor>) -> Self {
        Descriptor::Call {
            target: Some(Box::new(target)),
            declaring,
            method: Arc::from(method),
            args,
            generic_args: Vec::new(),
        }
    }

    pub fn static_call(declaring: TypeTag, method: &str, args: Vec<Descriptor>) -> Self {
        Descriptor::Call { target: None, declaring, method: Arc::from(method), args, generic_args: Vec::new() }
    }

    /// Adds explicit generic arguments to a `Call` node; other nodes are returned unchanged.
    pub fn with_generics(self, generics: Vec<TypeTag>) -> Self {
        match self {
            Descriptor::Call { target, declaring, method, args, .. } => {
                Descriptor::Call { target, declaring, method, args, generic_args: generics }
            }
            other => other,
        }
    }

    pub fn new_object(ty: TypeTag, args: Vec<Descriptor>) -> Self {
        Descriptor::New { ty, args }
    }

    pub fn new_array(elem: TypeTag, items: Vec<Descriptor>) -> Self {
        Descriptor::NewArray { elem, init: ArrayInit::Elements(items) }
    }

    pub fn new_array_bounds(elem: TypeTag, bounds: Vec<Descriptor>) -> Self {
        Descriptor::NewArray { elem, init: ArrayInit::Bounds(bounds) }
    }

    pub fn block(locals: Vec<Param>, body: Vec<Descriptor>) -> Self {
        Descriptor::Block { locals, body }
    }

    pub fn lambda(params: Vec<Param>, body: Descriptor) -> Self {
        Descriptor::Lambda { params, body: Box::new(body) }
    }

    /// Node name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Descriptor::Constant { .. } => "Constant",
            Descriptor::Parameter(_) => "Parameter",
            Descriptor::Binary { .. } => "Binary",
            Descriptor::Unary { .. } => "Unary",
            Descriptor::Member { .. } => "Member",
            Descriptor::Index { .. } => "Index",
            Descriptor::Conditional { .. } => "Conditional",
            Descriptor::Invoke { .. } => "Invoke",
            Descriptor::Call { .. } => "Call",
            Descriptor::New { .. } => "New",
            Descriptor::NewArray { .. } => "NewArray",
            Descriptor::Block { .. } => "Block",
            Descriptor::Lambda { .. } => "Lambda",
        }
    }

    /// Best-effort static type, used for overload resolution while decoding.
    /// Nodes whose type is only known at runtime report `Any`, which every
    /// parameter type accepts.
    pub fn static_type(&self, catalog: &Catalog) -> TypeTag {
        match self {
            Descriptor::Constant { ty, .. } => ty.clone(),
            Descriptor::Parameter(p) => p.ty.clone(),
            Descriptor::Binary { op, left, .. } => {
                if op.is_comparison() || matches!(op, BinaryOp::AndAlso | BinaryOp::OrElse) {
                    TypeTag::Bool
                } else if *op == BinaryOp::ArrayIndex {
                    left.static_type(catalog).element().cloned().unwrap_or(TypeTag::Any)
                } else {
                    left.static_type(catalog)
                }
            }
            Descriptor::Unary { ty, .. } => ty.clone(),
            Descriptor::Member { declaring, member, target } => catalog
                .find_property(declaring, member, target.is_none())
                .map(|p| p.ty.clone())
                .unwrap_or(TypeTag::Any),
            Descriptor::Index { target, .. } => {
                target.static_type(catalog).element().cloned().unwrap_or(TypeTag::Any)
            }
            Descriptor::Conditional { ty, .. } => ty.clone(),
            Descriptor::Call { declaring, method, args, generic_args, target } => {
                let arg_types: Vec<_> = args.iter().map(|a| Some(a.static_type(catalog))).collect();
                catalog
                    .resolve_method(declaring, method, &arg_types, generic_args.len(), target.is_none())
                    .map(|m| m.ret.clone())
                    .unwrap_or(TypeTag::Any)
            }
            Descriptor::New { ty, .. } => ty.clone(),
            Descriptor::NewArray { elem, .. } => TypeTag::array(elem.clone()),
            Descriptor::Block { body, .. } => {
                body.last().map(|b| b.static_type(catalog)).unwrap_or(TypeTag::Void)
            }
            Descriptor::Invoke { .. } | Descriptor::Lambda { .. } => TypeTag::Any,
        }
    }
}
