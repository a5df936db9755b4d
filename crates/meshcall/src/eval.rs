//! # Evaluator
//!
//! A stack machine that executes a descriptor tree against live bindings.
//!
//! ## Philosophy
//! The tree is never walked recursively. Nodes are scheduled onto an explicit
//! task stack; each node leaves exactly one value on the value stack. Deep
//! descriptors cost heap, not native stack. Only lambda invocation opens a
//! nested machine, and that nesting is bounded.
//!
//! ## Invariants
//! - Assignment targets are resolved to a `Place` first and read at most once,
//!   after the right-hand side is computed.
//! - The access policy is consulted before every method, property and
//!   constructor invocation. A denial aborts before the invoker runs.
//! - Block scopes push their locals on entry and pop exactly those on exit.

use std::sync::Arc;

use crate::arith;
use crate::catalog::Access;
use crate::catalog::AccessPolicy;
use crate::catalog::Catalog;
use crate::catalog::MemberInfo;
use crate::catalog::PropertyDef;
use crate::descriptor::ArrayInit;
use crate::descriptor::BinaryOp;
use crate::descriptor::Descriptor;
use crate::descriptor::Param;
use crate::descriptor::UnaryOp;
use crate::error::Error;
use crate::error::Result;
use crate::types::TypeTag;
use crate::value::ArrayRef;
use crate::value::Closure;
use crate::value::MAX_ARRAY_LEN;
use crate::value::Value;

/// Maximum nesting of lambda invocations.
pub const MAX_INVOKE_DEPTH: usize = 64;

/// Evaluates `d` with the given bindings in scope.
pub fn evaluate(
    d: &Descriptor,
    bindings: &[(Param, Value)],
    catalog: &Catalog,
    policy: &dyn AccessPolicy,
) -> Result<Value> {
    Evaluator::new(catalog, policy).eval(d, bindings)
}

/// Executes descriptors against a catalog under an access policy.
pub struct Evaluator<'a> {
    catalog: &'a Catalog,
    policy: &'a dyn AccessPolicy,
}

impl<'a> Evaluator<'a> {
    pub fn new(catalog: &'a Catalog, policy: &'a dyn AccessPolicy) -> Self {
        Self { catalog, policy }
    }

    pub fn eval(&self, d: &Descriptor, bindings: &[(Param, Value)]) -> Result<Value> {
        Machine::new(self, bindings.to_vec(), 0).run(d)
    }

    /// Calls a lambda value with positional arguments.
    pub fn call_closure(&self, closure: &Closure, args: Vec<Value>) -> Result<Value> {
        self.invoke(closure, args, 0)
    }

    fn invoke(&self, closure: &Closure, args: Vec<Value>, depth: usize) -> Result<Value> {
        if depth >= MAX_INVOKE_DEPTH {
            return Err(Error::RecursionLimitExceeded);
        }
        if closure.params.len() != args.len() {
            return Err(Error::TypeMismatch {
                expected: format!("{} arguments", closure.params.len()),
                found: format!("{} arguments", args.len()),
            });
        }
        let mut env = closure.captured.clone();
        env.extend(closure.params.iter().cloned().zip(args));
        Machine::new(self, env, depth).run(&closure.body)
    }

    fn check(&self, member: MemberInfo<'_>) -> Result<()> {
        match self.policy.check(member) {
            Access::Allowed => Ok(()),
            Access::Denied => Err(Error::AccessDenied(format!("{}.{}", member.declaring, member.name))),
        }
    }

    fn property(&self, declaring: &TypeTag, name: &str, target: Option<&Value>) -> Result<Arc<PropertyDef>> {
        let is_static = target.is_none();
        self.catalog
            .find_property(declaring, name, is_static)
            .or_else(|| {
                let runtime = target?.runtime_type()?;
                self.catalog.find_property(&runtime, name, is_static)
            })
            .ok_or_else(|| Error::Resolution(format!("no member {}.{}", declaring, name)))
    }
}

/// A resolved assignment target.
enum Place {
    Slot(usize),
    Element(ArrayRef, usize),
    Property(Option<Value>, Arc<PropertyDef>),
}

enum Task<'d> {
    Eval(&'d Descriptor),
    Place(&'d Descriptor),
    Op(Op<'d>),
}

enum Op<'d> {
    Binary(BinaryOp),
    Unary(UnaryOp, &'d TypeTag),
    ShortCircuit(BinaryOp, &'d Descriptor),
    Coalesce(&'d Descriptor),
    Branch(&'d Descriptor, &'d Descriptor),
    Member(&'d TypeTag, &'d str, bool),
    Index(usize),
    Invoke(usize),
    Call {
        declaring: &'d TypeTag,
        method: &'d str,
        argc: usize,
        has_target: bool,
        generics: &'d [TypeTag],
    },
    New(&'d TypeTag, usize),
    ArrayBounds(&'d TypeTag, usize),
    ArrayElements(&'d TypeTag, usize),
    EnterScope(&'d [Param]),
    ExitScope(usize),
    Discard,
    PushUnit,
    ElementPlace,
    PropertyPlace(&'d TypeTag, &'d str, bool),
    Assign(BinaryOp),
    UnaryAssign(UnaryOp),
}

struct Machine<'e, 'd> {
    ev: &'e Evaluator<'e>,
    depth: usize,
    env: Vec<(Param, Value)>,
    tasks: Vec<Task<'d>>,
    values: Vec<Value>,
    places: Vec<Place>,
}

fn as_bool(v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        other => Err(Error::TypeMismatch { expected: "bool".into(), found: other.type_name() }),
    }
}

fn as_index(v: &Value) -> Result<usize> {
    let i = arith::small_int(v)
        .ok_or_else(|| Error::TypeMismatch { expected: "integer index".into(), found: v.type_name() })?;
    usize::try_from(i)
        .map_err(|_| Error::TypeMismatch { expected: "non-negative index".into(), found: i.to_string() })
}

/// Rejects bounds whose total element count exceeds `MAX_ARRAY_LEN`.
fn check_bounds(dims: &[usize]) -> Result<()> {
    let mut total: usize = 1;
    for &n in dims {
        total = total
            .checked_mul(n.max(1))
            .filter(|t| *t <= MAX_ARRAY_LEN)
            .ok_or(Error::IndexOutOfRange { index: n, len: MAX_ARRAY_LEN })?;
    }
    Ok(())
}

fn build_array(elem: &TypeTag, dims: &[usize]) -> Value {
    match dims {
        [] => Value::array(elem.clone(), Vec::new()),
        [n] => Value::Array(ArrayRef::with_len(elem.clone(), *n)),
        [n, rest @ ..] => {
            let inner = rest.iter().fold(elem.clone(), |t, _| TypeTag::array(t));
            let items = (0..*n).map(|_| build_array(elem, rest)).collect();
            Value::array(inner, items)
        }
    }
}

impl<'e, 'd> Machine<'e, 'd> {
    fn new(ev: &'e Evaluator<'e>, env: Vec<(Param, Value)>, depth: usize) -> Self {
        Self { ev, depth, env, tasks: Vec::new(), values: Vec::new(), places: Vec::new() }
    }

    fn run(mut self, root: &'d Descriptor) -> Result<Value> {
        self.tasks.push(Task::Eval(root));
        while let Some(task) = self.tasks.pop() {
            match task {
                Task::Eval(d) => self.schedule(d)?,
                Task::Place(d) => self.schedule_place(d)?,
                Task::Op(op) => self.apply(op)?,
            }
        }
        self.pop()
    }

    fn pop(&mut self) -> Result<Value> {
        self.values
            .pop()
            .ok_or_else(|| Error::Internal("evaluation stack underflow".into()))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        if self.values.len() < n {
            return Err(Error::Internal("evaluation stack underflow".into()));
        }
        Ok(self.values.split_off(self.values.len() - n))
    }

    fn slot(&self, p: &Param) -> Result<usize> {
        self.env
            .iter()
            .rposition(|(q, _)| q == p)
            .ok_or_else(|| Error::Resolution(format!("unbound parameter {}", p.name)))
    }

    fn eval_all(&mut self, items: &'d [Descriptor]) {
        for d in items.iter().rev() {
            self.tasks.push(Task::Eval(d));
        }
    }

    fn schedule(&mut self, d: &'d Descriptor) -> Result<()> {
        match d {
            Descriptor::Constant { value, .. } => self.values.push(value.clone()),
            Descriptor::Parameter(p) => {
                let i = self.slot(p)?;
                self.values.push(self.env[i].1.clone());
            }
            Descriptor::Binary { op, left, right } => {
                if op.is_assign() {
                    self.tasks.push(Task::Op(Op::Assign(*op)));
                    self.tasks.push(Task::Eval(right));
                    self.tasks.push(Task::Place(left));
                } else {
                    match op {
                        BinaryOp::AndAlso | BinaryOp::OrElse => {
                            self.tasks.push(Task::Op(Op::ShortCircuit(*op, right)));
                        }
                        BinaryOp::Coalesce => self.tasks.push(Task::Op(Op::Coalesce(right))),
                        _ => {
                            self.tasks.push(Task::Op(Op::Binary(*op)));
                            self.tasks.push(Task::Eval(right));
                        }
                    }
                    self.tasks.push(Task::Eval(left));
                }
            }
            Descriptor::Unary { op, ty, operand } => {
                if op.is_assign() {
                    self.tasks.push(Task::Op(Op::UnaryAssign(*op)));
                    self.tasks.push(Task::Place(operand));
                } else {
                    self.tasks.push(Task::Op(Op::Unary(*op, ty)));
                    self.tasks.push(Task::Eval(operand));
                }
            }
            Descriptor::Member { target, declaring, member } => {
                self.tasks.push(Task::Op(Op::Member(declaring, &**member, target.is_some())));
                if let Some(t) = target {
                    self.tasks.push(Task::Eval(t));
                }
            }
            Descriptor::Index { target, indexes } => {
                self.tasks.push(Task::Op(Op::Index(indexes.len())));
                self.eval_all(indexes);
                self.tasks.push(Task::Eval(target));
            }
            Descriptor::Conditional { test, if_true, if_false, .. } => {
                self.tasks.push(Task::Op(Op::Branch(if_true, if_false)));
                self.tasks.push(Task::Eval(test));
            }
            Descriptor::Invoke { callee, args } => {
                self.tasks.push(Task::Op(Op::Invoke(args.len())));
                self.eval_all(args);
                self.tasks.push(Task::Eval(callee));
            }
            Descriptor::Call { target, declaring, method, args, generic_args } => {
                self.tasks.push(Task::Op(Op::Call {
                    declaring,
                    method: &**method,
                    argc: args.len(),
                    has_target: target.is_some(),
                    generics: generic_args.as_slice(),
                }));
                self.eval_all(args);
                if let Some(t) = target {
                    self.tasks.push(Task::Eval(t));
                }
            }
            Descriptor::New { ty, args } => {
                self.tasks.push(Task::Op(Op::New(ty, args.len())));
                self.eval_all(args);
            }
            Descriptor::NewArray { elem, init } => match init {
                ArrayInit::Bounds(bounds) => {
                    self.tasks.push(Task::Op(Op::ArrayBounds(elem, bounds.len())));
                    self.eval_all(bounds);
                }
                ArrayInit::Elements(items) => {
                    self.tasks.push(Task::Op(Op::ArrayElements(elem, items.len())));
                    self.eval_all(items);
                }
            },
            Descriptor::Block { locals, body } => {
                self.tasks.push(Task::Op(Op::ExitScope(locals.len())));
                if body.is_empty() {
                    self.tasks.push(Task::Op(Op::PushUnit));
                }
                for (i, expr) in body.iter().enumerate().rev() {
                    self.tasks.push(Task::Eval(expr));
                    if i > 0 {
                        self.tasks.push(Task::Op(Op::Discard));
                    }
                }
                self.tasks.push(Task::Op(Op::EnterScope(locals)));
            }
            Descriptor::Lambda { params, body } => {
                let closure = Closure {
                    params: params.clone(),
                    body: Arc::new(body.as_ref().clone()),
                    captured: self.env.clone(),
                };
                self.values.push(Value::Closure(Arc::new(closure)));
            }
        }
        Ok(())
    }

    fn schedule_place(&mut self, d: &'d Descriptor) -> Result<()> {
        match d {
            Descriptor::Parameter(p) => {
                let i = self.slot(p)?;
                self.places.push(Place::Slot(i));
            }
            Descriptor::Binary { op: BinaryOp::ArrayIndex, left, right } => {
                self.tasks.push(Task::Op(Op::ElementPlace));
                self.tasks.push(Task::Eval(right));
                self.tasks.push(Task::Eval(left));
            }
            Descriptor::Index { target, indexes } if indexes.len() == 1 => {
                self.tasks.push(Task::Op(Op::ElementPlace));
                self.tasks.push(Task::Eval(&indexes[0]));
                self.tasks.push(Task::Eval(target));
            }
            Descriptor::Member { target, declaring, member } => {
                self.tasks.push(Task::Op(Op::PropertyPlace(declaring, &**member, target.is_some())));
                if let Some(t) = target {
                    self.tasks.push(Task::Eval(t));
                }
            }
            other => {
                return Err(Error::NotImplemented(format!("assignment to {}", other.kind_name())));
            }
        }
        Ok(())
    }

    fn read(&self, place: &Place) -> Result<Value> {
        match place {
            Place::Slot(i) => Ok(self.env[*i].1.clone()),
            Place::Element(a, i) => a.get(*i),
            Place::Property(target, prop) => {
                self.ev.check(MemberInfo { declaring: &prop.declaring, name: &*prop.name, remote: prop.remote })?;
                prop.get(target.as_ref())
            }
        }
    }

    fn write(&mut self, place: &Place, value: Value) -> Result<()> {
        match place {
            Place::Slot(i) => {
                self.env[*i].1 = value;
                Ok(())
            }
            Place::Element(a, i) => a.set(*i, value),
            Place::Property(target, prop) => {
                self.ev.check(MemberInfo { declaring: &prop.declaring, name: &*prop.name, remote: prop.remote })?;
                prop.set(target.as_ref(), value)
            }
        }
    }

    fn pop_target(&mut self, has_target: bool, member: &str) -> Result<Option<Value>> {
        if !has_target {
            return Ok(None);
        }
        match self.pop()? {
            Value::Null => Err(Error::NullReference(member.to_string())),
            v => Ok(Some(v)),
        }
    }

    fn apply(&mut self, op: Op<'d>) -> Result<()> {
        match op {
            Op::Binary(op) => {
                let r = self.pop()?;
                let l = self.pop()?;
                let v = if op == BinaryOp::ArrayIndex { self.element(&l, &r)? } else { arith::binary(op, &l, &r)? };
                self.values.push(v);
            }
            Op::Unary(op, ty) => {
                let v = self.pop()?;
                let out = match op {
                    UnaryOp::Convert => arith::convert(&v, ty, false)?,
                    UnaryOp::ConvertChecked => arith::convert(&v, ty, true)?,
                    UnaryOp::TypeAs => arith::type_as(&v, ty),
                    _ => arith::unary(op, &v)?,
                };
                self.values.push(out);
            }
            Op::ShortCircuit(op, right) => {
                let l = as_bool(&self.pop()?)?;
                let decided = if op == BinaryOp::AndAlso { !l } else { l };
                if decided {
                    self.values.push(Value::Bool(l));
                } else {
                    self.tasks.push(Task::Eval(right));
                }
            }
            Op::Coalesce(right) => {
                let l = self.pop()?;
                if l.is_null() {
                    self.tasks.push(Task::Eval(right));
                } else {
                    self.values.push(l);
                }
            }
            Op::Branch(if_true, if_false) => {
                let test = as_bool(&self.pop()?)?;
                self.tasks.push(Task::Eval(if test { if_true } else { if_false }));
            }
            Op::Member(declaring, member, has_target) => {
                let target = self.pop_target(has_target, member)?;
                let prop = self.ev.property(declaring, member, target.as_ref())?;
                self.ev.check(MemberInfo { declaring: &prop.declaring, name: &*prop.name, remote: prop.remote })?;
                let v = prop.get(target.as_ref())?;
                self.values.push(v);
            }
            Op::Index(n) => {
                let indexes = self.pop_n(n)?;
                let target = self.pop()?;
                match indexes.as_slice() {
                    [i] => {
                        let v = self.element(&target, i)?;
                        self.values.push(v);
                    }
                    _ => return Err(Error::NotImplemented(format!("{}-dimensional index", n))),
                }
            }
            Op::Invoke(n) => {
                let args = self.pop_n(n)?;
                match self.pop()? {
                    Value::Closure(c) => {
                        let v = self.ev.invoke(&c, args, self.depth + 1)?;
                        self.values.push(v);
                    }
                    Value::Null => return Err(Error::NullReference("invoked delegate".into())),
                    other => {
                        return Err(Error::TypeMismatch { expected: "lambda".into(), found: other.type_name() });
                    }
                }
            }
            Op::Call { declaring, method, argc, has_target, generics } => {
                let args = self.pop_n(argc)?;
                let target = self.pop_target(has_target, method)?;
                let arg_types: Vec<_> = args.iter().map(Value::runtime_type).collect();
                let def = self
                    .ev
                    .catalog
                    .resolve_method(declaring, method, &arg_types, generics.len(), !has_target)?;
                self.ev.check(MemberInfo { declaring: &def.declaring, name: &*def.name, remote: def.remote })?;
                let v = def.invoke(target.as_ref(), &args, generics)?;
                self.values.push(v);
            }
            Op::New(ty, n) => {
                let args = self.pop_n(n)?;
                let arg_types: Vec<_> = args.iter().map(Value::runtime_type).collect();
                let ctor = self.ev.catalog.resolve_constructor(ty, &arg_types)?;
                self.ev.check(MemberInfo { declaring: ty, name: ".ctor", remote: ctor.remote })?;
                let v = ctor.invoke(&args)?;
                self.values.push(v);
            }
            Op::ArrayBounds(elem, n) => {
                let dims = self
                    .pop_n(n)?
                    .iter()
                    .map(as_index)
                    .collect::<Result<Vec<_>>>()?;
                check_bounds(&dims)?;
                self.values.push(build_array(elem, &dims));
            }
            Op::ArrayElements(elem, n) => {
                let items = self.pop_n(n)?;
                self.values.push(Value::array(elem.clone(), items));
            }
            Op::EnterScope(locals) => {
                for l in locals {
                    self.env.push((l.clone(), Value::default_for(&l.ty)));
                }
            }
            Op::ExitScope(n) => {
                let keep = self.env.len().saturating_sub(n);
                self.env.truncate(keep);
            }
            Op::Discard => {
                self.pop()?;
            }
            Op::PushUnit => self.values.push(Value::Unit),
            Op::ElementPlace => {
                let index = self.pop()?;
                match self.pop()? {
                    Value::Array(a) => self.places.push(Place::Element(a, as_index(&index)?)),
                    Value::Null => return Err(Error::NullReference("array".into())),
                    other => {
                        return Err(Error::TypeMismatch { expected: "array".into(), found: other.type_name() });
                    }
                }
            }
            Op::PropertyPlace(declaring, member, has_target) => {
                let target = self.pop_target(has_target, member)?;
                let prop = self.ev.property(declaring, member, target.as_ref())?;
                self.places.push(Place::Property(target, prop));
            }
            Op::Assign(op) => {
                let rhs = self.pop()?;
                let place = self
                    .places
                    .pop()
                    .ok_or_else(|| Error::Decode("assignment without target".into()))?;
                let new = match op.combining() {
                    None => rhs,
                    Some(base) => arith::binary(base, &self.read(&place)?, &rhs)?,
                };
                self.write(&place, new.clone())?;
                self.values.push(new);
            }
            Op::UnaryAssign(op) => {
                let place = self
                    .places
                    .pop()
                    .ok_or_else(|| Error::Decode("assignment without target".into()))?;
                let old = self.read(&place)?;
                let step = match op {
                    UnaryOp::PreIncrementAssign | UnaryOp::PostIncrementAssign => UnaryOp::Increment,
                    _ => UnaryOp::Decrement,
                };
                let new = arith::unary(step, &old)?;
                self.write(&place, new.clone())?;
                let result = match op {
                    UnaryOp::PreIncrementAssign | UnaryOp::PreDecrementAssign => new,
                    _ => old,
                };
                self.values.push(result);
            }
        }
        Ok(())
    }

    fn element(&self, target: &Value, index: &Value) -> Result<Value> {
        let i = as_index(index)?;
        match target {
            Value::Array(a) => a.get(i),
            Value::String(s) => {
                let units: Vec<u16> = s.encode_utf16().collect();
                let unit = units.get(i).ok_or(Error::IndexOutOfRange { index: i, len: units.len() })?;
                Ok(Value::Char(char::from_u32(*unit as u32).unwrap_or(char::REPLACEMENT_CHARACTER)))
            }
            Value::Null => Err(Error::NullReference("indexed value".into())),
            other => Err(Error::TypeMismatch { expected: "array".into(), found: other.type_name() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AllowAll;

    #[test]
    fn test_stack_underflow_is_internal() {
        let catalog = Catalog::new();
        let ev = Evaluator::new(&catalog, &AllowAll);
        let mut machine = Machine::new(&ev, Vec::new(), 0);
        assert!(matches!(machine.pop(), Err(Error::Internal(_))));
        machine.values.push(Value::I32(1));
        assert!(matches!(machine.pop_n(2), Err(Error::Internal(_))));
        assert_eq!(machine.pop_n(1), Ok(vec![Value::I32(1)]));
    }
}
