use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use anyhow::Result;
use meshpack::Decoder;
use meshpack::Encoder;

use crate::*;
use crate::codec::kind;

// ============================================================================
//  FIXTURES
// ============================================================================

struct Counter {
    hits: AtomicI32,
}

#[derive(Debug, Clone, PartialEq)]
struct Point {
    x: i32,
    y: i32,
}

impl WireData for Point {
    fn encode(&self, enc: &mut Encoder) -> meshpack::Result<()> {
        enc.i32(self.x);
        enc.i32(self.y);
        Ok(())
    }

    fn decode(dec: &mut Decoder<'_>) -> meshpack::Result<Self> {
        Ok(Point { x: dec.i32()?, y: dec.i32()? })
    }
}

fn counter_ty() -> TypeTag {
    TypeTag::external("demo.Counter")
}

fn point_ty() -> TypeTag {
    TypeTag::external("demo.Point")
}

fn catalog() -> Catalog {
    let mut catalog = Catalog::with_builtins();
    catalog
        .define::<Counter>("demo.Counter")
        .method("Add", &[TypeTag::I32, TypeTag::I32], TypeTag::I32, |_, args| {
            Ok(arith::binary(BinaryOp::AddChecked, &args[0], &args[1])?)
        })
        .method("Bump", &[], TypeTag::I32, |c, _| Ok(Value::I32(c.hits.fetch_add(1, Ordering::SeqCst) + 1)))
        .local_method("Reset", &[], TypeTag::Void, |c, _| {
            c.hits.store(0, Ordering::SeqCst);
            Ok(Value::Unit)
        })
        .generic_method("Default", 1, &[], TypeTag::Any, |_, _, generics| Ok(Value::default_for(&generics[0])))
        .property("Hits", TypeTag::I32, |c| Value::I32(c.hits.load(Ordering::SeqCst)))
        .constructor(&[], |_| Ok(Counter { hits: AtomicI32::new(0) }))
        .constructor(&[TypeTag::I32], |args| {
            Ok(Counter { hits: AtomicI32::new(i32::from_value(args[0].clone())?) })
        });
    catalog
        .define::<Point>("demo.Point")
        .data()
        .property("X", TypeTag::I32, |p| Value::I32(p.x))
        .constructor(&[TypeTag::I32, TypeTag::I32], |args| {
            Ok(Point { x: i32::from_value(args[0].clone())?, y: i32::from_value(args[1].clone())? })
        });
    catalog
}

fn counter(hits: i32) -> Value {
    Value::object("demo.Counter", Counter { hits: AtomicI32::new(hits) })
}

fn this() -> Param {
    Param::new("this", counter_ty())
}

fn roundtrip(catalog: &Catalog, registry: &TypeRegistry, d: &Descriptor) -> Result<Descriptor> {
    let ctx = CodecContext::new(registry, catalog);
    let mut scope = vec![this()];
    let bytes = codec::encode(ctx, d, &mut scope)?;
    assert_eq!(scope.len(), 1);
    let back = codec::decode(ctx, &bytes, &mut scope)?;
    assert_eq!(scope.len(), 1);
    Ok(back)
}

fn eval_with(catalog: &Catalog, d: &Descriptor, target: Value) -> crate::Result<Value> {
    eval::evaluate(d, &[(this(), target)], catalog, &RemoteOnly)
}

fn c(v: impl Into<Value>) -> Descriptor {
    Descriptor::constant(v)
}

// ============================================================================
//  CODEC
// ============================================================================

#[test]
fn test_roundtrip_representative_nodes() -> Result<()> {
    let catalog = catalog();
    let registry = TypeRegistry::new();
    let p = this();
    let x = Param::new("x", TypeTag::I32);
    let local = Param::new("acc", TypeTag::I64);

    let nodes = vec![
        c(42i32),
        Descriptor::typed_constant(TypeTag::Any, Value::from("boxed")),
        Descriptor::typed_constant(TypeTag::nullable(TypeTag::Decimal), Decimal::new(-12345, 2).unwrap()),
        Descriptor::typed_constant(TypeTag::String, Value::Null),
        Descriptor::typed_constant(TypeTag::array(TypeTag::U16), Value::array(TypeTag::U16, vec![Value::U16(1), Value::U16(65535)])),
        Descriptor::typed_constant(TypeTag::DateTime, DateTime(638_000_000_000_000_000)),
        Descriptor::binary(BinaryOp::MultiplyChecked, c(3i64), c(4i64)),
        Descriptor::unary(UnaryOp::ConvertChecked, TypeTag::U8, c(7i32)),
        Descriptor::member(Descriptor::param(&p), counter_ty(), "Hits"),
        Descriptor::index(c(Value::array(TypeTag::I32, vec![Value::I32(9)])), vec![c(0i32)]),
        Descriptor::conditional(TypeTag::String, c(true), c("yes"), c("no")),
        Descriptor::call(Descriptor::param(&p), counter_ty(), "Add", vec![c(1i32), c(2i32)]),
        Descriptor::call(Descriptor::param(&p), counter_ty(), "Default", vec![]).with_generics(vec![TypeTag::I64]),
        Descriptor::static_call(TypeTag::String, "Concat", vec![c("a"), c("b")]),
        Descriptor::new_object(counter_ty(), vec![c(5i32)]),
        Descriptor::new_array(TypeTag::F64, vec![c(1.5f64), c(-0.0f64)]),
        Descriptor::new_array_bounds(TypeTag::Char, vec![c(2i32), c(3i32)]),
        Descriptor::block(
            vec![local.clone()],
            vec![
                Descriptor::binary(BinaryOp::Assign, Descriptor::param(&local), c(10i64)),
                Descriptor::binary(BinaryOp::AddAssign, Descriptor::param(&local), c(5i64)),
            ],
        ),
        Descriptor::invoke(
            Descriptor::lambda(vec![x.clone()], Descriptor::binary(BinaryOp::Add, Descriptor::param(&x), c(1i32))),
            vec![c(41i32)],
        ),
    ];

    for node in nodes {
        let back = roundtrip(&catalog, &registry, &node)?;
        assert_eq!(back, node, "roundtrip of {}", node.kind_name());
    }
    Ok(())
}

#[test]
fn test_roundtrip_every_primitive_constant() -> Result<()> {
    let catalog = catalog();
    let registry = TypeRegistry::new();

    let primitives: Vec<(TypeTag, Value)> = vec![
        (TypeTag::I8, Value::I8(i8::MIN)),
        (TypeTag::U8, Value::U8(u8::MAX)),
        (TypeTag::I16, Value::I16(-2)),
        (TypeTag::U16, Value::U16(40_000)),
        (TypeTag::I32, Value::I32(i32::MIN)),
        (TypeTag::U32, Value::U32(u32::MAX)),
        (TypeTag::I64, Value::I64(i64::MIN)),
        (TypeTag::U64, Value::U64(u64::MAX)),
        (TypeTag::F32, Value::F32(-1.5)),
        (TypeTag::F64, Value::F64(1e300)),
        (TypeTag::Decimal, Value::Decimal(Decimal::new(-79_228_162_514_264_337_593_543_950_335, 28).unwrap())),
        (TypeTag::Bool, Value::Bool(true)),
        (TypeTag::Char, Value::Char('\u{e9}')),
        (TypeTag::DateTime, Value::DateTime(DateTime(-1))),
    ];

    for (ty, value) in primitives {
        let forms = [
            Descriptor::typed_constant(ty.clone(), value.clone()),
            Descriptor::typed_constant(TypeTag::nullable(ty.clone()), value.clone()),
            Descriptor::typed_constant(TypeTag::nullable(ty.clone()), Value::Null),
            Descriptor::typed_constant(TypeTag::Any, value.clone()),
        ];
        for node in forms {
            let back = roundtrip(&catalog, &registry, &node)?;
            assert_eq!(back, node, "roundtrip of {}", ty);
        }
    }

    for s in [Value::from(""), Value::from("\u{1F600} mesh"), Value::Null] {
        let node = Descriptor::typed_constant(TypeTag::String, s);
        assert_eq!(roundtrip(&catalog, &registry, &node)?, node);
    }
    Ok(())
}

#[test]
fn test_registered_and_unregistered_type_tags() -> Result<()> {
    let catalog = catalog();
    let registry = TypeRegistry::new();
    let ctx = CodecContext::new(&registry, &catalog);

    let mut enc = Encoder::new();
    codec::encode_type(ctx, &mut enc, &point_ty())?;
    let unregistered = enc.into_bytes()?;
    assert_eq!(unregistered[0], types::code::UNREGISTERED);

    let id = registry.register("demo.Point");
    let mut enc = Encoder::new();
    codec::encode_type(ctx, &mut enc, &point_ty())?;
    let registered = enc.into_bytes()?;
    assert_eq!(registered[0], types::code::REGISTERED);
    assert_eq!(&registered[1..], &id.to_le_bytes());

    for bytes in [unregistered, registered] {
        let ty = codec::decode_type(ctx, &mut Decoder::new(&bytes))?;
        assert_eq!(ty, point_ty());
    }
    Ok(())
}

#[test]
fn test_unknown_type_name_fails_closed() -> Result<()> {
    let catalog = catalog();
    let registry = TypeRegistry::new();
    let ctx = CodecContext::new(&registry, &catalog);

    let mut enc = Encoder::new();
    codec::encode_type(ctx, &mut enc, &TypeTag::external("demo.Missing"))?;
    let bytes = enc.into_bytes()?;
    let err = codec::decode_type(ctx, &mut Decoder::new(&bytes)).unwrap_err();
    assert!(matches!(err, Error::Resolution(_)));

    let unknown_id = [types::code::REGISTERED, 99, 0, 0, 0];
    let err = codec::decode_type(ctx, &mut Decoder::new(&unknown_id)).unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
    Ok(())
}

#[test]
fn test_data_objects_cross_the_wire() -> Result<()> {
    let catalog = catalog();
    let registry = TypeRegistry::new();
    let ctx = CodecContext::new(&registry, &catalog);

    let point = Value::object("demo.Point", Point { x: 3, y: -4 });
    let bytes = codec::value_to_bytes(ctx, &point)?;
    let back = codec::value_from_bytes(ctx, &bytes)?;
    let Value::Object(obj) = back else { panic!("expected object") };
    assert_eq!(obj.downcast::<Point>(), Some(&Point { x: 3, y: -4 }));

    let err = codec::value_to_bytes(ctx, &counter(1)).unwrap_err();
    assert!(matches!(err, Error::NotSerializable(_)));
    Ok(())
}

#[test]
fn test_constant_member_chain_is_folded() -> Result<()> {
    let catalog = catalog();
    let registry = TypeRegistry::new();
    let captured = Value::object("demo.Point", Point { x: 17, y: 0 });
    let d = Descriptor::member(Descriptor::typed_constant(point_ty(), captured), point_ty(), "X");

    let back = roundtrip(&catalog, &registry, &d)?;
    assert_eq!(back, Descriptor::typed_constant(TypeTag::I32, 17i32));

    // Receivers rooted in a parameter are shipped as written.
    let live = Descriptor::member(Descriptor::param(&this()), counter_ty(), "Hits");
    assert_eq!(roundtrip(&catalog, &registry, &live)?, live);
    Ok(())
}

#[test]
fn test_method_reresolution_on_decode() -> Result<()> {
    let catalog = catalog();
    let registry = TypeRegistry::new();
    let ctx = CodecContext::new(&registry, &catalog);
    let mut scope = vec![this()];

    // Wrong generic arity.
    let d = Descriptor::call(Descriptor::param(&this()), counter_ty(), "Default", vec![]);
    let bytes = codec::encode(ctx, &d, &mut scope)?;
    let err = codec::decode(ctx, &bytes, &mut scope).unwrap_err();
    assert!(matches!(err, Error::Resolution(ref m) if m.contains("arity")), "{err}");

    // Incompatible argument types.
    let d = Descriptor::call(Descriptor::param(&this()), counter_ty(), "Add", vec![c("1"), c(2i32)]);
    let bytes = codec::encode(ctx, &d, &mut scope)?;
    assert!(matches!(codec::decode(ctx, &bytes, &mut scope), Err(Error::Resolution(_))));
    assert_eq!(scope.len(), 1);
    Ok(())
}

#[test]
fn test_malformed_input() -> Result<()> {
    let catalog = catalog();
    let registry = TypeRegistry::new();
    let ctx = CodecContext::new(&registry, &catalog);
    let mut scope = Vec::new();

    assert!(matches!(codec::decode(ctx, &[0x7F], &mut scope), Err(Error::Decode(_))));
    assert!(matches!(codec::decode(ctx, &[kind::BINARY, 0xEE], &mut scope), Err(Error::Decode(_))));
    assert!(matches!(codec::decode(ctx, &[kind::PARAMETER, 0, 0], &mut scope), Err(Error::Decode(_))));
    assert!(matches!(codec::decode(ctx, &[kind::CONSTANT, types::code::I32, 1], &mut scope), Err(Error::Pack(_))));

    // Decimal scale above 28 and reserved flag bits.
    let mut decimal = vec![kind::CONSTANT, types::code::DECIMAL, 1];
    decimal.extend_from_slice(&[0; 11]);
    decimal.extend_from_slice(&[0, 0, 60, 0]);
    assert!(matches!(codec::decode(ctx, &decimal, &mut scope), Err(Error::Decode(_))));
    decimal[14] = 0x01;
    decimal[16] = 2;
    assert!(matches!(codec::decode(ctx, &decimal, &mut scope), Err(Error::Decode(_))));

    // A tiny header cannot claim a huge array, whatever the element type.
    let claim = |elem: u8, n: i32| {
        let mut bytes = vec![kind::CONSTANT, types::code::ARRAY, elem];
        bytes.extend_from_slice(&n.to_le_bytes());
        bytes
    };
    let huge_void = claim(types::code::VOID, 50_000_000);
    assert!(matches!(codec::decode(ctx, &huge_void, &mut scope), Err(Error::Decode(_))));
    let huge_int = claim(types::code::I32, 50_000_000);
    assert!(matches!(codec::decode(ctx, &huge_int, &mut scope), Err(Error::Pack(_))));
    let Descriptor::Constant { value: Value::Array(units), .. } = codec::decode(ctx, &claim(types::code::VOID, 3), &mut scope)?
    else {
        panic!("expected an array constant");
    };
    assert_eq!(units.len(), 3);

    // A parameter that was never bound cannot be encoded.
    let stray = Descriptor::param(&Param::new("ghost", TypeTag::I32));
    assert!(matches!(codec::encode(ctx, &stray, &mut scope), Err(Error::Resolution(_))));
    Ok(())
}

#[test]
fn test_scope_is_restored_after_failed_block() -> Result<()> {
    let catalog = catalog();
    let registry = TypeRegistry::new();
    let ctx = CodecContext::new(&registry, &catalog);
    let local = Param::new("tmp", TypeTag::I32);
    let ghost = Param::new("ghost", TypeTag::I32);
    let d = Descriptor::block(vec![local.clone()], vec![Descriptor::param(&local), Descriptor::param(&ghost)]);

    let mut scope = vec![this()];
    assert!(codec::encode(ctx, &d, &mut scope).is_err());
    assert_eq!(scope, vec![this()]);
    Ok(())
}

#[test]
fn test_nesting_limit() {
    let catalog = catalog();
    let registry = TypeRegistry::new();
    let ctx = CodecContext::new(&registry, &catalog);

    let mut bytes = Vec::new();
    for _ in 0..(codec::MAX_RECURSION_DEPTH + 8) {
        bytes.extend_from_slice(&[kind::UNARY, UnaryOp::Negate as u8, types::code::I32]);
    }
    bytes.extend_from_slice(&[kind::CONSTANT, types::code::I32, 1, 0, 0, 0]);
    let err = codec::decode(ctx, &bytes, &mut Vec::new()).unwrap_err();
    assert_eq!(err, Error::RecursionLimitExceeded);
}

// ============================================================================
//  EVALUATOR
// ============================================================================

#[test]
fn test_array_bounds_are_capped() {
    let catalog = catalog();
    let bounds = |dims: &[i32]| Descriptor::new_array_bounds(TypeTag::U8, dims.iter().map(|d| c(*d)).collect());

    let flat = bounds(&[50_000_000]);
    assert!(matches!(eval_with(&catalog, &flat, Value::Null), Err(Error::IndexOutOfRange { .. })));
    let square = bounds(&[4096, 4096]);
    assert!(matches!(eval_with(&catalog, &square, Value::Null), Err(Error::IndexOutOfRange { .. })));
    let wrapping = bounds(&[i32::MAX, i32::MAX, i32::MAX]);
    assert!(matches!(eval_with(&catalog, &wrapping, Value::Null), Err(Error::IndexOutOfRange { .. })));

    let Ok(Value::Array(grid)) = eval_with(&catalog, &bounds(&[16, 16]), Value::Null) else {
        panic!("expected an array");
    };
    assert_eq!(grid.len(), 16);
    let Ok(Value::Array(empty)) = eval_with(&catalog, &bounds(&[0]), Value::Null) else {
        panic!("expected an array");
    };
    assert!(empty.is_empty());
}

#[test]
fn test_native_width_overflow() {
    let catalog = catalog();
    let unchecked = Descriptor::binary(BinaryOp::Add, c(250u8), c(10u8));
    let checked = Descriptor::binary(BinaryOp::AddChecked, c(250u8), c(10u8));
    assert_eq!(eval_with(&catalog, &unchecked, Value::Null), Ok(Value::U8(4)));
    assert_eq!(eval_with(&catalog, &checked, Value::Null), Err(Error::Overflow));

    let mul = Descriptor::binary(BinaryOp::MultiplyChecked, c(i64::MAX), c(2i64));
    assert_eq!(eval_with(&catalog, &mul, Value::Null), Err(Error::Overflow));
    let sub = Descriptor::binary(BinaryOp::Subtract, c(0u32), c(1u32));
    assert_eq!(eval_with(&catalog, &sub, Value::Null), Ok(Value::U32(u32::MAX)));
}

#[test]
fn test_access_denied_has_no_side_effect() {
    let catalog = catalog();
    let target = counter(5);
    let reset = Descriptor::call(Descriptor::param(&this()), counter_ty(), "Reset", vec![]);

    let err = eval_with(&catalog, &reset, target.clone()).unwrap_err();
    assert!(matches!(err, Error::AccessDenied(ref m) if m.contains("Reset")));

    let hits = Descriptor::member(Descriptor::param(&this()), counter_ty(), "Hits");
    assert_eq!(eval_with(&catalog, &hits, target.clone()), Ok(Value::I32(5)));

    // Local evaluation may call it.
    eval::evaluate(&reset, &[(this(), target.clone())], &catalog, &AllowAll).unwrap();
    assert_eq!(eval_with(&catalog, &hits, target), Ok(Value::I32(0)));
}

#[test]
fn test_methods_properties_and_construction() {
    let catalog = catalog();
    let target = counter(0);

    let bump = Descriptor::call(Descriptor::param(&this()), counter_ty(), "Bump", vec![]);
    assert_eq!(eval_with(&catalog, &bump, target.clone()), Ok(Value::I32(1)));
    assert_eq!(eval_with(&catalog, &bump, target.clone()), Ok(Value::I32(2)));

    let generic = Descriptor::call(Descriptor::param(&this()), counter_ty(), "Default", vec![])
        .with_generics(vec![TypeTag::U16]);
    assert_eq!(eval_with(&catalog, &generic, target.clone()), Ok(Value::U16(0)));

    let built = Descriptor::member(Descriptor::new_object(counter_ty(), vec![c(9i32)]), counter_ty(), "Hits");
    assert_eq!(eval_with(&catalog, &built, Value::Null), Ok(Value::I32(9)));
    assert_eq!(eval_with(&catalog, &built, Value::Null), Ok(Value::I32(9)));
    assert_eq!(catalog.cached_constructors(), 1);

    let missing = Descriptor::call(Descriptor::param(&this()), counter_ty(), "Nope", vec![]);
    assert!(matches!(eval_with(&catalog, &missing, target), Err(Error::Resolution(_))));

    let on_null = Descriptor::call(Descriptor::param(&this()), counter_ty(), "Bump", vec![]);
    assert!(matches!(eval_with(&catalog, &on_null, Value::Null), Err(Error::NullReference(_))));
}

#[test]
fn test_constructor_cache_distinguishes_same_arity_overloads() {
    struct Label(String);

    let mut catalog = Catalog::new();
    catalog
        .define::<Label>("demo.Label")
        .property("Text", TypeTag::String, |l| Value::from(l.0.as_str()))
        .constructor(&[TypeTag::I32], |args| Ok(Label(format!("#{}", i32::from_value(args[0].clone())?))))
        .constructor(&[TypeTag::String], |args| Ok(Label(String::from_value(args[0].clone())?)));
    let label = TypeTag::external("demo.Label");
    let text = |arg: Descriptor| Descriptor::member(Descriptor::new_object(label.clone(), vec![arg]), label.clone(), "Text");

    assert_eq!(eval_with(&catalog, &text(c(7i32)), Value::Null), Ok(Value::from("#7")));
    assert_eq!(eval_with(&catalog, &text(c("seven")), Value::Null), Ok(Value::from("seven")));
    assert_eq!(eval_with(&catalog, &text(c(8i32)), Value::Null), Ok(Value::from("#8")));
    assert_eq!(catalog.cached_constructors(), 2);

    let wrong = text(c(true));
    assert!(matches!(eval_with(&catalog, &wrong, Value::Null), Err(Error::Resolution(_))));
}

#[test]
fn test_builtins() {
    let catalog = catalog();
    let s = c("héllo");
    let len = Descriptor::member(s.clone(), TypeTag::String, "Length");
    assert_eq!(eval_with(&catalog, &len, Value::Null), Ok(Value::I32(5)));

    let upper = Descriptor::call(
        Descriptor::call(s, TypeTag::String, "Substring", vec![c(1i32), c(3i32)]),
        TypeTag::String,
        "ToUpper",
        vec![],
    );
    assert_eq!(eval_with(&catalog, &upper, Value::Null), Ok(Value::from("ÉLL")));

    let arr = Descriptor::new_array(TypeTag::I32, vec![c(1i32), c(2i32), c(3i32)]);
    let arr_len = Descriptor::member(arr.clone(), TypeTag::array(TypeTag::I32), "Length");
    assert_eq!(eval_with(&catalog, &arr_len, Value::Null), Ok(Value::I32(3)));
    let unary_len = Descriptor::unary(UnaryOp::ArrayLength, TypeTag::I32, arr);
    assert_eq!(eval_with(&catalog, &unary_len, Value::Null), Ok(Value::I32(3)));
}

#[test]
fn test_assignment_forms() {
    let catalog = catalog();
    let i = Param::new("i", TypeTag::I32);
    let arr = Param::new("arr", TypeTag::array(TypeTag::I32));
    let elem = Descriptor::binary(BinaryOp::ArrayIndex, Descriptor::param(&arr), c(1i32));

    let d = Descriptor::block(
        vec![i.clone(), arr.clone()],
        vec![
            Descriptor::binary(BinaryOp::Assign, Descriptor::param(&arr), Descriptor::new_array_bounds(TypeTag::I32, vec![c(3i32)])),
            Descriptor::binary(BinaryOp::Assign, Descriptor::param(&i), c(10i32)),
            Descriptor::unary(UnaryOp::PostIncrementAssign, TypeTag::I32, Descriptor::param(&i)),
            Descriptor::binary(BinaryOp::Assign, elem.clone(), Descriptor::param(&i)),
            Descriptor::binary(BinaryOp::MultiplyAssign, elem.clone(), c(4i32)),
            Descriptor::binary(
                BinaryOp::Add,
                elem,
                Descriptor::unary(UnaryOp::PreDecrementAssign, TypeTag::I32, Descriptor::param(&i)),
            ),
        ],
    );
    // i: 10 -> 11, arr[1] = 11 * 4 = 44, then 44 + (--i = 10)
    assert_eq!(eval_with(&catalog, &d, Value::Null), Ok(Value::I32(54)));

    let post = Descriptor::block(
        vec![i.clone()],
        vec![Descriptor::unary(UnaryOp::PostIncrementAssign, TypeTag::I32, Descriptor::param(&i))],
    );
    assert_eq!(eval_with(&catalog, &post, Value::Null), Ok(Value::I32(0)));

    let checked = Descriptor::block(
        vec![i.clone()],
        vec![
            Descriptor::binary(BinaryOp::Assign, Descriptor::param(&i), c(i32::MAX)),
            Descriptor::binary(BinaryOp::AddAssignChecked, Descriptor::param(&i), c(1i32)),
        ],
    );
    assert_eq!(eval_with(&catalog, &checked, Value::Null), Err(Error::Overflow));

    let bad = Descriptor::binary(BinaryOp::Assign, c(1i32), c(2i32));
    assert!(matches!(eval_with(&catalog, &bad, Value::Null), Err(Error::NotImplemented(_))));
}

#[test]
fn test_control_flow() {
    let catalog = catalog();
    let boom = Descriptor::binary(BinaryOp::Divide, c(1i32), c(0i32));

    let and = Descriptor::binary(BinaryOp::AndAlso, c(false), Descriptor::binary(BinaryOp::Equal, boom.clone(), c(0i32)));
    assert_eq!(eval_with(&catalog, &and, Value::Null), Ok(Value::Bool(false)));

    let or = Descriptor::binary(BinaryOp::OrElse, c(true), Descriptor::binary(BinaryOp::Equal, boom.clone(), c(0i32)));
    assert_eq!(eval_with(&catalog, &or, Value::Null), Ok(Value::Bool(true)));

    let cond = Descriptor::conditional(TypeTag::I32, c(false), boom.clone(), c(7i32));
    assert_eq!(eval_with(&catalog, &cond, Value::Null), Ok(Value::I32(7)));

    let coalesce = Descriptor::binary(BinaryOp::Coalesce, Descriptor::typed_constant(TypeTag::String, Value::Null), c("fallback"));
    assert_eq!(eval_with(&catalog, &coalesce, Value::Null), Ok(Value::from("fallback")));

    assert_eq!(eval_with(&catalog, &boom, Value::Null), Err(Error::DivideByZero));
}

#[test]
fn test_lambdas_capture_scope() {
    let catalog = catalog();
    let x = Param::new("x", TypeTag::I32);
    let k = Param::new("k", TypeTag::I32);
    let add_k = Descriptor::lambda(vec![x.clone()], Descriptor::binary(BinaryOp::Add, Descriptor::param(&x), Descriptor::param(&k)));
    let d = Descriptor::block(
        vec![k.clone()],
        vec![
            Descriptor::binary(BinaryOp::Assign, Descriptor::param(&k), c(100i32)),
            Descriptor::invoke(add_k, vec![c(23i32)]),
        ],
    );
    assert_eq!(eval_with(&catalog, &d, Value::Null), Ok(Value::I32(123)));

    let wrong_arity = Descriptor::invoke(Descriptor::lambda(vec![x.clone()], Descriptor::param(&x)), vec![]);
    assert!(matches!(eval_with(&catalog, &wrong_arity, Value::Null), Err(Error::TypeMismatch { .. })));
}

#[test]
fn test_recursive_lambda_is_bounded() {
    let catalog = catalog();
    let f = Param::new("f", TypeTag::Any);
    // f = () => f(); f()
    let d = Descriptor::block(
        vec![f.clone()],
        vec![
            Descriptor::binary(
                BinaryOp::Assign,
                Descriptor::param(&f),
                Descriptor::lambda(vec![], Descriptor::invoke(Descriptor::param(&f), vec![])),
            ),
            Descriptor::invoke(Descriptor::param(&f), vec![]),
        ],
    );
    // The closure captured `f` before assignment, so the inner call sees null.
    assert!(matches!(eval_with(&catalog, &d, Value::Null), Err(Error::NullReference(_))));


    // (g => g(g))(g => g(g))
    let g = Param::new("g", TypeTag::Any);
    let omega = Descriptor::lambda(vec![g.clone()], Descriptor::invoke(Descriptor::param(&g), vec![Descriptor::param(&g)]));
    let d = Descriptor::invoke(omega.clone(), vec![omega]);
    assert_eq!(eval_with(&catalog, &d, Value::Null), Err(Error::RecursionLimitExceeded));

    let Ok(Value::Closure(identity)) = eval_with(&catalog, &Descriptor::lambda(vec![g.clone()], Descriptor::param(&g)), Value::Null) else {
        panic!("expected a lambda value");
    };
    let ev = Evaluator::new(&catalog, &AllowAll);
    assert_eq!(ev.call_closure(&identity, vec![Value::I64(8)]), Ok(Value::I64(8)));
}

#[test]
fn test_conversions_and_type_as() {
    let catalog = catalog();
    let narrow = Descriptor::unary(UnaryOp::Convert, TypeTag::I8, c(200i32));
    assert_eq!(eval_with(&catalog, &narrow, Value::Null), Ok(Value::I8(-56)));

    let checked = Descriptor::unary(UnaryOp::ConvertChecked, TypeTag::I8, c(200i32));
    assert_eq!(eval_with(&catalog, &checked, Value::Null), Err(Error::Overflow));

    let to_dec = Descriptor::unary(UnaryOp::Convert, TypeTag::Decimal, c(12i64));
    assert_eq!(eval_with(&catalog, &to_dec, Value::Null), Ok(Value::Decimal(Decimal::from(12))));

    let as_string = Descriptor::unary(UnaryOp::TypeAs, TypeTag::String, c(1i32));
    assert_eq!(eval_with(&catalog, &as_string, Value::Null), Ok(Value::Null));
}
