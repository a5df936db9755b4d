//! # Member Catalog
//!
//! The explicit registration table the evaluator resolves members against.
//!
//! ## Philosophy
//! Nothing is discovered at runtime. Every callable method, readable property
//! and constructor is registered at startup with its declaring type, name and
//! parameter signature, next to the concrete invoker that runs it. Unknown
//! names fail closed.
//!
//! ## Overload Resolution
//! Candidates are filtered by name, static-ness, generic arity and parameter
//! count, then by `TypeTag::accepts` against the argument types. An exact
//! signature match wins; otherwise the first compatible registration does.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use meshpack::Decoder;
use meshpack::Encoder;
use parking_lot::RwLock;

use crate::error::Error;
use crate::error::Result;
use crate::types::TypeName;
use crate::types::TypeTag;
use crate::value::ObjectRef;
use crate::value::Value;

pub type MethodFn = Arc<dyn Fn(Option<&Value>, &[Value], &[TypeTag]) -> Result<Value> + Send + Sync>;
pub type GetterFn = Arc<dyn Fn(Option<&Value>) -> Result<Value> + Send + Sync>;
pub type SetterFn = Arc<dyn Fn(Option<&Value>, Value) -> Result<()> + Send + Sync>;
pub type CtorFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

type EncodeFn = Arc<dyn Fn(&ObjectRef, &mut Encoder) -> Result<()> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&mut Decoder<'_>) -> Result<ObjectRef> + Send + Sync>;

/// A data type that can cross the wire by value.
pub trait WireData: Any + Send + Sync + Sized {
    fn encode(&self, enc: &mut Encoder) -> meshpack::Result<()>;
    fn decode(dec: &mut Decoder<'_>) -> meshpack::Result<Self>;
}

/// A registered method.
pub struct MethodDef {
    pub declaring: TypeTag,
    pub name: Arc<str>,
    pub params: Vec<TypeTag>,
    pub ret: TypeTag,
    pub generic_arity: usize,
    pub is_static: bool,
    /// False for members that must never be invoked on behalf of a remote caller.
    pub remote: bool,
    invoker: MethodFn,
}

impl MethodDef {
    pub fn invoke(&self, target: Option<&Value>, args: &[Value], generics: &[TypeTag]) -> Result<Value> {
        (self.invoker)(target, args, generics)
    }
}

/// A registered property. Read-only unless a setter is present.
pub struct PropertyDef {
    pub declaring: TypeTag,
    pub name: Arc<str>,
    pub ty: TypeTag,
    pub is_static: bool,
    pub remote: bool,
    getter: GetterFn,
    setter: Option<SetterFn>,
}

impl PropertyDef {
    pub fn get(&self, target: Option<&Value>) -> Result<Value> {
        (self.getter)(target)
    }

    pub fn set(&self, target: Option<&Value>, value: Value) -> Result<()> {
        match &self.setter {
            Some(set) => set(target, value),
            None => Err(Error::Resolution(format!("{}.{} is read-only", self.declaring, self.name))),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }
}

/// A registered constructor.
pub struct CtorDef {
    pub ty: TypeTag,
    pub params: Vec<TypeTag>,
    pub remote: bool,
    invoker: CtorFn,
}

impl CtorDef {
    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        (self.invoker)(args)
    }
}

#[derive(Clone)]
struct DataCodec {
    encode: EncodeFn,
    decode: DecodeFn,
}

#[derive(Default)]
struct TypeDef {
    methods: Vec<Arc<MethodDef>>,
    properties: Vec<Arc<PropertyDef>>,
    ctors: Vec<Arc<CtorDef>>,
    codec: Option<DataCodec>,
}

/// The decision of an access hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied,
}

/// A member about to be invoked.
#[derive(Debug, Clone, Copy)]
pub struct MemberInfo<'a> {
    pub declaring: &'a TypeTag,
    pub name: &'a str,
    pub remote: bool,
}

/// Consulted before any member is invoked.
pub trait AccessPolicy: Send + Sync {
    fn check(&self, member: MemberInfo<'_>) -> Access;
}

/// Local evaluation: everything is callable.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _member: MemberInfo<'_>) -> Access {
        Access::Allowed
    }
}

/// Remote evaluation: members registered as local-only are denied.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteOnly;

impl AccessPolicy for RemoteOnly {
    fn check(&self, member: MemberInfo<'_>) -> Access {
        if member.remote { Access::Allowed } else { Access::Denied }
    }
}

const MAX_CACHED_CTORS: usize = 1024;

/// Constructor cache key: declaring type and the runtime argument types.
type CtorKey = (TypeTag, Vec<Option<TypeTag>>);

/// The registration table: types, members, constructors and data codecs.
#[derive(Default)]
pub struct Catalog {
    types: HashMap<TypeTag, TypeDef>,
    names: HashMap<TypeName, TypeTag>,
    ctor_cache: RwLock<HashMap<CtorKey, Arc<CtorDef>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog with the string and array members every hub understands.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        crate::builtins::install(&mut catalog);
        catalog
    }

    /// Starts a typed definition of the external type `name`, backed by `T`.
    pub fn define<T: Any + Send + Sync>(&mut self, name: &str) -> TypeBuilder<'_, T> {
        let name: TypeName = Arc::from(name);
        let tag = TypeTag::External(name.clone());
        self.names.insert(name.clone(), tag.clone());
        self.types.entry(tag.clone()).or_default();
        TypeBuilder { catalog: self, name, tag, _marker: PhantomData }
    }

    /// Registers a method with an untyped invoker.
    pub fn add_method(
        &mut self,
        declaring: TypeTag,
        name: &str,
        params: Vec<TypeTag>,
        ret: TypeTag,
        is_static: bool,
        invoker: MethodFn,
    ) -> Arc<MethodDef> {
        self.insert_method(MethodDef {
            declaring,
            name: Arc::from(name),
            params,
            ret,
            generic_arity: 0,
            is_static,
            remote: true,
            invoker,
        })
    }

    /// Registers a property with an untyped getter.
    pub fn add_property(
        &mut self,
        declaring: TypeTag,
        name: &str,
        ty: TypeTag,
        is_static: bool,
        getter: GetterFn,
        setter: Option<SetterFn>,
    ) {
        let def = PropertyDef {
            declaring: declaring.clone(),
            name: Arc::from(name),
            ty,
            is_static,
            remote: true,
            getter,
            setter,
        };
        self.types.entry(declaring).or_default().properties.push(Arc::new(def));
    }

    fn insert_method(&mut self, def: MethodDef) -> Arc<MethodDef> {
        let def = Arc::new(def);
        self.types.entry(def.declaring.clone()).or_default().methods.push(def.clone());
        def
    }

    /// Looks up an external type by fully-qualified name.
    pub fn lookup_name(&self, name: &str) -> Option<TypeName> {
        match self.names.get(name) {
            Some(TypeTag::External(n)) => Some(n.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, ty: &TypeTag) -> bool {
        self.types.contains_key(ty)
    }

    /// Arrays share one member table regardless of element type.
    fn type_def(&self, ty: &TypeTag) -> Option<&TypeDef> {
        match ty {
            TypeTag::Array(_) => self.types.get(ty).or_else(|| self.types.get(&TypeTag::array(TypeTag::Any))),
            TypeTag::Nullable(inner) => self.types.get(ty).or_else(|| self.types.get(inner)),
            _ => self.types.get(ty),
        }
    }

    pub fn find_property(&self, declaring: &TypeTag, name: &str, is_static: bool) -> Option<Arc<PropertyDef>> {
        self.type_def(declaring)?
            .properties
            .iter()
            .find(|p| &*p.name == name && p.is_static == is_static)
            .cloned()
    }

    /// Resolves a method by declaring type, name, generic arity and argument
    /// compatibility. `None` in `args` is a null argument.
    pub fn resolve_method(
        &self,
        declaring: &TypeTag,
        name: &str,
        args: &[Option<TypeTag>],
        generic_count: usize,
        is_static: bool,
    ) -> Result<Arc<MethodDef>> {
        let def = self
            .type_def(declaring)
            .ok_or_else(|| Error::Resolution(format!("unknown type {}", declaring)))?;

        let named: Vec<_> = def
            .methods
            .iter()
            .filter(|m| &*m.name == name && m.is_static == is_static)
            .collect();
        if named.is_empty() {
            return Err(Error::Resolution(format!("no method {}.{}", declaring, name)));
        }

        let arity_ok: Vec<_> = named.into_iter().filter(|m| m.generic_arity == generic_count).collect();
        if arity_ok.is_empty() {
            return Err(Error::Resolution(format!(
                "generic arity mismatch for {}.{}: {} type arguments",
                declaring, name, generic_count
            )));
        }

        let compatible: Vec<_> = arity_ok
            .into_iter()
            .filter(|m| {
                m.params.len() == args.len()
                    && m.params.iter().zip(args).all(|(p, a)| p.accepts(a.as_ref()))
            })
            .collect();

        let exact = compatible.iter().find(|m| {
            m.params.iter().zip(args).all(|(p, a)| a.as_ref() == Some(p))
        });
        exact
            .or_else(|| compatible.first())
            .map(|m| Arc::clone(m))
            .ok_or_else(|| {
                let sig: Vec<String> = args
                    .iter()
                    .map(|a| a.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "null".into()))
                    .collect();
                Error::Resolution(format!("no overload {}.{}({})", declaring, name, sig.join(", ")))
            })
    }

    /// Resolves a constructor by type and argument types. Resolutions are
    /// memoized per exact argument type list.
    pub fn resolve_constructor(&self, ty: &TypeTag, args: &[Option<TypeTag>]) -> Result<Arc<CtorDef>> {
        let key = (ty.clone(), args.to_vec());
        if let Some(hit) = self.ctor_cache.read().get(&key) {
            return Ok(hit.clone());
        }

        let def = self
            .type_def(ty)
            .ok_or_else(|| Error::Resolution(format!("unknown type {}", ty)))?;
        let found = def
            .ctors
            .iter()
            .filter(|c| c.params.len() == args.len())
            .find(|c| c.params.iter().zip(args).all(|(p, a)| p.accepts(a.as_ref())))
            .cloned()
            .ok_or_else(|| Error::Resolution(format!("no constructor {}/{}", ty, args.len())))?;

        let mut cache = self.ctor_cache.write();
        if cache.len() < MAX_CACHED_CTORS {
            cache.insert(key, found.clone());
        }
        Ok(found)
    }

    /// Number of memoized constructor resolutions.
    pub fn cached_constructors(&self) -> usize {
        self.ctor_cache.read().len()
    }

    /// True if objects of `name` can be written to the wire.
    pub fn is_data(&self, name: &str) -> bool {
        self.codec(name).is_some()
    }

    fn codec(&self, name: &str) -> Option<&DataCodec> {
        let tag = self.names.get(name)?;
        self.types.get(tag)?.codec.as_ref()
    }

    pub(crate) fn encode_data(&self, obj: &ObjectRef, enc: &mut Encoder) -> Result<()> {
        let codec = self
            .codec(obj.type_name())
            .ok_or_else(|| Error::NotSerializable(obj.type_name().to_string()))?;
        (codec.encode)(obj, enc)
    }

    pub(crate) fn decode_data(&self, name: &str, dec: &mut Decoder<'_>) -> Result<ObjectRef> {
        let codec = self
            .codec(name)
            .ok_or_else(|| Error::Decode(format!("type {} has no wire codec", name)))?;
        (codec.decode)(dec)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").field("types", &self.types.len()).finish()
    }
}

fn receiver<'v, T: Any>(ty: &TypeName, target: Option<&'v Value>) -> Result<&'v T> {
    match target {
        Some(Value::Object(obj)) => obj.downcast::<T>().ok_or_else(|| Error::TypeMismatch {
            expected: ty.to_string(),
            found: obj.type_name().to_string(),
        }),
        Some(Value::Null) | None => Err(Error::NullReference(ty.to_string())),
        Some(other) => Err(Error::TypeMismatch { expected: ty.to_string(), found: other.type_name() }),
    }
}

/// Typed registration of members on an external type backed by `T`.
pub struct TypeBuilder<'c, T> {
    catalog: &'c mut Catalog,
    name: TypeName,
    tag: TypeTag,
    _marker: PhantomData<fn() -> T>,
}

impl<'c, T: Any + Send + Sync> TypeBuilder<'c, T> {
    pub fn tag(&self) -> TypeTag {
        self.tag.clone()
    }

    fn push_method(&mut self, name: &str, params: &[TypeTag], ret: TypeTag, generic_arity: usize, remote: bool, invoker: MethodFn) {
        self.catalog.insert_method(MethodDef {
            declaring: self.tag.clone(),
            name: Arc::from(name),
            params: params.to_vec(),
            ret,
            generic_arity,
            is_static: false,
            remote,
            invoker,
        });
    }

    fn instance_invoker<F>(&self, f: F) -> MethodFn
    where
        F: Fn(&T, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let ty = self.name.clone();
        Arc::new(move |target: Option<&Value>, args: &[Value], _: &[TypeTag]| {
            f(receiver::<T>(&ty, target)?, args)
        })
    }

    /// An instance method callable remotely.
    pub fn method<F>(mut self, name: &str, params: &[TypeTag], ret: TypeTag, f: F) -> Self
    where
        F: Fn(&T, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let invoker = self.instance_invoker(f);
        self.push_method(name, params, ret, 0, true, invoker);
        self
    }

    /// An instance method that remote callers are denied.
    pub fn local_method<F>(mut self, name: &str, params: &[TypeTag], ret: TypeTag, f: F) -> Self
    where
        F: Fn(&T, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let invoker = self.instance_invoker(f);
        self.push_method(name, params, ret, 0, false, invoker);
        self
    }

    /// An instance method taking `arity` explicit type arguments.
    pub fn generic_method<F>(mut self, name: &str, arity: usize, params: &[TypeTag], ret: TypeTag, f: F) -> Self
    where
        F: Fn(&T, &[Value], &[TypeTag]) -> Result<Value> + Send + Sync + 'static,
    {
        let ty = self.name.clone();
        let invoker: MethodFn = Arc::new(move |target: Option<&Value>, args: &[Value], generics: &[TypeTag]| {
            f(receiver::<T>(&ty, target)?, args, generics)
        });
        self.push_method(name, params, ret, arity, true, invoker);
        self
    }

    pub fn static_method<F>(self, name: &str, params: &[TypeTag], ret: TypeTag, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.catalog.insert_method(MethodDef {
            declaring: self.tag.clone(),
            name: Arc::from(name),
            params: params.to_vec(),
            ret,
            generic_arity: 0,
            is_static: true,
            remote: true,
            invoker: Arc::new(move |_: Option<&Value>, args: &[Value], _: &[TypeTag]| f(args)),
        });
        self
    }

    pub fn property<G>(self, name: &str, ty: TypeTag, get: G) -> Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
    {
        let owner = self.name.clone();
        let getter: GetterFn = Arc::new(move |target: Option<&Value>| -> Result<Value> {
            Ok(get(receiver::<T>(&owner, target)?))
        });
        self.catalog.add_property(self.tag.clone(), name, ty, false, getter, None);
        self
    }

    /// A writable property. `T` provides its own interior mutability.
    pub fn property_mut<G, S>(self, name: &str, ty: TypeTag, get: G, set: S) -> Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
        S: Fn(&T, Value) -> Result<()> + Send + Sync + 'static,
    {
        let owner = self.name.clone();
        let getter: GetterFn = Arc::new(move |target: Option<&Value>| -> Result<Value> {
            Ok(get(receiver::<T>(&owner, target)?))
        });
        let owner = self.name.clone();
        let setter: SetterFn = Arc::new(move |target: Option<&Value>, value: Value| {
            set(receiver::<T>(&owner, target)?, value)
        });
        self.catalog.add_property(self.tag.clone(), name, ty, false, getter, Some(setter));
        self
    }

    pub fn constructor<F>(self, params: &[TypeTag], f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<T> + Send + Sync + 'static,
    {
        let ty = self.name.clone();
        let def = CtorDef {
            ty: self.tag.clone(),
            params: params.to_vec(),
            remote: true,
            invoker: Arc::new(move |args: &[Value]| -> Result<Value> {
                Ok(Value::Object(ObjectRef::new(ty.clone(), f(args)?)))
            }),
        };
        self.catalog.types.entry(self.tag.clone()).or_default().ctors.push(Arc::new(def));
        self
    }
}

impl<'c, T: WireData> TypeBuilder<'c, T> {
    /// Makes the type serializable by value through `WireData`.
    pub fn data(self) -> Self {
        let ty = self.name.clone();
        let codec = DataCodec {
            encode: Arc::new(|obj: &ObjectRef, enc: &mut Encoder| -> Result<()> {
                let value = obj.downcast::<T>().ok_or_else(|| Error::NotSerializable(obj.type_name().to_string()))?;
                value.encode(enc)?;
                Ok(())
            }),
            decode: Arc::new(move |dec: &mut Decoder<'_>| -> Result<ObjectRef> {
                Ok(ObjectRef::new(ty.clone(), T::decode(dec)?))
            }),
        };
        self.catalog.types.entry(self.tag.clone()).or_default().codec = Some(codec);
        self
    }
}
