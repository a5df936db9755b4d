//! String and array members registered by `Catalog::with_builtins`.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::catalog::GetterFn;
use crate::catalog::MethodFn;
use crate::error::Error;
use crate::error::Result;
use crate::types::TypeTag;
use crate::value::Value;

fn this_str(target: Option<&Value>) -> Result<&str> {
    match target {
        Some(Value::String(s)) => Ok(s),
        Some(Value::Null) | None => Err(Error::NullReference("string".into())),
        Some(other) => Err(Error::TypeMismatch { expected: "string".into(), found: other.type_name() }),
    }
}

fn arg_i32(args: &[Value], i: usize) -> Result<i32> {
    match args.get(i) {
        Some(Value::I32(v)) => Ok(*v),
        Some(other) => Err(Error::TypeMismatch { expected: "i32".into(), found: other.type_name() }),
        None => Err(Error::Invocation(format!("missing argument {}", i))),
    }
}

fn utf16_len(s: &str) -> i32 {
    s.encode_utf16().count() as i32
}

pub(crate) fn install(catalog: &mut Catalog) {
    let length: GetterFn = Arc::new(|target: Option<&Value>| -> Result<Value> {
        Ok(Value::I32(utf16_len(this_str(target)?)))
    });
    catalog.add_property(TypeTag::String, "Length", TypeTag::I32, false, length, None);

    let array_length: GetterFn = Arc::new(|target: Option<&Value>| -> Result<Value> {
        match target {
            Some(Value::Array(a)) => Ok(Value::I32(a.len() as i32)),
            Some(Value::Null) | None => Err(Error::NullReference("array".into())),
            Some(other) => Err(Error::TypeMismatch { expected: "array".into(), found: other.type_name() }),
        }
    });
    catalog.add_property(TypeTag::array(TypeTag::Any), "Length", TypeTag::I32, false, array_length, None);

    let concat: MethodFn = Arc::new(|_: Option<&Value>, args: &[Value], _: &[TypeTag]| -> Result<Value> {
        let mut out = String::new();
        for arg in args {
            out.push_str(&arg.to_string());
        }
        Ok(Value::string(out))
    });
    catalog.add_method(TypeTag::String, "Concat", vec![TypeTag::String, TypeTag::String], TypeTag::String, true, concat.clone());
    catalog.add_method(
        TypeTag::String,
        "Concat",
        vec![TypeTag::String, TypeTag::String, TypeTag::String],
        TypeTag::String,
        true,
        concat,
    );

    // Offsets are UTF-16 code units.
    let substring: MethodFn = Arc::new(|target: Option<&Value>, args: &[Value], _: &[TypeTag]| -> Result<Value> {
        let s = this_str(target)?;
        let units: Vec<u16> = s.encode_utf16().collect();
        let start = arg_i32(args, 0)?;
        let len = arg_i32(args, 1)?;
        if start < 0 || len < 0 || start as usize + len as usize > units.len() {
            return Err(Error::IndexOutOfRange { index: start.max(0) as usize + len.max(0) as usize, len: units.len() });
        }
        let slice = &units[start as usize..start as usize + len as usize];
        String::from_utf16(slice)
            .map(Value::string)
            .map_err(|_| Error::Invocation("substring splits a surrogate pair".into()))
    });
    catalog.add_method(TypeTag::String, "Substring", vec![TypeTag::I32, TypeTag::I32], TypeTag::String, false, substring);

    let to_upper: MethodFn = Arc::new(|target: Option<&Value>, _: &[Value], _: &[TypeTag]| -> Result<Value> {
        Ok(Value::string(this_str(target)?.to_uppercase()))
    });
    catalog.add_method(TypeTag::String, "ToUpper", Vec::new(), TypeTag::String, false, to_upper);
}
