//! The JSON bridge: parses and serializes through the engine's own
//! `JSON.parse`/`JSON.stringify`, the same way real engines implement JSON
//! as native built-ins rather than as authored script (see
//! `natus_backend::mock`'s `Builtin::Json*` variants for the reference
//! implementation every backend is expected to expose under a global
//! `JSON` object).
//!
//! [`from_serde`]/[`to_serde`] sidestep the engine entirely for the
//! host-side config path (`-C key=jsonval` on the CLI): building native
//! values directly from a `serde_json::Value` tree is both cheaper and
//! simpler than round-tripping through text.

use crate::context::Context;
use crate::error::{NatusError, NatusResult};
use crate::value::Value;

/// Parses `text` through the engine's global `JSON.parse`.
pub fn parse(ctx: &Context, text: &str) -> NatusResult<Value> {
    let json = ctx.global().get("JSON")?;
    let parse_fn = json.get("parse")?;
    let text_value = ctx.string(text);
    parse_fn.call(&json, &[text_value])
}

/// Serializes `value` through the engine's global `JSON.stringify`.
pub fn stringify(value: &Value) -> NatusResult<String> {
    let ctx = value.ctx();
    let json = ctx.global().get("JSON")?;
    let stringify_fn = json.get("stringify")?;
    let result = stringify_fn.call(&json, std::slice::from_ref(value))?;
    if result.is_exception() {
        return Err(NatusError::script(result.to_rust_string().unwrap_or_default()));
    }
    result.to_rust_string()
}

/// Builds a native value tree directly from a `serde_json::Value`, without
/// involving the engine's parser at all.
pub fn from_serde(ctx: &Context, value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => ctx.null(),
        serde_json::Value::Bool(b) => ctx.boolean(*b),
        serde_json::Value::Number(n) => ctx.number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => ctx.string(s),
        serde_json::Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(|v| from_serde(ctx, v)).collect();
            ctx.array(&values)
        }
        serde_json::Value::Object(map) => {
            let obj = ctx.object();
            for (k, v) in map {
                let _ = obj.set(k.as_str(), &from_serde(ctx, v));
            }
            obj
        }
    }
}

/// The inverse of [`from_serde`]: walks a native value tree into a
/// `serde_json::Value`. Functions are rejected since JSON has no
/// equivalent — matching `JSON.stringify`'s own behavior of dropping them,
/// but explicitly, since a host-side config consumer usually wants to know
/// rather than silently lose data.
pub fn to_serde(value: &Value) -> NatusResult<serde_json::Value> {
    use serde_json::Value as J;
    if value.is_function() {
        return Err(NatusError::type_error("cannot convert a function to JSON"));
    }
    if value.is_undefined() {
        return Ok(J::Null);
    }
    if value.is_null() {
        return Ok(J::Null);
    }
    match value.type_name() {
        "boolean" => Ok(J::Bool(value.to_bool())),
        "number" => Ok(serde_json::Number::from_f64(value.to_number()).map(J::Number).unwrap_or(J::Null)),
        "string" => Ok(J::String(value.to_rust_string()?)),
        "array" => {
            let len = value.get("length")?.to_number() as usize;
            let mut items = Vec::with_capacity(len);
            for i in 0..len {
                items.push(to_serde(&value.get(i as u32)?)?);
            }
            Ok(J::Array(items))
        }
        _ => {
            let mut map = serde_json::Map::new();
            for key in value.enumerate()? {
                let v = value.get(key.as_str())?;
                map.insert(key, to_serde(&v)?);
            }
            Ok(J::Object(map))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natus_backend::mock::MockBackend;
    use natus_backend::EngineHandle;

    fn test_ctx() -> Context {
        Context::new(EngineHandle::from_builtin("mock", MockBackend::new())).unwrap()
    }

    #[test]
    fn parse_and_stringify_round_trip() {
        let ctx = test_ctx();
        let value = parse(&ctx, "{\"a\":1,\"b\":[true,null]}").unwrap();
        assert_eq!(stringify(&value).unwrap(), "{\"a\":1,\"b\":[true,null]}");
    }

    #[test]
    fn from_serde_builds_native_tree_without_json_parse() {
        let ctx = test_ctx();
        let json: serde_json::Value = serde_json::json!({"x": 1, "y": "hi"});
        let value = from_serde(&ctx, &json);
        assert_eq!(value.get("x").unwrap().to_number(), 1.0);
        assert_eq!(value.get("y").unwrap().to_rust_string().unwrap(), "hi");
    }

    #[test]
    fn to_serde_rejects_functions() {
        let ctx = test_ctx();
        let func = ctx.function("f", std::rc::Rc::new(|ctx, _this, _args| ctx.undefined()));
        assert!(to_serde(&func).is_err());
    }
}
