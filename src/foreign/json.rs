//! JSON encoding and decoding foreign functions (`slug.encoding.json`).

use crate::error::EvalFault;
use crate::foreign::ForeignCtx;
use crate::foreign_fn;
use crate::number::Number;
use crate::object::{MapObj, Object};

/// Convert a Slug object to a JSON value.
///
/// Maps become objects (string and symbol keys only), lists arrays, numbers
/// JSON numbers, `nil` null. Functions, channels, and tasks do not encode.
fn object_to_json(value: &Object) -> Result<serde_json::Value, EvalFault> {
    match value {
        Object::Nil => Ok(serde_json::Value::Null),
        Object::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Object::Number(n) => {
            if let Some(i) = n.to_i64() {
                return Ok(serde_json::Value::Number(i.into()));
            }
            let parsed: f64 = n
                .to_string()
                .parse()
                .map_err(|_| EvalFault::Message(format!("cannot encode number {}", n)))?;
            serde_json::Number::from_f64(parsed)
                .map(serde_json::Value::Number)
                .ok_or_else(|| EvalFault::Message(format!("cannot encode number {}", n)))
        }
        Object::Str(s) => Ok(serde_json::Value::String(s.clone())),
        Object::Symbol(s) => Ok(serde_json::Value::String(s.name())),
        Object::List(items) => {
            let encoded: Result<Vec<_>, _> = items.iter().map(object_to_json).collect();
            Ok(serde_json::Value::Array(encoded?))
        }
        Object::Map(map) => {
            let mut out = serde_json::Map::new();
            for (key, entry) in map.iter() {
                let name = match key {
                    Object::Str(s) => s.clone(),
                    Object::Symbol(s) => s.name(),
                    other => {
                        return Err(EvalFault::type_mismatch(
                            "stringify",
                            "string key",
                            other.type_name(),
                        ))
                    }
                };
                out.insert(name, object_to_json(entry)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Err(EvalFault::type_mismatch(
            "stringify",
            "encodable value",
            other.type_name(),
        )),
    }
}

fn json_to_object(json: &serde_json::Value) -> Object {
    match json {
        serde_json::Value::Null => Object::Nil,
        serde_json::Value::Bool(b) => Object::Bool(*b),
        // serde renders the exact literal, which the decimal parses
        serde_json::Value::Number(n) => Object::Number(Number::parse(&n.to_string())),
        serde_json::Value::String(s) => Object::Str(s.clone()),
        serde_json::Value::Array(items) => {
            Object::List(items.iter().map(json_to_object).collect())
        }
        serde_json::Value::Object(entries) => {
            let mut map = MapObj::new();
            for (key, value) in entries {
                let _ = map.insert(Object::Str(key.clone()), json_to_object(value));
            }
            Object::Map(map)
        }
    }
}

/// `parse(text)` — decode a JSON string.
fn parse_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let Some(Object::Str(text)) = args.first() else {
        return Object::Error(EvalFault::type_mismatch(
            "parse",
            "string",
            args.first().map(|a| a.type_name()).unwrap_or("nil"),
        ));
    };
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => json_to_object(&value),
        Err(e) => Object::Error(EvalFault::Message(e.to_string())),
    }
}

/// `stringify(value)` — encode to a compact JSON string.
fn stringify_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let value = args.first().cloned().unwrap_or(Object::Nil);
    match object_to_json(&value) {
        Ok(json) => match serde_json::to_string(&json) {
            Ok(text) => Object::Str(text),
            Err(e) => Object::Error(EvalFault::Message(e.to_string())),
        },
        Err(fault) => Object::Error(fault),
    }
}

/// `pretty(value)` — encode with indentation.
fn pretty_fn(_ctx: &mut dyn ForeignCtx, args: Vec<Object>) -> Object {
    let value = args.first().cloned().unwrap_or(Object::Nil);
    match object_to_json(&value) {
        Ok(json) => match serde_json::to_string_pretty(&json) {
            Ok(text) => Object::Str(text),
            Err(e) => Object::Error(EvalFault::Message(e.to_string())),
        },
        Err(fault) => Object::Error(fault),
    }
}

foreign_fn!("slug.encoding.json.parse", "@str text", entry = parse_fn);
foreign_fn!("slug.encoding.json.stringify", "value", entry = stringify_fn);
foreign_fn!("slug.encoding.json.pretty", "value", entry = pretty_fn);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_values() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"name": "slug", "n": 3.5, "tags": [1, 2], "ok": true}"#)
                .unwrap();
        let obj = json_to_object(&json);
        let back = object_to_json(&obj).unwrap();
        assert_eq!(json, back);
    }

    #[test]
    fn test_non_encodable_rejected() {
        let chan = Object::Channel(std::sync::Arc::new(crate::channel::Channel::new(1, 0)));
        assert!(object_to_json(&chan).is_err());
    }

    #[test]
    fn test_exact_integer_round_trip() {
        let big = Object::Number(Number::parse("9007199254740993"));
        let json = object_to_json(&big).unwrap();
        assert_eq!(json.to_string(), "9007199254740993");
    }
}
