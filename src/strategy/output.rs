//! Normalizes a strategy's return value into the fixed output shape
//! the engine hands back to callers: `Null | Bool | Int | Float |
//! String | Array | Object`.

use rhai::Dynamic;
use serde_json::{Map, Value};

use crate::error::WorkerError;

pub fn normalize(value: &Dynamic) -> Result<Value, WorkerError> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Ok(Value::Bool(b));
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Ok(Value::from(i));
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        // NaN/Inf has no JSON representation; null it out rather than
        // failing the run, matching how a missing/undefined numeric
        // result is treated elsewhere in the pipeline.
        return Ok(serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null));
    }
    if let Some(s) = value.clone().try_cast::<rhai::ImmutableString>() {
        return Ok(Value::String(s.to_string()));
    }
    if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        let items = arr.iter().map(normalize).collect::<Result<Vec<_>, _>>()?;
        return Ok(Value::Array(items));
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let mut obj = Map::new();
        for (k, v) in map.iter() {
            obj.insert(k.to_string(), normalize(v)?);
        }
        return Ok(Value::Object(obj));
    }

    Err(WorkerError::Runtime(format!(
        "strategy returned an unsupported value of type `{}`",
        value.type_name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Engine;

    fn eval(src: &str) -> Dynamic {
        Engine::new().eval::<Dynamic>(src).unwrap()
    }

    #[test]
    fn normalizes_primitives() {
        assert_eq!(normalize(&eval("()")).unwrap(), Value::Null);
        assert_eq!(normalize(&eval("true")).unwrap(), Value::Bool(true));
        assert_eq!(normalize(&eval("42")).unwrap(), Value::from(42));
        assert_eq!(normalize(&eval("\"hi\"")).unwrap(), Value::String("hi".into()));
    }

    #[test]
    fn normalizes_nested_array_and_object() {
        let v = normalize(&eval(r#"[1, "x", #{a: 1.5, b: true}]"#)).unwrap();
        assert_eq!(
            v,
            Value::Array(vec![
                Value::from(1),
                Value::String("x".into()),
                Value::Object(
                    vec![
                        ("a".to_string(), Value::from(1.5)),
                        ("b".to_string(), Value::Bool(true)),
                    ]
                    .into_iter()
                    .collect()
                ),
            ])
        );
    }

    #[test]
    fn non_finite_float_becomes_null() {
        assert_eq!(normalize(&eval("1.0 / 0.0")).unwrap(), Value::Null);
        assert_eq!(normalize(&eval("-1.0 / 0.0")).unwrap(), Value::Null);
    }

    #[test]
    fn non_finite_float_in_object_becomes_null_not_error() {
        let v = normalize(&eval(r#"#{ticker: "X", score: 1.0 / 0.0}"#)).unwrap();
        assert_eq!(
            v,
            Value::Object(
                vec![
                    ("ticker".to_string(), Value::String("X".into())),
                    ("score".to_string(), Value::Null),
                ]
                .into_iter()
                .collect()
            )
        );
    }
}
