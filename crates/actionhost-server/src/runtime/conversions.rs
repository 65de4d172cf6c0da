//! JSON <-> JavaScript Value Conversions
//!
//! Bidirectional conversion between `serde_json::Value` and Boa's `JsValue`,
//! used for the request object, store results, and response payloads.
//!
//! # Type Mapping
//!
//! | JSON Type | JavaScript Type |
//! |-----------|-----------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! # Limitations
//!
//! - Symbol keys in JavaScript objects are skipped
//! - Functions and `undefined` are dropped from objects and become `null`
//!   inside arrays, as `JSON.stringify` does
//! - Non-finite numbers become `null`
//! - Nesting deeper than [`MAX_DEPTH`] is an error

use actionhost_common::{ActionError, Result};
use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context,
};
use serde_json::Value as JsonValue;

/// Deepest nesting either direction will follow.
pub const MAX_DEPTH: usize = 128;

pub fn json_to_js_value(json: JsonValue, ctx: &mut Context) -> Result<JsValue> {
    json_to_js_inner(json, ctx, 0)
}

fn json_to_js_inner(json: JsonValue, ctx: &mut Context, depth: usize) -> Result<JsValue> {
    if depth > MAX_DEPTH {
        return Err(ActionError::Runtime("value nested too deeply".into()));
    }

    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(JsValue::new)
            .ok_or_else(|| ActionError::Runtime("number out of range".into())),
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for (i, v) in arr.into_iter().enumerate() {
                let js_value = json_to_js_inner(v, ctx, depth + 1)?;
                js_array
                    .push(js_value, ctx)
                    .map_err(|e| ActionError::Runtime(format!("failed to push array element {}: {}", i, e)))?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in obj {
                let js_value = json_to_js_inner(value, ctx, depth + 1)?;
                js_obj
                    .create_data_property_or_throw(js_string!(key.as_str()), js_value, ctx)
                    .map_err(|e| ActionError::Runtime(format!("failed to set property '{}': {}", key, e)))?;
            }
            Ok(js_obj.into())
        }
    }
}

pub fn js_value_to_json(value: JsValue, ctx: &mut Context) -> Result<JsonValue> {
    Ok(js_to_json_inner(value, ctx, 0)?.unwrap_or(JsonValue::Null))
}

/// `None` marks a value JSON has no encoding for (undefined, functions).
fn js_to_json_inner(value: JsValue, ctx: &mut Context, depth: usize) -> Result<Option<JsonValue>> {
    if depth > MAX_DEPTH {
        return Err(ActionError::Runtime("value nested too deeply".into()));
    }

    if value.is_undefined() {
        return Ok(None);
    }
    if value.is_null() || value.is_symbol() {
        return Ok(Some(JsonValue::Null));
    }

    if let Some(b) = value.as_boolean() {
        return Ok(Some(JsonValue::Bool(b)));
    }

    if let Some(i) = value.as_i32() {
        return Ok(Some(JsonValue::Number(i.into())));
    }

    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
            return Ok(Some(JsonValue::Number((n as i64).into())));
        }
        return Ok(Some(
            serde_json::Number::from_f64(n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
        ));
    }

    if let Some(s) = value.as_string() {
        return Ok(Some(JsonValue::String(s.to_std_string_escaped())));
    }

    if value.as_bigint().is_some() {
        return Err(ActionError::Runtime("BigInt value can't be serialized".into()));
    }

    let Some(obj) = value.as_object().map(|o| o.clone()) else {
        return Ok(Some(JsonValue::Null));
    };

    if obj.is_callable() {
        return Ok(None);
    }

    if obj.is_array() {
        let array = JsArray::from_object(obj.clone())
            .map_err(|e| ActionError::Runtime(format!("object is not a valid array: {}", e)))?;

        let length: usize = array
            .length(ctx)
            .map_err(|e| ActionError::Runtime(format!("failed to get array length: {}", e)))?
            .try_into()
            .map_err(|_| ActionError::Runtime("array length overflow".into()))?;

        let mut result = Vec::with_capacity(length.min(1024));
        for i in 0..length {
            let elem = array
                .get(i, ctx)
                .map_err(|e| ActionError::Runtime(format!("failed to get array element {}: {}", i, e)))?;
            result.push(js_to_json_inner(elem, ctx, depth + 1)?.unwrap_or(JsonValue::Null));
        }
        return Ok(Some(JsonValue::Array(result)));
    }

    let keys = obj
        .own_property_keys(ctx)
        .map_err(|e| ActionError::Runtime(format!("failed to get object keys: {}", e)))?;

    let mut result = serde_json::Map::new();
    for key in keys {
        let key_str = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };

        let prop_value = obj
            .get(key.clone(), ctx)
            .map_err(|e| ActionError::Runtime(format!("failed to get property '{}': {}", key_str, e)))?;
        if let Some(json) = js_to_json_inner(prop_value, ctx, depth + 1)? {
            result.insert(key_str, json);
        }
    }

    Ok(Some(JsonValue::Object(result)))
}
