//! Tool response envelope
//!
//! Every tool returns one top-level JSON object: `success: true` plus a
//! payload, or `success: false` plus `error: { code, message, details }`.
//! Conversion sanitizes: numeric code and message only, never SQL text or
//! filesystem paths.

use engram_core::EngramError;
use serde_json::{json, Value};

/// Wrap a payload object in the success envelope.
pub fn success_body(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.insert("success".into(), Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "success": true, "result": other }),
    }
}

/// Convert a core error into the failure envelope.
pub fn error_body(err: &EngramError) -> Value {
    json!({
        "success": false,
        "error": {
            "code": err.code(),
            "message": err.to_string(),
            "details": error_details(err),
        }
    })
}

fn error_details(err: &EngramError) -> Value {
    match err {
        EngramError::Permission(engram_core::PermissionError::RateLimited {
            retry_after_ms,
            class,
            ..
        }) => json!({ "retry_after_ms": retry_after_ms, "class": class }),
        EngramError::Validation(engram_core::ValidationError::CursorTooLarge {
            size,
            max,
        }) => json!({ "size": size, "max": max }),
        _ => Value::Null,
    }
}
