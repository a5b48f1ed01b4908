use axum::http::HeaderMap;
use serde_json::{Map, Value};

use crate::config::HeaderPass;
use crate::context::HeaderArg;

/// Resolve the configured pass-through headers against the inbound
/// request; missing headers yield empty values.
pub fn extract_headers(pass: &[HeaderPass], headers: &HeaderMap) -> Vec<HeaderArg> {
    pass.iter()
        .map(|p| HeaderArg {
            name: p.field_name.clone(),
            value: headers
                .get(p.header.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            kind: p.argument_type.clone(),
        })
        .collect()
}

/// Compose the request body: splice untyped header fields into the raw
/// JSON, then merge URL query parameters as top-level fields.
pub fn compose(body: Vec<u8>, params: &[(String, String)], headers: &[HeaderArg]) -> Vec<u8> {
    let body = if headers.is_empty() {
        body
    } else {
        splice_headers(body, headers)
    };
    merge_params(body, params)
}

/// Inject `"field":"value"` pairs for headers with an empty argument type
/// by splicing bytes before the final `}`. The body is not reparsed, so
/// its formatting survives. Array-shaped bodies pass through untouched.
fn splice_headers(mut body: Vec<u8>, headers: &[HeaderArg]) -> Vec<u8> {
    if body.is_empty() {
        body = b"{}".to_vec();
    }

    let mut closing = body.len() as isize - 1;
    while closing >= 0 {
        if body[closing as usize] == b'}' {
            break;
        }
        if body[closing as usize] == b']' {
            return body;
        }
        closing -= 1;
    }
    if closing <= 0 {
        return body;
    }
    let closing = closing as usize;

    let mut sep = b',';
    let mut i = closing as isize - 1;
    while i >= 0 {
        let b = body[i as usize];
        if b == b' ' || b == b'\t' || b == b'\n' {
            i -= 1;
            continue;
        }
        if b == b'{' {
            sep = b' ';
            break;
        }
        if i == 0 {
            return body;
        }
        break;
    }

    body.truncate(closing);
    for header in headers {
        if header.kind.is_empty() {
            body.push(sep);
            body.extend_from_slice(format!("\"{}\":\"{}\"", header.name, header.value).as_bytes());
            sep = b',';
        }
    }
    body.push(b'}');
    body
}

/// Merge query parameters into the body. An object body gains the params
/// as top-level fields (param value shadows a body field); anything else
/// is replaced by an object of the params.
fn merge_params(body: Vec<u8>, params: &[(String, String)]) -> Vec<u8> {
    if params.is_empty() {
        return body;
    }

    let mut object: Map<String, Value> = match serde_json::from_slice(&body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for (key, value) in params {
        object.insert(key.clone(), Value::String(value.clone()));
    }

    serde_json::to_vec(&Value::Object(object)).unwrap_or(body)
}
