use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use axum::http::header::CONTENT_TYPE;
use regex::Regex;
use serde_json::{Map, Value};

use crate::config::{Enhance, reference_regex};
use crate::context::RequestContext;
use crate::jsonpath;
use crate::metrics::Metrics;

/// Timeout for the synchronous pre-enhancement pass.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(1);
/// Timeout for background enhancement stages.
pub const ASYNC_TIMEOUT: Duration = Duration::from_secs(60);

// `{$jsonpath}` placeholders inside a step URL.
static URL_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\$.+?)\}").expect("compile url key regex"));

// http://domain.com/api/v1/some/service?param=foo -> api/v1/some/service
static SERVICE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.+://[^/]+/([^/?]+(?:/[^/?]+)*)/?(?:\?[^?]*)?$").expect("compile service regex")
});

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("compile word regex"));

#[derive(Debug)]
pub enum EnhanceError {
    NoFieldsFilled,
    Client(reqwest::Error),
    BadStatus { url: String, status: u16 },
}

impl std::fmt::Display for EnhanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnhanceError::NoFieldsFilled => write!(f, "no IncomingFields filled"),
            EnhanceError::Client(err) => write!(f, "external request failed: {}", err),
            EnhanceError::BadStatus { url, status } => write!(f, "{}: status {}", url, status),
        }
    }
}

impl std::error::Error for EnhanceError {}

/// Run an enhancement pipeline against the JSON body and return the
/// resulting document bytes.
///
/// Steps execute sequentially against the evolving document. A failing
/// step is logged and skipped; it never aborts the pipeline or the
/// request. A body that does not parse as JSON is returned unchanged.
pub async fn run(
    body: Vec<u8>,
    steps: &[Enhance],
    timeout: Duration,
    metrics: &Metrics,
    ctx: &RequestContext,
) -> Vec<u8> {
    let mut doc: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return body,
    };

    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build external http client");
            return body;
        }
    };

    // Placeholder values are extracted once per request and reused by
    // every later step that names the same path.
    let mut url_values: HashMap<String, String> = HashMap::new();

    for step in steps {
        let begin = Instant::now();

        let url = match resolve_url(&step.url, &doc, &mut url_values) {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(url = %step.url, error = %err, "url placeholder resolution failed");
                continue;
            }
        };

        if !step.condition.is_empty() {
            match jsonpath::matches(&doc, &step.condition) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::error!(condition = %step.condition, error = %err, "condition evaluation failed");
                    continue;
                }
            }
        }

        let scope = service_scope(&url);

        let fields = match build_fields(step, &doc) {
            Ok(fields) => fields,
            Err(err) => {
                tracing::error!(url = %url, error = %err, "enhancement step skipped");
                continue;
            }
        };

        let response = match call_external(&client, step, &url, &fields).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "external service call failed");
                continue;
            }
        };
        tracing::debug!(response = %String::from_utf8_lossy(&response), "external service response");

        apply_transfers(&mut doc, step, &fields, &response);

        metrics.score(ctx.verb.as_str(), &ctx.vpath, &scope, begin, false);
    }

    serde_json::to_vec(&doc).unwrap_or(body)
}

/// Substitute every `{$path}` placeholder in the URL with the value
/// extracted from the document, caching values across steps.
fn resolve_url(
    url: &str,
    doc: &Value,
    cache: &mut HashMap<String, String>,
) -> Result<String, jsonpath::PathError> {
    let mut resolved = url.to_string();
    for caps in URL_KEY.captures_iter(url) {
        let full = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if !cache.contains_key(key) {
            let value = jsonpath::get(doc, key)?;
            cache.insert(key.to_string(), display_value(value));
        }
        if let Some(value) = cache.get(key) {
            resolved = resolved.replace(full, value);
        }
    }
    Ok(resolved)
}

/// Metric scope derived from the external URL path:
/// `http://host/api/v1/x?y=1` becomes `api_v1_x`, anything unparseable
/// is scored as `external`.
fn service_scope(url: &str) -> String {
    match SERVICE_NAME.captures(url) {
        Some(caps) => {
            let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            WORD.find_iter(path)
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join("_")
        }
        None => "external".to_string(),
    }
}

/// Build the outbound field map from `IncomingFields`/`ForwardFields`.
fn build_fields(step: &Enhance, doc: &Value) -> Result<Map<String, Value>, EnhanceError> {
    let mut fields = Map::new();
    let mut filled = 0usize;

    for (i, source) in step.incoming_fields.iter().enumerate() {
        let value = match source.chars().next() {
            Some('$') => match jsonpath::get(doc, source) {
                Ok(v) => Some(coerce_integral(v.clone())),
                Err(_) => None,
            },
            Some('~') => Some(match source.as_str() {
                "~true" => Value::Bool(true),
                "~false" => Value::Bool(false),
                _ => Value::Null,
            }),
            _ => Some(Value::String(source.clone())),
        };

        let Some(value) = value else { continue };
        filled += 1;

        let target = &step.forward_fields[i];
        match target.strip_suffix("[]").filter(|key| !key.is_empty()) {
            Some(key) => {
                fields.insert(key.to_string(), Value::Array(vec![value]));
            }
            None => {
                fields.insert(target.clone(), value);
            }
        }
    }

    if filled == 0 && !step.incoming_fields.is_empty() {
        return Err(EnhanceError::NoFieldsFilled);
    }
    Ok(fields)
}

// JSON numbers arriving as integral floats are forwarded as 64-bit integers.
fn coerce_integral(value: Value) -> Value {
    if let Value::Number(n) = &value
        && n.as_i64().is_none()
        && n.as_u64().is_none()
        && let Some(f) = n.as_f64()
        && f == f.trunc()
        && f >= i64::MIN as f64
        && f <= i64::MAX as f64
    {
        return Value::from(f as i64);
    }
    value
}

/// Serialize the POST body for a step: array mode wraps the single value,
/// `InArray` wraps the whole field map, otherwise the map itself is sent.
fn post_payload(step: &Enhance, fields: &Map<String, Value>) -> Vec<u8> {
    let payload = if step.forward_fields.first().map(String::as_str) == Some("[]") {
        Value::Array(vec![fields.get("[]").cloned().unwrap_or(Value::Null)])
    } else if step.in_array {
        Value::Array(vec![Value::Object(fields.clone())])
    } else {
        Value::Object(fields.clone())
    };
    serde_json::to_vec(&payload).unwrap_or_default()
}

async fn call_external(
    client: &reqwest::Client,
    step: &Enhance,
    url: &str,
    fields: &Map<String, Value>,
) -> Result<Vec<u8>, EnhanceError> {
    let mut request = if step.method == "POST" {
        client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(post_payload(step, fields))
    } else {
        let query: Vec<(String, String)> = fields
            .iter()
            .map(|(key, value)| (key.clone(), display_value(value)))
            .collect();
        client.get(url).query(&query)
    };

    for header in &step.headers_to_send {
        request = request.header(header.header.as_str(), header.value.as_str());
    }

    let response = request.send().await.map_err(EnhanceError::Client)?;
    let status = response.status().as_u16();
    if status != 200 {
        return Err(EnhanceError::BadStatus {
            url: url.to_string(),
            status,
        });
    }

    Ok(response.bytes().await.map_err(EnhanceError::Client)?.to_vec())
}

/// Move values from the external response into top-level keys of the
/// document. Only object documents accept assignments.
fn apply_transfers(doc: &mut Value, step: &Enhance, fields: &Map<String, Value>, response: &[u8]) {
    if step.transfer_fields.is_empty() {
        return;
    }

    let response: Value = match serde_json::from_slice(response) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "external response is not valid JSON");
            return;
        }
    };

    for transfer in &step.transfer_fields {
        let from = substitute_refs(&transfer.from, step, fields);
        let value = match jsonpath::get(&response, &from) {
            Ok(v) => v.clone(),
            Err(err) => {
                tracing::error!(path = %from, error = %err, "transfer source not found");
                continue;
            }
        };
        match doc {
            Value::Object(map) => {
                map.insert(transfer.to.clone(), value);
            }
            _ => {
                tracing::error!(key = %transfer.to, "cannot assign into a non-object document");
            }
        }
    }
}

/// Substitute `%N` references in a transfer path with the N-th forward
/// field's outbound value.
fn substitute_refs(from: &str, step: &Enhance, fields: &Map<String, Value>) -> String {
    let mut out = from.to_string();
    for m in reference_regex().find_iter(from) {
        let token = m.as_str();
        let idx: usize = token[1..].parse().unwrap_or(0);
        if idx >= 1 && idx <= step.forward_fields.len() {
            let target = &step.forward_fields[idx - 1];
            let key = target
                .strip_suffix("[]")
                .filter(|k| !k.is_empty())
                .unwrap_or(target);
            let value = fields.get(key).map(display_value).unwrap_or_default();
            out = out.replace(token, &value);
        }
    }
    out
}

// Strings render without quotes, everything else as compact JSON.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Verb;
    use serde_json::json;

    fn step(incoming: &[&str], forward: &[&str]) -> Enhance {
        Enhance {
            url: "http://ext/lookup".to_string(),
            method: "POST".to_string(),
            incoming_fields: incoming.iter().map(|s| s.to_string()).collect(),
            forward_fields: forward.iter().map(|s| s.to_string()).collect(),
            ..Enhance::default()
        }
    }

    #[test]
    fn build_fields_extracts_jsonpath_sources() {
        let fields = build_fields(&step(&["$.nm"], &["nm"]), &json!({"nm": "A"})).unwrap();
        assert_eq!(fields.get("nm"), Some(&json!("A")));
    }

    #[test]
    fn build_fields_literals_and_verbatim_text() {
        let fields = build_fields(
            &step(&["~null", "~true", "~false", "plain"], &["a", "b", "c", "d"]),
            &json!({}),
        )
        .unwrap();
        assert_eq!(fields.get("a"), Some(&Value::Null));
        assert_eq!(fields.get("b"), Some(&json!(true)));
        assert_eq!(fields.get("c"), Some(&json!(false)));
        assert_eq!(fields.get("d"), Some(&json!("plain")));
    }

    #[test]
    fn build_fields_wraps_bracket_suffixed_names() {
        let fields = build_fields(&step(&["$.id"], &["ids[]"]), &json!({"id": 5})).unwrap();
        assert_eq!(fields.get("ids"), Some(&json!([5])));
    }

    #[test]
    fn build_fields_fails_when_nothing_resolves() {
        let err = build_fields(&step(&["$.missing"], &["x"]), &json!({})).unwrap_err();
        assert!(matches!(err, EnhanceError::NoFieldsFilled));
    }

    #[test]
    fn build_fields_ignores_unresolved_among_resolved() {
        let fields =
            build_fields(&step(&["$.missing", "$.nm"], &["x", "nm"]), &json!({"nm": 1})).unwrap();
        assert!(!fields.contains_key("x"));
        assert_eq!(fields.get("nm"), Some(&json!(1)));
    }

    #[test]
    fn integral_floats_are_forwarded_as_integers() {
        let fields = build_fields(&step(&["$.qty"], &["qty"]), &json!({"qty": 3.0})).unwrap();
        assert_eq!(serde_json::to_string(&fields.get("qty")).unwrap(), "3");
        let fields = build_fields(&step(&["$.rate"], &["rate"]), &json!({"rate": 3.5})).unwrap();
        assert_eq!(fields.get("rate"), Some(&json!(3.5)));
    }

    #[test]
    fn post_payload_array_mode_wraps_the_first_value() {
        let s = step(&["$.ids"], &["[]"]);
        let fields = build_fields(&s, &json!({"ids": [1, 2]})).unwrap();
        assert_eq!(post_payload(&s, &fields), b"[[1,2]]".to_vec());
    }

    #[test]
    fn post_payload_in_array_wraps_the_field_map() {
        let mut s = step(&["$.nm"], &["nm"]);
        s.in_array = true;
        let fields = build_fields(&s, &json!({"nm": "A"})).unwrap();
        assert_eq!(post_payload(&s, &fields), br#"[{"nm":"A"}]"#.to_vec());
    }

    #[test]
    fn post_payload_plain_map() {
        let s = step(&["$.nm"], &["nm"]);
        let fields = build_fields(&s, &json!({"nm": "A"})).unwrap();
        assert_eq!(post_payload(&s, &fields), br#"{"nm":"A"}"#.to_vec());
    }

    #[test]
    fn resolve_url_substitutes_and_caches() {
        let doc = json!({"nm": "A", "n": 2});
        let mut cache = HashMap::new();
        let url =
            resolve_url("http://ext/lookup?x={$.nm}&n={$.n}&again={$.nm}", &doc, &mut cache)
                .unwrap();
        assert_eq!(url, "http://ext/lookup?x=A&n=2&again=A");
        assert_eq!(cache.get("$.nm"), Some(&"A".to_string()));

        // Cached values win over the (changed) document on later steps.
        let url = resolve_url("http://ext/b?x={$.nm}", &json!({}), &mut cache).unwrap();
        assert_eq!(url, "http://ext/b?x=A");
    }

    #[test]
    fn resolve_url_fails_on_missing_path() {
        let mut cache = HashMap::new();
        assert!(resolve_url("http://ext/{$.gone}", &json!({}), &mut cache).is_err());
    }

    #[test]
    fn service_scope_joins_path_words() {
        assert_eq!(service_scope("http://domain.com/api/v1/some/service?param=foo"), "api_v1_some_service");
        assert_eq!(service_scope("http://ext/lookup?x=A"), "lookup");
        assert_eq!(service_scope("http://hostonly"), "external");
    }

    #[test]
    fn substitute_refs_inserts_forward_values() {
        let s = step(&["$.nm", "$.n"], &["nm", "n"]);
        let fields = build_fields(&s, &json!({"nm": "A", "n": 7})).unwrap();
        assert_eq!(substitute_refs("$.items.%2.price", &s, &fields), "$.items.7.price");
        assert_eq!(substitute_refs("$.%1", &s, &fields), "$.A");
        assert_eq!(substitute_refs("$.price", &s, &fields), "$.price");
    }

    #[test]
    fn apply_transfers_assigns_top_level_keys() {
        let s = Enhance {
            transfer_fields: vec![crate::config::TransferField {
                from: "$.price".to_string(),
                to: "price".to_string(),
            }],
            ..step(&["$.nm"], &["nm"])
        };
        let mut doc = json!({"nm": "A"});
        let fields = build_fields(&s, &doc).unwrap();
        apply_transfers(&mut doc, &s, &fields, br#"{"price": 99}"#);
        assert_eq!(doc, json!({"nm": "A", "price": 99}));
    }

    #[test]
    fn apply_transfers_skips_invalid_response() {
        let s = Enhance {
            transfer_fields: vec![crate::config::TransferField {
                from: "$.price".to_string(),
                to: "price".to_string(),
            }],
            ..step(&["$.nm"], &["nm"])
        };
        let mut doc = json!({"nm": "A"});
        let fields = build_fields(&s, &doc).unwrap();
        apply_transfers(&mut doc, &s, &fields, b"not json");
        assert_eq!(doc, json!({"nm": "A"}));
    }

    #[tokio::test]
    async fn run_returns_unparseable_body_unchanged() {
        let metrics = Metrics::new("svc", Vec::new());
        let ctx = RequestContext {
            verb: Verb::Post,
            version: 1,
            vpath: "/v1/bar/".to_string(),
            path: "/bar/".to_string(),
            user_id: 0,
        };
        let out = run(b"not json".to_vec(), &[step(&["$.nm"], &["nm"])], SYNC_TIMEOUT, &metrics, &ctx)
            .await;
        assert_eq!(out, b"not json".to_vec());
    }

    #[tokio::test]
    async fn run_with_no_steps_normalizes_document() {
        let metrics = Metrics::new("svc", Vec::new());
        let ctx = RequestContext {
            verb: Verb::Post,
            version: 1,
            vpath: "/v1/bar/".to_string(),
            path: "/bar/".to_string(),
            user_id: 0,
        };
        let out = run(br#"{"nm": "A"}"#.to_vec(), &[], SYNC_TIMEOUT, &metrics, &ctx).await;
        assert_eq!(out, br#"{"nm":"A"}"#.to_vec());
    }

    #[tokio::test]
    async fn skipped_condition_leaves_document_intact() {
        let metrics = Metrics::new("svc", Vec::new());
        let ctx = RequestContext {
            verb: Verb::Post,
            version: 1,
            vpath: "/v1/bar/".to_string(),
            path: "/bar/".to_string(),
            user_id: 0,
        };
        let mut s = step(&["$.nm"], &["nm"]);
        s.condition = "@.kind == 'other'".to_string();
        let out = run(br#"{"nm":"A","kind":"prod"}"#.to_vec(), &[s], SYNC_TIMEOUT, &metrics, &ctx)
            .await;
        assert_eq!(out, br#"{"kind":"prod","nm":"A"}"#.to_vec());
    }
}
