use std::time::Instant;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use sqlx::PgPool;

use crate::config::{DEFAULT_CONTENT_TYPE, MethodConfig};
use crate::context::{HeaderArg, RequestContext, Verb};
use crate::enhance;
use crate::http::url::ParsedUrl;
use crate::http::{ApiError, AppState, apply_cors, body, url};
use crate::sql;

/// Result envelope returned by stored procedures:
/// `{httpcode, errcode, error, id}`. A bare integer is accepted as a
/// legacy form carrying only the id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub code: i32,
    pub id: i64,
    pub error: String,
}

impl Envelope {
    pub fn parse(raw: &str) -> Envelope {
        #[derive(Default, Deserialize)]
        struct Wire {
            #[serde(default)]
            httpcode: Option<i32>,
            #[serde(default)]
            errcode: Option<i32>,
            #[serde(default)]
            error: Option<String>,
            #[serde(default)]
            id: Option<i64>,
        }

        match serde_json::from_str::<Wire>(raw) {
            Ok(wire) => Envelope {
                code: wire.httpcode.unwrap_or(0).max(wire.errcode.unwrap_or(0)),
                id: wire.id.unwrap_or(0),
                error: wire.error.unwrap_or_default(),
            },
            Err(_) => Envelope {
                id: raw.trim().parse().unwrap_or(0),
                ..Envelope::default()
            },
        }
    }

    /// Response status: the envelope code when present, the verb default
    /// otherwise.
    pub fn status(&self, verb: Verb) -> StatusCode {
        let code = if self.code > 0 {
            self.code
        } else {
            verb.default_status() as i32
        };
        u16::try_from(code)
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// The main request pipeline: parse the URL, resolve method properties,
/// compose the body, enhance, dispatch the stored-function call and
/// schedule background work.
pub async fn run(
    state: &AppState,
    ctx: RequestContext,
    headers: &HeaderMap,
    query_pairs: &[(String, String)],
    body_bytes: Vec<u8>,
) -> Result<Response, ApiError> {
    let parsed = url::parse(&ctx.path, ctx.verb)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.message.to_string()))?;
    let effective = state
        .config
        .method_properties(&parsed.method_path, ctx.version);

    let header_args = body::extract_headers(&effective.headers_pass, headers);
    let mut working = body::compose(body_bytes, query_pairs, &header_args);

    // Pre-enhancement runs synchronously only in the standard scenario.
    if effective.finalize_name.is_empty() && !effective.enhance.is_empty() && ctx.verb == Verb::Post
    {
        working = enhance::run(
            working,
            &effective.enhance,
            enhance::SYNC_TIMEOUT,
            &state.metrics,
            &ctx,
        )
        .await;
    }

    let (pool, schema) = if ctx.verb.uses_write_pool() {
        (&state.db_write, state.config.db_group.write.schema.as_str())
    } else {
        (&state.db_read, state.config.db_group.read.schema.as_str())
    };

    let body_str = String::from_utf8_lossy(&working).into_owned();
    let query = sql::build_call(schema, &parsed, &effective, &ctx, &body_str, &header_args, 0);
    tracing::info!(sql = %query, "executing main query");

    let result = run_query(state, &ctx, pool, &query).await.map_err(|err| {
        tracing::error!(sql = %query, error = %err, "database call failed");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    })?;

    let envelope = Envelope::parse(&result);
    if !envelope.error.is_empty() {
        tracing::error!(error = %envelope.error, sql = %query, "procedure returned error");
    }

    if effective.finalize_name.is_empty() || ctx.verb != Verb::Post {
        // Standard scenario: post-processing runs detached on the raw result.
        if !effective.postproc.is_empty() && ctx.verb == Verb::Post {
            spawn_postproc(state, &ctx, &effective, result.clone());
        }
    } else {
        // Fast path: the client already has the id; pre, finalize and post
        // run in the background in that order.
        spawn_finalize(
            state,
            &ctx,
            &parsed,
            &effective,
            &header_args,
            working,
            envelope.id,
        );
    }

    Ok(respond(state, &effective, envelope.status(ctx.verb), result))
}

/// One scored database round-trip.
async fn run_query(
    state: &AppState,
    ctx: &RequestContext,
    pool: &PgPool,
    query: &str,
) -> Result<String, restproc_db::DbError> {
    let begin = Instant::now();
    let result = restproc_db::fetch_scalar(pool, query).await;
    state
        .metrics
        .score(ctx.verb.as_str(), &ctx.vpath, "db", begin, result.is_err());
    result
}

fn respond(
    state: &AppState,
    effective: &MethodConfig,
    status: StatusCode,
    raw: String,
) -> Response {
    let mut response = (status, raw).into_response();

    let content_type = if effective.content_type.is_empty() {
        DEFAULT_CONTENT_TYPE
    } else {
        effective.content_type.as_str()
    };
    let value = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    response.headers_mut().insert(CONTENT_TYPE, value);

    if state.config.http.cors {
        apply_cors(state, response.headers_mut());
    }
    response
}

fn spawn_postproc(
    state: &AppState,
    ctx: &RequestContext,
    effective: &MethodConfig,
    raw_result: String,
) {
    let token = state.shutdown.clone();
    let metrics = state.metrics.clone();
    let postproc = effective.postproc.clone();
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let work = enhance::run(
            raw_result.into_bytes(),
            &postproc,
            enhance::ASYNC_TIMEOUT,
            &metrics,
            &ctx,
        );
        tokio::select! {
            _ = token.cancelled() => {}
            _ = work => {}
        }
    });
}

fn spawn_finalize(
    state: &AppState,
    ctx: &RequestContext,
    parsed: &ParsedUrl,
    effective: &MethodConfig,
    header_args: &[HeaderArg],
    raw_body: Vec<u8>,
    id: i64,
) {
    let token = state.shutdown.clone();
    let metrics = state.metrics.clone();
    let pool = state.db_write.clone();
    let schema = state.config.db_group.write.schema.clone();
    let ctx = ctx.clone();
    let parsed = parsed.clone();
    let effective = effective.clone();
    let header_args = header_args.to_vec();

    tokio::spawn(async move {
        let work = async {
            let mut body = raw_body;
            if !effective.enhance.is_empty() && ctx.verb == Verb::Post {
                body = enhance::run(
                    body,
                    &effective.enhance,
                    enhance::ASYNC_TIMEOUT,
                    &metrics,
                    &ctx,
                )
                .await;
            }

            let body_str = String::from_utf8_lossy(&body).into_owned();
            let query =
                sql::build_call(&schema, &parsed, &effective, &ctx, &body_str, &header_args, id);

            let begin = Instant::now();
            let result = restproc_db::fetch_scalar(&pool, &query).await;
            metrics.score(ctx.verb.as_str(), &ctx.vpath, "db", begin, result.is_err());

            match result {
                Err(err) => {
                    tracing::error!(sql = %query, error = %err, "finalizing query failed");
                }
                Ok(result) => {
                    tracing::info!(result = %result, "finalizing query result");
                    if !effective.postproc.is_empty() && ctx.verb == Verb::Post {
                        enhance::run(
                            result.into_bytes(),
                            &effective.postproc,
                            enhance::ASYNC_TIMEOUT,
                            &metrics,
                            &ctx,
                        )
                        .await;
                    }
                }
            }
        };

        tokio::select! {
            _ = token.cancelled() => {}
            _ = work => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_full_shape() {
        let envelope = Envelope::parse(r#"{"httpcode":200,"errcode":0,"error":"","id":5}"#);
        assert_eq!(envelope.code, 200);
        assert_eq!(envelope.id, 5);
        assert!(envelope.error.is_empty());
    }

    #[test]
    fn envelope_takes_the_larger_of_the_codes() {
        let envelope = Envelope::parse(r#"{"httpcode":200,"errcode":409}"#);
        assert_eq!(envelope.code, 409);
    }

    #[test]
    fn envelope_accepts_legacy_bare_integer() {
        let envelope = Envelope::parse("7");
        assert_eq!(envelope.id, 7);
        assert_eq!(envelope.code, 0);
    }

    #[test]
    fn envelope_ignores_unknown_fields() {
        let envelope = Envelope::parse(r#"{"id":3,"extra":{"a":1}}"#);
        assert_eq!(envelope.id, 3);
    }

    #[test]
    fn unparseable_result_yields_empty_envelope() {
        let envelope = Envelope::parse("not a number");
        assert_eq!(envelope, Envelope::default());
    }

    #[test]
    fn status_prefers_envelope_code() {
        let envelope = Envelope::parse(r#"{"httpcode":202,"id":7}"#);
        assert_eq!(envelope.status(Verb::Post), StatusCode::ACCEPTED);
    }

    #[test]
    fn status_falls_back_to_verb_defaults() {
        let envelope = Envelope::default();
        assert_eq!(envelope.status(Verb::Hit), StatusCode::OK);
        assert_eq!(envelope.status(Verb::Get), StatusCode::OK);
        assert_eq!(envelope.status(Verb::Post), StatusCode::CREATED);
        assert_eq!(envelope.status(Verb::Put), StatusCode::NO_CONTENT);
        assert_eq!(envelope.status(Verb::Patch), StatusCode::NO_CONTENT);
        assert_eq!(envelope.status(Verb::Delete), StatusCode::NO_CONTENT);
    }

    #[test]
    fn invalid_envelope_code_maps_to_500() {
        let envelope = Envelope::parse(r#"{"errcode":40001}"#);
        assert_eq!(envelope.status(Verb::Get), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
