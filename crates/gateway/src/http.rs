pub mod body;
pub mod process;
pub mod url;
pub mod user;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::{self, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use restproc_auth::Verifier;

use crate::config::Config;
use crate::context::{RequestContext, Verb};
use crate::files::{FileService, HttpObjectStore};
use crate::metrics::{self, Metrics};

pub type ApiError = (StatusCode, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

/// Liveness/readiness flags behind the k8s probe routes.
#[derive(Debug, Default)]
pub struct Health {
    alive: AtomicBool,
    ready: AtomicBool,
}

impl Health {
    pub fn new() -> Health {
        Health::default()
    }

    pub fn set_alive(&self, value: bool) {
        self.alive.store(value, Ordering::Relaxed);
    }

    pub fn set_ready(&self, value: bool) {
        self.ready.store(value, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub db_read: PgPool,
    pub db_write: PgPool,
    pub files: Arc<FileService>,
    pub verifier: Option<Arc<Verifier>>,
    pub health: Arc<Health>,
    pub shutdown: CancellationToken,
}

/// Connect the pools, load access keys and assemble the router. The
/// returned state is shared with `main` for health flag flips.
pub async fn build(
    mut config: Config,
    shutdown: CancellationToken,
) -> Result<(Router, AppState), StartupError> {
    let db_read = restproc_db::connect(&config.db_group.read)
        .await
        .map_err(|err| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: format!("failed to open read pool: {}", err),
        })?;

    let (write_cfg, same) = config.write_db();
    config.db_group.write = write_cfg;
    let db_write = if same {
        db_read.clone()
    } else {
        restproc_db::connect(&config.db_group.write)
            .await
            .map_err(|err| StartupError {
                code: "ERR_DB_UNAVAILABLE",
                message: format!("failed to open write pool: {}", err),
            })?
    };

    let verifier = if config.http.access_files.is_empty() {
        None
    } else {
        let verifier =
            Verifier::from_files(&config.http.access_files).map_err(|err| StartupError {
                code: "ERR_ACCESS_KEYS",
                message: err.to_string(),
            })?;
        Some(Arc::new(verifier))
    };

    let hints = &config.service.prometheus;
    let buckets = metrics::bucket_ladder(&hints.buckets, hints.start, hints.width, hints.count);
    let metrics = Metrics::new(&config.service.name, buckets);

    let store = HttpObjectStore::new(&config.file_storage).map_err(|err| StartupError {
        code: "ERR_FILE_STORAGE",
        message: err.to_string(),
    })?;
    let files = Arc::new(FileService::new(
        config.file_storage.clone(),
        config.http.endpoint.clone(),
        Arc::new(store),
    ));

    let health = Arc::new(Health::new());
    health.set_ready(true);

    let endpoint = config.http.endpoint.clone();
    let state = AppState {
        config: Arc::new(config),
        metrics,
        db_read,
        db_write,
        files,
        verifier,
        health,
        shutdown,
    };

    let root = Router::new()
        .route("/alive", get(alive))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_handler));

    let mut api = Router::new()
        .route(&format!("/{}", endpoint), any(endpoint_handler))
        .route(&format!("/{}/", endpoint), any(endpoint_handler))
        .route(&format!("/{}/{{*rest}}", endpoint), any(endpoint_handler));
    if state.verifier.is_some() {
        api = api.layer(middleware::from_fn_with_state(state.clone(), access_guard));
    }

    let app = root.merge(api).with_state(state.clone());
    Ok((app, state))
}

async fn alive(State(state): State<AppState>) -> StatusCode {
    if state.health.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn ready(State(state): State<AppState>) -> StatusCode {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok((buffer, format)) => {
            let mut response = buffer.into_response();
            if let Ok(value) = HeaderValue::from_str(&format) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Access-key middleware wrapped around the gateway routes. The verified
/// caller name rides along in request extensions.
async fn access_guard(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let Some(verifier) = state.verifier.clone() else {
        return next.run(req).await;
    };

    match verifier.verify(req.headers()) {
        Ok(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(err) => {
            tracing::error!(error = %err, "access key verification failed");
            let mut response = StatusCode::UNAUTHORIZED.into_response();
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(restproc_auth::WWW_AUTHENTICATE),
            );
            response
        }
    }
}

pub(crate) fn apply_cors(state: &AppState, headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("OPTIONS, GET, POST, PUT, PATCH, DELETE"),
    );
    let allow = cors_allow_headers(!state.config.http.access_files.is_empty());
    if let Ok(value) = HeaderValue::from_str(&allow) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
    }
}

fn cors_allow_headers(with_access_keys: bool) -> String {
    let mut allow = String::from("Origin, X-Requested-With, Content-Type, Accept, Authorization");
    if with_access_keys {
        allow.push_str(", X-Auth-Sign, X-Auth-ID");
    }
    allow
}

fn cors_response(state: &AppState) -> Response {
    let mut response = StatusCode::OK.into_response();
    apply_cors(state, response.headers_mut());
    response
}

/// Entry point for everything under `/<Endpoint>/`: prepares the request
/// context, dispatches to the file surface or the main pipeline and
/// scores the whole request.
async fn endpoint_handler(State(state): State<AppState>, req: Request) -> Response {
    let begin = Instant::now();

    let mut vpath = req.uri().path().to_string();
    if !vpath.ends_with('/') {
        vpath.push('/');
    }

    if req.method() == Method::OPTIONS && state.config.http.cors {
        return cors_response(&state);
    }

    let (verb_label, result) = dispatch(&state, req, &vpath).await;
    let failed = result.is_err();
    let response = match result {
        Ok(response) => response,
        Err((status, message)) => (status, message).into_response(),
    };
    state
        .metrics
        .score(&verb_label, &vpath, "total", begin, failed);
    response
}

async fn dispatch(
    state: &AppState,
    req: Request,
    vpath: &str,
) -> (String, Result<Response, ApiError>) {
    let method = req.method().clone();
    let mut label = method.as_str().to_string();

    let user_id = match user::resolve_user(state, req.headers()).await {
        Ok(user_id) => user_id,
        Err(err) => return (label, Err(err)),
    };

    let after = vpath
        .get(state.config.http.endpoint.len() + 2..)
        .unwrap_or("")
        .to_string();

    if let Some(file_path) = after.strip_prefix("file/") {
        let response = handle_file(state, user_id, file_path, &method, req).await;
        return (label, Ok(response));
    }

    let Some((version, rest)) = url::split_version(&after) else {
        return (
            label,
            Err((
                StatusCode::BAD_REQUEST,
                "API version not specified".to_string(),
            )),
        );
    };
    if version == 0 {
        return (
            label,
            Err((StatusCode::BAD_REQUEST, "invalid API version".to_string())),
        );
    }

    let mut path = rest.to_string();
    if path.is_empty() {
        return (
            label,
            Err((
                StatusCode::BAD_REQUEST,
                "service method not specified".to_string(),
            )),
        );
    }
    if !path.ends_with('/') {
        path.push('/');
    }

    let query_pairs: Vec<(String, String)> = req
        .uri()
        .query()
        .map(|q| ::url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let headers = req.headers().clone();

    let mut body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return (
                label,
                Err((
                    StatusCode::BAD_REQUEST,
                    format!("failed to read request body: {}", err),
                )),
            );
        }
    };

    // An urlencoded form is consumed for verb synthesis and does not reach
    // the pipeline as a JSON body.
    let mut form_pairs: Vec<(String, String)> = Vec::new();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        form_pairs = ::url::form_urlencoded::parse(&body).into_owned().collect();
        body = Vec::new();
    }

    let mut verb = match Verb::from_method(&method) {
        Some(verb) => verb,
        None => {
            return (
                label,
                Err((
                    StatusCode::METHOD_NOT_ALLOWED,
                    "method not allowed".to_string(),
                )),
            );
        }
    };
    if has_value(&query_pairs, &form_pairs, "latitude")
        && has_value(&query_pairs, &form_pairs, "longitude")
    {
        verb = Verb::Hit;
    }
    label = verb.as_str().to_string();

    let ctx = RequestContext {
        verb,
        version,
        vpath: vpath.to_string(),
        path,
        user_id,
    };

    (
        label,
        process::run(state, ctx, &headers, &query_pairs, body).await,
    )
}

fn has_value(query: &[(String, String)], form: &[(String, String)], key: &str) -> bool {
    query
        .iter()
        .chain(form.iter())
        .any(|(k, v)| k == key && !v.is_empty())
}

async fn handle_file(
    state: &AppState,
    user_id: i64,
    file_path: &str,
    method: &Method,
    req: Request,
) -> Response {
    match *method {
        Method::POST => match Multipart::from_request(req, &()).await {
            Ok(multipart) => {
                state
                    .files
                    .upload(&state.db_write, user_id, multipart)
                    .await
            }
            Err(_) => {
                (StatusCode::BAD_REQUEST, "Invalid file in multipart/form-data").into_response()
            }
        },
        Method::GET => match file_path.split_once('/') {
            Some((bucket, object)) => state.files.download(bucket, object).await,
            None => (StatusCode::BAD_REQUEST, "Invalid path").into_response(),
        },
        _ => (StatusCode::OK, "Only POST and GET are supported!").into_response(),
    }
}
