use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Multipart;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use sqlx::PgPool;

use crate::config::FileStorage;

#[derive(Debug)]
pub enum StoreError {
    Client(reqwest::Error),
    BadStatus(u16),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Client(err) => write!(f, "object store request failed: {}", err),
            StoreError::BadStatus(status) => write!(f, "object store returned status {}", status),
        }
    }
}

impl std::error::Error for StoreError {}

/// Object-storage port. The gateway only needs byte-level put/get; the
/// wire protocol behind it is the adapter's concern.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        object: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError>;

    async fn get(&self, bucket: &str, object: &str) -> Result<Vec<u8>, StoreError>;
}

/// Thin HTTP adapter: objects live at `{base}/{bucket}/{object}` and the
/// configured key pair is presented as basic credentials.
pub struct HttpObjectStore {
    base_url: String,
    access_key: String,
    secret_key: String,
    http: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(cfg: &FileStorage) -> Result<Self, StoreError> {
        let scheme = if cfg.use_ssl { "https" } else { "http" };
        let http = reqwest::Client::builder()
            .build()
            .map_err(StoreError::Client)?;

        Ok(Self {
            base_url: format!("{}://{}", scheme, cfg.host.trim_end_matches('/')),
            access_key: cfg.access_key.clone(),
            secret_key: cfg.secret_key.clone(),
            http,
        })
    }

    fn object_url(&self, bucket: &str, object: &str) -> String {
        format!("{}/{}/{}", self.base_url, bucket, object)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        bucket: &str,
        object: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        let response = self
            .http
            .put(self.object_url(bucket, object))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .header(CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(StoreError::Client)?;

        if !response.status().is_success() {
            return Err(StoreError::BadStatus(response.status().as_u16()));
        }
        Ok(())
    }

    async fn get(&self, bucket: &str, object: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .http
            .get(self.object_url(bucket, object))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await
            .map_err(StoreError::Client)?;

        if !response.status().is_success() {
            return Err(StoreError::BadStatus(response.status().as_u16()));
        }
        Ok(response.bytes().await.map_err(StoreError::Client)?.to_vec())
    }
}

struct UploadPart {
    field: String,
    filename: String,
    content_type: String,
    data: Vec<u8>,
}

/// Multipart upload and download surface: bytes go to the object store,
/// metadata goes to the database through the configured procedure.
pub struct FileService {
    cfg: FileStorage,
    endpoint: String,
    store: Arc<dyn ObjectStore>,
}

impl FileService {
    pub fn new(cfg: FileStorage, endpoint: String, store: Arc<dyn ObjectStore>) -> FileService {
        FileService {
            cfg,
            endpoint,
            store,
        }
    }

    pub async fn upload(&self, pool: &PgPool, user_id: i64, mut multipart: Multipart) -> Response {
        let (values, parts) = match collect_parts(&mut multipart).await {
            Ok(collected) => collected,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    "Invalid file in multipart/form-data",
                )
                    .into_response();
            }
        };

        let mut data = merge_values(user_id, &values);
        let Some(category) = data.get("category").and_then(Value::as_str).map(str::to_string)
        else {
            return (
                StatusCode::BAD_REQUEST,
                r#"Required field "category" is missing"#,
            )
                .into_response();
        };

        let mut fpath = String::new();
        let mut total_size: i64 = 0;

        for part in &parts {
            let ext = bare_extension(&part.filename);
            if !ext_allowed(&self.cfg.allowed_ext, &ext) {
                return (
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    r#"{"code":415, "msg":"bad ext", "descr":"File extention is not in white list"}"#,
                )
                    .into_response();
            }

            let size = part.data.len() as i64;
            if self.cfg.size_limit > 0 && size > self.cfg.size_limit {
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    r#"{"code":413, "msg": "file size", "descr": "File size is beyond limit"}"#,
                )
                    .into_response();
            }
            total_size += size;
            if self.cfg.size_limit > 0 && total_size > self.cfg.size_limit {
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    r#"{"code":413, "msg": "total size", "descr": "Total file size is beyond limit"}"#,
                )
                    .into_response();
            }

            data.insert("filename".to_string(), json!(part.filename));
            data.insert("filesize".to_string(), json!(size));
            data.insert("fileext".to_string(), json!(extension_with_dot(&part.filename)));

            let payload = Value::Object(data.clone()).to_string();
            let (prefix, message) =
                match restproc_db::store_file_metadata(pool, &self.cfg.procedure, &payload).await {
                    Ok(result) => result,
                    Err(err) => {
                        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                            .into_response();
                    }
                };
            if !message.is_empty() {
                return (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
            }

            let object = format!("{}{}", prefix, part.filename);
            if let Err(err) = self
                .store
                .put(&category, &object, &part.content_type, part.data.clone())
                .await
            {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("File storage error: {}", err),
                )
                    .into_response();
            }

            fpath = format!("/{}/file/{}/{}", self.endpoint, category, object);
        }

        let mut response = (StatusCode::OK, upload_response_body(&fpath)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        );
        response
    }

    pub async fn download(&self, bucket: &str, object: &str) -> Response {
        let object = match percent_encoding::percent_decode_str(object).decode_utf8() {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => return (StatusCode::BAD_REQUEST, "Invalid path").into_response(),
        };

        match self.store.get(bucket, &object).await {
            Ok(bytes) => bytes.into_response(),
            Err(err) => {
                tracing::error!(bucket = %bucket, object = %object, error = %err, "object fetch failed");
                (StatusCode::NOT_FOUND, "file not found").into_response()
            }
        }
    }
}

async fn collect_parts(
    multipart: &mut Multipart,
) -> Result<(HashMap<String, String>, Vec<UploadPart>), axum::extract::multipart::MultipartError> {
    let mut values: HashMap<String, String> = HashMap::new();
    let mut parts: Vec<UploadPart> = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        if let Some(filename) = field.file_name() {
            // Only the first file under each field name is taken; later
            // files posted under the same name are dropped.
            if parts.iter().any(|p| p.field == name) {
                continue;
            }
            let filename = filename.to_string();
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = field.bytes().await?.to_vec();
            parts.push(UploadPart {
                field: name,
                filename,
                content_type,
                data,
            });
        } else {
            let text = field.text().await?;
            values
                .entry(name)
                .and_modify(|v| {
                    v.push('\n');
                    v.push_str(&text);
                })
                .or_insert(text);
        }
    }

    Ok((values, parts))
}

/// Form values plus the resolved user become the metadata field map.
fn merge_values(user_id: i64, values: &HashMap<String, String>) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in values {
        map.insert(key.clone(), Value::String(value.clone()));
    }
    map.insert("user_id".to_string(), json!(user_id));
    map
}

fn bare_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string()
}

fn extension_with_dot(filename: &str) -> String {
    let ext = bare_extension(filename);
    if ext.is_empty() {
        String::new()
    } else {
        format!(".{}", ext)
    }
}

fn ext_allowed(allowed: &[String], ext: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|x| x == ext)
}

fn upload_response_body(fpath: &str) -> String {
    format!(
        "{{\"file\":\"{}\", \"status\":\"ok\"}}",
        fpath.replace('"', "\\\"")
    )
}
