use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use restproc_db::Database;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
pub const DEFAULT_CONVENTION: &str = "CRUD";

const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ConfigError {}

fn invalid(message: String) -> ConfigError {
    ConfigError {
        code: "ERR_INVALID_CONFIG",
        message,
    }
}

/// HTTP server parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Http {
    /// API endpoint, the first path segment of every gateway route.
    pub endpoint: String,
    pub port: u16,
    #[serde(rename = "UseSSL")]
    pub use_ssl: bool,
    #[serde(rename = "SSLCert")]
    pub ssl_cert: String,
    #[serde(rename = "SSLKey")]
    pub ssl_key: String,
    /// Files containing `key,caller` rows for access-key verification.
    pub access_files: Vec<String>,
    #[serde(rename = "CORS")]
    pub cors: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct DbGroup {
    pub read: Database,
    pub write: Database,
}

/// Accepted for configuration round-trips; the gateway performs no caching.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Cache {
    pub enable: bool,
    #[serde(rename = "TTL")]
    pub ttl: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct PrometheusHints {
    pub buckets: Vec<f64>,
    pub start: f64,
    pub width: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Service {
    pub name: String,
    pub version: String,
    pub prometheus: PrometheusHints,
    pub log: String,
}

/// Cookie-based user resolution parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Auth {
    /// Name of the cookie containing the token; empty disables resolution.
    pub cookie_name: String,
    /// Set when the cookie is stored unescaped.
    pub unescaped: bool,
    pub offset: usize,
    pub separator: String,
    pub part: usize,
    /// User retrieval procedure, called as `select * from Procedure($1)`.
    pub procedure: String,
}

/// Object-storage parameters for the file upload/download surface.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct FileStorage {
    pub host: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(rename = "UseSSL")]
    pub use_ssl: bool,
    pub size_limit: i64,
    /// Metadata procedure, called with the JSON field map.
    pub procedure: String,
    pub allowed_ext: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TransferField {
    /// JSONPath into the external response; may contain `%N` references
    /// to forward fields.
    pub from: String,
    /// Top-level key assigned in the request document.
    pub to: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SendHeader {
    pub header: String,
    pub value: String,
}

/// One external-service call of an enhancement pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Enhance {
    #[serde(rename = "URL")]
    pub url: String,
    /// GET or POST.
    pub method: String,
    /// Filter predicate; the step is skipped when it selects nothing.
    pub condition: String,
    /// Sources: `$...` JSONPath, `~null|~true|~false` literal, or verbatim text.
    pub incoming_fields: Vec<String>,
    /// Destination field names; `[]` alone switches to array-body mode,
    /// a `name[]` suffix wraps the value in a one-element array.
    pub forward_fields: Vec<String>,
    pub transfer_fields: Vec<TransferField>,
    /// Wrap the whole field map in a one-element array.
    pub in_array: bool,
    pub headers_to_send: Vec<SendHeader>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct HeaderPass {
    pub header: String,
    pub field_name: String,
    /// Empty, or int|integer|bigint|float|number|string|text|varchar.
    pub argument_type: String,
}

/// Per-method behavior; `General` carries the defaults, `Methods` the
/// overrides matched by regex against the method path.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MethodConfig {
    pub name: Vec<String>,
    /// Method version this entry applies from (always >= 1 after load).
    pub version_from: i32,
    /// Finalizing method names, parallel to `name`; empty when unused.
    pub finalize_name: Vec<String>,
    pub convention: String,
    pub content_type: String,
    pub enhance: Vec<Enhance>,
    pub postproc: Vec<Enhance>,
    pub headers_pass: Vec<HeaderPass>,
    #[serde(skip)]
    pub name_match: Vec<Regex>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    #[serde(rename = "HTTP")]
    pub http: Http,
    #[serde(rename = "DBGroup")]
    pub db_group: DbGroup,
    pub cache: Cache,
    pub service: Service,
    pub auth: Auth,
    pub general: MethodConfig,
    pub methods: Vec<MethodConfig>,
    pub file_storage: FileStorage,
    #[serde(default = "default_debug")]
    pub debug: u8,
}

fn default_debug() -> u8 {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    fn for_path(path: &str) -> ConfigFormat {
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

impl Config {
    /// Read, substitute environment placeholders, parse and validate a
    /// configuration file. The format follows the file extension.
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError {
            code: "ERR_CONFIG_READ",
            message: format!("failed to read config at {}: {}", path, err),
        })?;
        Config::parse_str(&raw, ConfigFormat::for_path(path))
    }

    pub fn parse_str(raw: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
        let raw = substitute_env(raw);

        let mut config: Config = match format {
            ConfigFormat::Json => serde_json::from_str(&raw).map_err(|err| ConfigError {
                code: "ERR_CONFIG_PARSE",
                message: err.to_string(),
            })?,
            ConfigFormat::Yaml => serde_yaml::from_str(&raw).map_err(|err| ConfigError {
                code: "ERR_CONFIG_PARSE",
                message: err.to_string(),
            })?,
        };

        config.apply_defaults();
        config.validate()?;
        config.compile_matchers()?;

        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.http.port == 0 {
            self.http.port = DEFAULT_PORT;
        }
        for method in &mut self.methods {
            if method.version_from == 0 {
                method.version_from = 1;
            }
            method.convention = scoalesce(&method.convention, DEFAULT_CONVENTION);
            method.content_type = scoalesce(&method.content_type, DEFAULT_CONTENT_TYPE);
        }
        if self.general.version_from == 0 {
            self.general.version_from = 1;
        }
        self.general.convention = scoalesce(&self.general.convention, DEFAULT_CONVENTION);
        self.general.content_type = scoalesce(&self.general.content_type, DEFAULT_CONTENT_TYPE);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.db_group.read.max_conn < 0 {
            return Err(invalid("DBGroup.Read.MaxConn should be >= 0".to_string()));
        }

        if self.service.version.is_empty() {
            return Err(invalid("Service.Version is not specified".to_string()));
        }

        if self.service.name.is_empty() {
            return Err(invalid("Service.Name is not specified".to_string()));
        }
        if !valid_service_name(&self.service.name) {
            return Err(invalid(
                "Service.Name can contain only [a-zA-Z_-]".to_string(),
            ));
        }

        if self.http.endpoint.is_empty() {
            return Err(invalid("HTTP.Endpoint is not specified".to_string()));
        }

        validate_enhance("General", &self.general.enhance)?;
        validate_enhance("General", &self.general.postproc)?;

        for (idx, method) in self.methods.iter().enumerate() {
            let label = method.name.join(",");
            validate_enhance(&label, &method.enhance)?;
            validate_enhance(&label, &method.postproc)?;

            if !method.finalize_name.is_empty() && method.finalize_name.len() != method.name.len()
            {
                return Err(invalid(format!(
                    "slices Name and FinalizeName in Methods[{}] have different lengths",
                    idx
                )));
            }
        }

        if self.http.use_ssl {
            if self.http.ssl_cert.is_empty() {
                return Err(invalid("provide HTTP.SSLCert to use ssl".to_string()));
            }
            if !Path::new(&self.http.ssl_cert).exists() {
                return Err(invalid(format!("file not found: {}", self.http.ssl_cert)));
            }
            if self.http.ssl_key.is_empty() {
                return Err(invalid("provide HTTP.SSLKey to use ssl".to_string()));
            }
            if !Path::new(&self.http.ssl_key).exists() {
                return Err(invalid(format!("file not found: {}", self.http.ssl_key)));
            }
        }

        Ok(())
    }

    fn compile_matchers(&mut self) -> Result<(), ConfigError> {
        for method in &mut self.methods {
            let mut matchers = Vec::with_capacity(method.name.len());
            for pattern in &method.name {
                let rx = Regex::new(pattern)
                    .map_err(|_| invalid(format!("invalid regex \"{}\"", pattern)))?;
                matchers.push(rx);
            }
            method.name_match = matchers;
        }
        Ok(())
    }

    /// Effective method configuration for a method path and API version.
    ///
    /// Among overrides whose pattern matches the path and whose
    /// `VersionFrom` does not exceed the requested version, the entry with
    /// the largest `VersionFrom` wins. Its finalize name is the element at
    /// the matching pattern index. `Enhance` and `Postproc` concatenate
    /// onto the general lists; `Convention`, `ContentType` and
    /// `HeadersPass` replace the general values when set.
    pub fn method_properties(&self, method: &str, version: i32) -> MethodConfig {
        let mut best_version = 0;
        let mut best_idx = 0;
        let mut fin_name_idx = 0;

        for (idx, entry) in self.methods.iter().enumerate() {
            for (n, matcher) in entry.name_match.iter().enumerate() {
                if matcher.is_match(method)
                    && entry.version_from <= version
                    && entry.version_from > best_version
                {
                    best_version = entry.version_from;
                    best_idx = idx;
                    fin_name_idx = n;
                }
            }
        }

        let mut finalize_name = Vec::new();
        let mut convention = self.general.convention.clone();
        let mut content_type = self.general.content_type.clone();
        let mut enhance = self.general.enhance.clone();
        let mut postproc = self.general.postproc.clone();
        let mut headers_pass = self.general.headers_pass.clone();

        if best_version > 0 {
            let best = &self.methods[best_idx];
            if !best.finalize_name.is_empty() {
                finalize_name.push(best.finalize_name[fin_name_idx].clone());
            }
            if !best.convention.is_empty() {
                convention = best.convention.clone();
            }
            if !best.content_type.is_empty() {
                content_type = best.content_type.clone();
            }
            if !best.enhance.is_empty() {
                enhance.extend(best.enhance.iter().cloned());
            }
            if !best.postproc.is_empty() {
                postproc.extend(best.postproc.iter().cloned());
            }
            if !best.headers_pass.is_empty() {
                headers_pass = best.headers_pass.clone();
            }
        }

        MethodConfig {
            finalize_name,
            convention,
            content_type,
            enhance,
            postproc,
            headers_pass,
            ..MethodConfig::default()
        }
    }

    /// Write-database descriptor with read fields filled in for anything
    /// left empty, plus a flag telling whether it ends up structurally
    /// equal to the read descriptor (in which case one pool is shared).
    pub fn write_db(&self) -> (Database, bool) {
        let merged = self.db_group.write.coalesce(&self.db_group.read);
        let same = merged == self.db_group.read;
        (merged, same)
    }

    /// Tracing filter derived from the `Debug` level
    /// (0..3 = none, errors, warnings, verbose).
    pub fn log_filter(&self) -> &'static str {
        match self.debug {
            0 => "off",
            1 => "error",
            2 => "warn",
            _ => "info",
        }
    }
}

fn validate_enhance(method: &str, steps: &[Enhance]) -> Result<(), ConfigError> {
    for step in steps {
        if step.incoming_fields.len() != step.forward_fields.len() {
            return Err(invalid(format!(
                "{}: count(Enhance.IncomingFields) != count(Enhance.ForwardFields) [{} != {}]",
                method,
                step.incoming_fields.len(),
                step.forward_fields.len()
            )));
        }

        for fwd in &step.forward_fields {
            if fwd == "[]" && step.forward_fields.len() > 1 {
                return Err(invalid(format!(
                    "{}: \"[]\" must be the only element in Enhance.ForwardFields",
                    method
                )));
            }
        }

        for transfer in &step.transfer_fields {
            for reference in field_references(&transfer.from) {
                if reference < 1 || reference > step.forward_fields.len() {
                    return Err(invalid(format!(
                        "{}: unmatched wildcard \"%{}\" in \"{}\"",
                        method, reference, transfer.from
                    )));
                }
            }
        }
    }
    Ok(())
}

/// `%N` references found in a `TransferFields.From` path.
pub fn field_references(from: &str) -> Vec<usize> {
    let rx = reference_regex();
    rx.find_iter(from)
        .filter_map(|m| m.as_str()[1..].parse().ok())
        .collect()
}

pub(crate) fn reference_regex() -> &'static Regex {
    static RX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RX.get_or_init(|| Regex::new(r"%\d+").expect("compile reference regex"))
}

fn valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphabetic() || b == b'_' || b == b'-')
}

fn scoalesce(value: &str, fallback: &str) -> String {
    if !value.is_empty() { value } else { fallback }.to_string()
}

/// Replace every `{{token}}` placeholder with the environment variable
/// named by the upper-cased token, until none remain. Unset variables
/// substitute as empty strings.
fn substitute_env(raw: &str) -> String {
    let rx = Regex::new(r"\{\{(\w+)\}\}").expect("compile env placeholder regex");
    let mut out = raw.to_string();
    while let Some(caps) = rx.captures(&out) {
        let full = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
        let token = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let value = std::env::var(token.to_uppercase()).unwrap_or_default();
        out = out.replace(&full, &value);
    }
    out
}
