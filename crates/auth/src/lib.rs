use std::collections::HashMap;

use http::HeaderMap;

/// Header carrying the secret key of a remote service.
pub const KEY_HEADER: &str = "x-auth-sign";
/// Header carrying the name of a remote service.
pub const CALLER_HEADER: &str = "x-auth-id";

/// Challenge sent back on verification failure.
pub const WWW_AUTHENTICATE: &str = "Basic realm=\"Access to production service\"";

const UNKNOWN_CALLER: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Caller name attached to request extensions after successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl Caller {
    pub fn name(&self) -> &str {
        if self.0.is_empty() {
            UNKNOWN_CALLER
        } else {
            &self.0
        }
    }
}

/// Parses and verifies static access keys.
///
/// The key map is read-only after load; a `Verifier` is shared across
/// request handlers without further synchronization.
#[derive(Debug, Clone)]
pub struct Verifier {
    access_keys: HashMap<String, String>,
}

impl Verifier {
    /// Load `key,caller` CSV files into a verifier. At least one file is
    /// required; every row must have exactly two non-empty columns.
    pub fn from_files(paths: &[String]) -> Result<Self, AuthError> {
        if paths.is_empty() {
            return Err(AuthError {
                code: "ERR_MISSING_CONFIG",
                message: "must provide AccessFiles".to_string(),
            });
        }

        let mut verifier = Verifier {
            access_keys: HashMap::new(),
        };

        for path in paths {
            let contents = std::fs::read_to_string(path).map_err(|err| AuthError {
                code: "ERR_ACCESS_FILE_READ",
                message: format!("failed to open file {}: {}", path, err),
            })?;
            verifier.load_keys(&contents)?;
        }

        Ok(verifier)
    }

    /// Parse one CSV block of `key,caller` rows into the key map.
    pub fn load_keys(&mut self, contents: &str) -> Result<(), AuthError> {
        for (idx, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            let mut columns = line.split(',');
            let key = columns.next().map(str::trim).unwrap_or("");
            let caller = columns.next().map(str::trim).unwrap_or("");
            if columns.next().is_some() {
                return Err(AuthError {
                    code: "ERR_ACCESS_FILE_PARSE",
                    message: format!("invalid format: line {}", idx + 1),
                });
            }
            if key.is_empty() || caller.is_empty() {
                return Err(AuthError {
                    code: "ERR_ACCESS_FILE_PARSE",
                    message: format!("invalid key or caller: line {}", idx + 1),
                });
            }

            self.access_keys.insert(caller.to_string(), key.to_string());
        }

        Ok(())
    }

    /// Verify the `X-Auth-Id`/`X-Auth-Sign` pair against the loaded keys
    /// and return the caller name on success.
    pub fn verify(&self, headers: &HeaderMap) -> Result<Caller, AuthError> {
        let caller = headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let sign = headers
            .get(KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        match self.access_keys.get(caller) {
            Some(key) if !sign.is_empty() && key == sign => Ok(Caller(caller.to_string())),
            _ => Err(AuthError {
                code: "ERR_ACCESS_KEY",
                message: format!("access key verification error for caller {}", caller),
            }),
        }
    }

    /// Key registered for the given caller, if any.
    pub fn access_key(&self, caller: &str) -> Option<&str> {
        self.access_keys.get(caller).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn loaded_verifier() -> Verifier {
        let mut v = Verifier {
            access_keys: HashMap::new(),
        };
        v.load_keys("sekrit, billing \nother-key,reports\n").unwrap();
        v
    }

    fn headers(caller: &str, sign: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CALLER_HEADER, HeaderValue::from_str(caller).unwrap());
        h.insert(KEY_HEADER, HeaderValue::from_str(sign).unwrap());
        h
    }

    #[test]
    fn from_files_requires_at_least_one_file() {
        let err = Verifier::from_files(&[]).unwrap_err();
        assert_eq!(err.code, "ERR_MISSING_CONFIG");
    }

    #[test]
    fn load_keys_trims_columns() {
        let v = loaded_verifier();
        assert_eq!(v.access_key("billing"), Some("sekrit"));
        assert_eq!(v.access_key("reports"), Some("other-key"));
    }

    #[test]
    fn load_keys_rejects_extra_columns() {
        let mut v = Verifier {
            access_keys: HashMap::new(),
        };
        let err = v.load_keys("a,b,c").unwrap_err();
        assert_eq!(err.code, "ERR_ACCESS_FILE_PARSE");
    }

    #[test]
    fn load_keys_rejects_empty_columns() {
        let mut v = Verifier {
            access_keys: HashMap::new(),
        };
        assert!(v.load_keys("key,").is_err());
        assert!(v.load_keys(",caller").is_err());
    }

    #[test]
    fn verify_accepts_registered_pair() {
        let v = loaded_verifier();
        let caller = v.verify(&headers("billing", "sekrit")).unwrap();
        assert_eq!(caller.name(), "billing");
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let v = loaded_verifier();
        assert!(v.verify(&headers("billing", "wrong")).is_err());
    }

    #[test]
    fn verify_rejects_unknown_caller() {
        let v = loaded_verifier();
        assert!(v.verify(&headers("nobody", "sekrit")).is_err());
    }

    #[test]
    fn verify_rejects_missing_headers() {
        let v = loaded_verifier();
        assert!(v.verify(&HeaderMap::new()).is_err());
    }

    #[test]
    fn unknown_caller_name_defaults() {
        assert_eq!(Caller(String::new()).name(), "unknown");
    }
}
