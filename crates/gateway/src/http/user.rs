use axum::http::header::COOKIE;
use axum::http::{HeaderMap, StatusCode};

use crate::http::{ApiError, AppState};

/// Resolve the user ID from the configured cookie, or 0 when cookie-based
/// authentication is not configured. Every failure along the way is a 401.
pub async fn resolve_user(state: &AppState, headers: &HeaderMap) -> Result<i64, ApiError> {
    let auth = &state.config.auth;
    if auth.cookie_name.is_empty() {
        return Ok(0);
    }

    let Some(raw) = cookie_value(headers, &auth.cookie_name) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            "authentication cookie not present".to_string(),
        ));
    };
    if raw.is_empty() {
        return Err((
            StatusCode::UNAUTHORIZED,
            "empty cookie, authentication failed".to_string(),
        ));
    }

    let value = if auth.unescaped {
        raw
    } else {
        let plused = raw.replace('+', " ");
        match percent_encoding::percent_decode_str(&plused).decode_utf8() {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => {
                return Err((
                    StatusCode::UNAUTHORIZED,
                    "authentication failed".to_string(),
                ));
            }
        }
    };

    let Some(item) = token_part(&value, auth.offset, &auth.separator, auth.part) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            "authentication failed".to_string(),
        ));
    };

    let lookup = restproc_db::lookup_user(&state.db_read, &auth.procedure, item)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "user lookup failed");
            (
                StatusCode::UNAUTHORIZED,
                "authentication failed".to_string(),
            )
        })?;

    match lookup {
        (Some(user_id), Some(200)) => Ok(user_id),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            "authentication failed".to_string(),
        )),
    }
}

/// Substring from `offset`, split by `separator`, `part`-th item.
/// An empty separator splits into individual characters.
fn token_part<'a>(value: &'a str, offset: usize, separator: &str, part: usize) -> Option<&'a str> {
    let tail = value.get(offset..)?;
    if separator.is_empty() {
        return tail
            .char_indices()
            .nth(part)
            .map(|(i, c)| &tail[i..i + c.len_utf8()]);
    }
    tail.split(separator).nth(part)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=')
                && key == name
            {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cookie_value_finds_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("session=abc; token=xyz; other=1"),
        );
        assert_eq!(cookie_value(&headers, "token"), Some("xyz".to_string()));
        assert_eq!(cookie_value(&headers, "session"), Some("abc".to_string()));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn token_part_applies_offset_separator_and_part() {
        assert_eq!(token_part("xx:a|b|c", 3, "|", 1), Some("b"));
        assert_eq!(token_part("a|b", 0, "|", 0), Some("a"));
        assert_eq!(token_part("a|b", 0, "|", 5), None);
        assert_eq!(token_part("short", 99, "|", 0), None);
    }

    #[test]
    fn empty_separator_splits_into_characters() {
        assert_eq!(token_part("abcdef", 2, "", 0), Some("c"));
        assert_eq!(token_part("abcdef", 2, "", 3), Some("f"));
        assert_eq!(token_part("abcdef", 2, "", 4), None);
        assert_eq!(token_part("döf", 1, "", 0), Some("ö"));
    }
}
