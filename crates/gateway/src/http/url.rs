use std::sync::LazyLock;

use regex::Regex;

use crate::context::Verb;

static PARSE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\w+)(?:/(\d+)?)").expect("compile url regex"));

static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"v(\d+)/").expect("compile version regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlError {
    pub message: &'static str,
}

impl std::fmt::Display for UrlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message)
    }
}

impl std::error::Error for UrlError {}

/// Decomposed request URL: `/a/1/b/2/` becomes method path `/a/b/`,
/// query path `a_b` and the ID vector `[1, 2]` (0 for absent IDs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub method_path: String,
    pub query_path: String,
    pub ids: Vec<i64>,
}

/// Parse the unversioned, slash-terminated path and cross-check the
/// trailing ID against the verb: POST must not carry one, PUT/PATCH/DELETE
/// must.
pub fn parse(path: &str, verb: Verb) -> Result<ParsedUrl, UrlError> {
    let mut method_path = String::from("/");
    let mut query_path = String::new();
    let mut ids = Vec::new();

    for caps in PARSE_URL.captures_iter(path) {
        let word = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        method_path.push_str(word);
        method_path.push('/');
        if !ids.is_empty() {
            query_path.push('_');
        }
        query_path.push_str(word);

        let id = caps
            .get(2)
            .map(|m| m.as_str())
            .unwrap_or("")
            .parse::<i64>()
            .unwrap_or(0);
        ids.push(id);
    }

    if ids.is_empty() {
        return Err(UrlError {
            message: "invalid url",
        });
    }

    let last = *ids.last().unwrap_or(&0);
    if last != 0 && verb == Verb::Post {
        return Err(UrlError {
            message: "unnecessary item ID in POST query",
        });
    }
    if last == 0 && matches!(verb, Verb::Put | Verb::Patch | Verb::Delete) {
        return Err(UrlError {
            message: "item ID required",
        });
    }

    Ok(ParsedUrl {
        method_path,
        query_path,
        ids,
    })
}

/// Extract the API version from a `v<N>/`-prefixed path and return it
/// together with the remainder after the version segment.
pub fn split_version(path: &str) -> Option<(i32, &str)> {
    let caps = VERSION.captures(path)?;
    let whole = caps.get(0)?;
    let version = caps.get(1)?.as_str().parse::<i32>().ok()?;
    Some((version, &path[whole.end()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_with_id() {
        let parsed = parse("foo/42/", Verb::Get).unwrap();
        assert_eq!(parsed.method_path, "/foo/");
        assert_eq!(parsed.query_path, "foo");
        assert_eq!(parsed.ids, vec![42]);
    }

    #[test]
    fn nested_segments_with_ids() {
        let parsed = parse("a/1/b/2/", Verb::Get).unwrap();
        assert_eq!(parsed.method_path, "/a/b/");
        assert_eq!(parsed.query_path, "a_b");
        assert_eq!(parsed.ids, vec![1, 2]);
    }

    #[test]
    fn absent_ids_become_zero() {
        let parsed = parse("catalog/goods/", Verb::Get).unwrap();
        assert_eq!(parsed.method_path, "/catalog/goods/");
        assert_eq!(parsed.query_path, "catalog_goods");
        assert_eq!(parsed.ids, vec![0, 0]);
    }

    #[test]
    fn rejoining_segments_restores_the_path() {
        let original = "a/1/b/2/";
        let parsed = parse(original, Verb::Get).unwrap();
        let words: Vec<&str> = parsed.method_path.trim_matches('/').split('/').collect();
        let mut rebuilt = String::new();
        for (word, id) in words.iter().zip(&parsed.ids) {
            rebuilt.push_str(word);
            rebuilt.push('/');
            if *id != 0 {
                rebuilt.push_str(&id.to_string());
                rebuilt.push('/');
            }
        }
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn post_with_trailing_id_is_rejected() {
        let err = parse("foo/42/", Verb::Post).unwrap_err();
        assert_eq!(err.message, "unnecessary item ID in POST query");
    }

    #[test]
    fn post_without_trailing_id_is_accepted() {
        assert!(parse("foo/", Verb::Post).is_ok());
    }

    #[test]
    fn mutating_verbs_require_trailing_id() {
        for verb in [Verb::Put, Verb::Patch, Verb::Delete] {
            let err = parse("foo/", verb).unwrap_err();
            assert_eq!(err.message, "item ID required");
        }
        assert!(parse("foo/42/", Verb::Put).is_ok());
    }

    #[test]
    fn garbage_path_is_invalid() {
        let err = parse("!!!", Verb::Get).unwrap_err();
        assert_eq!(err.message, "invalid url");
    }

    #[test]
    fn split_version_extracts_number_and_rest() {
        assert_eq!(split_version("v1/foo/42/"), Some((1, "foo/42/")));
        assert_eq!(split_version("v12/a/b/"), Some((12, "a/b/")));
        assert_eq!(split_version("foo/42/"), None);
    }
}
