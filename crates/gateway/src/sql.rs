use crate::config::MethodConfig;
use crate::context::{HeaderArg, RequestContext};
use crate::http::url::ParsedUrl;

/// Synthesize the stored-function invocation for a request.
///
/// The function name is the finalize name when `prepend_id` is positive,
/// otherwise the query path. The CRUD convention appends the verb suffix
/// and passes the trailing path ID as its own argument; any other
/// convention forces the `ins` suffix, which drops that argument.
/// Arguments are literals: the procedure signature is a published
/// contract, so sanitation of strings and numerics is load-bearing.
pub fn build_call(
    schema: &str,
    parsed: &ParsedUrl,
    effective: &MethodConfig,
    ctx: &RequestContext,
    body: &str,
    headers: &[HeaderArg],
    prepend_id: i64,
) -> String {
    let mut suffix = ctx.verb.suffix();

    let mut function_name = if prepend_id > 0 {
        effective
            .finalize_name
            .first()
            .cloned()
            .unwrap_or_else(|| parsed.query_path.clone())
    } else {
        parsed.query_path.clone()
    };

    if effective.convention == "CRUD" {
        function_name.push('_');
        function_name.push_str(suffix);
    } else {
        suffix = "ins";
    }

    let mut arguments: Vec<String> = Vec::new();
    if ctx.user_id > 0 {
        arguments.push(ctx.user_id.to_string());
    }
    arguments.extend(serialize_headers(headers));
    if parsed.ids.len() > 1 {
        arguments.push(comma_separated(&parsed.ids[..parsed.ids.len() - 1]));
    }
    if suffix != "ins" {
        arguments.push(parsed.ids.last().copied().unwrap_or(0).to_string());
    }
    if suffix != "del" && !body.is_empty() {
        arguments.push(format!("'{}'", sanitize_string(body)));
    }

    let mut params = arguments.join(", ");
    if prepend_id > 0 {
        params = if params.is_empty() {
            prepend_id.to_string()
        } else {
            format!("{}, {}", prepend_id, params)
        };
    }

    let version_tag = if ctx.version > 1 {
        format!("_v{}", ctx.version)
    } else {
        String::new()
    };

    format!(
        "select * from {}.{}{} ({})",
        schema, function_name, version_tag, params
    )
}

/// Typed header values as positional SQL arguments, in configuration order.
fn serialize_headers(headers: &[HeaderArg]) -> Vec<String> {
    let mut result = Vec::new();
    for header in headers {
        match header.kind.to_lowercase().as_str() {
            "" => {}
            "int" | "integer" | "bigint" | "float" | "number" => {
                result.push(sanitize_number(&header.value));
            }
            "text" | "string" | "varchar" => {
                result.push(format!("'{}'", sanitize_string(&header.value)));
            }
            _ => {}
        }
    }
    result
}

pub fn sanitize_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Strip everything that cannot appear in a numeric literal; an empty
/// result becomes `0`.
pub fn sanitize_number(s: &str) -> String {
    let result: String = s
        .chars()
        .filter(|c| matches!(c, '0'..='9' | 'E' | 'e' | '.' | '-'))
        .collect();
    if result.is_empty() {
        "0".to_string()
    } else {
        result
    }
}

fn comma_separated(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Verb;

    fn ctx(verb: Verb, version: i32, user_id: i64) -> RequestContext {
        RequestContext {
            verb,
            version,
            vpath: format!("/v{}/foo/", version),
            path: "/foo/".to_string(),
            user_id,
        }
    }

    fn parsed(query_path: &str, ids: Vec<i64>) -> ParsedUrl {
        ParsedUrl {
            method_path: format!("/{}/", query_path.replace('_', "/")),
            query_path: query_path.to_string(),
            ids,
        }
    }

    fn crud() -> MethodConfig {
        MethodConfig {
            convention: "CRUD".to_string(),
            ..MethodConfig::default()
        }
    }

    #[test]
    fn crud_get_by_id() {
        let query = build_call(
            "public",
            &parsed("foo", vec![42]),
            &crud(),
            &ctx(Verb::Get, 1, 0),
            "",
            &[],
            0,
        );
        assert_eq!(query, "select * from public.foo_get (42)");
    }

    #[test]
    fn crud_post_quotes_the_body() {
        let query = build_call(
            "public",
            &parsed("bar", vec![0]),
            &crud(),
            &ctx(Verb::Post, 1, 0),
            r#"{"nm":"A","price":99}"#,
            &[],
            0,
        );
        assert_eq!(
            query,
            r#"select * from public.bar_ins ('{"nm":"A","price":99}')"#
        );
    }

    #[test]
    fn finalize_prepends_the_id() {
        let effective = MethodConfig {
            convention: "CRUD".to_string(),
            finalize_name: vec!["jobs_done".to_string()],
            ..MethodConfig::default()
        };
        let query = build_call(
            "public",
            &parsed("jobs", vec![0]),
            &effective,
            &ctx(Verb::Post, 1, 0),
            r#"{"k":1}"#,
            &[],
            7,
        );
        assert_eq!(query, r#"select * from public.jobs_done_ins (7, '{"k":1}')"#);
    }

    #[test]
    fn version_tag_appears_above_v1() {
        let query = build_call(
            "public",
            &parsed("foo", vec![5]),
            &crud(),
            &ctx(Verb::Get, 3, 0),
            "",
            &[],
            0,
        );
        assert_eq!(query, "select * from public.foo_get_v3 (5)");
    }

    #[test]
    fn non_crud_convention_drops_suffix_and_trailing_id() {
        let effective = MethodConfig {
            convention: "POST".to_string(),
            ..MethodConfig::default()
        };
        let query = build_call(
            "public",
            &parsed("foo", vec![5]),
            &effective,
            &ctx(Verb::Get, 1, 0),
            r#"{"q":1}"#,
            &[],
            0,
        );
        assert_eq!(query, r#"select * from public.foo ('{"q":1}')"#);
    }

    #[test]
    fn user_id_comes_first() {
        let query = build_call(
            "public",
            &parsed("foo", vec![42]),
            &crud(),
            &ctx(Verb::Get, 1, 99),
            "",
            &[],
            0,
        );
        assert_eq!(query, "select * from public.foo_get (99, 42)");
    }

    #[test]
    fn leading_ids_join_into_one_argument() {
        let query = build_call(
            "public",
            &parsed("a_b_c", vec![1, 2, 3]),
            &crud(),
            &ctx(Verb::Get, 1, 0),
            "",
            &[],
            0,
        );
        assert_eq!(query, "select * from public.a_b_c_get (1, 2, 3)");
    }

    #[test]
    fn delete_omits_the_body() {
        let query = build_call(
            "public",
            &parsed("foo", vec![42]),
            &crud(),
            &ctx(Verb::Delete, 1, 0),
            r#"{"x":1}"#,
            &[],
            0,
        );
        assert_eq!(query, "select * from public.foo_del (42)");
    }

    #[test]
    fn typed_headers_become_arguments() {
        let headers = vec![
            HeaderArg {
                name: "shop".to_string(),
                value: "17".to_string(),
                kind: "int".to_string(),
            },
            HeaderArg {
                name: "region".to_string(),
                value: "north".to_string(),
                kind: "varchar".to_string(),
            },
            HeaderArg {
                name: "skipped".to_string(),
                value: "x".to_string(),
                kind: String::new(),
            },
        ];
        let query = build_call(
            "public",
            &parsed("foo", vec![42]),
            &crud(),
            &ctx(Verb::Get, 1, 0),
            "",
            &headers,
            0,
        );
        assert_eq!(query, "select * from public.foo_get (17, 'north', 42)");
    }

    #[test]
    fn emitted_literal_has_no_unescaped_quote() {
        let nasty = r#"{"name":"O'Brien'); drop table users; --"}"#;
        let query = build_call(
            "public",
            &parsed("foo", vec![0]),
            &crud(),
            &ctx(Verb::Post, 1, 0),
            nasty,
            &[],
            0,
        );
        let literal = query
            .split_once('(')
            .map(|(_, args)| args)
            .unwrap_or_default();
        let inner = literal.trim_end_matches(')');
        let inner = &inner[1..inner.len() - 1];
        let mut chars = inner.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                assert_eq!(chars.next(), Some('\''), "unescaped quote in {}", query);
            }
        }
    }

    #[test]
    fn numeric_header_is_scrubbed() {
        assert_eq!(sanitize_number("12abc3"), "123");
        assert_eq!(sanitize_number("-1.5e3"), "-1.5e3");
        assert_eq!(sanitize_number("drop"), "0");
        assert_eq!(sanitize_number(""), "0");
    }

    #[test]
    fn string_sanitizer_doubles_quotes() {
        assert_eq!(sanitize_string("a'b''c"), "a''b''''c");
        assert_eq!(sanitize_string("plain"), "plain");
    }
}
