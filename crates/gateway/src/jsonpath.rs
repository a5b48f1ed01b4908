use serde_json::Value;

/// Minimal JSONPath evaluation over parsed JSON documents.
///
/// Supported shapes are the ones the enhancement pipeline uses: dotted
/// member access (`$.order.customer`), array indexing (`$.items[0]`) and
/// filter selection on arrays (`$[?(@.price > 100)]`). Filter predicates
/// compare a `@.`-relative path against a literal with
/// `== != > >= < <=`, or test bare existence (`@.field`).
#[derive(Debug)]
pub enum PathError {
    Syntax(String),
    NotFound(String),
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::Syntax(msg) => write!(f, "invalid jsonpath: {}", msg),
            PathError::NotFound(path) => write!(f, "no match for {}", path),
        }
    }
}

impl std::error::Error for PathError {}

#[derive(Debug)]
enum Segment {
    Key(String),
    Index(usize),
    Filter(Predicate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug)]
struct Predicate {
    path: Vec<String>,
    cmp: Option<(CmpOp, Value)>,
}

/// First value matched by `path`, or `NotFound`.
pub fn get<'a>(doc: &'a Value, path: &str) -> Result<&'a Value, PathError> {
    select(doc, path)?
        .into_iter()
        .next()
        .ok_or_else(|| PathError::NotFound(path.to_string()))
}

/// All values matched by `path` (empty when nothing matches).
pub fn select<'a>(doc: &'a Value, path: &str) -> Result<Vec<&'a Value>, PathError> {
    let segments = parse(path)?;
    let mut nodes = vec![doc];

    for segment in &segments {
        let mut next = Vec::new();
        for node in nodes {
            match segment {
                Segment::Key(key) => {
                    if let Value::Object(map) = node
                        && let Some(v) = map.get(key)
                    {
                        next.push(v);
                    }
                }
                Segment::Index(idx) => {
                    if let Value::Array(items) = node
                        && let Some(v) = items.get(*idx)
                    {
                        next.push(v);
                    }
                }
                Segment::Filter(predicate) => {
                    if let Value::Array(items) = node {
                        next.extend(items.iter().filter(|el| eval_predicate(el, predicate)));
                    }
                }
            }
        }
        nodes = next;
    }

    Ok(nodes)
}

/// Evaluate a bare filter predicate (the `<cond>` of `$[?(<cond>)]`)
/// against a single document.
pub fn matches(doc: &Value, condition: &str) -> Result<bool, PathError> {
    let predicate = parse_predicate(condition)?;
    Ok(eval_predicate(doc, &predicate))
}

fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| PathError::Syntax(format!("path must start with '$': {}", path)))?;

    let mut segments = Vec::new();
    let mut i = 0;

    while i < rest.len() {
        match rest.as_bytes()[i] {
            b'.' => {
                let start = i + 1;
                let end = scan_ident(rest, start);
                if end == start {
                    return Err(PathError::Syntax(format!("empty key in {}", path)));
                }
                segments.push(Segment::Key(rest[start..end].to_string()));
                i = end;
            }
            b'[' => {
                if rest[i + 1..].starts_with("?(") {
                    let close = rest[i..].find(")]").ok_or_else(|| {
                        PathError::Syntax(format!("unterminated filter in {}", path))
                    })?;
                    let expr = &rest[i + 3..i + close];
                    segments.push(Segment::Filter(parse_predicate(expr)?));
                    i += close + 2;
                } else {
                    let close = rest[i..]
                        .find(']')
                        .ok_or_else(|| PathError::Syntax(format!("unterminated index in {}", path)))?;
                    let idx = rest[i + 1..i + close].trim().parse::<usize>().map_err(|_| {
                        PathError::Syntax(format!("invalid index in {}", path))
                    })?;
                    segments.push(Segment::Index(idx));
                    i += close + 1;
                }
            }
            _ => {
                return Err(PathError::Syntax(format!(
                    "unexpected character at offset {} in {}",
                    i + 1,
                    path
                )));
            }
        }
    }

    Ok(segments)
}

fn scan_ident(s: &str, start: usize) -> usize {
    let mut end = start;
    for (off, c) in s[start..].char_indices() {
        if c.is_alphanumeric() || c == '_' || c == '-' {
            end = start + off + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

fn parse_predicate(expr: &str) -> Result<Predicate, PathError> {
    let expr = expr.trim();
    let rest = expr
        .strip_prefix('@')
        .ok_or_else(|| PathError::Syntax(format!("filter must start with '@': {}", expr)))?;

    let mut path = Vec::new();
    let mut i = 0;
    while rest[i..].starts_with('.') {
        let start = i + 1;
        let end = scan_ident(rest, start);
        if end == start {
            return Err(PathError::Syntax(format!("empty key in filter: {}", expr)));
        }
        path.push(rest[start..end].to_string());
        i = end;
    }

    let tail = rest[i..].trim();
    if tail.is_empty() {
        return Ok(Predicate { path, cmp: None });
    }

    let (op, literal) = if let Some(s) = tail.strip_prefix("==") {
        (CmpOp::Eq, s)
    } else if let Some(s) = tail.strip_prefix("!=") {
        (CmpOp::Ne, s)
    } else if let Some(s) = tail.strip_prefix(">=") {
        (CmpOp::Gte, s)
    } else if let Some(s) = tail.strip_prefix("<=") {
        (CmpOp::Lte, s)
    } else if let Some(s) = tail.strip_prefix('>') {
        (CmpOp::Gt, s)
    } else if let Some(s) = tail.strip_prefix('<') {
        (CmpOp::Lt, s)
    } else {
        return Err(PathError::Syntax(format!("invalid operator in filter: {}", expr)));
    };

    Ok(Predicate {
        path,
        cmp: Some((op, parse_literal(literal.trim())?)),
    })
}

fn parse_literal(s: &str) -> Result<Value, PathError> {
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        return Ok(Value::String(s[1..s.len() - 1].to_string()));
    }
    serde_json::from_str(s)
        .map_err(|_| PathError::Syntax(format!("invalid literal in filter: {}", s)))
}

fn eval_predicate(node: &Value, predicate: &Predicate) -> bool {
    let mut current = node;
    for key in &predicate.path {
        match current {
            Value::Object(map) => match map.get(key) {
                Some(v) => current = v,
                None => return false,
            },
            _ => return false,
        }
    }

    match &predicate.cmp {
        None => true,
        Some((op, rhs)) => compare(current, *op, rhs),
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Gt => ordered(left, right, |o| o == std::cmp::Ordering::Greater),
        CmpOp::Gte => ordered(left, right, |o| o != std::cmp::Ordering::Less),
        CmpOp::Lt => ordered(left, right, |o| o == std::cmp::Ordering::Less),
        CmpOp::Lte => ordered(left, right, |o| o != std::cmp::Ordering::Greater),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

fn ordered<F>(left: &Value, right: &Value, check: F) -> bool
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l.partial_cmp(&r).map(&check).unwrap_or(false);
    }
    if let (Value::String(l), Value::String(r)) = (left, right) {
        return check(l.as_str().cmp(r.as_str()));
    }
    false
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
