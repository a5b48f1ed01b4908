use axum::http::Method;

/// Logical request verb. `Hit` is synthesized when a request carries both
/// `latitude` and `longitude` form values, whatever the original verb was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Hit,
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub fn from_method(method: &Method) -> Option<Verb> {
        match *method {
            Method::GET => Some(Verb::Get),
            Method::POST => Some(Verb::Post),
            Method::PUT => Some(Verb::Put),
            Method::PATCH => Some(Verb::Patch),
            Method::DELETE => Some(Verb::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Hit => "HIT",
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }

    /// Stored-procedure name suffix for the CRUD convention.
    pub fn suffix(self) -> &'static str {
        match self {
            Verb::Hit => "hit",
            Verb::Get => "get",
            Verb::Post => "ins",
            Verb::Put => "upd",
            Verb::Patch => "pat",
            Verb::Delete => "del",
        }
    }

    /// HTTP status used when the procedure envelope carries no code.
    pub fn default_status(self) -> u16 {
        match self {
            Verb::Hit | Verb::Get => 200,
            Verb::Post => 201,
            Verb::Put | Verb::Patch | Verb::Delete => 204,
        }
    }

    pub fn uses_write_pool(self) -> bool {
        matches!(self, Verb::Post | Verb::Put | Verb::Patch | Verb::Delete)
    }
}

/// Per-request state threaded through every pipeline stage by value.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub verb: Verb,
    pub version: i32,
    /// Full request path including the version prefix, slash-terminated
    /// (`/api/v1/foo/1/`).
    pub vpath: String,
    /// Endpoint- and version-relative path, slash-terminated (`foo/1/`).
    pub path: String,
    pub user_id: i64,
}

/// One pass-through HTTP header resolved against the inbound request.
/// An empty `kind` injects the value into the body as a JSON field;
/// otherwise the value becomes a typed positional SQL argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderArg {
    pub name: String,
    pub value: String,
    pub kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_map_to_suffixes() {
        assert_eq!(Verb::Hit.suffix(), "hit");
        assert_eq!(Verb::Get.suffix(), "get");
        assert_eq!(Verb::Post.suffix(), "ins");
        assert_eq!(Verb::Put.suffix(), "upd");
        assert_eq!(Verb::Patch.suffix(), "pat");
        assert_eq!(Verb::Delete.suffix(), "del");
    }

    #[test]
    fn write_pool_selection() {
        assert!(!Verb::Hit.uses_write_pool());
        assert!(!Verb::Get.uses_write_pool());
        assert!(Verb::Post.uses_write_pool());
        assert!(Verb::Put.uses_write_pool());
        assert!(Verb::Patch.uses_write_pool());
        assert!(Verb::Delete.uses_write_pool());
    }

    #[test]
    fn options_is_not_a_pipeline_verb() {
        assert_eq!(Verb::from_method(&Method::OPTIONS), None);
    }
}
