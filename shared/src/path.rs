use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Static(String),
    Param(String),
}

/// A path pattern made of static segments, `{name}` parameters and an optional trailing `*`
/// that captures the unmatched remainder of the request path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathPattern {
    segments: Vec<PathSegment>,
    has_trailing_splat: bool,
}

#[derive(Debug, PartialEq)]
pub struct PathMatch<'a> {
    pub params: HashMap<String, &'a str>,
    /// Whatever followed the matched segments, without a leading slash. Only ever non-empty
    /// for patterns ending in `*`. A trailing slash on the request path is preserved here.
    pub rest: &'a str,
}

impl PathPattern {
    /// Parses a path pattern string.
    /// Supports:
    /// - Static segments: "/api/users"
    /// - Dynamic parameters: "/api/users/{id}"
    /// - Trailing splat: "/api/users/*"
    pub fn parse(path_str: &str) -> Self {
        let mut normalized_path = path_str.trim().trim_matches('/');

        let mut has_trailing_splat = false;
        if normalized_path == "*" {
            has_trailing_splat = true;
            normalized_path = "";
        } else if let Some(stripped) = normalized_path.strip_suffix("/*") {
            has_trailing_splat = true;
            normalized_path = stripped;
        }

        let segments: Vec<PathSegment> = if normalized_path.is_empty() {
            vec![]
        } else {
            normalized_path
                .split('/')
                .map(|s| {
                    if let Some(stripped) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                        PathSegment::Param(stripped.to_string())
                    } else {
                        PathSegment::Static(s.to_string())
                    }
                })
                .collect()
        };

        PathPattern {
            segments,
            has_trailing_splat,
        }
    }

    /// Matches a request path against this pattern.
    /// Returns Some(match) if it succeeds, None otherwise.
    pub fn matches<'a>(&self, request_path: &'a str) -> Option<PathMatch<'a>> {
        let mut remaining = request_path.trim_start_matches('/');
        let mut params = HashMap::new();

        for seg in &self.segments {
            if remaining.is_empty() {
                return None;
            }
            let (req_segment, tail) = match remaining.split_once('/') {
                Some((head, tail)) => (head, tail),
                None => (remaining, ""),
            };

            match seg {
                PathSegment::Static(s) => {
                    if req_segment != s {
                        return None;
                    }
                }
                PathSegment::Param(name) => {
                    if req_segment.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), req_segment);
                }
            }
            remaining = tail;
        }

        if self.has_trailing_splat {
            Some(PathMatch {
                params,
                rest: remaining,
            })
        } else if remaining.trim_matches('/').is_empty() {
            Some(PathMatch { params, rest: "" })
        } else {
            None
        }
    }
}
