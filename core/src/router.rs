//! Route table: (method, pattern) to handler.
//!
//! # Design
//! Patterns are `/`-separated segments, each either a literal or a `{name}`
//! template. Empty segments are ignored, so `/ping/` and `/ping` are the same
//! route. A route set is small, so resolution is a linear scan that keeps the
//! most specific candidate: segments are compared from the left and a literal
//! beats a template at the first position where two candidates differ.
//!
//! Two patterns with the same shape (template names aside) would always match
//! the same paths, so registering the second one is a `DuplicateRoute`. That
//! keeps resolution deterministic.
//!
//! The table itself has no "frozen" state; `EmbedServer` refuses
//! registrations while it is listening and hands connection tasks an
//! `Arc<RouteTable>` snapshot.

use std::sync::Arc;

use crate::error::{ServerError, ServerResult};
use crate::handler::Handler;
use crate::http::Method;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(raw: &str) -> ServerResult<Self> {
        let invalid = |reason: &str| ServerError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };
        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        let mut segments = Vec::new();
        for seg in raw.split('/').filter(|s| !s.is_empty()) {
            if let Some(name) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                if name.is_empty() || name.contains(['{', '}']) {
                    return Err(invalid("template segment needs a name"));
                }
                segments.push(Segment::Param(name.to_string()));
            } else if seg.contains(['{', '}']) {
                return Err(invalid("braces are only allowed around a whole segment"));
            } else {
                segments.push(Segment::Literal(seg.to_string()));
            }
        }
        Ok(Pattern {
            raw: raw.to_string(),
            segments,
        })
    }

    fn same_shape(&self, other: &Pattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|pair| match pair {
                    (Segment::Literal(a), Segment::Literal(b)) => a == b,
                    (Segment::Param(_), Segment::Param(_)) => true,
                    _ => false,
                })
    }

    fn matches(&self, path: &[&str]) -> Option<Vec<(String, String)>> {
        if self.segments.len() != path.len() {
            return None;
        }
        let mut params = Vec::new();
        for (segment, actual) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(lit) if lit == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => params.push((name.clone(), actual.to_string())),
            }
        }
        Some(params)
    }

    /// Literal positions as `true`; compares lexicographically from the left.
    fn specificity(&self) -> Vec<bool> {
        self.segments
            .iter()
            .map(|s| matches!(s, Segment::Literal(_)))
            .collect()
    }
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: Arc<dyn Handler>,
}

/// A resolved route with its extracted template values.
pub struct RouteMatch<'a> {
    pub handler: &'a Arc<dyn Handler>,
    pub pattern: &'a str,
    pub params: Vec<(String, String)>,
}

/// Registered routes.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. On error the table is left unchanged.
    pub fn register<H: Handler>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
    ) -> ServerResult<()> {
        self.register_arc(method, pattern, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> ServerResult<()> {
        let pattern = Pattern::parse(pattern)?;
        if self
            .routes
            .iter()
            .any(|r| r.method == method && r.pattern.same_shape(&pattern))
        {
            return Err(ServerError::DuplicateRoute {
                method,
                pattern: pattern.raw,
            });
        }
        self.routes.push(Arc::new(Route {
            method,
            pattern,
            handler,
        }));
        Ok(())
    }

    /// Find the most specific route for `method` and `path`.
    pub fn resolve(&self, method: Method, path: &str) -> ServerResult<RouteMatch<'_>> {
        let segments = split_path(path);
        self.routes
            .iter()
            .filter(|r| r.method == method)
            .filter_map(|r| r.pattern.matches(&segments).map(|params| (r, params)))
            .max_by(|(a, _), (b, _)| a.pattern.specificity().cmp(&b.pattern.specificity()))
            .map(|(route, params)| RouteMatch {
                handler: &route.handler,
                pattern: &route.pattern.raw,
                params,
            })
            .ok_or_else(|| ServerError::NoRoute {
                method,
                path: path.to_string(),
            })
    }

    /// Methods that have a route matching `path`, in registration order.
    pub fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let segments = split_path(path);
        let mut methods = Vec::new();
        for route in &self.routes {
            if !methods.contains(&route.method) && route.pattern.matches(&segments).is_some() {
                methods.push(route.method);
            }
        }
        methods
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerFault;
    use crate::handler::{Context, Reply};
    use crate::http::{Request, Response};

    fn tagged(tag: &'static str) -> impl Handler {
        move |_req: &Request, _ctx: &mut Context| -> Result<Reply, HandlerFault> {
            Ok(Response::text(200, tag).into())
        }
    }

    fn tag_of(table: &RouteTable, method: Method, path: &str) -> String {
        let m = table.resolve(method, path).unwrap();
        m.pattern.to_string()
    }

    #[test]
    fn exact_match() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/ping", tagged("ping")).unwrap();
        assert_eq!(tag_of(&table, Method::Get, "/ping"), "/ping");
        assert_eq!(tag_of(&table, Method::Get, "/ping/"), "/ping");
        assert!(matches!(
            table.resolve(Method::Get, "/missing"),
            Err(ServerError::NoRoute { .. })
        ));
        assert!(matches!(
            table.resolve(Method::Post, "/ping"),
            Err(ServerError::NoRoute { .. })
        ));
    }

    #[test]
    fn root_pattern_matches_root_only() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/", tagged("root")).unwrap();
        assert_eq!(tag_of(&table, Method::Get, "/"), "/");
        assert!(table.resolve(Method::Get, "/x").is_err());
    }

    #[test]
    fn templates_capture_params() {
        let mut table = RouteTable::new();
        table
            .register(Method::Get, "/users/{id}/posts/{post}", tagged("post"))
            .unwrap();
        let m = table.resolve(Method::Get, "/users/7/posts/abc").unwrap();
        assert_eq!(
            m.params,
            vec![
                ("id".to_string(), "7".to_string()),
                ("post".to_string(), "abc".to_string())
            ]
        );
        assert!(table.resolve(Method::Get, "/users/7/posts").is_err());
    }

    #[test]
    fn literal_beats_template() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/users/{id}", tagged("t")).unwrap();
        table.register(Method::Get, "/users/me", tagged("l")).unwrap();
        assert_eq!(tag_of(&table, Method::Get, "/users/me"), "/users/me");
        assert_eq!(tag_of(&table, Method::Get, "/users/42"), "/users/{id}");
    }

    #[test]
    fn leftmost_segment_decides() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/{a}/b", tagged("x")).unwrap();
        table.register(Method::Get, "/a/{b}", tagged("y")).unwrap();
        // Both match; the literal in the first position wins.
        assert_eq!(tag_of(&table, Method::Get, "/a/b"), "/a/{b}");
        assert_eq!(tag_of(&table, Method::Get, "/z/b"), "/{a}/b");
    }

    #[test]
    fn resolution_does_not_depend_on_registration_order() {
        let mut forward = RouteTable::new();
        forward.register(Method::Get, "/a/{b}", tagged("1")).unwrap();
        forward.register(Method::Get, "/{a}/b", tagged("2")).unwrap();
        forward.register(Method::Get, "/{a}/{b}", tagged("3")).unwrap();

        let mut reverse = RouteTable::new();
        reverse.register(Method::Get, "/{a}/{b}", tagged("3")).unwrap();
        reverse.register(Method::Get, "/{a}/b", tagged("2")).unwrap();
        reverse.register(Method::Get, "/a/{b}", tagged("1")).unwrap();

        for path in ["/a/b", "/a/x", "/x/b", "/x/y"] {
            assert_eq!(
                tag_of(&forward, Method::Get, path),
                tag_of(&reverse, Method::Get, path),
                "{path}"
            );
        }
    }

    #[test]
    fn duplicate_route_is_rejected_and_table_unchanged() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/ping", tagged("a")).unwrap();
        let err = table.register(Method::Get, "/ping", tagged("b")).unwrap_err();
        assert!(matches!(err, ServerError::DuplicateRoute { .. }));
        assert_eq!(table.len(), 1);

        table.register(Method::Get, "/items/{id}", tagged("c")).unwrap();
        let err = table
            .register(Method::Get, "/items/{other}", tagged("d"))
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateRoute { .. }));
        assert_eq!(table.len(), 2);

        // Same pattern under another method is fine.
        table.register(Method::Post, "/ping", tagged("e")).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let mut table = RouteTable::new();
        for pattern in ["ping", "/a/{}", "/a/{id", "/a/x{id}", "/a/{i{d}}"] {
            let err = table.register(Method::Get, pattern, tagged("x")).unwrap_err();
            assert!(
                matches!(err, ServerError::InvalidPattern { .. }),
                "{pattern}"
            );
        }
        assert!(table.is_empty());
    }

    #[test]
    fn allowed_methods_lists_matching_routes() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/ping", tagged("a")).unwrap();
        table.register(Method::Put, "/{any}", tagged("b")).unwrap();
        assert_eq!(table.allowed_methods("/ping"), vec![Method::Get, Method::Put]);
        assert!(table.allowed_methods("/a/b").is_empty());
    }
}
