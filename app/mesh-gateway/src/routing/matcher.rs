//! Route matching implementation

use crate::config::RouteConfig;
use std::sync::Arc;

/// Route match result
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// Matched route
    pub route: Arc<RouteConfig>,
    /// Path to send to the backend
    pub target_path: String,
}

impl RouteMatch {
    pub fn new(route: Arc<RouteConfig>, request_path: &str) -> Self {
        let target_path = if route.strip_path {
            strip_prefix(request_path, route.prefix())
        } else {
            request_path.to_string()
        };

        Self { route, target_path }
    }

    pub fn service_name(&self) -> &str {
        &self.route.service_name
    }
}

/// Length of the matched part of `path`, `None` if the route does not match.
///
/// Wildcard routes match their prefix at a segment boundary, so `/api/ai/*`
/// matches `/api/ai` and `/api/ai/x` but not `/api/aix`.
pub fn match_len(route: &RouteConfig, path: &str) -> Option<usize> {
    if route.is_wildcard() {
        let prefix = route.prefix();
        let rest = path.strip_prefix(prefix)?;
        if rest.is_empty() || rest.starts_with('/') || prefix.is_empty() {
            return Some(prefix.len());
        }
        None
    } else if route.path == path {
        Some(path.len())
    } else {
        None
    }
}

pub fn matches_method(route: &RouteConfig, method: &str) -> bool {
    route
        .methods
        .iter()
        .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
}

/// Remove the route prefix from the request path; never returns an empty path
pub fn strip_prefix(path: &str, prefix: &str) -> String {
    match path.strip_prefix(prefix) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) => format!("/{}", rest),
        None => path.to_string(),
    }
}
