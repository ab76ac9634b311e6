//! Route table

use crate::{
    config::RouteConfig,
    routing::matcher::{match_len, matches_method, RouteMatch},
    GatewayResult,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Route table for the gateway
///
/// The longest matching path wins; on equal length an exact route beats a
/// wildcard one.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Vec<Arc<RouteConfig>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from validated route configs
    pub fn from_routes(routes: Vec<RouteConfig>) -> GatewayResult<Self> {
        for route in &routes {
            route.validate()?;
        }

        Ok(Self {
            routes: RwLock::new(routes.into_iter().map(Arc::new).collect()),
        })
    }

    /// Add a route, replacing any route with the same path
    pub async fn add_route(&self, route: RouteConfig) -> GatewayResult<()> {
        route.validate()?;

        let mut routes = self.routes.write().await;
        routes.retain(|r| r.path != route.path);
        info!("Added route: {} -> {}", route.path, route.service_name);
        routes.push(Arc::new(route));
        Ok(())
    }

    /// Remove the route registered under `path`
    pub async fn remove_route(&self, path: &str) -> bool {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|r| r.path != path);

        let removed = routes.len() != before;
        if removed {
            info!("Removed route: {}", path);
        }
        removed
    }

    pub async fn routes(&self) -> Vec<RouteConfig> {
        let routes = self.routes.read().await;
        routes.iter().map(|r| r.as_ref().clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }

    /// Find the route for a request
    pub async fn find_route(&self, path: &str, method: &str) -> Option<RouteMatch> {
        let routes = self.routes.read().await;

        let best = routes
            .iter()
            .filter(|route| matches_method(route, method))
            .filter_map(|route| match_len(route, path).map(|len| (len, !route.is_wildcard(), route)))
            .max_by_key(|(len, exact, _)| (*len, *exact))
            .map(|(_, _, route)| route.clone());

        match best {
            Some(route) => {
                debug!("Route matched: {} {} -> {}", method, path, route.service_name);
                Some(RouteMatch::new(route, path))
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_routes;

    #[tokio::test]
    async fn test_default_routes() {
        let table = RouteTable::from_routes(default_routes()).unwrap();

        let matched = table.find_route("/api/ai/generate", "POST").await.unwrap();
        assert_eq!(matched.service_name(), "ai-service");
        assert_eq!(matched.target_path, "/generate");

        let matched = table.find_route("/api/deploy/42", "GET").await.unwrap();
        assert_eq!(matched.service_name(), "deployment-service");

        assert!(table.find_route("/api/unknown", "GET").await.is_none());
        assert!(table.find_route("/api/ai/generate", "DELETE").await.is_none());
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let table = RouteTable::from_routes(vec![
            RouteConfig::new("/api/*", "general"),
            RouteConfig::new("/api/v2/*", "v2"),
        ])
        .unwrap();

        let matched = table.find_route("/api/v2/users", "GET").await.unwrap();
        assert_eq!(matched.service_name(), "v2");

        let matched = table.find_route("/api/v1/users", "GET").await.unwrap();
        assert_eq!(matched.service_name(), "general");
    }

    #[tokio::test]
    async fn test_exact_beats_wildcard_of_same_length() {
        let table = RouteTable::from_routes(vec![
            RouteConfig::new("/status/*", "wild"),
            RouteConfig::new("/status", "exact"),
        ])
        .unwrap();

        let matched = table.find_route("/status", "GET").await.unwrap();
        assert_eq!(matched.service_name(), "exact");
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let table = RouteTable::new();
        table
            .add_route(RouteConfig::new("/x/*", "one"))
            .await
            .unwrap();
        table
            .add_route(RouteConfig::new("/x/*", "two"))
            .await
            .unwrap();
        assert_eq!(table.len().await, 1);
        assert_eq!(
            table.find_route("/x/y", "GET").await.unwrap().service_name(),
            "two"
        );

        assert!(table.remove_route("/x/*").await);
        assert!(!table.remove_route("/x/*").await);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_route() {
        let table = RouteTable::new();
        assert!(table.add_route(RouteConfig::new("nope", "svc")).await.is_err());
    }
}
