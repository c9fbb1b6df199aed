//! Router: maps an inbound path to a configured backend route.

use std::collections::HashMap;

use crate::config::Config;
use crate::error::{Error, Result};

/// An immutable mapping entry known at startup.
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    /// Short identifier, e.g. `meds`, `ai_brain`.
    pub name: String,
    /// Scheme + host + port of the backend.
    pub base_url: String,
    /// Whether requests to this route require a valid admin token.
    pub protected: bool,
}

/// The full, immutable set of configured service routes.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: HashMap<String, ServiceRoute>,
}

/// Paths reserved for the gateway's own admin/health/status surface; never proxied.
pub const RESERVED_PREFIXES: &[&str] = &["admin", "health", "status"];

impl RouteTable {
    /// Build the route table from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let routes = config
            .routes
            .iter()
            .map(|(name, route)| {
                (
                    name.clone(),
                    ServiceRoute {
                        name: name.clone(),
                        base_url: route.base_url.trim_end_matches('/').to_string(),
                        protected: route.protected,
                    },
                )
            })
            .collect();
        Self { routes }
    }

    /// Resolve an inbound request path of the form `/<service>/<rest>` into the
    /// matching route and the remaining path tail (without a leading slash).
    ///
    /// `/meds` and `/meds/` both resolve to the same route with an empty tail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouteNotFound`] if the first path segment does not match
    /// any configured service.
    pub fn resolve<'a>(&'a self, path: &str) -> Result<(&'a ServiceRoute, &str)> {
        let trimmed = path.trim_start_matches('/');
        let (service, tail) = match trimmed.split_once('/') {
            Some((service, tail)) => (service, tail),
            None => (trimmed, ""),
        };

        self.routes
            .get(service)
            .map(|route| (route, tail))
            .ok_or_else(|| Error::RouteNotFound(service.to_string()))
    }

    /// Iterate all configured routes, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceRoute> {
        self.routes.values()
    }

    /// Number of configured routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no configured routes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// True if the first path segment names a reserved (locally-handled) prefix.
#[must_use]
pub fn is_reserved_path(path: &str) -> bool {
    let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
    RESERVED_PREFIXES.contains(&first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;

    fn table() -> RouteTable {
        let mut config = Config::default();
        config.routes.insert(
            "meds".to_string(),
            RouteConfig {
                base_url: "http://127.0.0.1:9001".to_string(),
                protected: false,
            },
        );
        config.routes.insert(
            "library".to_string(),
            RouteConfig {
                base_url: "http://127.0.0.1:9002/".to_string(),
                protected: true,
            },
        );
        RouteTable::from_config(&config)
    }

    #[test]
    fn resolves_known_service_with_tail() {
        let t = table();
        let (route, tail) = t.resolve("/meds/list/123").unwrap();
        assert_eq!(route.name, "meds");
        assert_eq!(tail, "list/123");
    }

    #[test]
    fn bare_path_and_trailing_slash_both_resolve_with_empty_tail() {
        let t = table();
        let (route_a, tail_a) = t.resolve("/meds").unwrap();
        let (route_b, tail_b) = t.resolve("/meds/").unwrap();
        assert_eq!(route_a.name, route_b.name);
        assert_eq!(tail_a, "");
        assert_eq!(tail_b, "");
    }

    #[test]
    fn unknown_service_is_route_not_found() {
        let t = table();
        let err = t.resolve("/nonexistent/x").unwrap_err();
        assert!(matches!(err, Error::RouteNotFound(s) if s == "nonexistent"));
    }

    #[test]
    fn service_matching_is_case_sensitive() {
        let t = table();
        assert!(t.resolve("/Meds").is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let t = table();
        let (route, _) = t.resolve("/library/x").unwrap();
        assert_eq!(route.base_url, "http://127.0.0.1:9002");
    }

    #[test]
    fn reserved_prefixes_are_detected() {
        assert!(is_reserved_path("/admin/tokens"));
        assert!(is_reserved_path("/health"));
        assert!(is_reserved_path("/status"));
        assert!(!is_reserved_path("/meds/x"));
    }
}
