//! Routing tables for running instances.
//!
//! A running instance never looks at the live configuration; it matches requests against
//! a `RouteTable` built once from the server snapshot it was started with.

use crate::model::{path_segments, HttpAction, Server};
use std::collections::HashMap;
use tracing::warn;

/// Two endpoints that normalize to the same method and path.
///
/// The table keeps `winner`; `shadowed` is never served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCollision {
    pub action: HttpAction,
    pub path: String,
    pub shadowed: String,
    pub winner: String,
}

/// Routing table built from a server snapshot: method, then literal segments, to endpoint id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: HashMap<HttpAction, HashMap<Vec<String>, String>>,
    collisions: Vec<RouteCollision>,
}

impl RouteTable {
    /// Build the routing table for a server.
    ///
    /// Endpoints are registered in creation order; when two of them share a method and
    /// normalized path the later one wins and the collision is recorded.
    pub fn build(server: &Server) -> Self {
        let mut table = RouteTable::default();

        for endpoint in server.sorted_endpoints() {
            let segments = endpoint.segments();
            let by_path = table.routes.entry(endpoint.action).or_default();
            if let Some(shadowed) = by_path.insert(segments.clone(), endpoint.id.clone()) {
                let collision = RouteCollision {
                    action: endpoint.action,
                    path: format!("/{}", segments.join("/")),
                    shadowed,
                    winner: endpoint.id.clone(),
                };
                warn!(
                    "Server '{}': {} {} is defined more than once, endpoint {} shadows {}",
                    server.name,
                    collision.action,
                    collision.path,
                    collision.winner,
                    collision.shadowed
                );
                table.collisions.push(collision);
            }
        }

        table
    }

    /// Endpoint id registered for `action` and the exact segment sequence.
    pub fn resolve(&self, action: HttpAction, segments: &[String]) -> Option<&str> {
        self.routes
            .get(&action)
            .and_then(|by_path| by_path.get(segments))
            .map(String::as_str)
    }

    /// Normalize a raw request path and resolve it.
    pub fn resolve_path(&self, action: HttpAction, path: &str) -> Option<&str> {
        self.resolve(action, &path_segments(path))
    }

    pub fn collisions(&self) -> &[RouteCollision] {
        &self.collisions
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered routes as `(action, "/path", endpoint id)`, sorted for display.
    pub fn routes(&self) -> Vec<(HttpAction, String, &str)> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .flat_map(|(action, by_path)| {
                by_path.iter().map(move |(segments, endpoint_id)| {
                    (*action, format!("/{}", segments.join("/")), endpoint_id.as_str())
                })
            })
            .collect();
        routes.sort();
        routes
    }
}
