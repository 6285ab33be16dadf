//! Domain model for mock server configuration.
//!
//! The configuration tree is `Environment` -> `Server` -> `Endpoint` -> `MockResponse`.
//! Everything here is plain data with derived views; the engine never mutates these
//! values in place except through the state manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generate a fresh opaque identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Host used when building endpoint URLs for the clipboard helper.
pub const LOCALHOST: &str = "http://localhost";

// ============================================================================
// HTTP action and sequencing mode
// ============================================================================

/// HTTP methods an endpoint can answer to.
///
/// Written in lowercase; read in any case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum HttpAction {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpAction {
    pub const ALL: [HttpAction; 4] = [
        HttpAction::Get,
        HttpAction::Post,
        HttpAction::Patch,
        HttpAction::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpAction::Get => "GET",
            HttpAction::Post => "POST",
            HttpAction::Patch => "PATCH",
            HttpAction::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported HTTP action: {0}")]
pub struct UnsupportedAction(pub String);

impl FromStr for HttpAction {
    type Err = UnsupportedAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HttpAction::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnsupportedAction(s.to_string()))
    }
}

impl TryFrom<String> for HttpAction {
    type Error = UnsupportedAction;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How an endpoint walks through its responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseSequenceMode {
    /// Cycle through the responses in order, wrapping after the last one.
    #[default]
    Loop,
    /// Pick a uniformly random response for every request.
    Random,
    /// Serve each response once, then a fixed 404.
    #[serde(rename = "return404AfterLast")]
    Return404AfterLast,
}

impl fmt::Display for ResponseSequenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseSequenceMode::Loop => "loop",
            ResponseSequenceMode::Random => "random",
            ResponseSequenceMode::Return404AfterLast => "return404AfterLast",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// A single response header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A canned response served by an endpoint.
///
/// `json_string` is served byte-for-byte; it is never parsed or re-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponse {
    #[serde(default = "new_id")]
    pub id: String,
    pub status_code: u16,
    #[serde(default)]
    pub json_string: String,
    #[serde(default)]
    pub headers: Vec<Header>,
}

impl MockResponse {
    pub fn new(status_code: u16, json_string: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            status_code,
            json_string: json_string.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Responses a freshly created endpoint starts with.
    pub fn default_responses() -> Vec<MockResponse> {
        vec![MockResponse::new(200, "{}")]
    }

    /// Served once a `Return404AfterLast` endpoint has run out of responses.
    pub fn end_of_responses() -> MockResponse {
        MockResponse::new(404, r#"{"message": "There are no more responses"}"#)
    }

    /// Served when an endpoint somehow has no responses at all.
    pub fn no_responses_configured() -> MockResponse {
        MockResponse::new(404, r#"{"message": "No responses are configured"}"#)
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// A (method, path) pair on a server together with its response sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    #[serde(default)]
    pub path: String,
    pub action: HttpAction,
    pub creation_date: DateTime<Utc>,
    pub responses: Vec<MockResponse>,
    #[serde(default)]
    pub response_sequence_mode: ResponseSequenceMode,
    #[serde(default)]
    pub rank_index: i64,
}

impl Endpoint {
    /// New endpoint with the default `200 {}` response.
    pub fn new(path: impl Into<String>, action: HttpAction) -> Self {
        Self::with_responses(path, action, MockResponse::default_responses())
    }

    pub fn with_responses(
        path: impl Into<String>,
        action: HttpAction,
        responses: Vec<MockResponse>,
    ) -> Self {
        Self {
            id: new_id(),
            path: path.into(),
            action,
            creation_date: Utc::now(),
            responses,
            response_sequence_mode: ResponseSequenceMode::default(),
            rank_index: 0,
        }
    }

    pub fn with_mode(mut self, mode: ResponseSequenceMode) -> Self {
        self.response_sequence_mode = mode;
        self
    }

    /// Path without its leading slash.
    pub fn normalized_path(&self) -> &str {
        normalize_path(&self.path)
    }

    /// Routing segments of the path; the root route has none.
    pub fn segments(&self) -> Vec<String> {
        path_segments(&self.path)
    }
}

// ============================================================================
// Servers and environment
// ============================================================================

/// One mock HTTP server: a port and the endpoints it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub creation_date: DateTime<Utc>,
    pub name: String,
    pub port: u16,
    #[serde(default, alias = "endpointsDictionary")]
    pub endpoints: HashMap<String, Endpoint>,
}

impl Server {
    /// New server without endpoints.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            id: new_id(),
            creation_date: Utc::now(),
            name: name.into(),
            port,
            endpoints: HashMap::new(),
        }
    }

    /// New server with a single default `GET /` endpoint.
    pub fn with_default_endpoint(name: impl Into<String>, port: u16) -> Self {
        let mut server = Self::new(name, port);
        server.insert_endpoint(Endpoint::new("", HttpAction::Get));
        server
    }

    pub fn default_server() -> Self {
        Self::with_default_endpoint("New Server", 8080)
    }

    /// Insert or replace an endpoint, returning the previous value for that id.
    pub fn insert_endpoint(&mut self, endpoint: Endpoint) -> Option<Endpoint> {
        self.endpoints.insert(endpoint.id.clone(), endpoint)
    }

    pub fn endpoint(&self, id: &str) -> Option<&Endpoint> {
        self.endpoints.get(id)
    }

    /// Endpoints ordered by creation date.
    pub fn sorted_endpoints(&self) -> Vec<&Endpoint> {
        sorted_by_creation(self.endpoints.values())
    }

    /// Endpoints in manual order, falling back to creation order on ties.
    pub fn ranked_endpoints(&self) -> Vec<&Endpoint> {
        let mut endpoints = self.sorted_endpoints();
        endpoints.sort_by_key(|e| e.rank_index);
        endpoints
    }

    /// Endpoints answering to `action`, ordered by creation date.
    pub fn endpoints_of_method(&self, action: HttpAction) -> Vec<&Endpoint> {
        sorted_by_creation(self.endpoints.values().filter(|e| e.action == action))
    }
}

/// The full configuration tree and the unit of persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default, alias = "serverConfigurations")]
    pub servers: HashMap<String, Server>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_server(&mut self, server: Server) -> Option<Server> {
        self.servers.insert(server.id.clone(), server)
    }

    pub fn server(&self, id: &str) -> Option<&Server> {
        self.servers.get(id)
    }

    pub fn server_mut(&mut self, id: &str) -> Option<&mut Server> {
        self.servers.get_mut(id)
    }

    /// Servers ordered by creation date.
    pub fn sorted_servers(&self) -> Vec<&Server> {
        sorted_by_creation(self.servers.values())
    }
}

// ============================================================================
// Ordering
// ============================================================================

/// Entities that carry an id and a creation timestamp.
pub trait Created {
    fn id(&self) -> &str;
    fn creation_date(&self) -> DateTime<Utc>;
}

impl Created for Server {
    fn id(&self) -> &str {
        &self.id
    }

    fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }
}

impl Created for Endpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }
}

/// Sort by creation date ascending; ids break ties so the order is total.
pub fn sorted_by_creation<'a, T, I>(items: I) -> Vec<&'a T>
where
    T: Created + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut items: Vec<&T> = items.into_iter().collect();
    items.sort_by(|a, b| {
        a.creation_date()
            .cmp(&b.creation_date())
            .then_with(|| a.id().cmp(b.id()))
    });
    items
}

// ============================================================================
// Paths and URLs
// ============================================================================

/// Strip leading slashes from a configured or requested path.
pub fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Split a path into routing segments.
///
/// Empty segments are dropped and each segment is percent-decoded, so `/items/`,
/// `items` and `//items` all yield `["items"]`. The empty path yields no segments.
pub fn path_segments(path: &str) -> Vec<String> {
    normalize_path(path)
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| match urlencoding::decode(segment) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => segment.to_string(),
        })
        .collect()
}

/// Fully qualified URL of an endpoint, as offered for copy-to-clipboard.
pub fn endpoint_url(server: &Server, endpoint: &Endpoint) -> String {
    format!(
        "{}:{}/{}",
        LOCALHOST,
        server.port,
        endpoint.normalized_path()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_http_action_parse_is_case_insensitive() {
        assert_eq!("get".parse::<HttpAction>(), Ok(HttpAction::Get));
        assert_eq!("PATCH".parse::<HttpAction>(), Ok(HttpAction::Patch));
        assert_eq!("Delete".parse::<HttpAction>(), Ok(HttpAction::Delete));
        assert!("PUT".parse::<HttpAction>().is_err());
    }

    #[test]
    fn test_http_action_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&HttpAction::Post).unwrap(), r#""post""#);
        let parsed: HttpAction = serde_json::from_str(r#""DELETE""#).unwrap();
        assert_eq!(parsed, HttpAction::Delete);
        let parsed: HttpAction = serde_json::from_str(r#""Patch""#).unwrap();
        assert_eq!(parsed, HttpAction::Patch);
        assert!(serde_json::from_str::<HttpAction>(r#""put""#).is_err());
    }

    #[test]
    fn test_mixed_case_action_in_state_file_decodes() {
        let json = r#"{
            "servers": {
                "s1": {
                    "id": "s1",
                    "creationDate": "2024-01-01T00:00:00Z",
                    "name": "mixed",
                    "port": 8082,
                    "endpoints": {
                        "e1": {
                            "id": "e1",
                            "path": "users/1",
                            "action": "Patch",
                            "creationDate": "2024-01-01T00:00:00Z",
                            "responses": [{"statusCode": 204, "jsonString": ""}]
                        }
                    }
                }
            }
        }"#;

        let env: Environment = serde_json::from_str(json).unwrap();
        let endpoint = env.server("s1").unwrap().endpoint("e1").unwrap();
        assert_eq!(endpoint.action, HttpAction::Patch);
        assert!(serde_json::to_string(&env).unwrap().contains(r#""action":"patch""#));
    }

    #[test]
    fn test_sequence_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&ResponseSequenceMode::Return404AfterLast).unwrap(),
            r#""return404AfterLast""#
        );
        assert_eq!(
            serde_json::to_string(&ResponseSequenceMode::Loop).unwrap(),
            r#""loop""#
        );
        assert_eq!(ResponseSequenceMode::default(), ResponseSequenceMode::Loop);
    }

    #[test]
    fn test_path_segments() {
        assert!(path_segments("").is_empty());
        assert!(path_segments("/").is_empty());
        assert_eq!(path_segments("/items"), vec!["items"]);
        assert_eq!(path_segments("items/"), vec!["items"]);
        assert_eq!(path_segments("/a//b/c"), vec!["a", "b", "c"]);
        assert_eq!(path_segments("/hello%20world"), vec!["hello world"]);
    }

    #[test]
    fn test_normalize_path_strips_leading_slash() {
        assert_eq!(normalize_path("/items/1"), "items/1");
        assert_eq!(normalize_path("items/1"), "items/1");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_endpoint_url() {
        let server = Server::new("api", 8080);
        let endpoint = Endpoint::new("/items/latest", HttpAction::Get);
        assert_eq!(
            endpoint_url(&server, &endpoint),
            "http://localhost:8080/items/latest"
        );

        let root = Endpoint::new("", HttpAction::Get);
        assert_eq!(endpoint_url(&server, &root), "http://localhost:8080/");
    }

    #[test]
    fn test_default_server_has_root_endpoint() {
        let server = Server::default_server();
        assert_eq!(server.name, "New Server");
        assert_eq!(server.port, 8080);
        assert_eq!(server.endpoints.len(), 1);
        let endpoint = server.sorted_endpoints()[0];
        assert_eq!(endpoint.action, HttpAction::Get);
        assert!(endpoint.segments().is_empty());
        assert_eq!(endpoint.responses, vec![MockResponse {
            id: endpoint.responses[0].id.clone(),
            status_code: 200,
            json_string: "{}".to_string(),
            headers: vec![],
        }]);
    }

    #[test]
    fn test_sorted_views_follow_creation_date() {
        let base = Utc::now();
        let mut server = Server::new("api", 9000);
        for (offset, path, action) in [
            (2, "c", HttpAction::Post),
            (0, "a", HttpAction::Get),
            (1, "b", HttpAction::Get),
        ] {
            let mut endpoint = Endpoint::new(path, action);
            endpoint.creation_date = base + Duration::seconds(offset);
            server.insert_endpoint(endpoint);
        }

        let paths: Vec<&str> = server
            .sorted_endpoints()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(paths, vec!["a", "b", "c"]);

        let gets: Vec<&str> = server
            .endpoints_of_method(HttpAction::Get)
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(gets, vec!["a", "b"]);
        assert!(server.endpoints_of_method(HttpAction::Delete).is_empty());
    }

    #[test]
    fn test_ranked_endpoints_prefer_rank_index() {
        let base = Utc::now();
        let mut server = Server::new("api", 9000);
        for (offset, path, rank) in [(0, "first", 2), (1, "second", 0), (2, "third", 1)] {
            let mut endpoint = Endpoint::new(path, HttpAction::Get);
            endpoint.creation_date = base + Duration::seconds(offset);
            endpoint.rank_index = rank;
            server.insert_endpoint(endpoint);
        }

        let paths: Vec<&str> = server
            .ranked_endpoints()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(paths, vec!["second", "third", "first"]);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = MockResponse::new(200, "{}").with_header("Content-Type", "text/plain");
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn test_decoding_tolerates_unknown_and_legacy_fields() {
        let json = r#"{
            "serverConfigurations": {
                "s1": {
                    "id": "s1",
                    "creationDate": "2024-01-01T00:00:00Z",
                    "name": "legacy",
                    "port": 8081,
                    "color": "blue",
                    "endpointsDictionary": {
                        "e1": {
                            "id": "e1",
                            "path": "/users",
                            "action": "get",
                            "creationDate": "2024-01-01T00:00:00Z",
                            "responses": [{"statusCode": 201, "jsonString": "[]"}]
                        }
                    }
                }
            },
            "futureField": 42
        }"#;

        let env: Environment = serde_json::from_str(json).unwrap();
        let server = env.server("s1").unwrap();
        assert_eq!(server.port, 8081);
        let endpoint = server.endpoint("e1").unwrap();
        assert_eq!(endpoint.response_sequence_mode, ResponseSequenceMode::Loop);
        assert_eq!(endpoint.rank_index, 0);
        assert_eq!(endpoint.responses[0].status_code, 201);
        assert!(endpoint.responses[0].headers.is_empty());
        assert!(!endpoint.responses[0].id.is_empty());
    }
}
