//! Request handling logic for running instances.

use super::core::RunningInstance;
use crate::model::HttpAction;
use crate::response::{mock_response, text_response};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

/// Handle a request to a running instance.
///
/// The request body is never inspected; routing only looks at the method and path.
pub async fn handle_instance_request<B>(
    req: Request<B>,
    instance: Arc<RunningInstance>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    instance.increment_request_count();

    let method = req.method().as_str();
    let path = req.uri().path();

    let endpoint = method
        .parse::<HttpAction>()
        .ok()
        .and_then(|action| instance.resolve(action, path));

    let Some(endpoint) = endpoint else {
        debug!(
            "No route for {} {} on port {}",
            method,
            path,
            instance.bound_port()
        );
        return Ok(text_response(
            StatusCode::NOT_FOUND,
            format!("No endpoint matches {method} {path}"),
        ));
    };

    let response = instance.next_response(endpoint);
    debug!(
        "{} {} on port {} -> endpoint {} response {} ({})",
        method,
        path,
        instance.bound_port(),
        endpoint.id,
        response.id,
        response.status_code
    );
    Ok(mock_response(&response))
}
