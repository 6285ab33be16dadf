//! Core RunningInstance struct and implementation.
//!
//! A running instance holds an immutable snapshot of its server's endpoints, the
//! routing table built from that snapshot, and the response cursors. Nothing in here
//! is shared with any other instance.

use crate::model::{Endpoint, HttpAction, MockResponse, Server};
use crate::routing::RouteTable;
use crate::sequencer::ResponseSequencer;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Runtime state of one server's listener.
pub struct RunningInstance {
    server_id: String,
    server_name: String,
    bound_port: u16,
    endpoints: HashMap<String, Endpoint>,
    routes: RouteTable,
    sequencer: ResponseSequencer,
    request_count: AtomicU64,
    started_at: chrono::DateTime<chrono::Utc>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RunningInstance {
    /// Create an instance from a snapshot of `server`.
    ///
    /// Later edits to the configuration do not reach this instance.
    pub fn new(server: &Server, bound_port: u16) -> Self {
        let routes = RouteTable::build(server);
        let sequencer = ResponseSequencer::for_endpoints(server.endpoints.keys().map(String::as_str));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            bound_port,
            endpoints: server.endpoints.clone(),
            routes,
            sequencer,
            request_count: AtomicU64::new(0),
            started_at: chrono::Utc::now(),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn sequencer(&self) -> &ResponseSequencer {
        &self.sequencer
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    /// Look up the endpoint serving `action` on a raw request path.
    pub fn resolve(&self, action: HttpAction, path: &str) -> Option<&Endpoint> {
        self.routes
            .resolve_path(action, path)
            .and_then(|endpoint_id| self.endpoints.get(endpoint_id))
    }

    /// Next response for an endpoint of this instance.
    pub fn next_response<'a>(&self, endpoint: &'a Endpoint) -> Cow<'a, MockResponse> {
        self.sequencer.next_response(endpoint)
    }

    pub fn increment_request_count(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }

    /// Tell the accept loop to stop accepting and start draining.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait until the accept loop has drained and released the port.
    ///
    /// Returns `false` if the loop ended abnormally.
    pub(crate) async fn wait_stopped(&self) -> bool {
        let handle = self.task.lock().take();
        let clean = match handle {
            Some(handle) => match handle.await {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        "Accept loop for server {} on port {} ended abnormally: {}",
                        self.server_id, self.bound_port, e
                    );
                    false
                }
            },
            None => true,
        };
        self.sequencer.reset_all();
        debug!(
            "Instance for server {} released port {}",
            self.server_id, self.bound_port
        );
        clean
    }
}
