//! InstanceManager - lifecycle management for running servers.
//!
//! Each started server gets its own listener and accept loop on its own tokio task.
//! The manager tracks every server's lifecycle state and is the only owner of the
//! listener handles.

use super::core::RunningInstance;
use super::handler::handle_instance_request;
use super::types::{InstanceError, InstanceOptions, InstanceState};
use crate::model::Server;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

enum Slot {
    /// Bind in progress; `cancelled` is set by a concurrent `stop`.
    Starting { cancelled: bool },
    Running(Arc<RunningInstance>),
    Stopping,
}

impl Slot {
    fn state(&self) -> InstanceState {
        match self {
            Slot::Starting { .. } => InstanceState::Starting,
            Slot::Running(_) => InstanceState::Running,
            Slot::Stopping => InstanceState::Stopping,
        }
    }
}

/// Lifecycle slots by server id; absent means stopped.
type Slots = Arc<RwLock<HashMap<String, Slot>>>;

/// Manages the lifecycle of every running server instance.
pub struct InstanceManager {
    options: InstanceOptions,
    /// Shared with every accept loop, which clears its own slot once drained.
    slots: Slots,
}

impl InstanceManager {
    pub fn new(options: InstanceOptions) -> Self {
        Self {
            options,
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    /// Start serving `server` on its configured port.
    ///
    /// Routes are built from a snapshot of `server` taken now. Starting a server that is
    /// already starting or running is a no-op.
    pub async fn start(&self, server: &Server) -> Result<(), InstanceError> {
        if self.reserve(server)? {
            self.bind_and_run(server)?;
        }
        Ok(())
    }

    /// Claim the `Starting` slot for `server`.
    ///
    /// Returns `false` when the server is already starting or running.
    pub(crate) fn reserve(&self, server: &Server) -> Result<bool, InstanceError> {
        let mut slots = self.slots.write();
        match slots.get(&server.id) {
            Some(Slot::Starting { .. }) | Some(Slot::Running(_)) => {
                debug!("Server {} is already running", server.id);
                Ok(false)
            }
            Some(Slot::Stopping) => Err(InstanceError::ShuttingDown(server.id.clone())),
            None => {
                slots.insert(server.id.clone(), Slot::Starting { cancelled: false });
                Ok(true)
            }
        }
    }

    /// Bind the listener for a reserved server and spawn its accept loop, unless a
    /// `stop` cancelled the reservation in the meantime.
    pub(crate) fn bind_and_run(&self, server: &Server) -> Result<(), InstanceError> {
        let addr = SocketAddr::new(self.options.bind_host, server.port);
        let listener = match bind_listener(addr) {
            Ok(listener) => listener,
            Err(source) => {
                self.slots.write().remove(&server.id);
                warn!(
                    "Server '{}' could not bind {}: {}",
                    server.name, addr, source
                );
                return Err(InstanceError::PortBind {
                    port: server.port,
                    source,
                });
            }
        };
        let bound_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(server.port);

        let instance = Arc::new(RunningInstance::new(server, bound_port));

        let mut slots = self.slots.write();
        if !matches!(
            slots.get(&server.id),
            Some(Slot::Starting { cancelled: false })
        ) {
            slots.remove(&server.id);
            info!(
                "Start of server '{}' was cancelled by a concurrent stop",
                server.name
            );
            return Ok(());
        }

        let shutdown_rx = instance.subscribe_shutdown();
        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&instance),
            shutdown_rx,
            self.options.shutdown_timeout,
            Arc::clone(&self.slots),
        ));
        instance.attach_task(handle);
        slots.insert(server.id.clone(), Slot::Running(instance));

        info!(
            "Server '{}' listening on {}:{}",
            server.name, self.options.bind_host, bound_port
        );
        Ok(())
    }

    /// Stop the instance for `server_id`, waiting for in-flight requests up to the
    /// shutdown timeout. Stopping a server that is not running is a no-op.
    ///
    /// The shutdown is under way once this future is first polled. Dropping it early
    /// does not leave the server stuck in `Stopping`; the accept loop clears the slot
    /// itself after draining.
    pub async fn stop(&self, server_id: &str) {
        let instance = {
            let mut slots = self.slots.write();
            match slots.remove(server_id) {
                Some(Slot::Running(instance)) => {
                    slots.insert(server_id.to_string(), Slot::Stopping);
                    instance
                }
                Some(Slot::Starting { .. }) => {
                    slots.insert(server_id.to_string(), Slot::Starting { cancelled: true });
                    return;
                }
                Some(Slot::Stopping) => {
                    slots.insert(server_id.to_string(), Slot::Stopping);
                    return;
                }
                None => return,
            }
        };

        instance.signal_shutdown();
        if !instance.wait_stopped().await {
            // The accept loop died before it could clear its slot.
            let mut slots = self.slots.write();
            if matches!(slots.get(server_id), Some(Slot::Stopping)) {
                slots.remove(server_id);
            }
        }
        info!(
            "Server '{}' stopped after {} requests",
            instance.server_name(),
            instance.request_count()
        );
    }

    /// Stop then start again, picking up the current configuration.
    pub async fn restart(&self, server: &Server) -> Result<(), InstanceError> {
        self.stop(&server.id).await;
        self.start(server).await
    }

    /// Stop every instance.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.slots.read().keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub fn is_running(&self, server_id: &str) -> bool {
        matches!(self.slots.read().get(server_id), Some(Slot::Running(_)))
    }

    pub fn state(&self, server_id: &str) -> InstanceState {
        self.slots
            .read()
            .get(server_id)
            .map_or(InstanceState::Stopped, Slot::state)
    }

    /// The running instance for `server_id`, for inspection.
    pub fn instance(&self, server_id: &str) -> Option<Arc<RunningInstance>> {
        match self.slots.read().get(server_id) {
            Some(Slot::Running(instance)) => Some(Arc::clone(instance)),
            _ => None,
        }
    }

    /// Port the instance actually listens on.
    pub fn bound_port(&self, server_id: &str) -> Option<u16> {
        self.instance(server_id).map(|i| i.bound_port())
    }

    pub fn request_count(&self, server_id: &str) -> Option<u64> {
        self.instance(server_id).map(|i| i.request_count())
    }

    /// Ids of all servers currently running.
    pub fn running_ids(&self) -> Vec<String> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.running_ids().len()
    }
}

impl Default for InstanceManager {
    fn default() -> Self {
        Self::new(InstanceOptions::default())
    }
}

/// Bind a listener for an instance.
///
/// SO_REUSEADDR lets a stopped server rebind its port while old connections sit in
/// TIME_WAIT. It is only set on Unix, where it does not allow two live listeners on
/// the same port.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

async fn accept_loop(
    listener: TcpListener,
    instance: Arc<RunningInstance>,
    mut shutdown_rx: broadcast::Receiver<()>,
    drain_timeout: Duration,
    slots: Slots,
) {
    let port = instance.bound_port();
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {} on port {}", addr, port);
                        let io = TokioIo::new(stream);
                        let instance = Arc::clone(&instance);
                        let service = service_fn(move |req| {
                            let instance = Arc::clone(&instance);
                            async move { handle_instance_request(req, instance).await }
                        });
                        let conn = graceful.watch(http1::Builder::new().serve_connection(io, service));
                        connections.spawn(async move {
                            if let Err(e) = conn.await {
                                debug!("Connection error on port {}: {}", port, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error on port {}: {}", port, e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.recv() => {
                info!("Server on port {} shutting down", port);
                break;
            }
        }
    }

    drop(listener);

    match tokio::time::timeout(drain_timeout, graceful.shutdown()).await {
        Ok(()) => debug!("All connections on port {} drained", port),
        Err(_) => {
            warn!(
                "Connections on port {} still open after {:?}, closing them",
                port, drain_timeout
            );
            connections.abort_all();
        }
    }
    while connections.join_next().await.is_some() {}

    let mut slots = slots.write();
    if matches!(slots.get(instance.server_id()), Some(Slot::Stopping)) {
        slots.remove(instance.server_id());
    }
    debug!("Port {} released", port);
}
