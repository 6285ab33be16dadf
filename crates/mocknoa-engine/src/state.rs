//! Central state manager.
//!
//! `StateManager` is the single owner of the configuration `Environment` and the only
//! component a front end talks to. Every mutation runs under one write lock and follows
//! the same order: mutate in memory, persist, then notify subscribers. Lifecycle calls
//! are forwarded to the `InstanceManager`, which alone holds the listeners.

use crate::config::EngineConfig;
use crate::instance::{InstanceError, InstanceManager, InstanceOptions, InstanceState};
use crate::model::{
    endpoint_url, Endpoint, Environment, HttpAction, MockResponse, ResponseSequenceMode, Server,
};
use crate::routing::{RouteCollision, RouteTable};
use crate::store::{EnvironmentStore, StoreError};
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Server {0} not found")]
    ServerNotFound(String),
    #[error("Endpoint {0} not found")]
    EndpointNotFound(String),
    #[error("Response {0} not found")]
    ResponseNotFound(String),
    #[error("Endpoint {0} must keep at least one response")]
    LastResponse(String),
    #[error("Position {index} is out of bounds for {len} responses")]
    InvalidPosition { index: usize, len: usize },
    #[error(transparent)]
    Instance(#[from] InstanceError),
    /// The in-memory change was applied but could not be written to disk.
    #[error("Changes may not survive a restart: {0}")]
    Persistence(#[from] StoreError),
}

/// Notification sent to subscribers after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    ServerAdded { server_id: String },
    ServerUpdated { server_id: String },
    ServerRemoved { server_id: String },
    EndpointUpdated { server_id: String, endpoint_id: String },
    EndpointRemoved { server_id: String, endpoint_id: String },
    InstanceStarted { server_id: String, port: u16 },
    InstanceStopped { server_id: String },
}

const CHANGE_CHANNEL_CAPACITY: usize = 64;

pub struct StateManager {
    environment: RwLock<Environment>,
    store: EnvironmentStore,
    instances: InstanceManager,
    /// Serializes start, stop and delete so a server is never left running without
    /// a configuration.
    lifecycle: Mutex<()>,
    changes: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Build a manager around an already loaded environment.
    pub fn new(environment: Environment, store: EnvironmentStore, options: InstanceOptions) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            environment: RwLock::new(environment),
            store,
            instances: InstanceManager::new(options),
            lifecycle: Mutex::new(()),
            changes,
        }
    }

    /// Load the persisted environment named by `config`, or start empty.
    pub fn open(config: &EngineConfig) -> Self {
        let store = EnvironmentStore::new(config.state_file.clone());
        let environment = store.load_or_default();
        Self::new(environment, store, config.instance_options())
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StateChange) {
        debug!("State change: {:?}", change);
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    /// Apply `f` under the write lock, persist, then notify.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Environment) -> Result<(T, StateChange), StateError>,
    ) -> Result<T, StateError> {
        let (value, change, saved) = {
            let mut environment = self.environment.write();
            let (value, change) = f(&mut environment)?;
            let saved = self.store.save(&environment);
            (value, change, saved)
        };
        self.notify(change);
        match saved {
            Ok(()) => Ok(value),
            Err(e) => {
                error!("Failed to persist configuration: {}", e);
                Err(StateError::Persistence(e))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Snapshot of the whole environment.
    pub fn environment(&self) -> Environment {
        self.environment.read().clone()
    }

    /// Servers ordered by creation date.
    pub fn servers(&self) -> Vec<Server> {
        self.environment
            .read()
            .sorted_servers()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn server(&self, server_id: &str) -> Result<Server, StateError> {
        self.environment
            .read()
            .server(server_id)
            .cloned()
            .ok_or_else(|| StateError::ServerNotFound(server_id.to_string()))
    }

    /// Endpoints of a server ordered by creation date.
    pub fn endpoints(&self, server_id: &str) -> Result<Vec<Endpoint>, StateError> {
        self.read_server(server_id, |server| {
            server.sorted_endpoints().into_iter().cloned().collect()
        })
    }

    /// Endpoints of a server in manual order.
    pub fn ranked_endpoints(&self, server_id: &str) -> Result<Vec<Endpoint>, StateError> {
        self.read_server(server_id, |server| {
            server.ranked_endpoints().into_iter().cloned().collect()
        })
    }

    pub fn endpoints_of_method(
        &self,
        server_id: &str,
        action: HttpAction,
    ) -> Result<Vec<Endpoint>, StateError> {
        self.read_server(server_id, |server| {
            server
                .endpoints_of_method(action)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn endpoint(&self, server_id: &str, endpoint_id: &str) -> Result<Endpoint, StateError> {
        let environment = self.environment.read();
        find_endpoint(&environment, server_id, endpoint_id).cloned()
    }

    pub fn responses(
        &self,
        server_id: &str,
        endpoint_id: &str,
    ) -> Result<Vec<MockResponse>, StateError> {
        Ok(self.endpoint(server_id, endpoint_id)?.responses)
    }

    /// URL of an endpoint, for copying to the clipboard.
    pub fn endpoint_url(&self, server_id: &str, endpoint_id: &str) -> Result<String, StateError> {
        let environment = self.environment.read();
        let server = find_server(&environment, server_id)?;
        let endpoint = find_endpoint(&environment, server_id, endpoint_id)?;
        Ok(endpoint_url(server, endpoint))
    }

    /// Endpoints that shadow each other on the same method and path.
    pub fn route_collisions(&self, server_id: &str) -> Result<Vec<RouteCollision>, StateError> {
        self.read_server(server_id, |server| {
            RouteTable::build(server).collisions().to_vec()
        })
    }

    fn read_server<T>(
        &self,
        server_id: &str,
        f: impl FnOnce(&Server) -> T,
    ) -> Result<T, StateError> {
        let environment = self.environment.read();
        find_server(&environment, server_id).map(f)
    }

    // ------------------------------------------------------------------------
    // Server mutations
    // ------------------------------------------------------------------------

    /// Create a server with a default root endpoint.
    pub fn create_server(&self, name: &str, port: u16) -> Result<Server, StateError> {
        self.add_server(Server::with_default_endpoint(name, port))
    }

    /// Add (or replace) a fully built server configuration.
    pub fn add_server(&self, server: Server) -> Result<Server, StateError> {
        self.mutate(|environment| {
            let server_id = server.id.clone();
            let change = match environment.insert_server(server.clone()) {
                Some(_) => StateChange::ServerUpdated { server_id },
                None => StateChange::ServerAdded { server_id },
            };
            Ok((server, change))
        })
    }

    pub fn rename_server(&self, server_id: &str, name: &str) -> Result<(), StateError> {
        self.update_server(server_id, |server| server.name = name.to_string())
    }

    /// Change a server's port; a running instance keeps its old port until restarted.
    pub fn set_server_port(&self, server_id: &str, port: u16) -> Result<(), StateError> {
        self.update_server(server_id, |server| server.port = port)
    }

    fn update_server(
        &self,
        server_id: &str,
        f: impl FnOnce(&mut Server),
    ) -> Result<(), StateError> {
        self.mutate(|environment| {
            let server = find_server_mut(environment, server_id)?;
            f(server);
            Ok((
                (),
                StateChange::ServerUpdated {
                    server_id: server_id.to_string(),
                },
            ))
        })
    }

    /// Delete a server, stopping its instance first if it is running.
    pub async fn delete_server(&self, server_id: &str) -> Result<Server, StateError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.server(server_id)?;

        if self.instances.state(server_id) != InstanceState::Stopped {
            info!("Stopping server {} before deleting it", server_id);
            self.stop_locked(server_id).await?;
        }

        self.mutate(|environment| {
            let server = environment
                .servers
                .remove(server_id)
                .ok_or_else(|| StateError::ServerNotFound(server_id.to_string()))?;
            Ok((
                server,
                StateChange::ServerRemoved {
                    server_id: server_id.to_string(),
                },
            ))
        })
    }

    // ------------------------------------------------------------------------
    // Endpoint mutations
    // ------------------------------------------------------------------------

    /// Create a `GET` endpoint with the default response.
    pub fn create_endpoint(&self, server_id: &str, path: &str) -> Result<Endpoint, StateError> {
        self.add_endpoint(server_id, Endpoint::new(path, HttpAction::Get))
    }

    pub fn add_endpoint(&self, server_id: &str, endpoint: Endpoint) -> Result<Endpoint, StateError> {
        if endpoint.responses.is_empty() {
            return Err(StateError::LastResponse(endpoint.id));
        }
        self.mutate(|environment| {
            let server = find_server_mut(environment, server_id)?;
            server.insert_endpoint(endpoint.clone());
            let change = StateChange::EndpointUpdated {
                server_id: server_id.to_string(),
                endpoint_id: endpoint.id.clone(),
            };
            Ok((endpoint, change))
        })
    }

    /// Replace an existing endpoint by id.
    pub fn update_endpoint(&self, server_id: &str, endpoint: Endpoint) -> Result<(), StateError> {
        if endpoint.responses.is_empty() {
            return Err(StateError::LastResponse(endpoint.id));
        }
        self.mutate(|environment| {
            let existing = find_endpoint_mut(environment, server_id, &endpoint.id)?;
            let change = StateChange::EndpointUpdated {
                server_id: server_id.to_string(),
                endpoint_id: endpoint.id.clone(),
            };
            *existing = endpoint;
            Ok(((), change))
        })
    }

    pub fn set_sequence_mode(
        &self,
        server_id: &str,
        endpoint_id: &str,
        mode: ResponseSequenceMode,
    ) -> Result<(), StateError> {
        self.modify_endpoint(server_id, endpoint_id, |endpoint| {
            endpoint.response_sequence_mode = mode;
            Ok(())
        })
    }

    pub fn delete_endpoint(&self, server_id: &str, endpoint_id: &str) -> Result<Endpoint, StateError> {
        self.mutate(|environment| {
            let server = find_server_mut(environment, server_id)?;
            let endpoint = server
                .endpoints
                .remove(endpoint_id)
                .ok_or_else(|| StateError::EndpointNotFound(endpoint_id.to_string()))?;
            Ok((
                endpoint,
                StateChange::EndpointRemoved {
                    server_id: server_id.to_string(),
                    endpoint_id: endpoint_id.to_string(),
                },
            ))
        })
    }

    /// Assign `rank_index` from the position of each id in `ordered_ids`.
    ///
    /// Endpoints not listed keep their rank after the listed ones.
    pub fn reorder_endpoints(&self, server_id: &str, ordered_ids: &[String]) -> Result<(), StateError> {
        self.mutate(|environment| {
            let server = find_server_mut(environment, server_id)?;
            if let Some(unknown) = ordered_ids
                .iter()
                .find(|id| !server.endpoints.contains_key(id.as_str()))
            {
                return Err(StateError::EndpointNotFound(unknown.clone()));
            }

            let listed = ordered_ids.len() as i64;
            let unlisted: Vec<String> = server
                .ranked_endpoints()
                .into_iter()
                .filter(|e| !ordered_ids.contains(&e.id))
                .map(|e| e.id.clone())
                .collect();
            for (rank, id) in ordered_ids.iter().enumerate() {
                if let Some(endpoint) = server.endpoints.get_mut(id) {
                    endpoint.rank_index = rank as i64;
                }
            }
            for (offset, id) in unlisted.iter().enumerate() {
                if let Some(endpoint) = server.endpoints.get_mut(id) {
                    endpoint.rank_index = listed + offset as i64;
                }
            }
            Ok((
                (),
                StateChange::ServerUpdated {
                    server_id: server_id.to_string(),
                },
            ))
        })
    }

    fn modify_endpoint<T>(
        &self,
        server_id: &str,
        endpoint_id: &str,
        f: impl FnOnce(&mut Endpoint) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        self.mutate(|environment| {
            let endpoint = find_endpoint_mut(environment, server_id, endpoint_id)?;
            let value = f(endpoint)?;
            Ok((
                value,
                StateChange::EndpointUpdated {
                    server_id: server_id.to_string(),
                    endpoint_id: endpoint_id.to_string(),
                },
            ))
        })
    }

    // ------------------------------------------------------------------------
    // Response mutations
    // ------------------------------------------------------------------------

    /// Append a response to an endpoint's sequence.
    pub fn add_response(
        &self,
        server_id: &str,
        endpoint_id: &str,
        response: MockResponse,
    ) -> Result<MockResponse, StateError> {
        self.modify_endpoint(server_id, endpoint_id, |endpoint| {
            endpoint.responses.push(response.clone());
            Ok(response)
        })
    }

    /// Replace a response by id, keeping its position.
    pub fn update_response(
        &self,
        server_id: &str,
        endpoint_id: &str,
        response: MockResponse,
    ) -> Result<(), StateError> {
        self.modify_endpoint(server_id, endpoint_id, |endpoint| {
            let slot = endpoint
                .responses
                .iter_mut()
                .find(|r| r.id == response.id)
                .ok_or_else(|| StateError::ResponseNotFound(response.id.clone()))?;
            *slot = response;
            Ok(())
        })
    }

    /// Remove a response; the last remaining response cannot be deleted.
    pub fn delete_response(
        &self,
        server_id: &str,
        endpoint_id: &str,
        response_id: &str,
    ) -> Result<MockResponse, StateError> {
        self.modify_endpoint(server_id, endpoint_id, |endpoint| {
            let index = endpoint
                .responses
                .iter()
                .position(|r| r.id == response_id)
                .ok_or_else(|| StateError::ResponseNotFound(response_id.to_string()))?;
            if endpoint.responses.len() == 1 {
                return Err(StateError::LastResponse(endpoint.id.clone()));
            }
            Ok(endpoint.responses.remove(index))
        })
    }

    /// Move a response to another position in the sequence.
    pub fn move_response(
        &self,
        server_id: &str,
        endpoint_id: &str,
        from: usize,
        to: usize,
    ) -> Result<(), StateError> {
        self.modify_endpoint(server_id, endpoint_id, |endpoint| {
            let len = endpoint.responses.len();
            if let Some(&index) = [from, to].iter().find(|&&i| i >= len) {
                return Err(StateError::InvalidPosition { index, len });
            }
            let response = endpoint.responses.remove(from);
            endpoint.responses.insert(to, response);
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start a server from a snapshot of its current configuration.
    ///
    /// Returns the port the instance listens on.
    pub async fn start_server(&self, server_id: &str) -> Result<u16, StateError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked(server_id).await
    }

    pub async fn stop_server(&self, server_id: &str) -> Result<(), StateError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked(server_id).await
    }

    /// Restart a server so it serves its current configuration.
    pub async fn restart_server(&self, server_id: &str) -> Result<u16, StateError> {
        let _lifecycle = self.lifecycle.lock().await;
        let server = self.server(server_id)?;
        self.stop_locked(server_id).await?;
        match self.start_locked(&server.id).await {
            Ok(port) => Ok(port),
            Err(e) => {
                warn!("Server '{}' did not come back after restart: {}", server.name, e);
                Err(e)
            }
        }
    }

    async fn start_locked(&self, server_id: &str) -> Result<u16, StateError> {
        let server = self.server(server_id)?;
        let was_running = self.instances.is_running(server_id);
        self.instances.start(&server).await?;

        let Some(port) = self.instances.bound_port(server_id) else {
            return Err(InstanceError::NotStarted(server_id.to_string()).into());
        };
        if !was_running {
            self.notify(StateChange::InstanceStarted {
                server_id: server_id.to_string(),
                port,
            });
        }
        Ok(port)
    }

    async fn stop_locked(&self, server_id: &str) -> Result<(), StateError> {
        if self.instances.state(server_id) == InstanceState::Stopped {
            // Unknown ids are still reported; stopping a stopped server is not.
            self.server(server_id)?;
            return Ok(());
        }
        self.instances.stop(server_id).await;
        self.notify(StateChange::InstanceStopped {
            server_id: server_id.to_string(),
        });
        Ok(())
    }

    pub fn is_running(&self, server_id: &str) -> bool {
        self.instances.is_running(server_id)
    }

    pub fn instance_state(&self, server_id: &str) -> InstanceState {
        self.instances.state(server_id)
    }

    pub fn bound_port(&self, server_id: &str) -> Option<u16> {
        self.instances.bound_port(server_id)
    }

    pub fn request_count(&self, server_id: &str) -> Option<u64> {
        self.instances.request_count(server_id)
    }

    /// Stop every running server.
    pub async fn shutdown(&self) {
        for server_id in self.instances.running_ids() {
            if let Err(e) = self.stop_server(&server_id).await {
                warn!("Failed to stop server {}: {}", server_id, e);
            }
        }
    }
}

fn find_server<'a>(environment: &'a Environment, server_id: &str) -> Result<&'a Server, StateError> {
    environment
        .server(server_id)
        .ok_or_else(|| StateError::ServerNotFound(server_id.to_string()))
}

fn find_server_mut<'a>(
    environment: &'a mut Environment,
    server_id: &str,
) -> Result<&'a mut Server, StateError> {
    environment
        .server_mut(server_id)
        .ok_or_else(|| StateError::ServerNotFound(server_id.to_string()))
}

fn find_endpoint<'a>(
    environment: &'a Environment,
    server_id: &str,
    endpoint_id: &str,
) -> Result<&'a Endpoint, StateError> {
    find_server(environment, server_id)?
        .endpoint(endpoint_id)
        .ok_or_else(|| StateError::EndpointNotFound(endpoint_id.to_string()))
}

fn find_endpoint_mut<'a>(
    environment: &'a mut Environment,
    server_id: &str,
    endpoint_id: &str,
) -> Result<&'a mut Endpoint, StateError> {
    find_server_mut(environment, server_id)?
        .endpoints
        .get_mut(endpoint_id)
        .ok_or_else(|| StateError::EndpointNotFound(endpoint_id.to_string()))
}
