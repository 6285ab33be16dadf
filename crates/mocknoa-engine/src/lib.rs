//! Mocknoa engine: several independent mock HTTP servers, each answering configured
//! endpoints with sequenced canned JSON responses.
//!
//! Front ends talk to [`StateManager`]; it owns the configuration, persists every change
//! and forwards start/stop requests to the [`InstanceManager`].

pub mod config;
pub mod instance;
pub mod model;
pub mod response;
pub mod routing;
pub mod sequencer;
pub mod state;
pub mod store;

pub use config::EngineConfig;
pub use instance::{InstanceError, InstanceManager, InstanceOptions, InstanceState};
pub use model::{
    endpoint_url, Endpoint, Environment, Header, HttpAction, MockResponse, ResponseSequenceMode,
    Server,
};
pub use routing::{RouteCollision, RouteTable};
pub use sequencer::ResponseSequencer;
pub use state::{StateChange, StateError, StateManager};
pub use store::{EnvironmentStore, StoreError};
