//! Running mock server instances.
//!
//! This module provides:
//! - `InstanceManager`: start/stop/restart lifecycle for any number of servers
//! - `RunningInstance`: one live listener with its routes and response cursors
//! - `InstanceError`, `InstanceState`, `InstanceOptions`
//!
//! Each instance binds its own TCP port and keeps its runtime state to itself.
//!
//! ## Module Structure
//!
//! - `types`: state, options and error types
//! - `core`: the RunningInstance struct
//! - `handler`: HTTP request handling
//! - `manager`: InstanceManager and the accept loop

mod core;
mod handler;
mod manager;
mod types;


pub use core::RunningInstance;
pub use handler::handle_instance_request;
pub use manager::InstanceManager;
pub use types::{InstanceError, InstanceOptions, InstanceState};
