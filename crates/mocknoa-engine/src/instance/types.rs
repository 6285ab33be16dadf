//! Type definitions for running server instances.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Lifecycle state of one server's instance.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`; a failed bind goes straight
/// from `Starting` back to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Settings shared by every instance the manager starts.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// Address every listener binds to.
    pub bind_host: IpAddr,
    /// How long `stop` waits for in-flight connections before closing them.
    pub shutdown_timeout: Duration,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("Failed to bind port {port}: {source}")]
    PortBind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("Server {0} is still shutting down")]
    ShuttingDown(String),
    #[error("Server {0} did not start: another start or stop is in progress")]
    NotStarted(String),
}
