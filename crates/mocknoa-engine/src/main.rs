//! Mocknoa headless front end.
//!
//! Usage:
//!   mocknoa serve [--server <id-or-name>]...
//!   mocknoa list
//!
//! Both commands read the persisted environment; `serve` runs servers until Ctrl-C.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mocknoa_engine::{endpoint_url, EngineConfig, Server, StateManager};
use std::path::PathBuf;
use tracing::{info, warn};

// ANSI color codes
const GREEN: &str = "\x1b[32m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Run mock HTTP servers from a Mocknoa environment
#[derive(Parser, Debug)]
#[command(name = "mocknoa")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML engine configuration
    #[arg(short, long, env = "MOCKNOA_CONFIG")]
    config: Option<PathBuf>,

    /// Environment file (overrides the configuration)
    #[arg(short, long, env = "MOCKNOA_STATE_FILE")]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start servers and serve until Ctrl-C
    Serve {
        /// Server id or name to start; all servers when omitted
        #[arg(long = "server")]
        servers: Vec<String>,
    },
    /// Print servers and their endpoints
    List,
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(state_file) = &args.state_file {
        config.state_file = state_file.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .init();

    let state = StateManager::open(&config);
    match args.command {
        Command::Serve { servers } => serve(&state, &servers).await,
        Command::List => {
            list(&state);
            Ok(())
        }
    }
}

fn selected_servers(state: &StateManager, selectors: &[String]) -> anyhow::Result<Vec<Server>> {
    let servers = state.servers();
    if selectors.is_empty() {
        return Ok(servers);
    }
    selectors
        .iter()
        .map(|selector| {
            servers
                .iter()
                .find(|s| &s.id == selector || &s.name == selector)
                .cloned()
                .with_context(|| format!("No server with id or name '{selector}'"))
        })
        .collect()
}

async fn serve(state: &StateManager, selectors: &[String]) -> anyhow::Result<()> {
    let servers = selected_servers(state, selectors)?;
    if servers.is_empty() {
        warn!("No servers configured in the environment");
        return Ok(());
    }

    let mut started = 0;
    for server in &servers {
        match state.start_server(&server.id).await {
            Ok(port) => {
                started += 1;
                // Port 0 servers report the port the OS picked.
                let bound = Server {
                    port,
                    ..server.clone()
                };
                for endpoint in bound.ranked_endpoints() {
                    info!(
                        "{} {} -> {}",
                        bound.name,
                        endpoint.action,
                        endpoint_url(&bound, endpoint)
                    );
                }
            }
            Err(e) => warn!("Server '{}' not started: {}", server.name, e),
        }
    }

    if started == 0 {
        anyhow::bail!("None of the selected servers could be started");
    }

    info!("{} server(s) running, press Ctrl-C to stop", started);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Stopping servers");
    state.shutdown().await;
    Ok(())
}

fn list(state: &StateManager) {
    let servers = state.servers();
    if servers.is_empty() {
        println!("{DIM}No servers configured{RESET}");
        return;
    }

    for server in servers {
        println!(
            "{BOLD}{}{RESET} {DIM}({}){RESET} port {}",
            server.name, server.id, server.port
        );
        for endpoint in server.ranked_endpoints() {
            println!(
                "  {GREEN}{:<6}{RESET} {}  {DIM}{}, {} response(s){RESET}",
                endpoint.action,
                endpoint_url(&server, endpoint),
                endpoint.response_sequence_mode,
                endpoint.responses.len()
            );
        }
    }
}
