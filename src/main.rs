#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # reachd
//!
//! Reach private machines from a browser.
//!
//! Agents behind NAT dial the SSH tunnel broker (default port 2222) with a
//! bearer token and reverse-forward their services. The HTTP API (default
//! port 8090) opens WebSocket terminals and runs SFTP operations against
//! those machines, or against directly reachable ones, without the browser
//! ever holding a credential.
//!
//! ## Subcommands
//!
//! - `reachd serve` (default): run the HTTP/WS server and the tunnel broker
//! - `reachd keygen --out <path>`: write a fresh Ed25519 host key
//!
//! ## API surface
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/api/health` | Liveness, no auth |
//! | GET | `/api/activity` | Audit entries |
//! | GET / DELETE | `/api/tunnels[/{id}]` | Live tunnels, kick |
//! | POST | `/api/tunnels/{id}/rotate` | New token, evict session |
//! | DELETE | `/api/tunnels/{id}/ports` | Release sticky ports |
//! | GET / DELETE | `/api/terminals[/{id}]` | Live terminals, force close |
//! | GET (WS) | `/api/servers/{id}/terminal` | Interactive shell |
//! | GET (WS) | `/api/servers/{id}/containers/{c}/exec` | Container shell |
//! | * | `/api/servers/{id}/files[/...]` | SFTP operations |
//! | POST | `/api/servers/{id}/power` | Reboot / shutdown |

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reachd::config::Config;
use reachd::routes;
use reachd::state::AppState;
use reachd::tunnel::broker::{load_or_generate_host_key, write_host_key};

/// Reverse-tunnel broker with WebSocket terminals and SFTP.
#[derive(Parser)]
#[command(name = "reachd", version)]
struct Cli {
    /// Path to TOML config file (when no subcommand is given).
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server and the tunnel broker (default).
    Serve,
    /// Write a new Ed25519 host key in OpenSSH format and exit.
    Keygen {
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Keygen { out }) => keygen(&out),
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

fn keygen(out: &Path) {
    if out.exists() {
        eprintln!("refusing to overwrite {}", out.display());
        std::process::exit(1);
    }
    match write_host_key(out) {
        Ok(key) => println!("wrote {} ({})", out.display(), key.public_key().fingerprint(Default::default())),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("reachd: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("reachd v{} starting", env!("CARGO_PKG_VERSION"));
    if config.auth.api_key == "change-me" {
        warn!("Using default API key; set REACHD_API_KEY or update config");
    }

    let host_key = load_or_generate_host_key(Path::new(&config.tunnel.host_key_path))
        .expect("Failed to load tunnel host key");
    let state = AppState::new(config, host_key).expect("Invalid tunnel port range");
    info!(servers = state.store.count(), "Server records loaded");

    let shutdown = CancellationToken::new();

    let broker_task = if state.config.tunnel.enabled {
        let listener = TcpListener::bind(&state.config.tunnel.listen)
            .await
            .expect("Failed to bind tunnel listener");
        let broker = state.broker.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move { broker.serve(listener, token).await }))
    } else {
        info!("Tunnel broker disabled");
        None
    };

    let app = routes::router(state.clone());
    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");
    info!("Listening on {}", state.config.server.listen);

    let signal = shutdown.clone();
    let stop = async move {
        wait_for_signal().await;
        signal.cancel();
    };

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
        error!(error = %e, "Server error");
    }

    info!("Shutting down...");
    shutdown.cancel();
    let closed = state.terminals.disconnect_all().await;
    info!(terminals = closed, "Terminal sessions closed");
    if let Some(task) = broker_task {
        let _ = task.await;
    }
    info!("Goodbye");
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
