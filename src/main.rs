#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # shroud
//!
//! Polling frame relay that lets a browser reach an app running on a
//! private machine. Both sides only make outbound HTTP requests to the relay.
//!
//! ## Subcommands
//!
//! - `shroud serve` (default): run the relay
//! - `shroud agent`: run next to the local app and answer relayed requests
//!
//! ## API surface
//!
//! | Method | Path                                   | Description                         |
//! |--------|----------------------------------------|-------------------------------------|
//! | POST   | `/tunnel.TunnelService/Register`       | gRPC-Web: register agent or browser |
//! | POST   | `/tunnel.TunnelService/SendFrame`      | gRPC-Web: submit one frame          |
//! | POST   | `/tunnel.TunnelService/PollFrames`     | gRPC-Web: fetch queued frames       |
//! | POST   | `/api/register-browser`                | New browser identity + cookie       |
//! | GET    | `/api/restore-session`                 | Refresh a remembered browser        |
//! | POST   | `/api/sync-session`                    | Ask the agent to load `/`           |
//! | GET    | `/api/sync-status/{request_id}`        | `pending` or `completed`            |
//! | ANY    | `/tunnel/{*path}`                      | Relay a request to the local app    |
//! | GET    | `/static`, `/media`, `/admin/static`, `/files` | Static assets via the agent |
//! | GET    | `/status`, `/health`                   | Relay state and liveness            |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, sweep task, graceful shutdown
//! config.rs        TOML + env-var configuration
//! frame.rs         Frame, FrameType, ids
//! messages.rs      request/response messages, gRPC-Web framing
//! obfuscation/     base64, xor and AES-GCM codecs, rotator
//! registry.rs      clients and tunnels
//! queue.rs         per-client outbound queues, poll cursor, long-poll wakeup
//! correlation.rs   pending requests, response shaping
//! relay/
//!   mod.rs         Relay service, RelayError
//!   routes.rs      axum router
//! agent/
//!   mod.rs         registration, poll loop, relay client
//!   local.rs       replay against the local app, cookie jar
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use shroud::config::Config;
use shroud::relay::{routes, Relay};
use shroud::{clock, html, Agent};

/// Polling HTTP tunnel: relay server and local agent.
#[derive(Parser)]
#[command(name = "shroud", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Override the listen address.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run the agent next to the local app.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Override the relay base URL.
        #[arg(long)]
        relay_url: Option<String>,
        /// Override the local app URL.
        #[arg(long)]
        local_app_url: Option<String>,
    },
}

fn load_config(path: Option<&str>) -> Config {
    match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("shroud: {e}");
            std::process::exit(2);
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        None => run_relay(None, None).await,
        Some(Commands::Serve { config, listen }) => {
            run_relay(config.as_deref(), listen).await;
        }
        Some(Commands::Agent {
            config,
            relay_url,
            local_app_url,
        }) => run_agent(config.as_deref(), relay_url, local_app_url).await,
    }
}

async fn run_relay(config_path: Option<&str>, listen: Option<String>) {
    let mut config = load_config(config_path);
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    init_tracing(&config);

    info!("shroud relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.obfuscation.aes_key.is_none() {
        warn!("No AES key configured; agents must share SHROUD_AES_KEY to read sealed frames");
    }

    let relay = match Relay::new(&config, clock::system(), html::pass_through()) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            error!("Invalid obfuscation settings: {e}");
            std::process::exit(2);
        }
    };
    let app = routes::router(Arc::clone(&relay), config.server.max_connections);

    let listener = match TcpListener::bind(&config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.server.listen);
            std::process::exit(1);
        }
    };
    info!("Relay ready");

    // Periodic sweep: idle clients, overdue requests, method rotation
    let sweep_relay = Arc::clone(&relay);
    let sweep_every = Duration::from_secs(config.relay.sweep_interval_secs.max(1));
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let report = sweep_relay.sweep().await;
            if report.evicted_clients > 0 || report.expired_requests > 0 {
                info!(
                    evicted = report.evicted_clients,
                    expired = report.expired_requests,
                    "Sweep"
                );
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| error!("Server error: {e}"));

    info!("Shutting down...");
    sweep_task.abort();
    let status = relay.status().await;
    info!(
        clients = status.clients,
        pending = status.pending_requests,
        "Goodbye"
    );
}

async fn run_agent(
    config_path: Option<&str>,
    relay_url: Option<String>,
    local_app_url: Option<String>,
) {
    let mut config = load_config(config_path);
    if let Some(url) = relay_url {
        config.agent.relay_url = url;
    }
    if let Some(url) = local_app_url {
        config.agent.local_app_url = url;
    }
    init_tracing(&config);

    info!("shroud agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        relay = %config.agent.relay_url,
        local_app = %config.agent.local_app_url,
        "Relaying requests"
    );

    let agent = match Agent::new(config.agent.clone(), &config.obfuscation) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            error!("Invalid obfuscation settings: {e}");
            std::process::exit(2);
        }
    };
    let task = tokio::spawn(agent.run());
    shutdown_signal().await;
    task.abort();
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
