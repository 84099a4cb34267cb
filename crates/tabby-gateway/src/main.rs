//! tabby-gateway: WebSocket to TCP connection gateway.
//!
//! Browsers cannot open raw TCP connections, so Tabby Web opens a WebSocket
//! here, names a host and port after a short JSON handshake, and then uses
//! the WebSocket as a byte pipe to that endpoint.

mod config;
mod relay;
mod server;
mod session;
mod transport;

use anyhow::Context;
use clap::Parser;
use config::{CliOverrides, GatewayConfig, AUTH_TOKEN_ENV};
use server::GatewayServer;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// tabby-gateway — WebSocket to TCP connection gateway
#[derive(Parser, Debug)]
#[command(name = "tabby-gateway", version, about = "WebSocket to TCP connection gateway for Tabby Web")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<IpAddr>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.tabby-gateway/config.toml")]
    config: String,

    /// WebSocket idle timeout in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Backend connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match load_config(&cli) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        auth_required = config.auth_required(),
        "starting tabby-gateway"
    );

    let server = GatewayServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("tabby-gateway stopped");
}

/// Resolve the configuration once; the auth token comes only from the environment.
fn load_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    let auth_token = match std::env::var(AUTH_TOKEN_ENV) {
        Ok(token) => Some(token),
        Err(std::env::VarError::NotPresent) => None,
        Err(e) => return Err(e).with_context(|| format!("cannot read {AUTH_TOKEN_ENV}")),
    };
    let overrides = CliOverrides {
        host: cli.host,
        port: cli.port,
        idle_timeout: cli.idle_timeout,
        connect_timeout: cli.connect_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    GatewayConfig::load(Some(&config_path), overrides, auth_token)
        .with_context(|| format!("config {}", config_path.display()))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
