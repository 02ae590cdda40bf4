//! Tunnel engine: a client and a server that share a wire protocol, a
//! connection table, and a keepalive/timeout/reconnect state machine.

pub mod bridge;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod errors;
pub mod handshake;
pub mod logging;
pub mod server;
pub mod wire;

#[cfg(test)]
mod scenarios;

use tracing::info;

use cli::{Cli, Command};
use errors::TunnelError;

pub async fn run(cli: Cli) -> Result<(), TunnelError> {
    let _logging = logging::init(cli.log.as_deref());

    let role = match cli.command {
        Command::Client { server_host, server_port, config_file, udp_bypass } => {
            tokio::spawn(client::run(client::ClientOptions {
                server_host,
                server_port,
                config_path: config_file,
                bypass: udp_bypass,
            }))
        }
        Command::Server { tcp_port } => tokio::spawn(server::run(server::ServerOptions { tcp_port })),
    };

    tokio::select! {
        result = role => result.map_err(|e| TunnelError::network_fatal(anyhow::anyhow!(e)))?,
        _ = shutdown_signal() => {
            info!("shutdown requested, exiting");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
