//! The client role: dials the server, streams `CONFIG` for every configured
//! bridge, opens the local bridge listeners/sockets, and reconnects with
//! `RESUME` on session loss.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, warn};

use super::config;
use super::engine::{Engine, EngineExit};
use super::errors::TunnelError;
use super::handshake::{self, HandshakeOutcome, HandshakeRole};
use super::wire::{self, Connection};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

pub struct ClientOptions {
    pub server_host: String,
    pub server_port: u16,
    pub config_path: PathBuf,
    pub bypass: bool,
}

pub async fn run(opts: ClientOptions) -> Result<(), TunnelError> {
    let bridges = config::load_bridges(&opts.config_path)?;
    let server_addr = format!("{}:{}", opts.server_host, opts.server_port);

    let (stream, outcome) = dial_and_handshake(&server_addr, opts.bypass, false).await?;
    let (reader, writer) = stream.into_split();
    let mut engine = Engine::new_client(writer, reader, outcome.udp_socket, outcome.udp_peer, outcome.bypass, bridges.clone());
    send_config_frames(&mut engine, &bridges).await?;
    engine.start_client_bridges().await?;

    loop {
        let EngineExit::SessionLoss = engine.run().await?;
        warn!(%server_addr, "session lost, reconnecting");

        let mut backoff = INITIAL_BACKOFF;
        loop {
            match dial_and_handshake(&server_addr, opts.bypass, true).await {
                Ok((stream, outcome)) => {
                    let fresh = outcome.connection == Connection::Fresh;
                    let (reader, writer) = stream.into_split();
                    engine.rebind_proto(writer, reader, outcome.udp_socket, outcome.udp_peer, outcome.bypass);
                    if fresh {
                        info!("server could not resume, reloading bridges");
                        engine.reset_for_fresh_session();
                        send_config_frames(&mut engine, &bridges).await?;
                    } else {
                        info!("resumed previous session");
                    }
                    break;
                }
                Err(err) => {
                    warn!(%err, backoff = %humantime::format_duration(backoff), "reconnect attempt failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

async fn dial_and_handshake(
    server_addr: &str,
    bypass: bool,
    want_resume: bool,
) -> Result<(TcpStream, HandshakeOutcome), TunnelError> {
    let mut stream = TcpStream::connect(server_addr).await.map_err(TunnelError::network_fatal)?;
    let local_udp_bind: SocketAddr = "0.0.0.0:0".parse().expect("static address parses");
    let outcome = handshake::run_handshake(
        &mut stream,
        HandshakeRole::Client { want_resume, bypass },
        local_udp_bind,
    )
    .await?;
    Ok((stream, outcome))
}

async fn send_config_frames(engine: &mut Engine, bridges: &[super::bridge::Bridge]) -> Result<(), TunnelError> {
    for bridge in bridges {
        wire::write_config(engine.tcp_writer_mut(), bridge.protocol, bridge.dest_port, &bridge.dest_host)
            .await
            .map_err(TunnelError::from)?;
    }
    Ok(())
}
