//! The server role: accepts exactly one tunnel client at a time, learns its
//! bridges from `CONFIG` frames, and offers `RESUME` to whichever client
//! reconnects after a session loss.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use super::engine::{Engine, EngineExit};
use super::errors::TunnelError;
use super::handshake::{self, HandshakeOutcome, HandshakeRole};
use super::wire::Connection;

pub struct ServerOptions {
    pub tcp_port: u16,
}

pub async fn run(opts: ServerOptions) -> Result<(), TunnelError> {
    let listener = TcpListener::bind(("0.0.0.0", opts.tcp_port))
        .await
        .map_err(TunnelError::network_fatal)?;
    info!(port = opts.tcp_port, "listening for a tunnel client");

    let (stream, outcome) = accept_and_handshake(&listener, false).await?;
    let (reader, writer) = stream.into_split();
    let mut engine = Engine::new_server(writer, reader, outcome.udp_socket, outcome.udp_peer, outcome.bypass);

    loop {
        let EngineExit::SessionLoss = engine.run().await?;
        warn!("session lost, waiting for the client to reconnect");

        let (stream, outcome) = accept_and_handshake(&listener, true).await?;
        let fresh = outcome.connection == Connection::Fresh;
        let (reader, writer) = stream.into_split();
        engine.rebind_proto(writer, reader, outcome.udp_socket, outcome.udp_peer, outcome.bypass);
        if fresh {
            info!("client could not resume, clearing learned bridges");
            engine.reset_for_fresh_session();
        } else {
            info!("resumed previous session");
        }
    }
}

async fn accept_and_handshake(
    listener: &TcpListener,
    can_resume: bool,
) -> Result<(TcpStream, HandshakeOutcome), TunnelError> {
    loop {
        let (mut stream, peer) = listener.accept().await.map_err(TunnelError::network_fatal)?;
        info!(%peer, "client connected");
        let local_udp_bind: SocketAddr = "0.0.0.0:0".parse().expect("static address parses");
        match handshake::run_handshake(&mut stream, HandshakeRole::Server { can_resume }, local_udp_bind).await {
            Ok(outcome) => return Ok((stream, outcome)),
            Err(err) => warn!(%peer, %err, "handshake failed, awaiting next connection"),
        }
    }
}
