//! Session handshake run once per connection attempt, before the
//! [`crate::rallonge::engine::Engine`] takes ownership of the TCP stream:
//! the `ESTABLISH` barrier, the fresh/resume negotiation, the UDP-bypass
//! announcement, and (unless bypassing) the UDP port exchange and UDP
//! handshake.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::debug;

use super::errors::TunnelError;
use super::wire::{self, Connection, OpCode, UdpBypass};

const UDP_HANDSHAKE_TICK: Duration = Duration::from_millis(10);
const UDP_HANDSHAKE_OVERALL_TIMEOUT: Duration = Duration::from_secs(30);
const N_INITIAL_MESSAGES: u32 = 16;

pub enum HandshakeRole {
    Client { want_resume: bool, bypass: bool },
    Server { can_resume: bool },
}

pub struct HandshakeOutcome {
    pub connection: Connection,
    pub bypass: bool,
    /// `None` in bypass mode, or if the UDP handshake never converges.
    pub udp_socket: Option<UdpSocket>,
    pub udp_peer: Option<SocketAddr>,
}

pub async fn run_handshake(
    stream: &mut TcpStream,
    role: HandshakeRole,
    local_udp_bind: SocketAddr,
) -> Result<HandshakeOutcome, TunnelError> {
    establish_barrier(stream).await?;

    let (connection, bypass) = match role {
        HandshakeRole::Client { want_resume, bypass } => {
            let proposal = if want_resume { Connection::Resume } else { Connection::Fresh };
            stream.write_u8(proposal as u8).await.map_err(TunnelError::network_fatal)?;
            let echo = stream.read_u8().await.map_err(TunnelError::network_fatal)?;
            let connection = decode_connection_byte(echo)?;
            stream
                .write_u8(if bypass { UdpBypass::Bypass as u8 } else { UdpBypass::NoBypass as u8 })
                .await
                .map_err(TunnelError::network_fatal)?;
            (connection, bypass)
        }
        HandshakeRole::Server { can_resume } => {
            let proposal = stream.read_u8().await.map_err(TunnelError::network_fatal)?;
            let proposed = decode_connection_byte(proposal)?;
            let echo = if can_resume && proposed == Connection::Resume {
                Connection::Resume
            } else {
                Connection::Fresh
            };
            stream.write_u8(echo as u8).await.map_err(TunnelError::network_fatal)?;
            let bypass_byte = stream.read_u8().await.map_err(TunnelError::network_fatal)?;
            (echo, bypass_byte == UdpBypass::Bypass as u8)
        }
    };

    if bypass {
        return Ok(HandshakeOutcome {
            connection,
            bypass: true,
            udp_socket: None,
            udp_peer: None,
        });
    }

    let local_udp_port = local_udp_bind.port();
    let (mut read_half, mut write_half) = stream.split();
    let (peer_port, ()) = tokio::try_join!(
        async { read_half.read_u16_le().await.map_err(TunnelError::network_fatal) },
        async { write_half.write_u16_le(local_udp_port).await.map_err(TunnelError::network_fatal) },
    )?;

    let peer_ip = stream.peer_addr().map_err(TunnelError::network_fatal)?.ip();
    let udp_peer = SocketAddr::new(peer_ip, peer_port);

    let udp_socket = UdpSocket::bind(local_udp_bind).await.map_err(TunnelError::network_fatal)?;
    run_udp_handshake(&udp_socket, udp_peer).await?;

    Ok(HandshakeOutcome {
        connection,
        bypass: false,
        udp_socket: Some(udp_socket),
        udp_peer: Some(udp_peer),
    })
}

fn decode_connection_byte(b: u8) -> Result<Connection, TunnelError> {
    match b {
        0 => Ok(Connection::Fresh),
        1 => Ok(Connection::Resume),
        other => Err(TunnelError::Protocol(wire::WireError::Malformed(
            malformed_connection_byte(other),
        ))),
    }
}

// The handshake's raw bytes aren't opcode-framed, so a bad one can't carry a
// `WireError::UnknownOpCode`'s byte value; keep a single static message
// instead of threading the byte through a `&'static str`.
fn malformed_connection_byte(_b: u8) -> &'static str {
    "handshake: connection byte is neither FRESH nor RESUME"
}

/// The `ESTABLISH` ping/pong: send our own, then discard bytes until the
/// peer's arrives. Synchronizes the two sides at the start of every attempt
/// so leftover bytes from an aborted prior attempt never leak into the
/// negotiation that follows.
async fn establish_barrier(stream: &mut TcpStream) -> Result<(), TunnelError> {
    wire::write_establish(stream).await.map_err(TunnelError::from)?;
    loop {
        let b = stream.read_u8().await.map_err(TunnelError::network_fatal)?;
        if b == OpCode::Establish as u8 {
            return Ok(());
        }
        debug!(byte = b, "discarding stale byte before ESTABLISH barrier");
    }
}

/// Opens NAT pinholes in both directions and converges on "both peers
/// believe UDP works", tolerating the loss of up to 15 of 16 initial `NOP`s
/// and one `UDP_CONNECTED` confirmation per side (see DESIGN.md for how the
/// `udp_est_resend` open question is resolved here).
async fn run_udp_handshake(socket: &UdpSocket, peer: SocketAddr) -> Result<(), TunnelError> {
    timeout(UDP_HANDSHAKE_OVERALL_TIMEOUT, async {
        let mut ticker = tokio::time::interval(UDP_HANDSHAKE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut recv_count: u32 = 0;
        let mut udp_established = false;
        let mut buf = [0u8; 4];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outgoing = if recv_count >= N_INITIAL_MESSAGES {
                        wire::OpCode::UdpConnected as u8
                    } else {
                        wire::OpCode::Nop as u8
                    };
                    let _ = socket.send_to(&[outgoing], peer).await;
                }
                recv = socket.recv_from(&mut buf) => {
                    if let Ok((n, from)) = recv {
                        if from != peer || n == 0 {
                            continue;
                        }
                        recv_count += 1;
                        if buf[0] == wire::OpCode::UdpConnected as u8 {
                            udp_established = true;
                        }
                    }
                }
            }

            if recv_count >= N_INITIAL_MESSAGES && udp_established {
                // One-shot resend: our own UDP_CONNECTED may not have
                // reached the peer before they stopped reading for it.
                let _ = socket.send_to(&[wire::OpCode::UdpConnected as u8], peer).await;
                return Ok(());
            }
        }
    })
    .await
    .map_err(|_| TunnelError::NetworkFatal(anyhow::anyhow!("udp handshake with {peer} timed out")))?
}
