//! The shared tunnel engine (`TunnelBase` in spirit): owns the connection
//! table, the proto-TCP write half, the auxiliary proto-UDP socket, and every
//! bridge listener/socket for the lifetime of one session.
//!
//! The original is a single-threaded `poll()` loop over a contiguous
//! descriptor vector; we have no equivalent of a single blocking syscall
//! multiplexing arbitrary sockets, so the loop is rebuilt as a single task
//! that owns all mutable state exclusively (no locking, matching the
//! original's "no internal parallelism" guarantee) and is fed readiness
//! through an mpsc channel from small dedicated reader/acceptor tasks. This
//! replaces the `pfd_index` back-reference and swap-and-pop erase entirely:
//! there is no poll vector to keep contiguous, so nothing to keep in sync
//! with a table entry (see DESIGN.md, Open Question on §9's poll-index note).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bridge::{Bridge, BridgeProtocol, ServerBridge};
use super::connection::{ComKey, ConnectionTable, SkAllocator, SubConnection, SubState, UkAllocator};
use super::errors::{is_connection_refused, TunnelError};
use super::wire::{self, TcpFrame, UdpFrame, WireError};

pub const TCP_KA_INTERVAL: Duration = Duration::from_secs(2);
pub const UDP_KA_INTERVAL: Duration = Duration::from_secs(5);
pub const TCP_TIMEOUT: Duration = Duration::from_secs(4);

/// Why the engine stopped running its main loop.
#[derive(Debug)]
pub enum EngineExit {
    /// `tcp_timeout` elapsed, or proto-TCP hung up, or a `TCP_TIMEOUT` frame
    /// arrived from the peer. The caller re-runs the session handshake with
    /// `Connection::Resume` and restarts the loop.
    SessionLoss,
}

/// Bookkeeping for one local UDP bridge endpoint (client: the bind address
/// applications talk to; server: the socket used to reach the destination).
/// The peer address is learned from the first datagram received, since
/// nothing in the config tells us which local application will speak first.
struct BridgeUdpSocket {
    socket: std::sync::Arc<UdpSocket>,
    peer: Option<SocketAddr>,
}

enum Event {
    TcpFrame(Result<TcpFrame, WireError>),
    UdpDatagram(Vec<u8>),
    BridgeAccepted {
        bridge: u16,
        stream: io::Result<TcpStream>,
    },
    BridgeUdpRead {
        bridge: u16,
        payload: Vec<u8>,
        peer: SocketAddr,
    },
    SubRead {
        key: ComKey,
        result: io::Result<Vec<u8>>,
    },
    ConnectOutcome {
        bridge: u16,
        sk: u64,
        uk: u64,
        outcome: io::Result<TcpStream>,
    },
}

/// Role-specific behavior the engine defers to when dispatching a frame that
/// only makes sense on one side of the tunnel.
enum Role {
    Client {
        bridges: Vec<Bridge>,
        uk_alloc: UkAllocator,
    },
    Server {
        bridges: HashMap<u16, ServerBridge>,
    },
}

pub struct Engine {
    role: Role,
    table: ConnectionTable,
    sk_alloc: SkAllocator,
    tcp_writer: OwnedWriteHalf,
    udp_socket: Option<std::sync::Arc<UdpSocket>>,
    udp_peer: Option<SocketAddr>,
    bypass: bool,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    bridge_udp: HashMap<u16, BridgeUdpSocket>,
    last_tcp_packet: Instant,
    tcp_ka_next: Instant,
    udp_ka_next: Instant,
}

impl Engine {
    fn new(
        role: Role,
        tcp_writer: OwnedWriteHalf,
        tcp_reader: tokio::net::tcp::OwnedReadHalf,
        udp_socket: Option<UdpSocket>,
        udp_peer: Option<SocketAddr>,
        bypass: bool,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        let now = Instant::now();

        spawn_tcp_reader(tcp_reader, bypass, events_tx.clone());
        let udp_socket = udp_socket.map(std::sync::Arc::new);
        if let Some(sock) = udp_socket.clone() {
            spawn_udp_reader(sock, events_tx.clone());
        }

        Engine {
            role,
            table: ConnectionTable::new(),
            sk_alloc: SkAllocator::new(),
            tcp_writer,
            udp_socket,
            udp_peer,
            bypass,
            events_tx,
            events_rx,
            bridge_udp: HashMap::new(),
            last_tcp_packet: now,
            tcp_ka_next: now + TCP_KA_INTERVAL,
            udp_ka_next: now + UDP_KA_INTERVAL,
        }
    }

    pub fn new_client(
        tcp_writer: OwnedWriteHalf,
        tcp_reader: tokio::net::tcp::OwnedReadHalf,
        udp_socket: Option<UdpSocket>,
        udp_peer: Option<SocketAddr>,
        bypass: bool,
        bridges: Vec<Bridge>,
    ) -> Self {
        Self::new(
            Role::Client {
                bridges,
                uk_alloc: UkAllocator::new(),
            },
            tcp_writer,
            tcp_reader,
            udp_socket,
            udp_peer,
            bypass,
        )
    }

    pub fn new_server(
        tcp_writer: OwnedWriteHalf,
        tcp_reader: tokio::net::tcp::OwnedReadHalf,
        udp_socket: Option<UdpSocket>,
        udp_peer: Option<SocketAddr>,
        bypass: bool,
    ) -> Self {
        Self::new(
            Role::Server {
                bridges: HashMap::new(),
            },
            tcp_writer,
            tcp_reader,
            udp_socket,
            udp_peer,
            bypass,
        )
    }

    /// Resets all session-scoped state for a `RESUME`-that-became-`FRESH`
    /// reconnect, or for a first-time setup. Keeps the client's configured
    /// bridge list (it's immutable for the process lifetime); drops the
    /// server's learned bridge table.
    pub fn reset_for_fresh_session(&mut self) {
        self.table.clear();
        self.bridge_udp.clear();
        if let Role::Server { bridges } = &mut self.role {
            bridges.clear();
        }
    }

    pub fn rebind_proto(
        &mut self,
        tcp_writer: OwnedWriteHalf,
        tcp_reader: tokio::net::tcp::OwnedReadHalf,
        udp_socket: Option<UdpSocket>,
        udp_peer: Option<SocketAddr>,
        bypass: bool,
    ) {
        let (events_tx, events_rx) = mpsc::channel(256);
        spawn_tcp_reader(tcp_reader, bypass, events_tx.clone());
        let udp_socket = udp_socket.map(std::sync::Arc::new);
        if let Some(sock) = udp_socket.clone() {
            spawn_udp_reader(sock, events_tx.clone());
        }
        self.tcp_writer = tcp_writer;
        self.udp_socket = udp_socket;
        self.udp_peer = udp_peer;
        self.bypass = bypass;
        self.events_tx = events_tx;
        self.events_rx = events_rx;
        let now = Instant::now();
        self.last_tcp_packet = now;
        self.tcp_ka_next = now + TCP_KA_INTERVAL;
        self.udp_ka_next = now + UDP_KA_INTERVAL;
    }

    /// Client only: starts accepting on a local TCP bridge listener and
    /// reading a local UDP bridge socket, one spawned task each, feeding the
    /// engine's event channel.
    pub async fn start_client_bridges(&mut self) -> Result<(), TunnelError> {
        let bridges = match &self.role {
            Role::Client { bridges, .. } => bridges.clone(),
            Role::Server { .. } => return Ok(()),
        };
        for bridge in &bridges {
            match bridge.protocol {
                BridgeProtocol::Tcp => {
                    let listener = tokio::net::TcpListener::bind(bridge.local_addr)
                        .await
                        .map_err(TunnelError::network_fatal)?;
                    info!(bridge = bridge.index, proto = bridge.protocol.as_str(), addr = %bridge.local_addr, "local bridge listening");
                    spawn_bridge_acceptor(bridge.index, listener, self.events_tx.clone());
                }
                BridgeProtocol::Udp => {
                    let socket = UdpSocket::bind(bridge.local_addr)
                        .await
                        .map_err(TunnelError::network_fatal)?;
                    info!(bridge = bridge.index, proto = bridge.protocol.as_str(), addr = %bridge.local_addr, "local bridge listening");
                    let socket = std::sync::Arc::new(socket);
                    spawn_bridge_udp_reader(bridge.index, socket.clone(), self.events_tx.clone());
                    self.bridge_udp.insert(bridge.index, BridgeUdpSocket { socket, peer: None });
                }
            }
        }
        Ok(())
    }

    /// Runs one session until `tcp_timeout` elapses, the peer hangs up, or a
    /// `TCP_TIMEOUT` frame arrives.
    pub async fn run(&mut self) -> Result<EngineExit, TunnelError> {
        loop {
            let tcp_timeout_at = self.last_tcp_packet + TCP_TIMEOUT;
            let mut deadline = tcp_timeout_at.min(self.tcp_ka_next);
            if !self.bypass {
                deadline = deadline.min(self.udp_ka_next);
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let now = Instant::now();
                    if now >= tcp_timeout_at {
                        warn!("proto-tcp silent for tcp_timeout, declaring session lost");
                        let _ = wire::write_tcp_timeout(&mut self.tcp_writer).await;
                        return Ok(EngineExit::SessionLoss);
                    }
                    if now >= self.tcp_ka_next {
                        wire::write_nop(&mut self.tcp_writer).await.map_err(TunnelError::from)?;
                        self.tcp_ka_next = now + TCP_KA_INTERVAL;
                    }
                    if !self.bypass && now >= self.udp_ka_next {
                        if let (Some(sock), Some(peer)) = (&self.udp_socket, self.udp_peer) {
                            let _ = sock.send_to(&[wire::OpCode::Nop as u8], peer).await;
                        }
                        self.udp_ka_next = now + UDP_KA_INTERVAL;
                    }
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        return Ok(EngineExit::SessionLoss);
                    };
                    if let Some(exit) = self.handle_event(event).await? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<Option<EngineExit>, TunnelError> {
        match event {
            Event::TcpFrame(Ok(frame)) => {
                self.last_tcp_packet = Instant::now();
                return self.dispatch_tcp_frame(frame).await;
            }
            Event::TcpFrame(Err(WireError::Eof)) => {
                debug!("proto-tcp closed by peer");
                return Ok(Some(EngineExit::SessionLoss));
            }
            Event::TcpFrame(Err(err)) => return Err(TunnelError::from(err)),
            Event::UdpDatagram(datagram) => self.dispatch_udp_datagram(&datagram).await?,
            Event::BridgeAccepted { bridge, stream } => self.on_bridge_accept(bridge, stream).await?,
            Event::BridgeUdpRead { bridge, payload, peer } => {
                self.on_bridge_udp_read(bridge, payload, peer).await?
            }
            Event::SubRead { key, result } => self.on_sub_read(key, result).await?,
            Event::ConnectOutcome { bridge, sk, uk, outcome } => {
                self.on_connect_outcome(bridge, sk, uk, outcome).await?
            }
        }
        Ok(None)
    }

    async fn dispatch_tcp_frame(&mut self, frame: TcpFrame) -> Result<Option<EngineExit>, TunnelError> {
        match frame {
            TcpFrame::Nop => {}
            TcpFrame::Config { proto, dst_port, host } => self.on_config(proto, dst_port, host).await?,
            TcpFrame::Message { sk, uk, payload } => self.on_sub_message(sk, uk, payload).await?,
            TcpFrame::UdpBypassMessage { bridge, payload } => {
                self.deliver_to_bridge_udp(bridge, &payload).await?
            }
            TcpFrame::Connect { bridge, sk, uk } => self.on_connect(bridge, sk, uk).await?,
            TcpFrame::TcpEstablished { client_sk, client_uk, server_sk } => {
                self.on_tcp_established(client_sk, client_uk, server_sk)?
            }
            TcpFrame::TcpDisconnected { sk, uk } => self.on_tcp_disconnected(sk, uk),
            TcpFrame::TcpTimeout => {
                info!("peer declared the tunnel lost");
                return Ok(Some(EngineExit::SessionLoss));
            }
        }
        Ok(None)
    }

    async fn on_config(&mut self, proto: BridgeProtocol, dst_port: u16, host: String) -> Result<(), TunnelError> {
        let index = match &mut self.role {
            Role::Client { .. } => {
                return Err(TunnelError::Protocol(WireError::WrongChannel(wire::OpCode::Config)));
            }
            Role::Server { bridges } => {
                let index = bridges.len() as u16;
                bridges.insert(
                    index,
                    ServerBridge {
                        protocol: proto,
                        dest_host: host.clone(),
                        dest_port: dst_port,
                    },
                );
                index
            }
        };

        info!(bridge = index, proto = proto.as_str(), host = %host, dst_port, "registered bridge from CONFIG");

        if proto == BridgeProtocol::Udp {
            // The server's end of a UDP bridge has a known destination up
            // front (unlike the client's, which only learns its peer -- the
            // local application -- from the first datagram it relays). Bind
            // now so `deliver_to_bridge_udp` can forward to it immediately,
            // without waiting on traffic from the destination first.
            let dest = format!("{host}:{dst_port}");
            let peer = tokio::net::lookup_host(&dest)
                .await
                .map_err(TunnelError::network_fatal)?
                .next()
                .ok_or_else(|| TunnelError::network_fatal(anyhow::anyhow!("{dest} resolved to no addresses")))?;
            let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(TunnelError::network_fatal)?;
            let socket = std::sync::Arc::new(socket);
            spawn_bridge_udp_reader(index, socket.clone(), self.events_tx.clone());
            self.bridge_udp.insert(index, BridgeUdpSocket { socket, peer: Some(peer) });
        }
        Ok(())
    }

    async fn on_sub_message(&mut self, sk: u64, uk: u64, payload: Bytes) -> Result<(), TunnelError> {
        let key = ComKey { sk, uk };
        let Some(conn) = self.table.get_mut(&key) else {
            debug!(sk, uk, "message on unknown ComKey, dropping");
            return Ok(());
        };
        if conn.writer.write_all(&payload).await.is_err() {
            self.table.remove(&key);
            wire::write_tcp_disconnected(&mut self.tcp_writer, sk, uk)
                .await
                .map_err(TunnelError::from)?;
        }
        Ok(())
    }

    async fn deliver_to_bridge_udp(&mut self, bridge: u16, payload: &[u8]) -> Result<(), TunnelError> {
        let Some(entry) = self.bridge_udp.get(&bridge) else {
            debug!(bridge, "udp datagram for unknown bridge, dropping");
            return Ok(());
        };
        let Some(peer) = entry.peer else {
            debug!(bridge, "no peer recorded yet for bridge, dropping");
            return Ok(());
        };
        let _ = entry.socket.send_to(payload, peer).await;
        Ok(())
    }

    async fn on_connect(&mut self, bridge: u16, sk: u64, uk: u64) -> Result<(), TunnelError> {
        let Role::Server { bridges } = &self.role else {
            return Err(TunnelError::Protocol(WireError::WrongChannel(wire::OpCode::Connect)));
        };
        let Some(server_bridge) = bridges.get(&bridge) else {
            warn!(bridge, "connect for unconfigured bridge, dropping");
            return Ok(());
        };
        let addr = server_bridge.dest_addr_string();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = TcpStream::connect(&addr).await;
            let _ = tx.send(Event::ConnectOutcome { bridge, sk, uk, outcome }).await;
        });
        Ok(())
    }

    async fn on_connect_outcome(
        &mut self,
        bridge: u16,
        sk: u64,
        uk: u64,
        outcome: io::Result<TcpStream>,
    ) -> Result<(), TunnelError> {
        match outcome {
            Ok(stream) => {
                let server_sk = self.sk_alloc.alloc();
                let (reader, writer) = stream.into_split();
                let key = ComKey { sk: server_sk, uk };
                let reader_task = spawn_sub_reader(key, reader, self.events_tx.clone());
                self.table.insert(
                    key,
                    SubConnection {
                        state: SubState::Established,
                        bridge,
                        protocol: BridgeProtocol::Tcp,
                        writer,
                        reader_task: Some(reader_task),
                        pending_reader: None,
                    },
                );
                wire::write_tcp_established(&mut self.tcp_writer, sk, uk, server_sk)
                    .await
                    .map_err(TunnelError::from)?;
            }
            Err(err) if is_connection_refused(&err) => {
                wire::write_tcp_disconnected(&mut self.tcp_writer, sk, uk)
                    .await
                    .map_err(TunnelError::from)?;
            }
            Err(err) => return Err(TunnelError::network_fatal(err)),
        }
        Ok(())
    }

    fn on_tcp_established(&mut self, client_sk: u64, client_uk: u64, server_sk: u64) -> Result<(), TunnelError> {
        if !matches!(self.role, Role::Client { .. }) {
            return Err(TunnelError::Protocol(WireError::WrongChannel(wire::OpCode::TcpEstablished)));
        }
        let pending_key = ComKey { sk: client_sk, uk: client_uk };
        let Some(mut conn) = self.table.remove(&pending_key) else {
            warn!(client_sk, client_uk, "tcp_established for unknown pending connection");
            return Ok(());
        };
        conn.state = SubState::Established;
        // Only now does the original enable POLLIN on the accepted socket;
        // we start the reader task here rather than at accept time.
        if let Some(reader) = conn.pending_reader.take() {
            let key = ComKey { sk: server_sk, uk: client_uk };
            conn.reader_task = Some(spawn_sub_reader(key, reader, self.events_tx.clone()));
        }
        // Re-key from (client_sk, uk) to (server_sk, uk): the server's table
        // is keyed by server_sk (it assigned it), so every MESSAGE/
        // TCP_DISCONNECTED the client sends from here on must name the
        // connection the way the server's table will look it up.
        let new_key = ComKey { sk: server_sk, uk: client_uk };
        self.table.insert(new_key, conn);
        Ok(())
    }

    fn on_tcp_disconnected(&mut self, sk: u64, uk: u64) {
        let key = ComKey { sk, uk };
        if self.table.remove(&key).is_none() {
            debug!(sk, uk, "tcp_disconnected for unknown or already-closed ComKey");
        }
    }

    async fn on_bridge_accept(&mut self, bridge: u16, stream: io::Result<TcpStream>) -> Result<(), TunnelError> {
        let Role::Client { uk_alloc, .. } = &mut self.role else {
            return Ok(());
        };
        let stream = match stream {
            Ok(s) => s,
            Err(err) => {
                warn!(bridge, %err, "local bridge accept failed");
                return Ok(());
            }
        };
        let uk = uk_alloc.alloc();
        let sk = self.sk_alloc.alloc();
        let (reader, writer) = stream.into_split();
        let key = ComKey { sk, uk };
        self.table.insert(
            key,
            SubConnection {
                state: SubState::Pending,
                bridge,
                protocol: BridgeProtocol::Tcp,
                writer,
                reader_task: None,
                pending_reader: Some(reader),
            },
        );
        wire::write_connect(&mut self.tcp_writer, bridge, sk, uk)
            .await
            .map_err(TunnelError::from)?;
        Ok(())
    }

    async fn on_bridge_udp_read(&mut self, bridge: u16, payload: Vec<u8>, peer: SocketAddr) -> Result<(), TunnelError> {
        if let Some(entry) = self.bridge_udp.get_mut(&bridge) {
            entry.peer = Some(peer);
        }
        self.send_udp_payload(bridge, &payload).await
    }

    /// `send_udp_payload(bridge, n)` (the header-reservation path collapses
    /// to a plain prefix-and-send here since we don't reuse one buffer
    /// across tasks; see DESIGN.md for why the allocation-free contract is
    /// relaxed at this boundary).
    async fn send_udp_payload(&mut self, bridge: u16, payload: &[u8]) -> Result<(), TunnelError> {
        if self.bypass {
            let mut region = [0u8; wire::TCP_MESSAGE_HEADER_SIZE];
            let offset = wire::encode_udp_bypass_header(&mut region, bridge, payload.len() as u32);
            self.tcp_writer
                .write_all(&region[offset..])
                .await
                .map_err(WireError::from)
                .map_err(TunnelError::from)?;
            self.tcp_writer.write_all(payload).await.map_err(WireError::from).map_err(TunnelError::from)?;
        } else if let (Some(sock), Some(peer)) = (&self.udp_socket, self.udp_peer) {
            let mut region = [0u8; wire::UDP_MESSAGE_HEADER_SIZE];
            let offset = wire::encode_udp_message_header(&mut region, bridge, payload.len() as u32);
            let mut datagram = Vec::with_capacity(region.len() - offset + payload.len());
            datagram.extend_from_slice(&region[offset..]);
            datagram.extend_from_slice(payload);
            let _ = sock.send_to(&datagram, peer).await;
        }
        let now = Instant::now();
        self.udp_ka_next = now + UDP_KA_INTERVAL;
        Ok(())
    }

    async fn dispatch_udp_datagram(&mut self, datagram: &[u8]) -> Result<(), TunnelError> {
        match wire::decode_udp_frame(datagram) {
            Ok(UdpFrame::Nop) => {}
            Ok(UdpFrame::UdpConnected) => {
                debug!("late UDP_CONNECTED after handshake, ignoring");
            }
            Ok(UdpFrame::Message { bridge, payload }) => self.deliver_to_bridge_udp(bridge, &payload).await?,
            Err(err) => return Err(TunnelError::from(err)),
        }
        Ok(())
    }

    async fn on_sub_read(&mut self, key: ComKey, result: io::Result<Vec<u8>>) -> Result<(), TunnelError> {
        match result {
            Ok(data) if !data.is_empty() => {
                let mut region = [0u8; wire::TCP_MESSAGE_HEADER_SIZE];
                let offset = wire::encode_sub_message_header(&mut region, key.sk, key.uk, data.len() as u32);
                self.tcp_writer
                    .write_all(&region[offset..])
                    .await
                    .map_err(WireError::from)
                    .map_err(TunnelError::from)?;
                self.tcp_writer.write_all(&data).await.map_err(WireError::from).map_err(TunnelError::from)?;
            }
            _ => {
                if self.table.remove(&key).is_some() {
                    wire::write_tcp_disconnected(&mut self.tcp_writer, key.sk, key.uk)
                        .await
                        .map_err(TunnelError::from)?;
                }
            }
        }
        Ok(())
    }

    pub fn tcp_writer_mut(&mut self) -> &mut OwnedWriteHalf {
        &mut self.tcp_writer
    }
}

fn spawn_tcp_reader(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    bypass: bool,
    tx: mpsc::Sender<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = wire::read_tcp_frame(&mut reader, bypass).await;
            let is_terminal = frame.is_err();
            if tx.send(Event::TcpFrame(frame)).await.is_err() || is_terminal {
                return;
            }
        }
    })
}

fn spawn_udp_reader(socket: std::sync::Arc<UdpSocket>, tx: mpsc::Sender<Event>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; wire::MESSAGE_BUFFER_SIZE];
        loop {
            match socket.recv(&mut buf).await {
                Ok(n) => {
                    if tx.send(Event::UdpDatagram(buf[..n].to_vec())).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    })
}

fn spawn_bridge_acceptor(
    bridge: u16,
    listener: tokio::net::TcpListener,
    tx: mpsc::Sender<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let outcome = listener.accept().await.map(|(s, _)| s);
            if tx.send(Event::BridgeAccepted { bridge, stream: outcome }).await.is_err() {
                return;
            }
        }
    })
}

fn spawn_bridge_udp_reader(
    bridge: u16,
    socket: std::sync::Arc<UdpSocket>,
    tx: mpsc::Sender<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; wire::MESSAGE_BUFFER_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    let event = Event::BridgeUdpRead {
                        bridge,
                        payload: buf[..n].to_vec(),
                        peer,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    })
}

fn spawn_sub_reader(
    key: ComKey,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::Sender<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; wire::MESSAGE_BUFFER_SIZE];
        loop {
            let result = reader.read(&mut buf).await.map(|n| buf[..n].to_vec());
            let is_terminal = !matches!(result, Ok(ref data) if !data.is_empty());
            if tx.send(Event::SubRead { key, result }).await.is_err() || is_terminal {
                return;
            }
        }
    })
}
