//! End-to-end scenarios: a client `Engine` and a server `Engine` talking to
//! each other over real loopback sockets, driving the handshake and the
//! dispatch loop exactly as `client::run`/`server::run` would, minus the
//! outer reconnect-forever loop (each test drives one session).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use super::bridge::{Bridge, BridgeProtocol};
use super::engine::Engine;
use super::handshake::{self, HandshakeRole};
use super::wire;

fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

async fn spawn_tcp_echo() -> u16 {
    let port = free_tcp_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn spawn_udp_echo() -> u16 {
    let port = free_udp_port();
    let socket = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else { return };
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    port
}

/// Connects a client/server engine pair over a loopback proto-TCP socket,
/// running the session handshake on each side exactly as the roles do, and
/// hands back the still-running server task plus the client's `Engine`
/// (not yet driving its main loop -- the caller still needs to send
/// `CONFIG` and call `start_client_bridges` first).
async fn connect_session_with_bridges(bypass: bool, bridges: Vec<Bridge>) -> (tokio::task::JoinHandle<()>, Engine) {
    let proto_port = free_tcp_port();
    let listener = TcpListener::bind(("127.0.0.1", proto_port)).await.unwrap();

    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let outcome = handshake::run_handshake(
            &mut stream,
            HandshakeRole::Server { can_resume: false },
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
        let (reader, writer) = stream.into_split();
        let mut engine = Engine::new_server(writer, reader, outcome.udp_socket, outcome.udp_peer, outcome.bypass);
        let _ = engine.run().await;
    });

    let mut client_stream = TcpStream::connect(("127.0.0.1", proto_port)).await.unwrap();
    let outcome = handshake::run_handshake(
        &mut client_stream,
        HandshakeRole::Client { want_resume: false, bypass },
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(outcome.bypass, bypass);
    let (reader, writer) = client_stream.into_split();
    let client_engine = Engine::new_client(writer, reader, outcome.udp_socket, outcome.udp_peer, outcome.bypass, bridges);

    (server_task, client_engine)
}

#[tokio::test]
async fn tcp_bridge_echo_round_trip() {
    let echo_port = spawn_tcp_echo().await;
    let client_bridge_port = free_tcp_port();
    let bridge = Bridge {
        index: 0,
        protocol: BridgeProtocol::Tcp,
        local_addr: format!("127.0.0.1:{client_bridge_port}").parse().unwrap(),
        dest_host: "127.0.0.1".to_string(),
        dest_port: echo_port,
    };

    let (_server_task, mut client_engine) = connect_session_with_bridges(false, vec![bridge]).await;
    wire::write_config(client_engine.tcp_writer_mut(), BridgeProtocol::Tcp, echo_port, "127.0.0.1")
        .await
        .unwrap();
    client_engine.start_client_bridges().await.unwrap();
    tokio::spawn(async move {
        let _ = client_engine.run().await;
    });

    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut app = TcpStream::connect(("127.0.0.1", client_bridge_port)).await.unwrap();
    app.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    app.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn udp_bridge_echo_round_trip() {
    let echo_port = spawn_udp_echo().await;
    let client_bridge_port = free_udp_port();
    let bridge = Bridge {
        index: 0,
        protocol: BridgeProtocol::Udp,
        local_addr: format!("127.0.0.1:{client_bridge_port}").parse().unwrap(),
        dest_host: "127.0.0.1".to_string(),
        dest_port: echo_port,
    };

    let (_server_task, mut client_engine) = connect_session_with_bridges(false, vec![bridge]).await;
    wire::write_config(client_engine.tcp_writer_mut(), BridgeProtocol::Udp, echo_port, "127.0.0.1")
        .await
        .unwrap();
    client_engine.start_client_bridges().await.unwrap();
    tokio::spawn(async move {
        let _ = client_engine.run().await;
    });

    tokio::time::sleep(Duration::from_millis(150)).await;

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{client_bridge_port}").parse().unwrap();
    app.send_to(b"ping", target).await.unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), app.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");
}

#[tokio::test]
async fn udp_bridge_echo_round_trip_via_bypass() {
    let echo_port = spawn_udp_echo().await;
    let client_bridge_port = free_udp_port();
    let bridge = Bridge {
        index: 0,
        protocol: BridgeProtocol::Udp,
        local_addr: format!("127.0.0.1:{client_bridge_port}").parse().unwrap(),
        dest_host: "127.0.0.1".to_string(),
        dest_port: echo_port,
    };

    let (_server_task, mut client_engine) = connect_session_with_bridges(true, vec![bridge]).await;
    wire::write_config(client_engine.tcp_writer_mut(), BridgeProtocol::Udp, echo_port, "127.0.0.1")
        .await
        .unwrap();
    client_engine.start_client_bridges().await.unwrap();
    tokio::spawn(async move {
        let _ = client_engine.run().await;
    });

    tokio::time::sleep(Duration::from_millis(150)).await;

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{client_bridge_port}").parse().unwrap();
    app.send_to(b"ping", target).await.unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), app.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");
}

#[tokio::test]
async fn refused_server_side_dial_reports_tcp_disconnected() {
    let refused_port = free_tcp_port(); // nothing is listening here
    let client_bridge_port = free_tcp_port();
    let bridge = Bridge {
        index: 0,
        protocol: BridgeProtocol::Tcp,
        local_addr: format!("127.0.0.1:{client_bridge_port}").parse().unwrap(),
        dest_host: "127.0.0.1".to_string(),
        dest_port: refused_port,
    };

    let (_server_task, mut client_engine) = connect_session_with_bridges(false, vec![bridge]).await;
    wire::write_config(client_engine.tcp_writer_mut(), BridgeProtocol::Tcp, refused_port, "127.0.0.1")
        .await
        .unwrap();
    client_engine.start_client_bridges().await.unwrap();
    tokio::spawn(async move {
        let _ = client_engine.run().await;
    });

    tokio::time::sleep(Duration::from_millis(150)).await;

    // The local app connects; the server's dial to `refused_port` fails, so
    // the tunnel should tear its end back down.
    let mut app = TcpStream::connect(("127.0.0.1", client_bridge_port)).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), app.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "tunnel should close the local socket after a refused dial");
}

#[tokio::test]
async fn keepalive_nops_keep_an_idle_session_alive() {
    let (_server_task, client_engine) = connect_session_with_bridges(false, Vec::new()).await;
    let mut client_engine = client_engine;
    client_engine.start_client_bridges().await.unwrap();
    let handle = tokio::spawn(async move { client_engine.run().await });

    // Comfortably longer than one tcp_ka_interval (2s) and one
    // udp_ka_interval (5s) but well under tcp_timeout (4s) triggering on a
    // silent channel -- NOPs on both keep last_tcp_packet advancing.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!handle.is_finished(), "session should still be alive after idle keepalive traffic");
    handle.abort();
}
