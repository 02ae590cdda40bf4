//! Bridges: the configured forwarding rules that make up a tunnel session.

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeProtocol {
    Tcp,
    Udp,
}

impl BridgeProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeProtocol::Tcp => "tcp",
            BridgeProtocol::Udp => "udp",
        }
    }
}

/// One line of the client's config file: a local bind endpoint and the
/// destination the server should reach on its own side.
#[derive(Debug, Clone)]
pub struct Bridge {
    pub index: u16,
    pub protocol: BridgeProtocol,
    pub local_addr: SocketAddr,
    pub dest_host: String,
    pub dest_port: u16,
}

/// The server's view of a bridge: just enough to dial or relay to the final
/// destination. Populated from `CONFIG` frames as the client streams them.
#[derive(Debug, Clone)]
pub struct ServerBridge {
    pub protocol: BridgeProtocol,
    pub dest_host: String,
    pub dest_port: u16,
}

impl ServerBridge {
    pub fn dest_addr_string(&self) -> String {
        format!("{}:{}", self.dest_host, self.dest_port)
    }
}
