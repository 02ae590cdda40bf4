//! The client's bridge config file: one whitespace-separated line per
//! bridge, `proto chost cport shost sport`. Parsing is a fatal error on any
//! unrecognized token; this mirrors the original tool's strictness and gives
//! the operator an immediate signal that a line is malformed rather than a
//! silently-skipped bridge.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;

use super::bridge::{Bridge, BridgeProtocol};
use super::errors::TunnelError;

pub fn load_bridges(path: &Path) -> Result<Vec<Bridge>, TunnelError> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("config: read {}", path.display()))
        .map_err(TunnelError::NetworkFatal)?;

    let mut bridges = Vec::new();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bridge = parse_line(line, bridges.len() as u16)
            .with_context(|| format!("config: {}:{}", path.display(), lineno + 1))
            .map_err(TunnelError::Parse)?;
        bridges.push(bridge);
    }
    Ok(bridges)
}

fn parse_line(line: &str, index: u16) -> anyhow::Result<Bridge> {
    let mut tokens = line.split_whitespace();

    let proto = tokens.next().context("missing protocol")?;
    let protocol = match proto {
        "tcp" => BridgeProtocol::Tcp,
        "udp" => BridgeProtocol::Udp,
        other => anyhow::bail!("unknown protocol {other:?} (expected tcp|udp)"),
    };

    let chost = tokens.next().context("missing client host")?;
    let cport: u16 = tokens
        .next()
        .context("missing client port")?
        .parse()
        .context("client port is not a valid u16")?;
    let shost = tokens.next().context("missing server host")?;
    let sport: u16 = tokens
        .next()
        .context("missing server port")?
        .parse()
        .context("server port is not a valid u16")?;

    if let Some(extra) = tokens.next() {
        anyhow::bail!("unexpected extra token {extra:?}");
    }

    let local_addr: SocketAddr = format!("{chost}:{cport}")
        .parse()
        .with_context(|| format!("invalid client bind address {chost}:{cport}"))?;

    Ok(Bridge {
        index,
        protocol,
        local_addr,
        dest_host: shost.to_string(),
        dest_port: sport,
    })
}
