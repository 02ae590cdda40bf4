//! Error taxonomy for the tunnel engine.
//!
//! `Usage`, `Parse`, `Protocol`, and `NetworkFatal` unwind to the top-level
//! handler in `main.rs`, which prints the message and exits non-zero.
//! A network-transient failure (a refused dial, see [`is_connection_refused`])
//! is translated into an outbound frame by the caller and never becomes a
//! `TunnelError` at all. Session loss is reported as [`super::engine::EngineExit`],
//! not a `TunnelError` variant: it drives the reconnect branch in
//! `client.rs`/`server.rs` and only reaches the top level if reconnecting
//! itself fails as `NetworkFatal`.

use thiserror::Error;

use super::wire::WireError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("{0:#}")]
    Parse(anyhow::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    #[error("network error: {0:#}")]
    NetworkFatal(anyhow::Error),
}

impl TunnelError {
    pub fn network_fatal(err: impl Into<anyhow::Error>) -> Self {
        TunnelError::NetworkFatal(err.into())
    }
}

/// A connection attempt refused by the remote end (`ECONNREFUSED`/
/// `WSAECONNREFUSED`). Per §4.5/§7 this is the one `network-transient` case
/// on the CONNECT dial path: the caller translates it into an outbound
/// `TCP_DISCONNECTED` rather than treating it as fatal. Any other dial
/// error, including a reset, is fatal.
pub fn is_connection_refused(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::ConnectionRefused
}
