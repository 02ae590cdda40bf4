//! Command-line surface: `rallonge client <host> <port> <config-file>
//! [--udp-bypass]` and `rallonge server <tcp-port>`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "rallonge", about = "Bidirectional TCP/UDP tunnel", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Overrides `RUST_LOG` for this run.
    #[arg(long, global = true, env = "RALLONGE_LOG")]
    pub log: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Dial a server and multiplex the bridges named in `config_file`.
    Client {
        server_host: String,
        server_port: u16,
        config_file: PathBuf,
        /// Carry UDP bridges over the TCP control channel instead of
        /// opening an auxiliary UDP socket.
        #[arg(short = 'u', long = "udp-bypass", alias = "ub")]
        udp_bypass: bool,
    },
    /// Listen for a single tunnel client and reproduce its bridges locally.
    Server { tcp_port: u16 },
}
