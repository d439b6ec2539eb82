use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{
    registry::{DEFAULT_OUTBOUND_CAPACITY, MAX_OUTBOUND_CAPACITY},
    relay::RelayConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections from chat clients.
    Relay(RelayArgs),
    /// Connect to a relay from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Interface to bind. The default listens on all interfaces.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 12345)]
    pub port: u16,

    /// Lines queued per client before a slow client is disconnected.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY, value_parser = parse_outbound_capacity)]
    pub outbound_capacity: usize,
}

impl RelayArgs {
    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            outbound_capacity: self.outbound_capacity,
        }
    }
}

fn parse_outbound_capacity(value: &str) -> Result<usize, String> {
    let capacity: usize = value
        .parse()
        .map_err(|err| format!("`{value}` is not a line count: {err}"))?;
    if !(1..=MAX_OUTBOUND_CAPACITY).contains(&capacity) {
        return Err(format!(
            "must be between 1 and {MAX_OUTBOUND_CAPACITY}, got {capacity}"
        ));
    }
    Ok(capacity)
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name sent with every message.
    #[arg(long)]
    pub nickname: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: SocketAddr,

    /// Image uploaded as this client's avatar right after connecting.
    #[arg(long)]
    pub avatar: Option<PathBuf>,
}
