use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    server::{DEFAULT_LISTEN, ServerConfig},
    session::{DEFAULT_READ_RETRIES, DEFAULT_WRITE_TIMEOUT_MS, SessionConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Consecutive unreadable lines tolerated before a client is disconnected.
    #[arg(long, default_value_t = DEFAULT_READ_RETRIES)]
    pub read_retries: u32,

    /// Milliseconds a single write to a client may take before it is abandoned.
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT_MS)]
    pub write_timeout_ms: u64,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            listen: args.listen,
            session: SessionConfig {
                read_retries: args.read_retries,
                write_timeout: Duration::from_millis(args.write_timeout_ms),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: SocketAddr,

    /// Username to answer the prompt with. Typed interactively when omitted.
    #[arg(long)]
    pub name: Option<String>,
}
