use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{message::DEFAULT_MAX_FRAME_BYTES, registry::DuplicatePolicy, relay::RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting chat clients over TCP.
    Server(ServerArgs),
    /// Connect to a relay and chat one-to-one from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "127.0.0.1:8888")]
    pub listen: SocketAddr,

    /// What happens when a nickname that is already online logs in again.
    #[arg(
        long,
        env = "CHAT_RELAY_DUPLICATE_POLICY",
        value_enum,
        default_value_t = DuplicatePolicy::Reject
    )]
    pub duplicate_policy: DuplicatePolicy,

    /// Drop chat records whose sender differs from the session's nickname.
    #[arg(long, env = "CHAT_RELAY_VERIFY_SENDER")]
    pub verify_sender: bool,

    /// Largest accepted record, in bytes.
    #[arg(long, env = "CHAT_RELAY_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            duplicate_policy: self.duplicate_policy,
            verify_sender: self.verify_sender,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname other users will see and address messages to.
    #[arg(long, env = "CHAT_RELAY_NICKNAME")]
    pub nickname: String,

    /// Address of the relay to connect to.
    #[arg(long, env = "CHAT_RELAY_SERVER", default_value = "127.0.0.1:8888")]
    pub server: SocketAddr,

    /// How long to wait for the TCP connection before giving up.
    #[arg(long, env = "CHAT_RELAY_CONNECT_TIMEOUT_MS", default_value_t = 3000)]
    pub connect_timeout_ms: u64,

    /// Directory received files are written to. Without it files are only announced.
    #[arg(long, env = "CHAT_RELAY_DOWNLOADS")]
    pub downloads: Option<PathBuf>,

    /// Largest record to send or accept, in bytes. Match the relay's setting.
    #[arg(long, env = "CHAT_RELAY_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
}
