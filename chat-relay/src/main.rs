use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use chat_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    relay::Relay,
};

/// `RUST_LOG` wins when set. The client prints the conversation on stdout, so
/// its diagnostics go to stderr and default to warnings only.
fn init_tracing(command: &Command) {
    let (default_filter, client) = match command {
        Command::Server(_) => ("info", false),
        Command::Client(_) => ("warn", true),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = fmt().with_env_filter(filter).with_target(false);

    let _ = if client {
        subscriber.with_writer(std::io::stderr).try_init()
    } else {
        subscriber.try_init()
    };
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = args.relay_config();
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let relay = Relay::new(listener, config.clone());
    let addr = relay.local_addr()?;

    // The address stays last in the message; scripts read it from there.
    info!(
        duplicate_policy = ?config.duplicate_policy,
        verify_sender = config.verify_sender,
        max_frame_bytes = config.max_frame_bytes,
        "relay listening on {addr}"
    );

    relay.run_until_ctrl_c().await.inspect_err(|err| {
        error!(error = ?err, "relay stopped");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => client::run(args).await,
    }
}
