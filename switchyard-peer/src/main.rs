//! Switchyard peer: connects to a relay, answers relayed messages, and
//! optionally sends one message of its own.
//!
//! # Usage
//!
//! ```bash
//! # Serve as "bob" until Ctrl-C
//! cargo run --bin switchyard-peer -- --id bob
//!
//! # Connect as "alice" and send one message to "bob"
//! cargo run --bin switchyard-peer -- --id alice --to bob --message "hi bob"
//! ```

use std::time::Duration;

use clap::Parser;
use futures_util::{StreamExt, stream};
use switchyard_peer::client::RelayPeer;
use switchyard_peer::responder;
use switchyard_proto::envelope::{ClientId, MessageEnvelope};

/// CLI arguments for the peer.
#[derive(clap::Parser, Debug)]
#[command(version, about = "Switchyard relay peer")]
struct PeerCliArgs {
    /// Relay WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:7000/ws", env = "SWITCHYARD_RELAY_URL")]
    relay: String,

    /// Client id to register under.
    #[arg(long)]
    id: String,

    /// Receiver to send a message to.
    #[arg(long)]
    to: Option<String>,

    /// Message content (default: a greeting).
    #[arg(long, requires = "to")]
    message: Option<String>,

    /// Send on `personal.call` instead of `group.call`.
    #[arg(long)]
    personal: bool,

    /// Seconds between status updates sent to the relay.
    #[arg(long, default_value_t = 5)]
    status_interval: u64,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "SWITCHYARD_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = PeerCliArgs::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let client_id = ClientId::new(cli.id.clone());
    if client_id.is_empty() {
        eprintln!("Error: --id must not be empty");
        std::process::exit(1);
    }

    let routes = responder::routes(
        client_id.clone(),
        Duration::from_secs(cli.status_interval),
    );
    let peer = match RelayPeer::connect(&cli.relay, client_id.clone(), routes).await {
        Ok(peer) => peer,
        Err(e) => {
            eprintln!("Error connecting to relay: {e}");
            std::process::exit(1);
        }
    };

    // Keeps the outbound exchange open while replies may still arrive.
    let _conversation = cli.to.as_deref().map(|to| {
        let content = cli
            .message
            .clone()
            .unwrap_or_else(|| format!("Hello from {client_id}"));
        let envelope = MessageEnvelope::new(client_id.clone(), to, content);
        let outbound = stream::iter([envelope]).chain(stream::pending());
        let replies = if cli.personal {
            peer.personal_call(outbound)
        } else {
            peer.group_call(outbound)
        };
        match replies {
            Ok(mut replies) => tokio::spawn(async move {
                while let Some(reply) = replies.next().await {
                    match reply {
                        Ok(envelope) => println!(
                            "Sender : {} Receiver : {} Content : {}",
                            envelope.sender, envelope.receiver, envelope.content
                        ),
                        Err(e) => {
                            tracing::warn!(error = %e, "conversation ended");
                            break;
                        }
                    }
                }
            }),
            Err(e) => {
                eprintln!("Error opening channel: {e}");
                std::process::exit(1);
            }
        }
    });

    tokio::select! {
        () = peer.closed() => {
            tracing::info!("relay connection closed");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            peer.close();
        }
    }
}
