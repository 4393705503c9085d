//! Switchyard relay server: routes duplex message streams between peers.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:7000
//! cargo run --bin switchyard-relay
//!
//! # Run on custom address
//! cargo run --bin switchyard-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! SWITCHYARD_ADDR=127.0.0.1:8080 cargo run --bin switchyard-relay
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use switchyard_relay::config::{RelayCliArgs, RelayConfig};
use switchyard_relay::server::{self, RelayState};

/// Upper bound on waiting for connections to close after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        status_probe = config.status_probe,
        enforce_sender = config.enforce_sender,
        "starting switchyard relay server"
    );

    let state = Arc::new(RelayState::with_config(&config));

    let handle = match server::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            handle
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
            state.shutdown();
            drain(&state).await;
        }
    }
}

/// Gives disposed connections a moment to send their close frames.
async fn drain(state: &RelayState) {
    let registry = state.registry();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = registry.len(), "connections still open at exit");
    }
}
