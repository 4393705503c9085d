//! Routes a peer serves to the relay.
//!
//! - `call`: answers every relayed envelope with a greeting addressed back
//!   to its sender.
//! - `client-status`: logs the relay's status notice and streams the peer's
//!   uptime in seconds at a fixed interval.

use std::time::{Duration, Instant};

use futures_util::{StreamExt, future, stream};
use switchyard_proto::codec;
use switchyard_proto::envelope::ClientId;
use switchyard_proto::route;
use switchyard_proto::session::{ExchangeError, ExchangeItem, Incoming, ResponseStream, Routes};

/// Shortest status interval; `tokio::time::interval` rejects zero.
const MIN_STATUS_INTERVAL: Duration = Duration::from_millis(1);

/// Reference peer routes for `client_id`.
#[must_use]
pub fn routes(client_id: ClientId, status_interval: Duration) -> Routes {
    let started = Instant::now();
    let every = status_interval.max(MIN_STATUS_INTERVAL);
    Routes::new()
        .route(route::CALL, move |inbound: Incoming| -> ResponseStream {
            call(client_id.clone(), inbound)
        })
        .route(route::CLIENT_STATUS, move |inbound: Incoming| -> ResponseStream {
            status(started, every, inbound)
        })
}

fn call(client_id: ClientId, inbound: Incoming) -> ResponseStream {
    inbound
        .filter_map(move |item: ExchangeItem| {
            let reply = match item.map(|bytes| codec::decode_envelope(&bytes)) {
                Ok(Ok(envelope)) => {
                    tracing::info!(
                        sender = %envelope.sender,
                        receiver = %envelope.receiver,
                        content = %envelope.content,
                        "message received"
                    );
                    let greeting = format!("Hello from {client_id}");
                    match codec::encode_envelope(&envelope.reply(client_id.clone(), greeting)) {
                        Ok(bytes) => Some(Ok(bytes)),
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to encode reply");
                            None
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "undecodable envelope");
                    None
                }
                Err(e) => {
                    tracing::debug!(error = %e, "call exchange ended");
                    None
                }
            };
            future::ready(reply)
        })
        .boxed()
}

fn status(started: Instant, every: Duration, inbound: Incoming) -> ResponseStream {
    tokio::spawn(inbound.for_each(|item| {
        match item.map(|bytes| codec::decode::<String>(&bytes)) {
            Ok(Ok(notice)) => tracing::info!(status = %notice, "connection status"),
            Ok(Err(e)) => tracing::debug!(error = %e, "undecodable status notice"),
            Err(e) => tracing::debug!(error = %e, "status exchange ended"),
        }
        future::ready(())
    }));

    let ticks = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    stream::unfold(ticks, move |mut ticks| async move {
        ticks.tick().await;
        let uptime = started.elapsed().as_secs().to_string();
        let item = codec::encode(&uptime).map_err(|e| ExchangeError::Remote(e.to_string()));
        Some((item, ticks))
    })
    .boxed()
}
