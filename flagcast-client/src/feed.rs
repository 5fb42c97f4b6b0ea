//! Background subscriber: keeps the snapshot fresh with auto-reconnection.
//!
//! The loop opens the stream with the highest version already applied, so
//! recovery is entirely client-owned: after any error it reconnects with
//! backoff and the server replays whatever the client has not seen yet.

use crate::cache::FeatureCache;
use crate::client::UpdateCallback;
use flagcast_core::dto::{GetFeatureRequest, GetFeatureResponse};
use futures03::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// 500 ms doubling up to the 10 s cap; reset whenever the stream yields.
pub(crate) static DEFAULT_BACKOFF: Lazy<ExponentialBackoff> = Lazy::new(|| {
    ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(Duration::from_secs(10))
});

/// Sleeps for the next backoff step; false means the client was closed.
pub(crate) async fn sleep_backoff(
    backoff: &mut ExponentialBackoff,
    token: &CancellationToken,
) -> bool {
    let Some(delay) = backoff.next() else {
        return false;
    };
    debug!(?delay, "backing off before reconnect");
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

pub(crate) async fn run_subscriber(
    ws_url: String,
    service_name: String,
    cache: Arc<FeatureCache>,
    on_update: Option<UpdateCallback>,
    token: CancellationToken,
) {
    let mut backoff = DEFAULT_BACKOFF.clone();

    'reconnect: loop {
        if token.is_cancelled() {
            return;
        }
        let connected = tokio::select! {
            _ = token.cancelled() => return,
            connected = connect_async(ws_url.as_str()) => connected,
        };
        let mut stream: WsStream = match connected {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(%err, "subscription connect failed");
                if !sleep_backoff(&mut backoff, &token).await {
                    return;
                }
                continue 'reconnect;
            }
        };

        let request = GetFeatureRequest {
            service_name: service_name.clone(),
            last_version: cache.last_version(),
        };
        info!(last_version = request.last_version, "subscription opened");
        let frame = serde_json::to_string(&request).expect("subscribe request serializes");
        if let Err(err) = stream.send(Message::Text(frame)).await {
            warn!(%err, "failed to send subscribe frame");
            if !sleep_backoff(&mut backoff, &token).await {
                return;
            }
            continue 'reconnect;
        }

        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => {
                    let _ = stream.close(None).await;
                    return;
                }
                msg = stream.next() => msg,
            };
            match msg {
                Some(Ok(Message::Text(text))) => {
                    // the stream is healthy again
                    backoff = DEFAULT_BACKOFF.clone();
                    match serde_json::from_str::<GetFeatureResponse>(&text) {
                        Ok(resp) => {
                            debug!(
                                version = resp.version,
                                features = resp.features.len(),
                                deleted = resp.deleted.len(),
                                "delta received"
                            );
                            let event = cache.apply(&resp);
                            if let Some(callback) = &on_update {
                                // a slow callback must not stall delta
                                // application
                                let callback = callback.clone();
                                tokio::spawn(async move { callback(event) });
                            }
                        }
                        Err(err) => warn!(%err, "skipping malformed delta message"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = stream.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("subscription stream ended, reconnecting");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%err, "subscription stream error, reconnecting");
                    break;
                }
            }
        }

        if !sleep_backoff(&mut backoff, &token).await {
            return;
        }
    }
}
