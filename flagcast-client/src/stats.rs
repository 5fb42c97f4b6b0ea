//! Background stats pipeline.
//!
//! Evaluations enqueue feature names on a bounded channel; this worker
//! drains it one record at a time over a persistent stream. Telemetry is
//! best effort by design: the producer never blocks (full buffer drops the
//! event) and a record in flight during a reconnect is lost. On close the
//! worker drains what is already queued, then says goodbye with a close
//! frame.

use crate::feed::{sleep_backoff, WsStream, DEFAULT_BACKOFF};
use flagcast_core::dto::SendStatsRequest;
use futures03::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) async fn run_stats(
    ws_url: String,
    service_name: String,
    mut rx: mpsc::Receiver<String>,
    token: CancellationToken,
) {
    let mut backoff = DEFAULT_BACKOFF.clone();
    let mut stream: Option<WsStream> = None;

    loop {
        if stream.is_none() {
            let connected = tokio::select! {
                _ = token.cancelled() => break,
                connected = connect_async(ws_url.as_str()) => connected,
            };
            match connected {
                Ok((new_stream, _)) => {
                    debug!("stats stream connected");
                    stream = Some(new_stream);
                    backoff = DEFAULT_BACKOFF.clone();
                }
                Err(err) => {
                    warn!(%err, "stats connect failed");
                    if !sleep_backoff(&mut backoff, &token).await {
                        break;
                    }
                    continue;
                }
            }
        }

        let feature_name = tokio::select! {
            _ = token.cancelled() => break,
            feature_name = rx.recv() => match feature_name {
                Some(feature_name) => feature_name,
                // all senders dropped
                None => break,
            },
        };
        if let Some(active) = stream.as_mut() {
            if let Err(err) = send_record(active, &service_name, &feature_name).await {
                // the record is lost; stats are best-effort telemetry
                warn!(%err, %feature_name, "stats send failed, reconnecting");
                stream = None;
            }
        }
    }

    // drain whatever is already queued, then close cleanly
    if let Some(mut active) = stream {
        while let Ok(feature_name) = rx.try_recv() {
            if send_record(&mut active, &service_name, &feature_name)
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = active.close(None).await;
    }
}

async fn send_record(
    stream: &mut WsStream,
    service_name: &str,
    feature_name: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let record = SendStatsRequest {
        service_name: service_name.to_owned(),
        feature_name: feature_name.to_owned(),
    };
    let frame = serde_json::to_string(&record).expect("stats record serializes");
    stream.send(Message::Text(frame)).await
}
