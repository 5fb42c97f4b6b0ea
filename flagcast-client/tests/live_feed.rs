//! End-to-end SDK behavior against an in-process WebSocket server: delta
//! application, reconnect with the client-owned version, tombstones and the
//! stats pipeline.

use flagcast_client::{FeatureClient, Options, UpdateEvent};
use flagcast_core::dto::{
    DeletedItem, FeatureItem, GetFeatureRequest, GetFeatureResponse, PropsItem, SendStatsRequest,
};
use futures03::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// What the mock server plays back for one subscriber connection.
struct Script {
    deltas: Vec<GetFeatureResponse>,
    /// Drop the connection after the script, forcing the client to
    /// reconnect.
    close_after: bool,
}

struct MockServer {
    addr: SocketAddr,
    /// Subscribe frames in arrival order; reconnects show up as new
    /// entries carrying the client's own last_version.
    subscriptions: mpsc::UnboundedReceiver<GetFeatureRequest>,
    stats: Arc<Mutex<Vec<SendStatsRequest>>>,
}

async fn spawn_server(scripts: Vec<Script>) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (subs_tx, subscriptions) = mpsc::unbounded_channel();
    let stats: Arc<Mutex<Vec<SendStatsRequest>>> = Arc::default();
    let scripts = Arc::new(Mutex::new(VecDeque::from(scripts)));

    let stats_clone = stats.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let subs_tx = subs_tx.clone();
            let stats = stats_clone.clone();
            let scripts = scripts.clone();
            tokio::spawn(async move {
                let mut ws = accept_async(socket).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    if let Ok(request) = serde_json::from_str::<GetFeatureRequest>(&text) {
                        subs_tx.send(request).ok();
                        let script = scripts.lock().unwrap().pop_front();
                        let Some(script) = script else { continue };
                        for delta in script.deltas {
                            let frame = serde_json::to_string(&delta).unwrap();
                            if ws.send(Message::Text(frame)).await.is_err() {
                                return;
                            }
                        }
                        if script.close_after {
                            let _ = ws.close(None).await;
                            return;
                        }
                    } else if let Ok(record) = serde_json::from_str::<SendStatsRequest>(&text) {
                        stats.lock().unwrap().push(record);
                    }
                }
            });
        }
    });

    MockServer { addr, subscriptions, stats }
}

fn delta_v2() -> GetFeatureResponse {
    GetFeatureResponse {
        version: 2,
        features: vec![
            FeatureItem {
                all: 30,
                name: "A".into(),
                props: vec![PropsItem {
                    all: 40,
                    name: "country".into(),
                    item: HashMap::from([("US".to_string(), 70)]),
                }],
            },
            FeatureItem { all: 90, name: "B".into(), props: vec![] },
        ],
        deleted: vec![],
    }
}

fn tombstone_delta(version: i64, feature: &str) -> GetFeatureResponse {
    GetFeatureResponse { version, features: vec![], deleted: vec![DeletedItem::feature(feature)] }
}

fn update_channel() -> (Arc<dyn Fn(UpdateEvent) + Send + Sync>, mpsc::UnboundedReceiver<UpdateEvent>)
{
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(move |event| {
        tx.send(event).ok();
    }), rx)
}

async fn recv_event(rx: &mut mpsc::UnboundedReceiver<UpdateEvent>) -> UpdateEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an update event")
        .expect("update channel closed")
}

#[test_log::test(tokio::test)]
async fn applies_deltas_and_reconnects_with_its_own_version() {
    let mut server = spawn_server(vec![
        Script { deltas: vec![delta_v2()], close_after: true },
        Script { deltas: vec![tombstone_delta(8, "A")], close_after: false },
    ])
    .await;

    let (on_update, mut events) = update_channel();
    let client = FeatureClient::connect(
        &format!("ws://{}/v1", server.addr),
        "checkout",
        Options { on_update: Some(on_update), ..Options::default() },
    )
    .unwrap();

    // initial subscription asks from zero
    let first = server.subscriptions.recv().await.unwrap();
    assert_eq!(first.service_name, "checkout");
    assert_eq!(first.last_version, 0);

    let event = recv_event(&mut events).await;
    assert_eq!(event.version, 2);
    let snapshot = client.snapshot();
    assert_eq!(snapshot["A"].all_percent, 30);
    assert_eq!(snapshot["A"].keys["country"].all_percent, 40);
    assert_eq!(snapshot["A"].keys["country"].items["US"], 70);
    assert_eq!(snapshot["B"].all_percent, 90);
    assert_eq!(client.last_version(), 2);

    // the server dropped the stream; the client reconnects with what it has
    let second = server.subscriptions.recv().await.unwrap();
    assert_eq!(second.last_version, 2);

    // the replayed tombstone removes the feature
    let event = recv_event(&mut events).await;
    assert_eq!(event.version, 8);
    let snapshot = client.snapshot();
    assert!(!snapshot.contains_key("A"));
    assert!(snapshot.contains_key("B"));
    assert_eq!(client.last_version(), 8);

    client.close().await;
}

#[test_log::test(tokio::test)]
async fn usage_events_reach_the_server() {
    let enabled_feature = GetFeatureResponse {
        version: 1,
        features: vec![FeatureItem { all: 100, name: "feat".into(), props: vec![] }],
        deleted: vec![],
    };
    let server = spawn_server(vec![Script { deltas: vec![enabled_feature], close_after: false }])
        .await;

    let (on_update, mut events) = update_channel();
    let client = FeatureClient::connect(
        &format!("ws://{}/v1", server.addr),
        "checkout",
        Options { auto_send_stats: true, on_update: Some(on_update), ..Options::default() },
    )
    .unwrap();

    recv_event(&mut events).await;
    assert!(client.is_enabled("feat", "seed", &[]));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let stats = server.stats.lock().unwrap();
                if stats
                    .iter()
                    .any(|record| record.service_name == "checkout" && record.feature_name == "feat")
                {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("usage event never reached the server");

    client.close().await;
}

#[test_log::test(tokio::test)]
async fn malformed_frames_do_not_kill_the_feed() {
    // A script the server cannot produce through the typed helper: inject a
    // raw garbage frame between two valid deltas by running a bespoke
    // server.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut ws = accept_async(socket).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    if serde_json::from_str::<GetFeatureRequest>(&text).is_ok() {
                        ws.send(Message::Text("{not json".into())).await.ok();
                        let frame = serde_json::to_string(&delta_v2()).unwrap();
                        ws.send(Message::Text(frame)).await.ok();
                    }
                }
            });
        }
    });

    let (on_update, mut events) = update_channel();
    let client = FeatureClient::connect(
        &format!("ws://{addr}/v1"),
        "checkout",
        Options { on_update: Some(on_update), ..Options::default() },
    )
    .unwrap();

    // the garbage frame is skipped, the following delta still lands
    let event = recv_event(&mut events).await;
    assert_eq!(event.version, 2);
    client.close().await;
}
