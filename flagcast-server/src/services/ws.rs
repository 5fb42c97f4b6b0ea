//! WebSocket streaming surface.
//!
//! Each connection is one actor. The client opens the stream with a
//! subscribe frame `{service_name, last_version}`; from then on a 1 s tick
//! asks the assembler for a delta and pushes it whenever something changed
//! or the watermark advanced. The actor keeps its own `last_version`, so a
//! reconnecting client owns recovery entirely; the server never buffers or
//! retries on its behalf. Usage records may arrive as frames on the same
//! connection and are admitted one by one.

use crate::deltas::DeltaAssembler;
use crate::stats::StatsService;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use flagcast_core::dto::{GetFeatureRequest, SendStatsRequest};
use metrics::counter;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct WsData {
    assembler: Arc<DeltaAssembler>,
    stats: Arc<StatsService>,
}

impl WsData {
    pub fn new(assembler: Arc<DeltaAssembler>, stats: Arc<StatsService>) -> Self {
        Self { assembler, stats }
    }
}

pub async fn subscribe(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<WsData>,
) -> Result<HttpResponse, actix_web::Error> {
    ws::start(
        WsSubscription::new(data.assembler.clone(), data.stats.clone()),
        &req,
        stream,
    )
}

/// Client frames are distinguished by their required fields: a subscribe
/// request carries `last_version`, a stats record carries `feature_name`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ClientFrame {
    Subscribe(GetFeatureRequest),
    Stats(SendStatsRequest),
}

pub struct WsSubscription {
    assembler: Arc<DeltaAssembler>,
    stats: Arc<StatsService>,
    subscription: Option<GetFeatureRequest>,
    in_flight: bool,
}

impl WsSubscription {
    pub fn new(assembler: Arc<DeltaAssembler>, stats: Arc<StatsService>) -> Self {
        Self { assembler, stats, subscription: None, in_flight: false }
    }

    fn tick(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(request) = self.subscription.clone() else {
            return;
        };
        // An assembly can outlast the tick when the store is slow; never
        // pipeline a second one behind it.
        if self.in_flight {
            return;
        }
        self.in_flight = true;

        let assembler = self.assembler.clone();
        let fut = async move {
            assembler
                .assemble(&request.service_name, request.last_version)
                .await
        };
        ctx.spawn(fut.into_actor(self).map(|res, act, ctx| {
            act.in_flight = false;
            let resp = match res {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(%err, "closing stream after invalid subscription");
                    ctx.close(Some(ws::CloseReason {
                        code: ws::CloseCode::Invalid,
                        description: Some(err.to_string()),
                    }));
                    ctx.stop();
                    return;
                }
            };
            let Some(subscription) = act.subscription.as_mut() else {
                return;
            };
            let nothing_new = resp.features.is_empty() &&
                resp.deleted.is_empty() &&
                resp.version <= subscription.last_version;
            if nothing_new {
                return;
            }
            match serde_json::to_string(&resp) {
                Ok(text) => {
                    if resp.version > subscription.last_version {
                        subscription.last_version = resp.version;
                    }
                    debug!(
                        service_name = %subscription.service_name,
                        version = resp.version,
                        features = resp.features.len(),
                        deleted = resp.deleted.len(),
                        "delta emitted"
                    );
                    counter!("flagcast_deltas_emitted_total").increment(1);
                    ctx.text(text);
                }
                Err(err) => error!(%err, "failed to serialize delta message"),
            }
        }));
    }

    fn handle_frame(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(ClientFrame::Subscribe(request)) => {
                if request.service_name.is_empty() {
                    warn!("rejecting subscription without a service name");
                    ctx.close(Some(ws::CloseReason {
                        code: ws::CloseCode::Invalid,
                        description: Some("service_name is required".to_owned()),
                    }));
                    ctx.stop();
                    return;
                }
                info!(
                    service_name = %request.service_name,
                    last_version = request.last_version,
                    "subscription opened"
                );
                self.subscription = Some(request);
            }
            Ok(ClientFrame::Stats(record)) => {
                let stats = self.stats.clone();
                ctx.spawn(
                    async move {
                        stats
                            .record(&record.service_name, &record.feature_name)
                            .await;
                    }
                    .into_actor(self)
                    .map(|_, _, _| ()),
                );
            }
            // a bad frame is dropped, the stream survives
            Err(err) => warn!(%err, "unparseable client frame, skipping"),
        }
    }
}

impl Actor for WsSubscription {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(TICK_INTERVAL, |act, ctx| act.tick(ctx));
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSubscription {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_frame(&text, ctx),
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Close(reason)) => {
                debug!("client closed the stream");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "websocket protocol error, dropping stream");
                ctx.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::tests::RecordingSink;
    use actix_web::App;
    use async_trait::async_trait;
    use flagcast_core::models::FeatureDelta;
    use flagcast_core::storage::{DeltaGateway, StorageError};
    use futures03::{SinkExt, StreamExt};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_tungstenite::tungstenite::Message;

    /// Replays a script of `(version, deltas)` answers, then keeps
    /// reporting the final version with no changes.
    struct ScriptedGateway {
        script: Mutex<VecDeque<(i64, Vec<FeatureDelta>)>>,
        final_version: i64,
    }

    #[async_trait]
    impl DeltaGateway for ScriptedGateway {
        async fn get_new_by_service(
            &self,
            _service_name: &str,
            last_version: i64,
        ) -> Result<(i64, Vec<FeatureDelta>), StorageError> {
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                return Ok(next);
            }
            Ok((self.final_version.max(last_version), vec![]))
        }
    }

    fn ws_data(gateway: ScriptedGateway, sink: Arc<RecordingSink>) -> web::Data<WsData> {
        web::Data::new(WsData::new(
            Arc::new(DeltaAssembler::new(Arc::new(gateway))),
            Arc::new(StatsService::new(sink)),
        ))
    }

    async fn connect(
        srv: &actix_test::TestServer,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let url = srv.url("/v1/ws").replace("http://", "ws://");
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .unwrap();
        stream
    }

    fn subscribe_frame(service_name: &str, last_version: i64) -> Message {
        Message::Text(
            serde_json::to_string(&GetFeatureRequest {
                service_name: service_name.into(),
                last_version,
            })
            .unwrap(),
        )
    }

    #[actix_web::test]
    async fn streams_deltas_and_admits_stats() {
        let mut delta = FeatureDelta::unchanged("search");
        delta.value = 30;
        let gateway = ScriptedGateway {
            script: Mutex::new(VecDeque::from([(7, vec![delta])])),
            final_version: 7,
        };
        let sink = Arc::new(RecordingSink::default());
        let data = ws_data(gateway, sink.clone());
        let srv = actix_test::start(move || {
            App::new()
                .app_data(data.clone())
                .service(web::resource("/v1/ws").route(web::get().to(subscribe)))
        });

        let mut stream = connect(&srv).await;
        stream
            .send(subscribe_frame("checkout", 0))
            .await
            .unwrap();

        // first tick fires after one second
        let frame = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("timed out waiting for a delta")
            .unwrap()
            .unwrap();
        let resp: flagcast_core::dto::GetFeatureResponse =
            serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(resp.version, 7);
        assert_eq!(resp.features[0].name, "search");

        // stats records ride the same connection
        stream
            .send(Message::Text(
                serde_json::to_string(&SendStatsRequest {
                    service_name: "checkout".into(),
                    feature_name: "search".into(),
                })
                .unwrap(),
            ))
            .await
            .unwrap();
        // let the actor drain the record before tearing the stream down
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            *sink.records.lock().unwrap(),
            vec![("checkout".to_owned(), "search".to_owned())]
        );
        stream.send(Message::Close(None)).await.unwrap();
    }

    #[actix_web::test]
    async fn caught_up_subscriber_receives_nothing() {
        let gateway = ScriptedGateway { script: Mutex::new(VecDeque::new()), final_version: 5 };
        let data = ws_data(gateway, Arc::new(RecordingSink::default()));
        let srv = actix_test::start(move || {
            App::new()
                .app_data(data.clone())
                .service(web::resource("/v1/ws").route(web::get().to(subscribe)))
        });

        let mut stream = connect(&srv).await;
        stream
            .send(subscribe_frame("checkout", 5))
            .await
            .unwrap();

        let res = tokio::time::timeout(Duration::from_millis(2500), stream.next()).await;
        assert!(res.is_err(), "expected silence for a caught-up subscriber");
    }

    #[actix_web::test]
    async fn watermark_advance_alone_is_emitted() {
        // no features changed, but the version moved past the subscriber's
        let gateway = ScriptedGateway {
            script: Mutex::new(VecDeque::from([(9, vec![])])),
            final_version: 9,
        };
        let data = ws_data(gateway, Arc::new(RecordingSink::default()));
        let srv = actix_test::start(move || {
            App::new()
                .app_data(data.clone())
                .service(web::resource("/v1/ws").route(web::get().to(subscribe)))
        });

        let mut stream = connect(&srv).await;
        stream
            .send(subscribe_frame("checkout", 3))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("timed out waiting for the watermark")
            .unwrap()
            .unwrap();
        let resp: flagcast_core::dto::GetFeatureResponse =
            serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(resp.version, 9);
        assert!(resp.features.is_empty());
    }
}
