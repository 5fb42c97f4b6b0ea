//! Single-shot JSON endpoints for environments that cannot keep a stream
//! open. Semantically the polling surface is one tick of the streaming
//! surface.

use crate::deltas::DeltaAssembler;
use crate::stats::StatsService;
use actix_web::{web, HttpResponse};
use flagcast_core::dto::{GetFeatureRequest, StatsBatch};
use flagcast_core::storage::StorageError;
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

pub struct RpcHandler {
    assembler: Arc<DeltaAssembler>,
    stats: Arc<StatsService>,
}

impl RpcHandler {
    pub fn new(assembler: Arc<DeltaAssembler>, stats: Arc<StatsService>) -> Self {
        Self { assembler, stats }
    }
}

pub async fn updates(
    data: web::Data<RpcHandler>,
    body: web::Json<GetFeatureRequest>,
) -> HttpResponse {
    match data
        .assembler
        .assemble(&body.service_name, body.last_version)
        .await
    {
        Ok(resp) => {
            counter!("flagcast_poll_requests_total").increment(1);
            HttpResponse::Ok().json(resp)
        }
        Err(StorageError::InvalidInput(msg)) => {
            HttpResponse::BadRequest().json(json!({ "error": msg }))
        }
        Err(err) => {
            error!(%err, "polling delta assembly failed");
            HttpResponse::InternalServerError().json(json!({ "error": "internal error" }))
        }
    }
}

pub async fn stats(data: web::Data<RpcHandler>, body: web::Json<StatsBatch>) -> HttpResponse {
    if body.service_name.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "service_name is required" }));
    }
    if body.features.is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "features must not be empty" }));
    }
    for feature in &body.features {
        if feature.is_empty() {
            continue;
        }
        data.stats
            .record(&body.service_name, feature)
            .await;
    }
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::tests::RecordingSink;
    use actix_web::{test, App};
    use async_trait::async_trait;
    use flagcast_core::dto::GetFeatureResponse;
    use flagcast_core::models::FeatureDelta;
    use flagcast_core::storage::DeltaGateway;

    struct FixedGateway {
        version: i64,
    }

    #[async_trait]
    impl DeltaGateway for FixedGateway {
        async fn get_new_by_service(
            &self,
            service_name: &str,
            last_version: i64,
        ) -> Result<(i64, Vec<FeatureDelta>), StorageError> {
            if service_name.is_empty() {
                return Err(StorageError::InvalidInput("service name must not be empty".into()));
            }
            if last_version >= self.version {
                return Ok((self.version, vec![]));
            }
            let mut delta = FeatureDelta::unchanged("search");
            delta.value = 30;
            Ok((self.version, vec![delta]))
        }
    }

    fn handler(sink: Arc<RecordingSink>) -> web::Data<RpcHandler> {
        let assembler = Arc::new(DeltaAssembler::new(Arc::new(FixedGateway { version: 7 })));
        web::Data::new(RpcHandler::new(assembler, Arc::new(StatsService::new(sink))))
    }

    #[actix_web::test]
    async fn updates_returns_delta_and_watermark() {
        let app = test::init_service(
            App::new()
                .app_data(handler(Arc::new(RecordingSink::default())))
                .route("/v1/updates", web::post().to(updates)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/updates")
            .set_json(GetFeatureRequest { service_name: "checkout".into(), last_version: 0 })
            .to_request();
        let resp: GetFeatureResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.version, 7);
        assert_eq!(resp.features[0].name, "search");

        // a caught-up poller gets the watermark and nothing else
        let req = test::TestRequest::post()
            .uri("/v1/updates")
            .set_json(GetFeatureRequest { service_name: "checkout".into(), last_version: 7 })
            .to_request();
        let resp: GetFeatureResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.version, 7);
        assert!(resp.features.is_empty());
    }

    #[actix_web::test]
    async fn empty_service_name_is_a_client_error() {
        let app = test::init_service(
            App::new()
                .app_data(handler(Arc::new(RecordingSink::default())))
                .route("/v1/updates", web::post().to(updates)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/updates")
            .set_json(GetFeatureRequest { service_name: "".into(), last_version: 0 })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn stats_batch_is_admitted_per_record() {
        let sink = Arc::new(RecordingSink::default());
        let app = test::init_service(
            App::new()
                .app_data(handler(sink.clone()))
                .route("/v1/stats", web::post().to(stats)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/stats")
            .set_json(StatsBatch {
                service_name: "checkout".into(),
                features: vec!["a".into(), "".into(), "b".into()],
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(
            *sink.records.lock().unwrap(),
            vec![
                ("checkout".to_owned(), "a".to_owned()),
                ("checkout".to_owned(), "b".to_owned()),
            ]
        );
    }

    #[actix_web::test]
    async fn stats_without_identity_is_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(handler(Arc::new(RecordingSink::default())))
                .route("/v1/stats", web::post().to(stats)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/stats")
            .set_json(StatsBatch { service_name: "".into(), features: vec!["a".into()] })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }
}
