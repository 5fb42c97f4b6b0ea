//! Stats admission: accepts usage records from both transports and hands
//! them to the sink. One bad record is dropped with a log line; it never
//! fails the stream or batch it arrived in.

use flagcast_core::storage::StatsGateway;
use metrics::counter;
use std::sync::Arc;
use tracing::warn;

pub struct StatsService {
    sink: Arc<dyn StatsGateway>,
}

impl StatsService {
    pub fn new(sink: Arc<dyn StatsGateway>) -> Self {
        Self { sink }
    }

    pub async fn record(&self, service_name: &str, feature_name: &str) {
        if service_name.is_empty() || feature_name.is_empty() {
            warn!(service_name, feature_name, "dropping stats record with empty identity");
            return;
        }
        self.sink
            .record_usage(service_name, feature_name)
            .await;
        counter!("flagcast_stats_records_total").increment(1);
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub records: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl StatsGateway for RecordingSink {
        async fn record_usage(&self, service_name: &str, feature_name: &str) {
            self.records
                .lock()
                .unwrap()
                .push((service_name.to_owned(), feature_name.to_owned()));
        }

        async fn is_used(&self, feature_name: &str) -> bool {
            self.records
                .lock()
                .unwrap()
                .iter()
                .any(|(_, feature)| feature == feature_name)
        }

        async fn is_service_used(&self, service_name: &str) -> bool {
            self.records
                .lock()
                .unwrap()
                .iter()
                .any(|(service, _)| service == service_name)
        }
    }

    #[tokio::test]
    async fn admits_records_and_drops_empty_identities() {
        let sink = Arc::new(RecordingSink::default());
        let service = StatsService::new(sink.clone());

        service.record("checkout", "new_cart").await;
        service.record("", "new_cart").await;
        service.record("checkout", "").await;

        assert_eq!(
            *sink.records.lock().unwrap(),
            vec![("checkout".to_owned(), "new_cart".to_owned())]
        );
    }
}
