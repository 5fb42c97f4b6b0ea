//! Single-shot polling transport.
//!
//! For environments that cannot hold a WebSocket open: one POST fetches the
//! delta since `last_version`, another reports usage in batches. Payloads
//! are identical to the streaming surface.

use crate::ClientError;
use flagcast_core::dto::{GetFeatureRequest, GetFeatureResponse, StatsBatch};
use url::Url;

pub struct PollingClient {
    http: reqwest::Client,
    base: String,
    service_name: String,
}

impl PollingClient {
    pub fn new(endpoint: &str, service_name: &str) -> Result<Self, ClientError> {
        if service_name.is_empty() {
            return Err(ClientError::MissingServiceName);
        }
        let url = Url::parse(endpoint)
            .map_err(|err| ClientError::InvalidEndpoint(err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::InvalidEndpoint(format!(
                "expected an http:// or https:// url, got `{}`",
                url.scheme()
            )));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base: endpoint.trim_end_matches('/').to_owned(),
            service_name: service_name.to_owned(),
        })
    }

    /// Fetches the delta since `last_version`. A caught-up caller gets the
    /// current watermark with empty feature and tombstone lists.
    pub async fn fetch_updates(&self, last_version: i64) -> Result<GetFeatureResponse, ClientError> {
        let request = GetFeatureRequest { service_name: self.service_name.clone(), last_version };
        let response = self
            .http
            .post(format!("{}/updates", self.base))
            .json(&request)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Protocol(format!(
                "updates request failed with status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| ClientError::Protocol(err.to_string()))
    }

    /// Reports a batch of used feature names. Empty names are skipped by
    /// the server; an empty batch is skipped here.
    pub async fn send_stats(&self, features: &[String]) -> Result<(), ClientError> {
        if features.is_empty() {
            return Ok(());
        }
        let batch =
            StatsBatch { service_name: self.service_name.clone(), features: features.to_vec() };
        let response = self
            .http
            .post(format!("{}/stats", self.base))
            .json(&batch)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::Protocol(format!(
                "stats request failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn fetches_and_decodes_a_delta() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/updates")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "service_name": "checkout",
                "last_version": 5,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"version":7,"features":[{"all":30,"name":"search","props":[]}],"deleted":[]}"#,
            )
            .create_async()
            .await;

        let client = PollingClient::new(&format!("{}/v1", server.url()), "checkout").unwrap();
        let resp = client.fetch_updates(5).await.unwrap();
        assert_eq!(resp.version, 7);
        assert_eq!(resp.features[0].name, "search");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn surfaces_client_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/updates")
            .with_status(400)
            .with_body(r#"{"error":"service name must not be empty"}"#)
            .create_async()
            .await;

        let client = PollingClient::new(&format!("{}/v1", server.url()), "checkout").unwrap();
        let err = client.fetch_updates(0).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn sends_stats_batches() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/stats")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "service_name": "checkout",
                "features": ["a", "b"],
            })))
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;

        let client = PollingClient::new(&format!("{}/v1", server.url()), "checkout").unwrap();
        client
            .send_stats(&["a".to_owned(), "b".to_owned()])
            .await
            .unwrap();
        mock.assert_async().await;

        // an empty batch never hits the wire
        client.send_stats(&[]).await.unwrap();
    }

    #[test]
    fn rejects_ws_endpoints() {
        assert!(matches!(
            PollingClient::new("ws://127.0.0.1:4242/v1", "svc"),
            Err(ClientError::InvalidEndpoint(_))
        ));
    }
}
