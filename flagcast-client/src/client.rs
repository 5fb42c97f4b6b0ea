//! The SDK entry point.

use crate::bucket::percentage_hit;
use crate::cache::{FeatureCache, FeatureConfig, UpdateEvent};
use crate::{feed, stats, ClientError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

/// Evaluations that enable a flag enqueue at most this many pending usage
/// events; beyond that events are dropped rather than blocking the caller.
const STATS_BUFFER: usize = 1024;

pub type UpdateCallback = Arc<dyn Fn(UpdateEvent) + Send + Sync>;

pub struct Options {
    /// Enqueue a usage event whenever `is_enabled` returns true.
    pub auto_send_stats: bool,
    /// Fired (on its own task) after every applied delta.
    pub on_update: Option<UpdateCallback>,
    /// Version to resume from; 0 requests the full state.
    pub initial_version: i64,
}

impl Default for Options {
    fn default() -> Self {
        Self { auto_send_stats: false, on_update: None, initial_version: 0 }
    }
}

/// A connected SDK instance.
///
/// Two background workers run from construction until [`close`]: the
/// subscriber keeping the snapshot fresh and the stats drain. Flag checks
/// never touch the network.
///
/// [`close`]: FeatureClient::close
pub struct FeatureClient {
    cache: Arc<FeatureCache>,
    stats_tx: mpsc::Sender<String>,
    auto_send_stats: bool,
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl FeatureClient {
    /// Starts the client against `endpoint` (e.g. `ws://host:4242/v1`).
    ///
    /// Must be called from within a tokio runtime; the background workers
    /// are spawned immediately.
    pub fn connect(
        endpoint: &str,
        service_name: &str,
        options: Options,
    ) -> Result<Self, ClientError> {
        if service_name.is_empty() {
            return Err(ClientError::MissingServiceName);
        }
        let url = Url::parse(endpoint)
            .map_err(|err| ClientError::InvalidEndpoint(err.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::InvalidEndpoint(format!(
                "expected a ws:// or wss:// url, got `{}`",
                url.scheme()
            )));
        }
        let ws_url = format!("{}/ws", endpoint.trim_end_matches('/'));

        let cache = Arc::new(FeatureCache::new(options.initial_version));
        let (stats_tx, stats_rx) = mpsc::channel(STATS_BUFFER);
        let token = CancellationToken::new();

        let workers = vec![
            tokio::spawn(feed::run_subscriber(
                ws_url.clone(),
                service_name.to_owned(),
                cache.clone(),
                options.on_update,
                token.clone(),
            )),
            tokio::spawn(stats::run_stats(
                ws_url,
                service_name.to_owned(),
                stats_rx,
                token.clone(),
            )),
        ];

        Ok(Self { cache, stats_tx, auto_send_stats: options.auto_send_stats, token, workers })
    }

    /// Evaluates a flag for the subject identified by `seed`.
    ///
    /// The effective percent is resolved by priority: an exact
    /// `(key, value)` match among `attrs` wins, then the key-level percent
    /// of the first attribute key the feature knows, then the
    /// feature-level percent. `attrs` are scanned in the order given;
    /// callers that may present several matching keys must order them if
    /// they need a deterministic winner.
    ///
    /// `seed` should be a stable subject identifier (user id, session id):
    /// the same seed always lands in the same bucket.
    pub fn is_enabled(&self, feature_name: &str, seed: &str, attrs: &[(&str, &str)]) -> bool {
        let Some(config) = self.cache.get(feature_name) else {
            return false;
        };
        let percent = resolve_percent(&config, attrs);
        let enabled = percentage_hit(feature_name, seed, percent);
        if enabled && self.auto_send_stats {
            self.track(feature_name);
        }
        enabled
    }

    /// Enqueues a usage event. Never blocks; the event is dropped when the
    /// buffer is full.
    pub fn track(&self, feature_name: &str) {
        if self.stats_tx.try_send(feature_name.to_owned()).is_err() {
            warn!(feature_name, "stats buffer full, dropping usage event");
        }
    }

    /// An owned copy of the current snapshot; mutating it does not affect
    /// the client.
    pub fn snapshot(&self) -> HashMap<String, FeatureConfig> {
        self.cache.snapshot()
    }

    /// The highest delta version applied so far.
    pub fn last_version(&self) -> i64 {
        self.cache.last_version()
    }

    /// Stops both workers and waits for their graceful exit. Usage events
    /// already queued are flushed best-effort; anything produced after this
    /// call is dropped.
    pub async fn close(self) {
        self.token.cancel();
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(%err, "sdk worker did not exit cleanly");
            }
        }
    }
}

fn resolve_percent(config: &FeatureConfig, attrs: &[(&str, &str)]) -> i32 {
    let mut key_level = None;
    for (key, value) in attrs {
        if let Some(key_config) = config.keys.get(*key) {
            if let Some(percent) = key_config.items.get(*value) {
                return *percent;
            }
            if key_level.is_none() {
                key_level = Some(key_config.all_percent);
            }
        }
    }
    key_level.unwrap_or(config.all_percent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyConfig;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    /// A client whose workers never started: evaluation against a canned
    /// snapshot, with the stats receiver handed back for inspection.
    fn detached(
        configs: Vec<FeatureConfig>,
        auto_send_stats: bool,
    ) -> (FeatureClient, mpsc::Receiver<String>) {
        use flagcast_core::dto::{FeatureItem, GetFeatureResponse, PropsItem};

        let cache = Arc::new(FeatureCache::new(0));
        cache.apply(&GetFeatureResponse {
            version: 1,
            features: configs
                .into_iter()
                .map(|config| FeatureItem {
                    all: config.all_percent,
                    name: config.name,
                    props: config
                        .keys
                        .into_iter()
                        .map(|(name, key)| PropsItem {
                            all: key.all_percent,
                            name,
                            item: key.items,
                        })
                        .collect(),
                })
                .collect(),
            deleted: vec![],
        });
        let (stats_tx, stats_rx) = mpsc::channel(STATS_BUFFER);
        let client = FeatureClient {
            cache,
            stats_tx,
            auto_send_stats,
            token: CancellationToken::new(),
            workers: vec![],
        };
        (client, stats_rx)
    }

    fn feature(name: &str, all_percent: i32, keys: Vec<(&str, i32, Vec<(&str, i32)>)>) -> FeatureConfig {
        FeatureConfig {
            name: name.to_owned(),
            all_percent,
            keys: keys
                .into_iter()
                .map(|(key, all, items)| {
                    (
                        key.to_owned(),
                        KeyConfig {
                            all_percent: all,
                            items: items
                                .into_iter()
                                .map(|(item, percent)| (item.to_owned(), percent))
                                .collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn unknown_feature_is_disabled() {
        let (client, _rx) = detached(vec![], false);
        assert!(!client.is_enabled("ghost", "seed", &[]));
    }

    #[tokio::test]
    async fn clamps_out_of_range_percents() {
        let (client, _rx) = detached(vec![feature("feat", -5, vec![])], false);
        assert!(!client.is_enabled("feat", "seed", &[]));

        let (client, _rx) = detached(vec![feature("feat", 1000, vec![])], false);
        assert!(client.is_enabled("feat", "seed", &[]));
    }

    #[tokio::test]
    async fn priority_exact_match_then_key_then_feature() {
        let (client, _rx) = detached(
            vec![feature("search", 0, vec![("country", 100, vec![("US", 0)])])],
            false,
        );
        // exact match wins even though the key level would enable
        assert!(!client.is_enabled("search", "u1", &[("country", "US")]));
        // no exact match: the key level enables
        assert!(client.is_enabled("search", "u2", &[("country", "DE")]));
        // no attrs: the feature level (0) disables
        assert!(!client.is_enabled("search", "u3", &[]));
        // attr keys the feature does not know are ignored
        assert!(!client.is_enabled("search", "u3", &[("tier", "gold")]));
    }

    #[tokio::test]
    async fn first_supplied_attr_wins_among_exact_matches() {
        let (client, _rx) = detached(
            vec![feature(
                "search",
                0,
                vec![
                    ("country", -1, vec![("US", 100)]),
                    ("tier", -1, vec![("gold", 0)]),
                ],
            )],
            false,
        );
        assert!(client.is_enabled("search", "u1", &[("country", "US"), ("tier", "gold")]));
        assert!(!client.is_enabled("search", "u1", &[("tier", "gold"), ("country", "US")]));
    }

    #[tokio::test]
    async fn enabled_evaluation_enqueues_a_usage_event() {
        let (client, mut rx) = detached(vec![feature("feat", 100, vec![])], true);
        assert!(client.is_enabled("feat", "seed", &[]));
        let got = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("expected a usage event within 500ms")
            .unwrap();
        assert_eq!(got, "feat");
    }

    #[tokio::test]
    async fn disabled_evaluation_stays_silent() {
        let (client, mut rx) = detached(vec![feature("feat", 0, vec![])], true);
        assert!(!client.is_enabled("feat", "seed", &[]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_stats_buffer_drops_instead_of_blocking() {
        let (client, mut rx) = detached(vec![feature("feat", 100, vec![])], true);
        for _ in 0..(STATS_BUFFER + 50) {
            client.track("feat");
        }
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, STATS_BUFFER);
    }

    #[test]
    fn connect_validates_its_input() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        assert!(matches!(
            FeatureClient::connect("ws://127.0.0.1:4242/v1", "", Options::default()),
            Err(ClientError::MissingServiceName)
        ));
        assert!(matches!(
            FeatureClient::connect("not a url", "svc", Options::default()),
            Err(ClientError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            FeatureClient::connect("http://127.0.0.1:4242/v1", "svc", Options::default()),
            Err(ClientError::InvalidEndpoint(_))
        ));
    }
}
