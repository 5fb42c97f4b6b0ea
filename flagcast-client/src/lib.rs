//! Client SDK for the flagcast feature-flag service.
//!
//! The client keeps an in-memory snapshot of every feature its service may
//! see, kept fresh by a background subscriber over WebSocket. Flag checks
//! are local: a deterministic bucket hash against a caller-provided seed
//! decides enablement, so the same subject gets the same answer on every
//! host running any SDK. Usage telemetry flows back over a second,
//! best-effort stream.
//!
//! ```no_run
//! use flagcast_client::{FeatureClient, Options};
//!
//! # async fn demo() -> Result<(), flagcast_client::ClientError> {
//! let client = FeatureClient::connect(
//!     "ws://127.0.0.1:4242/v1",
//!     "checkout",
//!     Options { auto_send_stats: true, ..Options::default() },
//! )?;
//! if client.is_enabled("new_cart", "user-42", &[("country", "US")]) {
//!     // roll out the new cart
//! }
//! # client.close().await;
//! # Ok(())
//! # }
//! ```

mod bucket;
mod cache;
mod client;
mod feed;
mod rpc;
mod stats;

pub use cache::{FeatureConfig, KeyConfig, UpdateEvent};
pub use client::{FeatureClient, Options, UpdateCallback};
pub use rpc::PollingClient;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
    #[error("service name is required")]
    MissingServiceName,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}
