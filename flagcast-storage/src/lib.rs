//! Storage backends for flagcast.
//!
//! The relational side (catalog, versioned activation values, delta
//! assembly) lives in [`postgres`]; the key-value side (version watermark,
//! usage sentinels) is an in-process cache in [`cache`] behind the
//! `KeyValueCache` trait, and [`stats`] implements the usage sink on top of
//! it.

pub mod cache;
pub mod postgres;
pub mod stats;
