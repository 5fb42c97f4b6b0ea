//! Shared domain types and storage contracts for the flagcast workspace.
//!
//! This crate is dependency-light on purpose: it holds the entities of the
//! flag hierarchy, the delta tree exchanged between storage and the
//! subscription server, the wire messages both transports speak, and the
//! traits the server consumes so that gateways can be swapped (or mocked)
//! without touching service code.

pub mod dto;
pub mod models;
pub mod storage;
