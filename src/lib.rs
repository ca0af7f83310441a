//! Rust SDK for Neutrino data and realtime APIs.
//!
//! The crate is organized by transport surface:
//! - `config`: application identity, token, and endpoints.
//! - `data_api`: HTTP client for key-addressed records.
//! - `object`: record objects with merge semantics, optionally API-backed.
//! - `realtime`: WAMP pub/sub notifications and remote calls over one shared
//!   websocket per application.
//! - `retry`: shared retry and timeout utilities.

/// Application configuration.
pub mod config;
/// Data API client and error types.
pub mod data_api;
/// Data objects and their API-backed variant.
pub mod object;
/// Realtime connections, clients, and wire types.
pub mod realtime;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
