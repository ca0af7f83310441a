//! Realtime pub/sub and RPC modules.
//!
//! - `client`: per-application facade for notifications, remote calls, and
//!   subscriptions.
//! - `connection`: one physical connection per application with session
//!   queueing and fixed-delay reconnects.
//! - `manager`: registry of connections keyed by application id.
//! - `envelope` / `topic`: wire envelope construction and topic naming.
//! - `proto`: WAMP messages exchanged with the router.
//! - `session`: an established WAMP session and its request bookkeeping.
//! - `subscription`: subscription descriptors, handles, and local dispatch.
//! - `transport`: connector seam and the websocket transport worker.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Public facade combining envelopes, topics, and the shared connection.
pub mod client;
/// Connection lifecycle, session queueing, and reconnect loop.
pub mod connection;
/// Message envelope and operation types.
pub mod envelope;
/// Connection registry keyed by application id.
pub mod manager;
/// WAMP wire messages.
pub mod proto;
/// Established WAMP session state.
pub mod session;
/// Subscription descriptors and local dispatch.
pub mod subscription;
/// Topic naming grammar.
pub mod topic;
/// Connector seam and websocket transport.
pub mod transport;

pub use client::{RealtimeClient, RealtimeError};
pub use connection::{ConnectionHandle, ConnectionState, RealtimeOptions, SendStatus};
pub use envelope::{Envelope, MessageOp, MessageOrigin};
pub use manager::{ConnectionManager, ShutdownGuard};
pub use subscription::{Notification, Subscription, SubscriptionDescriptor};

// Lock sections never panic while held, so a poisoned lock still holds
// consistent state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
