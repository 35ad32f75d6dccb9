//! Realtime streaming client over federated social-network backends.
//!
//! The crate is organized by concern:
//! - `stream`: channel subscriptions, backend profiles, connections, and
//!   canonical event delivery.
//! - `rest`: REST collaborator used for cursor seeding, resume, and polling.
//! - `retry`: shared retry, backoff, and timeout utilities.

/// REST collaborator trait and reqwest-backed implementation.
pub mod rest;
/// Retry, reconnect backoff, and timeout helpers.
pub mod retry;
/// Realtime stream client, backend profiles, and event model.
pub mod stream;
