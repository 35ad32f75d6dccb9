//! Realtime stream modules.
//!
//! - `client`: caller-facing subscribe / unsubscribe facade.
//! - `profile`: per-backend capability tables and presets.
//! - `normalize`: raw frames to canonical events.
//! - `connection`: connection state machine and reconnecting worker.
//! - `multiplexer`: channel to physical connection mapping.
//! - `dispatcher`: ordered per-channel fan-out to subscribers.
//! - `polling`: cursor-based fallback for backends without push.

/// Channel identity and subscription ids.
pub mod channel;
/// Stream client facade and configuration.
pub mod client;
/// Connection state machine and worker task.
pub mod connection;
/// Subscriber fan-out.
pub mod dispatcher;
/// Stream error taxonomy.
pub mod error;
/// Canonical events and cursors.
pub mod event;
/// Connection registry.
pub mod multiplexer;
/// Frame normalization.
pub mod normalize;
/// Polling fallback.
pub mod polling;
/// Backend profiles.
pub mod profile;
/// Raw wire frames.
pub mod proto;
/// Transport collaborator and network transports.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
