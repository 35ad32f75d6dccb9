//! Caller-facing stream client.
//!
//! The client validates channels against the backend profile, registers
//! subscribers with the dispatcher, and lets the multiplexer decide which
//! physical connection serves each channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::rest::RestClient;
use crate::retry::ReconnectBackoff;
use crate::stream::channel::{Channel, SubscriptionId};
use crate::stream::connection::WorkerContext;
use crate::stream::dispatcher::{Dispatcher, EventCallback};
use crate::stream::error::StreamError;
use crate::stream::event::CanonicalEvent;
use crate::stream::multiplexer::Multiplexer;
use crate::stream::profile::{BackendProfile, TransportKind};
use crate::stream::transport::{NetworkOpener, TransportOpener};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const PING_INTERVAL: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RECONNECT_BASE: Duration = Duration::from_secs(1);
    pub const RECONNECT_MAX: Duration = Duration::from_secs(60);
    pub const RECONNECT_JITTER: Duration = Duration::from_millis(250);
    pub const STABILITY_WINDOW: Duration = Duration::from_secs(60);
    pub const UNSUBSCRIBE_GRACE: Duration = Duration::from_secs(2);
    pub const POLL_INTERVAL: Duration = Duration::from_secs(30);
    pub const POLL_LIMIT: u32 = 40;
    pub const MALFORMED_FRAME_LIMIT: u32 = 20;
    pub const MALFORMED_WINDOW: Duration = Duration::from_secs(10);
}

/// Timing and threshold configuration shared by every connection.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// A connection with no frame for this long is treated as failed.
    pub idle_timeout: Duration,
    /// Client websocket ping period; `None` disables pings.
    pub ping_interval: Option<Duration>,
    pub connect_timeout: Duration,
    pub backoff: ReconnectBackoff,
    /// Open time after which the reconnect attempt counter resets.
    pub stability_window: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub unsubscribe_grace: Duration,
    pub poll_interval: Duration,
    pub poll_limit: u32,
    pub malformed_frame_limit: u32,
    pub malformed_window: Duration,
    /// Fetch the newest id on first connect so an early reconnect can resume.
    pub seed_cursor: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout: StreamDefaults::IDLE_TIMEOUT,
            ping_interval: Some(StreamDefaults::PING_INTERVAL),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            backoff: ReconnectBackoff {
                base: StreamDefaults::RECONNECT_BASE,
                max: StreamDefaults::RECONNECT_MAX,
                jitter: StreamDefaults::RECONNECT_JITTER,
            },
            stability_window: StreamDefaults::STABILITY_WINDOW,
            max_reconnect_attempts: None,
            unsubscribe_grace: StreamDefaults::UNSUBSCRIBE_GRACE,
            poll_interval: StreamDefaults::POLL_INTERVAL,
            poll_limit: StreamDefaults::POLL_LIMIT,
            malformed_frame_limit: StreamDefaults::MALFORMED_FRAME_LIMIT,
            malformed_window: StreamDefaults::MALFORMED_WINDOW,
            seed_cursor: true,
        }
    }
}

impl StreamConfig {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stability_window(mut self, window: Duration) -> Self {
        self.stability_window = window;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_unsubscribe_grace(mut self, grace: Duration) -> Self {
        self.unsubscribe_grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_limit(mut self, limit: u32) -> Self {
        self.poll_limit = limit;
        self
    }

    pub fn with_malformed_threshold(mut self, limit: u32, window: Duration) -> Self {
        self.malformed_frame_limit = limit;
        self.malformed_window = window;
        self
    }

    pub fn with_seed_cursor(mut self, seed: bool) -> Self {
        self.seed_cursor = seed;
        self
    }
}

/// Realtime stream client for one backend instance.
///
/// Workers are spawned lazily on the first subscription, so `subscribe`
/// must be called from within a tokio runtime.
#[derive(Clone)]
pub struct StreamClient {
    profile: Arc<BackendProfile>,
    token: Option<SecretString>,
    config: StreamConfig,
    rest: Option<Arc<dyn RestClient>>,
    opener: Option<Arc<dyn TransportOpener>>,
    runtime: Arc<OnceLock<Runtime>>,
    shut_down: Arc<AtomicBool>,
}

struct Runtime {
    dispatcher: Dispatcher,
    multiplexer: Multiplexer,
}

impl StreamClient {
    pub fn new(profile: BackendProfile, token: Option<SecretString>) -> Self {
        Self {
            profile: Arc::new(profile),
            token,
            config: StreamConfig::default(),
            rest: None,
            opener: None,
            runtime: Arc::new(OnceLock::new()),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// REST collaborator used for cursor seeding, resume, and polling.
    pub fn with_rest(mut self, rest: Arc<dyn RestClient>) -> Self {
        self.rest = Some(rest);
        self
    }

    /// Replaces the network transport opener.
    pub fn with_opener(mut self, opener: Arc<dyn TransportOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    /// Subscribes `callback` to `channel`.
    ///
    /// Events for one channel reach the callback in order, one at a time. A
    /// terminal `error` event ends the subscription.
    pub fn subscribe<F>(&self, channel: Channel, callback: F) -> Result<SubscriptionId, StreamClientError>
    where
        F: Fn(CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe_callback(channel, Arc::new(callback))
    }

    /// Subscribes to `channel` and returns a receiver of its events.
    pub fn subscribe_receiver(
        &self,
        channel: Channel,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<CanonicalEvent>), StreamClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(channel, move |event| {
            let _ = tx.send(event);
        })?;
        Ok((id, rx))
    }

    fn subscribe_callback(
        &self,
        channel: Channel,
        callback: EventCallback,
    ) -> Result<SubscriptionId, StreamClientError> {
        self.validate(&channel)?;
        let runtime = self.runtime()?;

        let (id, binding) = runtime.dispatcher.register(channel.clone(), callback);
        runtime.multiplexer.acquire(&channel, &binding);
        debug!(event = "stream_subscribed", subscription = %id, channel = %channel);
        Ok(id)
    }

    /// Ends a subscription. Its connection is released after the grace
    /// period once no subscription uses it.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), StreamClientError> {
        let runtime = self
            .runtime
            .get()
            .ok_or(StreamClientError::UnknownSubscription(id))?;
        let (channel, connection) = runtime
            .dispatcher
            .remove(id)
            .ok_or(StreamClientError::UnknownSubscription(id))?;
        runtime.multiplexer.release(&channel, connection);
        debug!(event = "stream_unsubscribed", subscription = %id, channel = %channel);
        Ok(())
    }

    /// Number of open or reconnecting physical connections.
    pub fn connection_count(&self) -> usize {
        self.runtime
            .get()
            .map(|runtime| runtime.multiplexer.live_connections())
            .unwrap_or(0)
    }

    /// Closes every connection and drops every subscription. Further
    /// subscribes fail with [`StreamClientError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(runtime) = self.runtime.get() {
            runtime.dispatcher.clear();
            runtime.multiplexer.close_all().await;
        }
        info!(event = "stream_client_shutdown", backend = %self.profile.backend_id);
    }

    fn validate(&self, channel: &Channel) -> Result<(), StreamClientError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StreamClientError::ShutDown);
        }
        if !self.profile.supports(channel) {
            return Err(StreamClientError::UnsupportedChannel {
                channel: channel.key(),
                backend: self.profile.backend_id.clone(),
            });
        }
        if self.profile.transport_for(channel) == TransportKind::Polling && self.rest.is_none() {
            return Err(StreamClientError::MissingRestClient(
                self.profile.backend_id.clone(),
            ));
        }
        Ok(())
    }

    fn runtime(&self) -> Result<&Runtime, StreamClientError> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(StreamClientError::NoRuntime);
        }

        let opener = match &self.opener {
            Some(opener) => Arc::clone(opener),
            None => Arc::new(NetworkOpener::new(self.config.connect_timeout)?),
        };
        let dispatcher = Dispatcher::spawn();
        let multiplexer = Multiplexer::new(WorkerContext {
            profile: Arc::clone(&self.profile),
            opener,
            rest: self.rest.clone(),
            token: self.token.clone(),
            config: Arc::new(self.config.clone()),
            sink: dispatcher.sink(),
        });
        let _ = self.runtime.set(Runtime {
            dispatcher,
            multiplexer,
        });
        self.runtime.get().ok_or(StreamClientError::ShutDown)
    }
}

/// Errors returned by [`StreamClient`] operations.
#[derive(Debug, Error)]
pub enum StreamClientError {
    #[error("channel {channel} is not supported by backend {backend}")]
    UnsupportedChannel { channel: String, backend: String },

    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("backend {0} only supports polling and needs a rest client")]
    MissingRestClient(String),

    #[error("stream client must be used within a tokio runtime")]
    NoRuntime,

    #[error("stream client is shut down")]
    ShutDown,

    #[error(transparent)]
    Stream(#[from] StreamError),
}
