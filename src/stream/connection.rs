//! Connection state machine and the worker task that owns one physical
//! transport.
//!
//! The worker connects, reads frames, watches liveness, and reconnects with
//! backoff. It never touches subscriber state: normalized events leave through
//! the dispatcher queue, and channel membership arrives as commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::rest::RestClient;
use crate::retry::{with_timeout, ReconnectBackoff};
use crate::stream::channel::Channel;
use crate::stream::client::StreamConfig;
use crate::stream::dispatcher::EventSink;
use crate::stream::error::StreamError;
use crate::stream::event::{CanonicalEvent, CursorTracker, EventCursor, EventType};
use crate::stream::normalize::normalize_frame;
use crate::stream::polling::fetch_since;
use crate::stream::profile::{BackendProfile, TransportKind};
use crate::stream::proto::{render_frames, RawFrame};
use crate::stream::transport::{Transport, TransportOpener, TransportRequest};

/// Lifecycle of one physical connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// What happens after a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureOutcome {
    /// Wait `delay`, then connect again.
    Retry { delay: Duration },
    /// The connection is closed; subscribers get a terminal event.
    Close,
}

/// Pure connection state machine. Time is passed in so transitions are
/// deterministic under test.
#[derive(Clone, Debug)]
pub struct ConnectionState {
    status: ConnectionStatus,
    reconnect_attempt: u32,
    opened_at: Option<Instant>,
    backoff_deadline: Option<Instant>,
    backoff: ReconnectBackoff,
    stability_window: Duration,
    max_reconnect_attempts: Option<u32>,
}

impl ConnectionState {
    pub fn new(
        backoff: ReconnectBackoff,
        stability_window: Duration,
        max_reconnect_attempts: Option<u32>,
    ) -> Self {
        Self {
            status: ConnectionStatus::Idle,
            reconnect_attempt: 0,
            opened_at: None,
            backoff_deadline: None,
            backoff,
            stability_window,
            max_reconnect_attempts,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.backoff.clone(),
            config.stability_window,
            config.max_reconnect_attempts,
        )
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn backoff_deadline(&self) -> Option<Instant> {
        self.backoff_deadline
    }

    /// `Idle → Connecting`, or `Reconnecting → Connecting` once the backoff
    /// deadline has elapsed, which counts one more reconnect attempt.
    pub fn begin_connect(&mut self) -> bool {
        match self.status {
            ConnectionStatus::Idle => {
                self.status = ConnectionStatus::Connecting;
                true
            }
            ConnectionStatus::Reconnecting => {
                self.status = ConnectionStatus::Connecting;
                self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
                self.backoff_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// `Connecting → Open`. The attempt counter is kept until the connection
    /// proves stable.
    pub fn on_open(&mut self, now: Instant) {
        if self.status == ConnectionStatus::Connecting {
            self.status = ConnectionStatus::Open;
            self.opened_at = Some(now);
        }
    }

    /// Whether the open connection has outlived the stability window.
    pub fn is_stable(&self, now: Instant) -> bool {
        self.status == ConnectionStatus::Open
            && self
                .opened_at
                .is_some_and(|opened| now.saturating_duration_since(opened) >= self.stability_window)
    }

    /// Applies a failure from `Connecting` or `Open`.
    pub fn on_failure(&mut self, error: &StreamError, now: Instant) -> FailureOutcome {
        if self.status == ConnectionStatus::Closed {
            return FailureOutcome::Close;
        }
        if error.is_fatal() {
            self.close();
            return FailureOutcome::Close;
        }
        if self.is_stable(now) {
            self.reconnect_attempt = 0;
        }
        if self
            .max_reconnect_attempts
            .is_some_and(|cap| self.reconnect_attempt >= cap)
        {
            self.close();
            return FailureOutcome::Close;
        }

        let delay = self
            .backoff
            .delay_with_hint(self.reconnect_attempt, error.retry_after());
        self.status = ConnectionStatus::Reconnecting;
        self.opened_at = None;
        self.backoff_deadline = Some(now + delay);
        FailureOutcome::Retry { delay }
    }

    /// Moves to `Closed`. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.status == ConnectionStatus::Closed {
            return false;
        }
        self.status = ConnectionStatus::Closed;
        self.opened_at = None;
        self.backoff_deadline = None;
        true
    }
}

/// Counts malformed frames in a sliding window.
#[derive(Clone, Debug)]
pub(crate) struct MalformedWindow {
    limit: u32,
    window: Duration,
    started: Option<Instant>,
    count: u32,
}

impl MalformedWindow {
    pub(crate) fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            started: None,
            count: 0,
        }
    }

    /// Records `rejected` frames; returns `true` once the limit is exceeded.
    pub(crate) fn record(&mut self, rejected: usize, now: Instant) -> bool {
        if rejected == 0 || self.limit == 0 {
            return false;
        }
        match self.started {
            Some(started) if now.saturating_duration_since(started) < self.window => {}
            _ => {
                self.started = Some(now);
                self.count = 0;
            }
        }
        self.count = self.count.saturating_add(rejected as u32);
        self.count > self.limit
    }
}

/// Channel membership changes sent to a connection worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionCommand {
    Attach(Channel),
    Detach(Channel),
    Close,
}

/// Owner-side handle of a connection worker.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    pub(crate) id: u64,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: u64,
        commands: mpsc::UnboundedSender<ConnectionCommand>,
        closed: Arc<AtomicBool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            commands,
            closed,
            task,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.commands.is_closed()
    }

    pub(crate) fn send(&self, command: ConnectionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Requests close. Idempotent.
    pub(crate) fn close(&self) {
        let _ = self.commands.send(ConnectionCommand::Close);
    }

    /// Waits until the worker has released its resources.
    pub(crate) async fn join(self) {
        let _ = self.task.await;
    }
}

/// Shared dependencies of connection and polling workers.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) profile: Arc<BackendProfile>,
    pub(crate) opener: Arc<dyn TransportOpener>,
    pub(crate) rest: Option<Arc<dyn RestClient>>,
    pub(crate) token: Option<SecretString>,
    pub(crate) config: Arc<StreamConfig>,
    pub(crate) sink: EventSink,
}

/// Called with the worker id once a worker has stopped accepting commands,
/// before its terminal events are queued.
pub(crate) type ExitHook = Box<dyn FnOnce(u64) + Send + Sync>;

/// Spawns a push-transport connection worker for `channels`. Events it
/// produces are attributed to `id`.
pub(crate) fn spawn_connection(
    id: u64,
    mut context: WorkerContext,
    channels: Vec<Channel>,
    on_exit: ExitHook,
) -> ConnectionHandle {
    context.sink = context.sink.bound_to(id);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let worker = ConnectionWorker {
        id,
        state: ConnectionState::from_config(&context.config),
        malformed: MalformedWindow::new(
            context.config.malformed_frame_limit,
            context.config.malformed_window,
        ),
        channels: Vec::new(),
        cursors: HashMap::new(),
        commands: commands_rx,
        closed: Arc::clone(&closed),
        context,
        on_exit,
    };
    let task = tokio::spawn(worker.run(channels));
    ConnectionHandle::new(id, commands_tx, closed, task)
}

enum Step<T> {
    Ready(T),
    Failed(StreamError),
    Shutdown,
}

struct ConnectionWorker {
    id: u64,
    context: WorkerContext,
    state: ConnectionState,
    malformed: MalformedWindow,
    channels: Vec<Channel>,
    cursors: HashMap<Channel, CursorTracker>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    closed: Arc<AtomicBool>,
    on_exit: ExitHook,
}

impl ConnectionWorker {
    async fn run(mut self, initial: Vec<Channel>) {
        for channel in initial {
            self.attach(channel);
        }

        let outcome = loop {
            self.state.begin_connect();
            debug!(
                event = "connection_connecting",
                connection_id = self.id,
                attempt = self.state.reconnect_attempt()
            );

            let error = match self.connect().await {
                Step::Shutdown => break None,
                Step::Failed(error) => error,
                Step::Ready(mut transport) => {
                    self.state.on_open(Instant::now());
                    info!(
                        event = "connection_open",
                        connection_id = self.id,
                        channels = self.channels.len()
                    );
                    let step = self.serve(transport.as_mut()).await;
                    transport.close().await;
                    match step {
                        Step::Failed(error) => error,
                        Step::Ready(()) | Step::Shutdown => break None,
                    }
                }
            };

            match self.state.on_failure(&error, Instant::now()) {
                FailureOutcome::Close => break Some(error),
                FailureOutcome::Retry { delay } => {
                    warn!(
                        event = "connection_reconnecting",
                        connection_id = self.id,
                        error = %error,
                        attempt = self.state.reconnect_attempt(),
                        delay_ms = delay.as_millis() as u64
                    );
                    if !self.wait_backoff(delay).await {
                        break None;
                    }
                }
            }
        };

        self.state.close();
        // Channels attached after the last read still get their terminal
        // event; later sends fail and make the owner open a new worker.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            self.apply_offline(Some(command));
        }
        self.closed.store(true, Ordering::SeqCst);
        (self.on_exit)(self.id);
        if let Some(error) = outcome {
            warn!(
                event = "connection_closed_terminal",
                connection_id = self.id,
                error = %error
            );
            emit_terminal(&self.context.sink, &self.channels, &error);
        } else {
            debug!(event = "connection_closed", connection_id = self.id);
        }
    }

    fn request(&self) -> Result<TransportRequest, StreamError> {
        let profile = &self.context.profile;
        let address = if profile.multiplexes() {
            profile.address_for(None)
        } else {
            self.channels
                .first()
                .and_then(|channel| profile.address_for(Some(channel)))
        };
        let address = address.ok_or_else(|| {
            StreamError::Transport(format!("no endpoint for backend {}", profile.backend_id))
        })?;
        Ok(TransportRequest {
            kind: profile.transport,
            address,
            auth: profile.auth.clone(),
            token: self.context.token.clone(),
        })
    }

    /// Opens the transport while still honoring membership commands.
    async fn connect(&mut self) -> Step<Box<dyn Transport>> {
        let request = match self.request() {
            Ok(request) => request,
            Err(error) => return Step::Failed(error),
        };
        let opener = Arc::clone(&self.context.opener);
        let connect_timeout = self.context.config.connect_timeout;
        let open = with_timeout(connect_timeout, opener.open(request));
        tokio::pin!(open);

        loop {
            tokio::select! {
                result = &mut open => {
                    return match result {
                        Ok(Ok(transport)) => Step::Ready(transport),
                        Ok(Err(error)) => Step::Failed(error),
                        Err(_) => Step::Failed(StreamError::Transport(format!(
                            "connect timed out after {connect_timeout:?}"
                        ))),
                    };
                }
                command = self.commands.recv() => {
                    if !self.apply_offline(command) {
                        return Step::Shutdown;
                    }
                }
            }
        }
    }

    /// Runs an open transport until it fails or the connection is closed.
    async fn serve(&mut self, transport: &mut dyn Transport) -> Step<()> {
        if self.context.profile.multiplexes() {
            let mut joined: Vec<Value> = Vec::new();
            for channel in &self.channels {
                for frame in self.membership_frames(channel, true) {
                    if !joined.contains(&frame) {
                        joined.push(frame);
                    }
                }
            }
            for frame in &joined {
                if let Err(error) = transport.send(frame.to_string()).await {
                    return Step::Failed(error);
                }
            }
        }
        if let Err(error) = self.resume_channels().await {
            return Step::Failed(error);
        }

        let idle_timeout = self.context.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let ping_period = self.context.config.ping_interval;
        let ping_enabled = ping_period.is_some()
            && self.context.profile.transport == TransportKind::WebSocket;
        let period = ping_period.unwrap_or(idle_timeout).max(Duration::from_millis(1));
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(ConnectionCommand::Attach(channel)) => {
                            if self.attach(channel.clone()) && self.context.profile.multiplexes() {
                                if let Err(error) = self.subscribe_channel(transport, &channel).await {
                                    return Step::Failed(error);
                                }
                            }
                        }
                        Some(ConnectionCommand::Detach(channel)) => {
                            if self.detach(&channel) && self.context.profile.multiplexes() {
                                if let Err(error) = self.unsubscribe_channel(transport, &channel).await {
                                    return Step::Failed(error);
                                }
                            }
                        }
                        Some(ConnectionCommand::Close) | None => return Step::Shutdown,
                    }
                }
                frame = transport.recv() => {
                    let now = Instant::now();
                    match frame {
                        Ok(Some(frame)) => {
                            idle.as_mut().reset(now + idle_timeout);
                            if let Err(error) = self.handle_frame(frame, now) {
                                return Step::Failed(error);
                            }
                        }
                        Ok(None) => {
                            return Step::Failed(StreamError::Transport(
                                "transport closed by remote".to_string(),
                            ));
                        }
                        Err(error) => return Step::Failed(error),
                    }
                }
                _ = &mut idle => {
                    return Step::Failed(StreamError::Timeout(idle_timeout));
                }
                _ = ping.tick(), if ping_enabled => {
                    if let Err(error) = transport.ping().await {
                        return Step::Failed(error);
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: RawFrame, now: Instant) -> Result<(), StreamError> {
        let normalized = normalize_frame(&self.context.profile, &self.channels, frame);
        if self.malformed.record(normalized.rejected, now) {
            return Err(StreamError::Transport(
                "malformed frame rate exceeded".to_string(),
            ));
        }
        for event in normalized.events {
            self.forward(event);
        }
        Ok(())
    }

    /// Drops recently delivered duplicates and hands the event to the
    /// dispatcher.
    fn forward(&mut self, event: CanonicalEvent) {
        self.forward_after(event, None);
    }

    /// Like `forward`, also dropping updates at or below `floor`.
    fn forward_after(&mut self, event: CanonicalEvent, floor: Option<&EventCursor>) {
        let Some(cursor) = self.cursors.get_mut(&event.channel) else {
            return;
        };
        if !cursor.admit_after(&event, floor) {
            debug!(
                event = "stream_event_duplicate_skipped",
                connection_id = self.id,
                channel = %event.channel
            );
            return;
        }
        self.context.sink.send(event);
    }

    /// Catches up each resumable channel from its cursor, or seeds the
    /// cursor when none is known yet.
    async fn resume_channels(&mut self) -> Result<(), StreamError> {
        let Some(rest) = self.context.rest.clone() else {
            return Ok(());
        };
        for channel in self.channels.clone() {
            if !self.context.profile.supports_resume(&channel) {
                continue;
            }
            let cursor = self
                .cursors
                .get(&channel)
                .and_then(|tracker| tracker.resume_point().cloned());
            let seeding = cursor.is_none();
            if seeding && !self.context.config.seed_cursor {
                continue;
            }
            let limit = if seeding { 1 } else { self.context.config.poll_limit };

            match fetch_since(
                rest.as_ref(),
                &self.context.profile,
                &channel,
                cursor.as_ref(),
                limit,
            )
            .await
            {
                Ok(events) if seeding => {
                    if let Some(tracker) = self.cursors.get_mut(&channel) {
                        for id in events.iter().filter_map(|event| event.sequence_id.as_ref()) {
                            tracker.seed(id);
                        }
                    }
                }
                Ok(events) => {
                    debug!(
                        event = "connection_resumed",
                        connection_id = self.id,
                        channel = %channel,
                        missed = events.len()
                    );
                    for event in events {
                        self.forward_after(event, cursor.as_ref());
                    }
                }
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    warn!(
                        event = "connection_resume_failed",
                        connection_id = self.id,
                        channel = %channel,
                        error = %error
                    );
                }
            }
        }
        Ok(())
    }

    /// Subscribe or unsubscribe frames for every backend stream a channel
    /// joins.
    fn membership_frames(&self, channel: &Channel, subscribe: bool) -> Vec<Value> {
        let profile = &self.context.profile;
        let template = if subscribe {
            profile.subscribe_frame.as_ref()
        } else {
            profile.unsubscribe_frame.as_ref()
        };
        match (template, profile.stream_for(channel)) {
            (Some(template), Some(spec)) => render_frames(template, spec, channel),
            _ => Vec::new(),
        }
    }

    /// Whether a channel other than `except` already holds `frame`'s
    /// backend stream.
    fn subscribed_elsewhere(&self, frame: &Value, except: &Channel) -> bool {
        self.channels
            .iter()
            .filter(|channel| *channel != except)
            .any(|channel| self.membership_frames(channel, true).contains(frame))
    }

    /// Joins the backend streams of a newly attached channel that no other
    /// channel already joined.
    async fn subscribe_channel(
        &self,
        transport: &mut dyn Transport,
        channel: &Channel,
    ) -> Result<(), StreamError> {
        for frame in self.membership_frames(channel, true) {
            if !self.subscribed_elsewhere(&frame, channel) {
                transport.send(frame.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Leaves the backend streams of a detached channel that no remaining
    /// channel still uses.
    async fn unsubscribe_channel(
        &self,
        transport: &mut dyn Transport,
        channel: &Channel,
    ) -> Result<(), StreamError> {
        let joins = self.membership_frames(channel, true);
        let leaves = self.membership_frames(channel, false);
        for (join, leave) in joins.iter().zip(&leaves) {
            if !self.subscribed_elsewhere(join, channel) {
                transport.send(leave.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Applies a command while no transport is open. Returns `false` on close.
    fn apply_offline(&mut self, command: Option<ConnectionCommand>) -> bool {
        match command {
            Some(ConnectionCommand::Attach(channel)) => {
                self.attach(channel);
                true
            }
            Some(ConnectionCommand::Detach(channel)) => {
                self.detach(&channel);
                true
            }
            Some(ConnectionCommand::Close) | None => false,
        }
    }

    fn attach(&mut self, channel: Channel) -> bool {
        if self.channels.contains(&channel) {
            return false;
        }
        self.cursors.insert(channel.clone(), CursorTracker::default());
        self.channels.push(channel);
        true
    }

    fn detach(&mut self, channel: &Channel) -> bool {
        let before = self.channels.len();
        self.channels.retain(|existing| existing != channel);
        self.cursors.remove(channel);
        self.channels.len() != before
    }

    /// Sleeps through backoff. Returns `false` if closed meanwhile.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => {
                    if !self.apply_offline(command) {
                        return false;
                    }
                }
            }
        }
    }
}

/// Sends one terminal `error` event per channel.
pub(crate) fn emit_terminal(sink: &EventSink, channels: &[Channel], error: &StreamError) {
    for channel in channels {
        sink.send(CanonicalEvent::new(
            channel.clone(),
            EventType::Error,
            error.to_payload(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::{
        spawn_connection, ConnectionCommand, ConnectionState, ConnectionStatus, FailureOutcome,
        MalformedWindow, WorkerContext,
    };
    use crate::rest::RestClient;
    use crate::retry::ReconnectBackoff;
    use crate::stream::channel::Channel;
    use crate::stream::client::StreamConfig;
    use crate::stream::dispatcher::{Dispatch, EventSink};
    use crate::stream::error::StreamError;
    use crate::stream::profile::BackendProfile;
    use crate::stream::proto::RawFrame;
    use crate::stream::testing::{
        mastodon_update, statuses, OpenScript, ScriptedOpener, ScriptedRest,
    };

    fn state(cap: Option<u32>) -> ConnectionState {
        ConnectionState::new(
            ReconnectBackoff {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
                jitter: Duration::ZERO,
            },
            Duration::from_secs(60),
            cap,
        )
    }

    fn transport_error() -> StreamError {
        StreamError::Transport("reset".to_string())
    }

    #[test]
    fn failed_connects_back_off_exponentially() {
        let now = Instant::now();
        let mut state = state(None);
        assert!(state.begin_connect());
        state.on_open(now);
        assert_eq!(state.status(), ConnectionStatus::Open);

        let delays: Vec<_> = (0..8)
            .map(|_| {
                let outcome = state.on_failure(&StreamError::Timeout(Duration::from_secs(30)), now);
                assert_eq!(state.status(), ConnectionStatus::Reconnecting);
                assert!(state.begin_connect());
                outcome
            })
            .collect();

        let secs: Vec<u64> = delays
            .iter()
            .map(|outcome| match outcome {
                FailureOutcome::Retry { delay } => delay.as_secs(),
                FailureOutcome::Close => panic!("unexpected close"),
            })
            .collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(state.reconnect_attempt(), 8);
    }

    #[test]
    fn open_does_not_reset_attempts_until_stable() {
        let start = Instant::now();
        let mut state = state(None);
        state.begin_connect();
        state.on_failure(&transport_error(), start);
        state.begin_connect();
        state.on_failure(&transport_error(), start);
        state.begin_connect();
        assert_eq!(state.reconnect_attempt(), 2);

        state.on_open(start);
        assert_eq!(state.reconnect_attempt(), 2);
        let outcome = state.on_failure(&transport_error(), start + Duration::from_secs(5));
        assert_eq!(outcome, FailureOutcome::Retry { delay: Duration::from_secs(4) });

        state.begin_connect();
        state.on_open(start + Duration::from_secs(10));
        let outcome = state.on_failure(&transport_error(), start + Duration::from_secs(71));
        assert_eq!(outcome, FailureOutcome::Retry { delay: Duration::from_secs(1) });
        assert_eq!(state.reconnect_attempt(), 0);
    }

    #[test]
    fn auth_failure_closes_without_retry() {
        let now = Instant::now();
        let mut state = state(None);
        state.begin_connect();
        state.on_failure(&transport_error(), now);
        state.begin_connect();
        state.on_failure(&transport_error(), now);
        state.begin_connect();
        assert_eq!(state.reconnect_attempt(), 2);

        let outcome = state.on_failure(&StreamError::Auth("401".to_string()), now);
        assert_eq!(outcome, FailureOutcome::Close);
        assert_eq!(state.status(), ConnectionStatus::Closed);
        assert!(!state.begin_connect());
        assert!(!state.close());
    }

    #[test]
    fn attempt_cap_closes_connection() {
        let now = Instant::now();
        let mut state = state(Some(2));
        state.begin_connect();
        assert!(matches!(state.on_failure(&transport_error(), now), FailureOutcome::Retry { .. }));
        state.begin_connect();
        assert!(matches!(state.on_failure(&transport_error(), now), FailureOutcome::Retry { .. }));
        state.begin_connect();
        assert_eq!(state.on_failure(&transport_error(), now), FailureOutcome::Close);
        assert_eq!(state.status(), ConnectionStatus::Closed);
    }

    #[test]
    fn rate_limit_hint_extends_backoff() {
        let now = Instant::now();
        let mut state = state(None);
        state.begin_connect();
        let outcome = state.on_failure(
            &StreamError::RateLimited {
                retry_after: Some(Duration::from_secs(20)),
            },
            now,
        );
        assert_eq!(outcome, FailureOutcome::Retry { delay: Duration::from_secs(20) });
        assert_eq!(state.backoff_deadline(), Some(now + Duration::from_secs(20)));
    }

    #[test]
    fn malformed_window_trips_after_limit() {
        let start = Instant::now();
        let mut window = MalformedWindow::new(3, Duration::from_secs(10));
        assert!(!window.record(0, start));
        assert!(!window.record(1, start));
        assert!(!window.record(2, start + Duration::from_secs(1)));
        assert!(window.record(1, start + Duration::from_secs(2)));

        let mut window = MalformedWindow::new(3, Duration::from_secs(10));
        assert!(!window.record(3, start));
        assert!(!window.record(3, start + Duration::from_secs(11)));
    }

    fn context(
        profile: BackendProfile,
        opener: Arc<ScriptedOpener>,
        rest: Option<Arc<dyn RestClient>>,
    ) -> (WorkerContext, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = StreamConfig::default()
            .with_idle_timeout(Duration::from_secs(30))
            .with_ping_interval(Some(Duration::from_secs(10)))
            .with_backoff(ReconnectBackoff {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
                jitter: Duration::ZERO,
            });
        let context = WorkerContext {
            profile: Arc::new(profile),
            opener,
            rest,
            token: Some(SecretString::new("tok".to_string())),
            config: Arc::new(config),
            sink: EventSink::new(tx),
        };
        (context, rx)
    }

    async fn wait_for(mut ready: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_silence_reconnects_on_doubling_schedule() {
        let refused = || OpenScript::Fail(StreamError::Transport("refused".to_string()));
        let opener = ScriptedOpener::new(vec![
            OpenScript::Open,
            refused(),
            refused(),
            refused(),
            OpenScript::Hang,
        ]);
        let (context, _events) = context(
            BackendProfile::pleroma("p1", "https://p.example"),
            opener.clone(),
            None,
        );
        let start = Instant::now();
        let handle = spawn_connection(1, context, vec![Channel::user("p1")], Box::new(|_| {}));

        wait_for(|| opener.opened_transports() == 1).await;
        let feed = opener.feed(0);
        for _ in 0..3 {
            feed.send(Ok(Some(RawFrame::Heartbeat))).expect("feed");
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        wait_for(|| opener.opens() == 5).await;

        let offsets: Vec<u64> = opener
            .open_times()
            .iter()
            .map(|at| at.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 51, 53, 57, 65]);
        assert_eq!(opener.closes(), 1);

        handle.close();
        handle.join().await;
        assert_eq!(opener.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resumes_from_cursor_without_redelivery() {
        let opener = ScriptedOpener::new(Vec::new());
        let rest = ScriptedRest::new(vec![Ok(Vec::new()), Ok(statuses(&["7", "6"]))]);
        let (context, mut events) = context(
            BackendProfile::mastodon("m1", "https://m.example"),
            opener.clone(),
            Some(rest.clone()),
        );
        let handle = spawn_connection(1, context, vec![Channel::user("m1")], Box::new(|_| {}));

        wait_for(|| opener.opened_transports() == 1).await;
        let feed = opener.feed(0);
        feed.send(Ok(Some(mastodon_update(&["user"], "5")))).expect("feed");
        feed.send(Ok(Some(mastodon_update(&["user"], "6")))).expect("feed");
        feed.send(Err(StreamError::Transport("reset".to_string())))
            .expect("feed");

        wait_for(|| opener.opened_transports() == 2).await;
        let feed = opener.feed(1);
        feed.send(Ok(Some(mastodon_update(&["user"], "7")))).expect("feed");
        feed.send(Ok(Some(mastodon_update(&["user"], "8")))).expect("feed");

        let mut ids = Vec::new();
        for _ in 0..4 {
            let event = events.recv().await.expect("event").event;
            ids.push(event.payload["id"].clone());
        }
        assert_eq!(ids, vec![json!("5"), json!("6"), json!("7"), json!("8")]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err());

        let calls = rest.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "/api/v1/timelines/home");
        assert!(calls[0].1.contains(&("limit".to_string(), "1".to_string())));
        assert!(calls[1].1.contains(&("since_id".to_string(), "6".to_string())));
        assert_eq!(
            opener.sent(),
            vec![
                json!({"type": "subscribe", "stream": "user"}),
                json!({"type": "subscribe", "stream": "user"}),
            ]
        );

        handle.close();
        handle.join().await;
        assert_eq!(opener.closes(), 2);
    }

    async fn next_ids(events: &mut mpsc::UnboundedReceiver<Dispatch>, count: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for _ in 0..count {
            let dispatch = events.recv().await.expect("event");
            assert_eq!(dispatch.connection, 1);
            ids.push(dispatch.event.payload["id"].as_str().unwrap_or_default().to_string());
        }
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn live_updates_with_older_ids_are_delivered() {
        let opener = ScriptedOpener::new(Vec::new());
        let (context, mut events) = context(
            BackendProfile::mastodon("m1", "https://m.example"),
            opener.clone(),
            None,
        );
        let handle = spawn_connection(1, context, vec![Channel::public("m1")], Box::new(|_| {}));

        wait_for(|| opener.opened_transports() == 1).await;
        let feed = opener.feed(0);
        for id in ["110", "105", "110", "111"] {
            feed.send(Ok(Some(mastodon_update(&["public"], id)))).expect("feed");
        }

        assert_eq!(next_ids(&mut events, 3).await, vec!["110", "105", "111"]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err());

        handle.close();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_cursor_does_not_hold_back_live_updates() {
        let opener = ScriptedOpener::new(Vec::new());
        let rest = ScriptedRest::new(vec![Ok(statuses(&["200"]))]);
        let (context, mut events) = context(
            BackendProfile::mastodon("m1", "https://m.example"),
            opener.clone(),
            Some(rest.clone()),
        );
        let handle = spawn_connection(1, context, vec![Channel::user("m1")], Box::new(|_| {}));

        wait_for(|| opener.opened_transports() == 1).await;
        let feed = opener.feed(0);
        feed.send(Ok(Some(mastodon_update(&["user"], "199")))).expect("feed");
        assert_eq!(next_ids(&mut events, 1).await, vec!["199"]);

        feed.send(Err(StreamError::Transport("reset".to_string())))
            .expect("feed");
        wait_for(|| opener.opened_transports() == 2).await;
        wait_for(|| rest.calls().len() == 2).await;

        let calls = rest.calls();
        assert!(calls[0].1.contains(&("limit".to_string(), "1".to_string())));
        assert!(calls[1].1.contains(&("since_id".to_string(), "200".to_string())));

        handle.close();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shared_backend_stream_is_joined_once_and_left_with_its_last_channel() {
        let opener = ScriptedOpener::new(Vec::new());
        let (context, _events) = context(
            BackendProfile::mastodon("m1", "https://m.example"),
            opener.clone(),
            None,
        );
        let direct = Channel::direct("m1");
        let conversation = Channel::conversation("m1");
        let handle = spawn_connection(
            1,
            context,
            vec![direct.clone(), conversation.clone()],
            Box::new(|_| {}),
        );

        wait_for(|| opener.opened_transports() == 1).await;
        assert!(handle.send(ConnectionCommand::Detach(conversation.clone())));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opener.sent(), vec![json!({"type": "subscribe", "stream": "direct"})]);

        assert!(handle.send(ConnectionCommand::Attach(conversation)));
        assert!(handle.send(ConnectionCommand::Detach(direct)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opener.sent().len(), 1);

        handle.close();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn last_channel_leaving_shared_stream_sends_unsubscribe() {
        let opener = ScriptedOpener::new(Vec::new());
        let (context, _events) = context(
            BackendProfile::mastodon("m1", "https://m.example"),
            opener.clone(),
            None,
        );
        let direct = Channel::direct("m1");
        let conversation = Channel::conversation("m1");
        let handle = spawn_connection(
            1,
            context,
            vec![direct.clone(), conversation.clone()],
            Box::new(|_| {}),
        );

        wait_for(|| opener.opened_transports() == 1).await;
        assert!(handle.send(ConnectionCommand::Detach(conversation)));
        assert!(handle.send(ConnectionCommand::Detach(direct)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            opener.sent(),
            vec![
                json!({"type": "subscribe", "stream": "direct"}),
                json!({"type": "unsubscribe", "stream": "direct"}),
            ]
        );

        handle.close();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn channels_attached_while_closing_get_terminal_events() {
        let opener = ScriptedOpener::new(vec![OpenScript::Fail(StreamError::Auth(
            "revoked".to_string(),
        ))]);
        let (context, mut events) = context(
            BackendProfile::mastodon("m1", "https://m.example"),
            opener.clone(),
            None,
        );
        let exited = Arc::new(Mutex::new(None));
        let exit_slot = Arc::clone(&exited);
        let handle = spawn_connection(
            1,
            context,
            vec![Channel::user("m1")],
            Box::new(move |id| *exit_slot.lock().expect("lock") = Some(id)),
        );
        assert!(handle.send(ConnectionCommand::Attach(Channel::public("m1"))));

        let mut ended = Vec::new();
        for _ in 0..2 {
            let dispatch = events.recv().await.expect("terminal");
            assert_eq!(dispatch.connection, 1);
            assert!(dispatch.event.is_terminal());
            ended.push(dispatch.event.channel);
        }
        assert_eq!(ended, vec![Channel::user("m1"), Channel::public("m1")]);

        wait_for(|| handle.is_closed()).await;
        assert!(!handle.send(ConnectionCommand::Attach(Channel::hashtag("m1", "rust"))));
        handle.join().await;
        assert_eq!(*exited.lock().expect("lock"), Some(1));
        assert_eq!(opener.opens(), 1);
    }
}
