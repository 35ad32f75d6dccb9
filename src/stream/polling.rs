//! Polling fallback for backends without a push transport.
//!
//! A poller behaves like a connection serving one channel: the first
//! successful fetch opens it, failures go through the same backoff state
//! machine, and it stops when the multiplexer closes it.

use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::rest::RestClient;
use crate::stream::channel::Channel;
use crate::stream::connection::{
    emit_terminal, ConnectionCommand, ConnectionHandle, ConnectionState, ExitHook,
    FailureOutcome, WorkerContext,
};
use crate::stream::error::StreamError;
use crate::stream::event::{CanonicalEvent, CursorTracker, EventCursor};
use crate::stream::normalize::normalize_frame;
use crate::stream::profile::BackendProfile;
use crate::stream::proto::RawFrame;

/// Fetches records newer than `cursor`, normalized and sorted by ascending id.
pub(crate) async fn fetch_since(
    rest: &dyn RestClient,
    profile: &BackendProfile,
    channel: &Channel,
    cursor: Option<&EventCursor>,
    limit: u32,
) -> Result<Vec<CanonicalEvent>, StreamError> {
    let endpoint = profile.timeline_for(channel).ok_or_else(|| {
        StreamError::Protocol(format!("no timeline endpoint for {channel}"))
    })?;

    let mut params = endpoint.params.clone();
    if let Some(cursor) = cursor {
        params.push((profile.cursor_param.clone(), cursor.to_string()));
    }
    params.push(("limit".to_string(), limit.to_string()));

    let rows = rest.get(&endpoint.path_for(channel), &params).await?;
    let mut events =
        normalize_frame(profile, slice::from_ref(channel), RawFrame::Rows(rows)).events;
    events.sort_by(|left, right| left.sequence_id.cmp(&right.sequence_id));
    Ok(events)
}

/// Cursor bookkeeping for one polled channel.
#[derive(Clone, Debug, Default)]
pub struct PollCursor {
    tracker: CursorTracker,
    seeded: bool,
}

impl PollCursor {
    /// A cursor that starts at `last`. With `None` the first batch only
    /// seeds the cursor and emits nothing.
    pub fn new(last: Option<EventCursor>) -> Self {
        let seeded = last.is_some();
        Self {
            tracker: CursorTracker::new(last),
            seeded,
        }
    }

    /// Cursor sent with the next fetch.
    pub fn resume_point(&self) -> Option<&EventCursor> {
        self.tracker.resume_point()
    }

    /// Takes a batch sorted by ascending id and returns the events to emit.
    pub fn absorb(&mut self, events: Vec<CanonicalEvent>) -> Vec<CanonicalEvent> {
        if !self.seeded {
            self.seeded = true;
            for id in events.iter().filter_map(|event| event.sequence_id.as_ref()) {
                self.tracker.seed(id);
            }
            return Vec::new();
        }
        let floor = self.tracker.resume_point().cloned();
        events
            .into_iter()
            .filter(|event| self.tracker.admit_after(event, floor.as_ref()))
            .collect()
    }
}

/// Spawns a poller for one channel.
pub(crate) fn spawn_poller(
    id: u64,
    mut context: WorkerContext,
    channel: Channel,
    on_exit: ExitHook,
) -> ConnectionHandle {
    context.sink = context.sink.bound_to(id);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let poller = Poller {
        id,
        state: ConnectionState::from_config(&context.config),
        cursor: PollCursor::new(None),
        channel,
        commands: commands_rx,
        closed: Arc::clone(&closed),
        context,
        on_exit,
    };
    let task = tokio::spawn(poller.run());
    ConnectionHandle::new(id, commands_tx, closed, task)
}

struct Poller {
    id: u64,
    context: WorkerContext,
    state: ConnectionState,
    cursor: PollCursor,
    channel: Channel,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    closed: Arc<AtomicBool>,
    on_exit: ExitHook,
}

impl Poller {
    async fn run(mut self) {
        let interval = self.context.config.poll_interval;
        let outcome = loop {
            self.state.begin_connect();
            let result = match self.poll().await {
                Some(result) => result,
                None => break None,
            };

            let wait = match result {
                Ok(events) => {
                    self.state.on_open(Instant::now());
                    let events = self.cursor.absorb(events);
                    if !events.is_empty() {
                        debug!(
                            event = "poll_delivered",
                            poller_id = self.id,
                            channel = %self.channel,
                            count = events.len()
                        );
                    }
                    for event in events {
                        self.context.sink.send(event);
                    }
                    interval
                }
                Err(error) => match self.state.on_failure(&error, Instant::now()) {
                    FailureOutcome::Close => break Some(error),
                    FailureOutcome::Retry { delay } => {
                        warn!(
                            event = "poll_failed",
                            poller_id = self.id,
                            channel = %self.channel,
                            error = %error,
                            attempt = self.state.reconnect_attempt(),
                            delay_ms = delay.as_millis() as u64
                        );
                        delay
                    }
                },
            };

            if !self.wait(wait).await {
                break None;
            }
        };

        self.state.close();
        self.commands.close();
        self.closed.store(true, Ordering::SeqCst);
        (self.on_exit)(self.id);
        match outcome {
            Some(error) => {
                warn!(
                    event = "poller_closed_terminal",
                    poller_id = self.id,
                    channel = %self.channel,
                    error = %error
                );
                emit_terminal(&self.context.sink, slice::from_ref(&self.channel), &error);
            }
            None => info!(event = "poller_closed", poller_id = self.id, channel = %self.channel),
        }
    }

    /// One fetch, cancelled by close. `None` means the poller was closed.
    async fn poll(&mut self) -> Option<Result<Vec<CanonicalEvent>, StreamError>> {
        let Some(rest) = self.context.rest.clone() else {
            return Some(Err(StreamError::Transport(
                "polling requires a rest client".to_string(),
            )));
        };
        let profile = Arc::clone(&self.context.profile);
        let channel = self.channel.clone();
        let cursor = self.cursor.resume_point().cloned();
        let limit = self.context.config.poll_limit;
        let fetch = fetch_since(rest.as_ref(), &profile, &channel, cursor.as_ref(), limit);
        tokio::pin!(fetch);

        loop {
            tokio::select! {
                result = &mut fetch => return Some(result),
                command = self.commands.recv() => {
                    if !keep_polling(command) {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleeps until the next poll. Returns `false` if closed meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => {
                    if !keep_polling(command) {
                        return false;
                    }
                }
            }
        }
    }
}

/// A poller serves exactly one channel, so membership commands are no-ops.
fn keep_polling(command: Option<ConnectionCommand>) -> bool {
    !matches!(command, Some(ConnectionCommand::Close) | None)
}
