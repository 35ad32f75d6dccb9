//! Canonical, backend-independent stream events.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::channel::Channel;

/// Canonical event discriminator.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Update,
    Notification,
    Delete,
    StatusUpdate,
    Conversation,
    Announcement,
    AnnouncementReaction,
    AnnouncementDelete,
    FiltersChanged,
    /// Terminal failure. No further events follow on the channel.
    Error,
}

/// Highest event identifier already delivered for a channel.
///
/// Backend ids are opaque strings. Ordering compares length first and then
/// the bytes, which matches numeric order for decimal snowflake ids and
/// lexical order for fixed-width sortable ids.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCursor(String);

impl EventCursor {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for EventCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for EventCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub channel: Channel,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Present when the backend supplies an orderable id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<EventCursor>,
    pub payload: Value,
}

impl CanonicalEvent {
    pub fn new(channel: Channel, event_type: EventType, payload: Value) -> Self {
        Self {
            channel,
            event_type,
            sequence_id: None,
            payload,
        }
    }

    pub fn with_sequence_id(mut self, sequence_id: Option<EventCursor>) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type == EventType::Error
    }
}

/// Delivered ids remembered per channel for duplicate suppression.
const RECENT_IDS: usize = 256;

/// Per-channel delivery bookkeeping.
///
/// `last` is the highest id delivered and only moves forward. Live events are
/// checked against the most recently delivered ids, never against `last`, so
/// federated statuses with backdated ids still reach subscribers. A seeded
/// resume point marks where the next catch-up fetch starts without claiming
/// anything was delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CursorTracker {
    last: Option<EventCursor>,
    seeded: Option<EventCursor>,
    recent: VecDeque<EventCursor>,
}

impl CursorTracker {
    pub fn new(last: Option<EventCursor>) -> Self {
        Self {
            last,
            ..Self::default()
        }
    }

    /// Highest id delivered so far.
    pub fn last(&self) -> Option<&EventCursor> {
        self.last.as_ref()
    }

    /// Where a catch-up fetch starts: the highest delivered or seeded id.
    pub fn resume_point(&self) -> Option<&EventCursor> {
        match (&self.last, &self.seeded) {
            (Some(last), Some(seeded)) => Some(std::cmp::max(last, seeded)),
            (last, seeded) => last.as_ref().or(seeded.as_ref()),
        }
    }

    /// Moves the resume point to `id` without marking it delivered.
    pub fn seed(&mut self, id: &EventCursor) {
        if self.seeded.as_ref().map_or(true, |seeded| id > seeded) {
            self.seeded = Some(id.clone());
        }
    }

    /// Whether a live event should reach subscribers. An `update` is dropped
    /// only when its id was delivered recently.
    pub fn admit(&mut self, event: &CanonicalEvent) -> bool {
        match (event.event_type, &event.sequence_id) {
            (EventType::Update, Some(id)) => self.record(id),
            _ => true,
        }
    }

    /// Like [`admit`](Self::admit) for catch-up results, which additionally
    /// drop updates at or below `floor`.
    pub fn admit_after(&mut self, event: &CanonicalEvent, floor: Option<&EventCursor>) -> bool {
        if let (EventType::Update, Some(id), Some(floor)) =
            (event.event_type, &event.sequence_id, floor)
        {
            if id <= floor {
                return false;
            }
        }
        self.admit(event)
    }

    fn record(&mut self, id: &EventCursor) -> bool {
        if self.recent.contains(id) {
            return false;
        }
        if self.recent.len() == RECENT_IDS {
            self.recent.pop_front();
        }
        self.recent.push_back(id.clone());
        if self.last.as_ref().map_or(true, |last| id > last) {
            self.last = Some(id.clone());
        }
        true
    }
}
