//! Pure mapping from raw transport frames to canonical events.
//!
//! Normalization only reads the backend profile. Malformed frames and unknown
//! discriminators are logged and counted, never fatal to the connection.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::stream::channel::Channel;
use crate::stream::error::StreamError;
use crate::stream::event::{CanonicalEvent, EventCursor, EventType};
use crate::stream::profile::{BackendProfile, EntityKind, FieldRemap, PayloadEncoding, Routing};
use crate::stream::proto::RawFrame;

/// Result of normalizing one frame.
#[derive(Debug, Default, PartialEq)]
pub struct Normalized {
    pub events: Vec<CanonicalEvent>,
    /// Frames dropped as protocol errors.
    pub rejected: usize,
}

impl Normalized {
    fn rejected(error: StreamError) -> Self {
        warn!(event = "stream_frame_rejected", error = %error);
        Self {
            events: Vec::new(),
            rejected: 1,
        }
    }

    fn ignored(profile: &BackendProfile, discriminator: &str) -> Self {
        debug!(
            event = "stream_frame_ignored",
            backend = %profile.backend_id,
            discriminator
        );
        Self::default()
    }
}

/// Normalizes one frame received on a connection serving `channels`.
pub fn normalize_frame(profile: &BackendProfile, channels: &[Channel], frame: RawFrame) -> Normalized {
    match frame {
        RawFrame::Heartbeat => Normalized::default(),
        RawFrame::Text(text) => normalize_text(profile, channels, &text),
        RawFrame::Event { name, data } => normalize_named(profile, channels, name.as_deref(), data),
        RawFrame::Rows(rows) => normalize_rows(profile, channels, rows),
    }
}

fn normalize_text(profile: &BackendProfile, channels: &[Channel], text: &str) -> Normalized {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => return Normalized::rejected(StreamError::Protocol(format!("invalid json: {err}"))),
    };

    let layout = &profile.frame;
    if let Some((path, expected)) = &layout.envelope {
        if value_at(&frame, path).and_then(Value::as_str) != Some(expected.as_str()) {
            debug!(event = "stream_control_frame_skipped", backend = %profile.backend_id);
            return Normalized::default();
        }
    }

    let Some(discriminator) = value_at(&frame, &layout.event_path).and_then(Value::as_str) else {
        return Normalized::rejected(StreamError::Protocol("frame has no event tag".to_string()));
    };
    if profile.ignores(discriminator) {
        return Normalized::ignored(profile, discriminator);
    }
    let Some(event_type) = profile.event_type(discriminator) else {
        return Normalized::rejected(StreamError::Protocol(format!(
            "unknown event tag {discriminator:?}"
        )));
    };

    let targets = route(profile, channels, &frame);
    if targets.is_empty() {
        debug!(
            event = "stream_frame_unrouted",
            backend = %profile.backend_id,
            discriminator
        );
        return Normalized::default();
    }

    let raw = value_at(&frame, &layout.payload_path)
        .cloned()
        .unwrap_or(Value::Null);
    let payload = match layout.payload_encoding {
        PayloadEncoding::Embedded => raw,
        PayloadEncoding::JsonString => match raw {
            Value::String(text) => decode_string_payload(text),
            other => other,
        },
    };

    build_events(profile, targets, event_type, payload)
}

fn normalize_named(
    profile: &BackendProfile,
    channels: &[Channel],
    name: Option<&str>,
    data: String,
) -> Normalized {
    let Some(name) = name else {
        return Normalized::rejected(StreamError::Protocol("event block has no name".to_string()));
    };
    if profile.ignores(name) {
        return Normalized::ignored(profile, name);
    }
    let Some(event_type) = profile.event_type(name) else {
        return Normalized::rejected(StreamError::Protocol(format!("unknown event tag {name:?}")));
    };
    let Some(channel) = channels.first() else {
        return Normalized::default();
    };

    build_events(profile, vec![channel.clone()], event_type, decode_string_payload(data))
}

fn normalize_rows(profile: &BackendProfile, channels: &[Channel], rows: Vec<Value>) -> Normalized {
    let Some(channel) = channels.first() else {
        return Normalized::default();
    };

    let mut normalized = Normalized::default();
    for row in rows {
        if !row.is_object() {
            normalized.rejected += 1;
            warn!(
                event = "stream_frame_rejected",
                error = %StreamError::Protocol("polled record is not an object".to_string())
            );
            continue;
        }
        let batch = build_events(profile, vec![channel.clone()], EventType::Update, row);
        normalized.events.extend(batch.events);
        normalized.rejected += batch.rejected;
    }
    normalized
}

fn build_events(
    profile: &BackendProfile,
    targets: Vec<Channel>,
    event_type: EventType,
    payload: Value,
) -> Normalized {
    let payload = match EntityKind::for_event(event_type) {
        Some(kind) => {
            if !payload.is_object() {
                return Normalized::rejected(StreamError::Protocol(format!(
                    "{event_type:?} payload is not an object"
                )));
            }
            remap_entity(&profile.field_remap, kind, payload)
        }
        None => match (event_type, payload) {
            (EventType::Delete | EventType::AnnouncementDelete, Value::Number(id)) => {
                Value::String(id.to_string())
            }
            (_, payload) => payload,
        },
    };

    let sequence_id = match (&profile.sequence_field, EntityKind::for_event(event_type)) {
        (Some(field), Some(_)) => payload.get(field).and_then(cursor_from_value),
        _ => None,
    };

    let events = targets
        .into_iter()
        .map(|channel| {
            CanonicalEvent::new(channel, event_type, payload.clone())
                .with_sequence_id(sequence_id.clone())
        })
        .collect();

    Normalized {
        events,
        rejected: 0,
    }
}

fn route(profile: &BackendProfile, channels: &[Channel], frame: &Value) -> Vec<Channel> {
    match &profile.frame.routing {
        Routing::Single => channels.first().cloned().into_iter().collect(),
        Routing::ChannelId(path) => {
            let Some(id) = value_at(frame, path).and_then(Value::as_str) else {
                return Vec::new();
            };
            channels
                .iter()
                .filter(|channel| match profile.stream_for(channel) {
                    Some(spec) => spec
                        .wire_streams(channel)
                        .iter()
                        .any(|(_, wire_id)| wire_id == id),
                    None => channel.key() == id,
                })
                .cloned()
                .collect()
        }
        Routing::StreamName(path) => {
            let (stream, selector) = match value_at(frame, path) {
                Some(Value::String(stream)) => (stream.as_str(), None),
                Some(Value::Array(items)) => (
                    items.first().and_then(Value::as_str).unwrap_or_default(),
                    items.get(1).and_then(Value::as_str),
                ),
                _ if channels.len() == 1 => return channels.to_vec(),
                _ => return Vec::new(),
            };
            channels
                .iter()
                .filter(|channel| {
                    profile
                        .stream_for(channel)
                        .is_some_and(|spec| spec.carries(stream))
                        && match (selector, channel.selector.as_deref()) {
                            (Some(wanted), Some(own)) => wanted.eq_ignore_ascii_case(own),
                            (None, None) => true,
                            _ => false,
                        }
                })
                .cloned()
                .collect()
        }
    }
}

/// Applies a backend's field remap to an entity and its nested entities.
pub fn remap_entity(remap: &FieldRemap, kind: EntityKind, value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };

    if let Some(renames) = remap.renames.get(&kind) {
        for (from, to) in renames {
            if let Some(moved) = take_path(&mut map, from) {
                map.insert(to.clone(), moved);
            }
        }
    }

    if let Some(values) = remap.values.get(&kind) {
        for rule in values {
            if let Some(Value::String(current)) = map.get_mut(&rule.field) {
                if *current == rule.from {
                    *current = rule.to.clone();
                }
            }
        }
    }

    for (field, nested, is_list) in kind.nested() {
        let Some(inner) = map.remove(*field) else {
            continue;
        };
        let inner = match (inner, is_list) {
            (Value::Array(items), true) => Value::Array(
                items
                    .into_iter()
                    .map(|item| remap_entity(remap, *nested, item))
                    .collect(),
            ),
            (other, _) => remap_entity(remap, *nested, other),
        };
        map.insert((*field).to_string(), inner);
    }

    Value::Object(map)
}

fn take_path(map: &mut Map<String, Value>, dotted: &str) -> Option<Value> {
    match dotted.split_once('.') {
        None => map.remove(dotted),
        Some((head, rest)) => match map.get_mut(head) {
            Some(Value::Object(inner)) => take_path(inner, rest),
            _ => None,
        },
    }
}

fn value_at<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| current.get(segment))
}

fn decode_string_payload(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn cursor_from_value(value: &Value) -> Option<EventCursor> {
    match value {
        Value::String(id) if !id.is_empty() => Some(EventCursor::new(id.clone())),
        Value::Number(id) => Some(EventCursor::new(id.to_string())),
        _ => None,
    }
}
