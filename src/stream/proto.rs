//! Raw wire shapes consumed from transports.
//!
//! - websocket text frames carrying one discriminated message each
//! - server-push text streams of `event:` / `data:` blocks
//! - polling batches of entity records

use serde_json::{Map, Value};

use crate::stream::channel::Channel;
use crate::stream::profile::{SelectorShape, StreamSpec};

/// One unit read from a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum RawFrame {
    /// Websocket text frame.
    Text(String),
    /// Named event block from a push stream.
    Event { name: Option<String>, data: String },
    /// Ordered entity records from a REST fetch.
    Rows(Vec<Value>),
    /// Liveness signal carrying no event (ping, pong, comment line).
    Heartbeat,
}

/// Incremental decoder for server-push text streams.
///
/// Bytes are pushed as they arrive; complete blocks are popped in order.
/// Lines are decoded only once complete, so multi-byte characters may span
/// chunks. Comment lines (`:thump`) surface as heartbeats.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    name: Option<String>,
    data: Vec<String>,
    ready: std::collections::VecDeque<RawFrame>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.feed_line(line.trim_end_matches('\n').trim_end_matches('\r'));
        }
    }

    /// Next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        self.ready.pop_front()
    }

    fn feed_line(&mut self, line: &str) {
        if line.is_empty() {
            if !self.data.is_empty() {
                let data = self.data.join("\n");
                self.data.clear();
                self.ready.push_back(RawFrame::Event {
                    name: self.name.take(),
                    data,
                });
            } else {
                self.name = None;
            }
            return;
        }

        if line.starts_with(':') {
            self.ready.push_back(RawFrame::Heartbeat);
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }
}

/// Renders a subscribe or unsubscribe frame template for a channel's
/// primary backend stream.
///
/// Placeholders: `{stream}`, `{id}`, `{selector}` in values and
/// `{selector_param}` in keys. Entries whose selector is absent are dropped.
pub fn render_frame(template: &Value, spec: &StreamSpec, channel: &Channel) -> Value {
    render(template, spec, channel, &spec.stream, &channel.key())
}

/// One rendered frame per backend stream the channel joins.
pub fn render_frames(template: &Value, spec: &StreamSpec, channel: &Channel) -> Vec<Value> {
    spec.wire_streams(channel)
        .into_iter()
        .map(|(stream, id)| render(template, spec, channel, stream, &id))
        .collect()
}

fn render(template: &Value, spec: &StreamSpec, channel: &Channel, stream: &str, id: &str) -> Value {
    match template {
        Value::Object(map) => {
            let mut rendered = Map::new();
            for (key, value) in map {
                let key = if key == "{selector_param}" {
                    match (&spec.selector_param, &channel.selector) {
                        (Some(param), Some(_)) => param.clone(),
                        _ => continue,
                    }
                } else {
                    key.clone()
                };
                if value.as_str() == Some("{selector}") && channel.selector.is_none() {
                    continue;
                }
                rendered.insert(key, render(value, spec, channel, stream, id));
            }
            Value::Object(rendered)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render(item, spec, channel, stream, id))
                .collect(),
        ),
        Value::String(text) => match text.as_str() {
            "{stream}" => Value::String(stream.to_string()),
            "{id}" => Value::String(id.to_string()),
            "{selector}" => selector_value(spec, channel),
            _ => template.clone(),
        },
        _ => template.clone(),
    }
}

fn selector_value(spec: &StreamSpec, channel: &Channel) -> Value {
    let selector = channel.selector.clone().unwrap_or_default();
    match spec.selector_shape {
        SelectorShape::Plain => Value::String(selector),
        SelectorShape::NestedList => {
            Value::Array(vec![Value::Array(vec![Value::String(selector)])])
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{render_frame, render_frames, EventStreamDecoder, RawFrame};
    use crate::stream::channel::Channel;
    use crate::stream::profile::BackendProfile;

    #[test]
    fn decoder_splits_named_blocks_across_chunks() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(b"event: upd");
        assert_eq!(decoder.next_frame(), None);
        decoder.push(b"ate\r\ndata: {\"id\":\"1\"}\r\n\r\n:thump\n");
        decoder.push(b"event: delete\ndata: 7\n\n");

        assert_eq!(
            decoder.next_frame(),
            Some(RawFrame::Event {
                name: Some("update".to_string()),
                data: "{\"id\":\"1\"}".to_string(),
            })
        );
        assert_eq!(decoder.next_frame(), Some(RawFrame::Heartbeat));
        assert_eq!(
            decoder.next_frame(),
            Some(RawFrame::Event {
                name: Some("delete".to_string()),
                data: "7".to_string(),
            })
        );
        assert_eq!(decoder.next_frame(), None);
    }

    #[test]
    fn decoder_keeps_multi_byte_characters_split_across_chunks() {
        let text = "data: h\u{e9}llo \u{1f980}\n\n".as_bytes();
        // Split inside the two-byte `é` and again inside the crab.
        let (first, rest) = text.split_at(8);
        let (second, third) = rest.split_at(8);
        let mut decoder = EventStreamDecoder::new();
        decoder.push(first);
        decoder.push(second);
        decoder.push(third);

        assert_eq!(
            decoder.next_frame(),
            Some(RawFrame::Event {
                name: None,
                data: "h\u{e9}llo \u{1f980}".to_string(),
            })
        );
    }

    #[test]
    fn decoder_joins_multi_line_data() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(b"data: a\ndata: b\n\n");
        assert_eq!(
            decoder.next_frame(),
            Some(RawFrame::Event {
                name: None,
                data: "a\nb".to_string(),
            })
        );
    }

    #[test]
    fn mastodon_subscribe_frame_includes_selector() {
        let profile = BackendProfile::mastodon("m1", "https://mastodon.example");
        let channel = Channel::hashtag("m1", "rust");
        let spec = profile.stream_for(&channel).expect("stream");
        let template = profile.subscribe_frame.as_ref().expect("template");
        assert_eq!(
            render_frame(template, spec, &channel),
            json!({"type": "subscribe", "stream": "hashtag", "tag": "rust"})
        );

        let user = Channel::user("m1");
        let spec = profile.stream_for(&user).expect("stream");
        assert_eq!(
            render_frame(template, spec, &user),
            json!({"type": "subscribe", "stream": "user"})
        );
    }

    #[test]
    fn misskey_connect_frame_nests_hashtag_query() {
        let profile = BackendProfile::misskey("k1", "https://misskey.example");
        let channel = Channel::hashtag("k1", "rust");
        let spec = profile.stream_for(&channel).expect("stream");
        let template = profile.subscribe_frame.as_ref().expect("template");
        assert_eq!(
            render_frame(template, spec, &channel),
            json!({
                "type": "connect",
                "body": {
                    "channel": "hashtag",
                    "id": "k1:hashtag:rust",
                    "params": {"q": [["rust"]]},
                },
            })
        );
    }

    #[test]
    fn misskey_user_channel_connects_home_and_main() {
        let profile = BackendProfile::misskey("k1", "https://misskey.example");
        let user = Channel::user("k1");
        let spec = profile.stream_for(&user).expect("stream");
        let template = profile.subscribe_frame.as_ref().expect("template");
        assert_eq!(
            render_frames(template, spec, &user),
            vec![
                json!({
                    "type": "connect",
                    "body": {"channel": "homeTimeline", "id": "k1:user", "params": {}},
                }),
                json!({
                    "type": "connect",
                    "body": {"channel": "main", "id": "k1:user/main", "params": {}},
                }),
            ]
        );
    }
}
