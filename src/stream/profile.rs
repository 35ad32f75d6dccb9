//! Static description of one backend's streaming capability.
//!
//! Every backend difference (transport, multiplexing, frame layout, field
//! names, cursor resume) is data in a [`BackendProfile`]. Connections,
//! pollers, and the normalizer are generic over the profile.

use std::collections::{BTreeMap, BTreeSet};

use reqwest::Url;
use serde_json::Value;

use crate::stream::channel::{Channel, ChannelKind};
use crate::stream::event::EventType;

/// Physical transport a backend offers for its event feed.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum TransportKind {
    /// Persistent duplex socket carrying discriminated text frames.
    WebSocket,
    /// Server-push text stream of named `event:` / `data:` blocks.
    EventStream,
    /// No push transport; channels are simulated by repeated REST fetches.
    Polling,
}

/// How the access token reaches the streaming endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <token>` header.
    BearerHeader,
    /// Token appended as a query parameter with the given name.
    QueryParam(String),
}

/// Encoding of the payload blob inside a push frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// Payload is a JSON value embedded in the frame.
    Embedded,
    /// Payload is a string containing JSON. Non-JSON strings (e.g. delete
    /// ids) are kept as plain strings.
    JsonString,
}

/// How a frame on a shared connection is matched to its channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Routing {
    /// The connection carries exactly one channel.
    Single,
    /// The frame names the backend stream as `[stream, selector?]` or
    /// `"stream"` at the given path.
    StreamName(Vec<String>),
    /// The frame carries the channel wire id at the given path.
    ChannelId(Vec<String>),
}

/// Layout of a discriminated push frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    /// Frames must carry `value` at `path` to be events; others are control
    /// frames and are skipped silently.
    pub envelope: Option<(Vec<String>, String)>,
    /// Path of the event discriminator.
    pub event_path: Vec<String>,
    /// Path of the payload blob.
    pub payload_path: Vec<String>,
    pub payload_encoding: PayloadEncoding,
    pub routing: Routing,
}

/// Shape of the selector inside a subscribe frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorShape {
    /// `"value"`
    Plain,
    /// `[["value"]]`, used by query-style hashtag channels.
    NestedList,
}

/// Backend stream serving one channel kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    /// Backend stream or channel name.
    pub stream: String,
    /// Query parameter or subscribe field carrying the selector.
    pub selector_param: Option<String>,
    pub selector_shape: SelectorShape,
    /// Extra selector-less backend streams joined alongside the primary one.
    pub companions: Vec<String>,
}

impl StreamSpec {
    pub fn named(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            selector_param: None,
            selector_shape: SelectorShape::Plain,
            companions: Vec::new(),
        }
    }

    pub fn with_companion(mut self, stream: impl Into<String>) -> Self {
        self.companions.push(stream.into());
        self
    }

    /// Backend streams joined for a channel with their wire ids. The primary
    /// stream comes first and uses the channel key.
    pub fn wire_streams(&self, channel: &Channel) -> Vec<(&str, String)> {
        let key = channel.key();
        let companions = self
            .companions
            .iter()
            .map(|companion| (companion.as_str(), format!("{key}/{companion}")));
        let mut streams: Vec<(&str, String)> = companions.collect();
        streams.insert(0, (self.stream.as_str(), key));
        streams
    }

    /// Whether a frame naming `stream` belongs to this spec.
    pub fn carries(&self, stream: &str) -> bool {
        self.stream == stream || self.companions.iter().any(|name| name == stream)
    }

    pub fn with_selector(mut self, param: impl Into<String>, shape: SelectorShape) -> Self {
        self.selector_param = Some(param.into());
        self.selector_shape = shape;
        self
    }
}

/// REST endpoint returning entity records newer than a cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestEndpoint {
    /// Path template; `{selector}` is replaced by the channel selector.
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl RestEndpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Resolves the path for a channel.
    pub fn path_for(&self, channel: &Channel) -> String {
        let selector = channel.selector.as_deref().unwrap_or_default();
        self.path.replace("{selector}", selector)
    }
}

/// Canonical entity families that carry field remaps.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityKind {
    Status,
    Notification,
    Account,
    Conversation,
    Announcement,
}

impl EntityKind {
    /// Fields holding nested entities, and whether they hold a list.
    pub fn nested(self) -> &'static [(&'static str, EntityKind, bool)] {
        match self {
            Self::Status => &[
                ("account", EntityKind::Account, false),
                ("reblog", EntityKind::Status, false),
            ],
            Self::Notification => &[
                ("account", EntityKind::Account, false),
                ("status", EntityKind::Status, false),
            ],
            Self::Conversation => &[
                ("accounts", EntityKind::Account, true),
                ("last_status", EntityKind::Status, false),
            ],
            Self::Account | Self::Announcement => &[],
        }
    }

    /// Entity carried by events of the given type.
    pub fn for_event(event_type: EventType) -> Option<Self> {
        match event_type {
            EventType::Update | EventType::StatusUpdate => Some(Self::Status),
            EventType::Notification => Some(Self::Notification),
            EventType::Conversation => Some(Self::Conversation),
            EventType::Announcement => Some(Self::Announcement),
            EventType::Delete
            | EventType::AnnouncementReaction
            | EventType::AnnouncementDelete
            | EventType::FiltersChanged
            | EventType::Error => None,
        }
    }
}

/// Replaces one enumerated field value with its canonical spelling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueRemap {
    pub field: String,
    pub from: String,
    pub to: String,
}

/// Field-name remaps per entity kind.
///
/// The same table is used for push payloads and REST records so both paths
/// produce identical canonical shapes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldRemap {
    /// `(dotted source path, canonical field)` pairs.
    pub renames: BTreeMap<EntityKind, Vec<(String, String)>>,
    pub values: BTreeMap<EntityKind, Vec<ValueRemap>>,
}

impl FieldRemap {
    pub fn rename(mut self, kind: EntityKind, from: &str, to: &str) -> Self {
        self.renames
            .entry(kind)
            .or_default()
            .push((from.to_string(), to.to_string()));
        self
    }

    pub fn value(mut self, kind: EntityKind, field: &str, from: &str, to: &str) -> Self {
        self.values.entry(kind).or_default().push(ValueRemap {
            field: field.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty() && self.values.is_empty()
    }
}

/// Immutable per-backend capability table.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendProfile {
    /// Identifier matched against [`Channel::backend_id`].
    pub backend_id: String,
    pub transport: TransportKind,
    /// Base URL of the streaming endpoint (ws/wss for sockets).
    pub streaming_url: String,
    /// Path template for per-channel connections; `{stream}` is replaced.
    pub endpoint_path: String,
    /// Query parameter naming the stream on per-channel connections.
    pub stream_query_param: Option<String>,
    /// Path used by multiplexed connections.
    pub multiplex_path: String,
    pub multiplex_capable: bool,
    /// Subscribe frame template for multiplexed sockets.
    pub subscribe_frame: Option<Value>,
    pub unsubscribe_frame: Option<Value>,
    pub auth: AuthStyle,
    pub streams: BTreeMap<ChannelKind, StreamSpec>,
    pub frame: FrameLayout,
    /// Raw discriminator to canonical event type.
    pub event_types: BTreeMap<String, EventType>,
    /// Discriminators the backend sends that carry nothing canonical.
    pub ignored_events: BTreeSet<String>,
    pub field_remap: FieldRemap,
    /// Payload field carrying an orderable id.
    pub sequence_field: Option<String>,
    /// REST timelines returning records newer than a cursor, per channel kind.
    pub timelines: BTreeMap<ChannelKind, RestEndpoint>,
    /// Query parameter carrying the cursor on timeline requests.
    pub cursor_param: String,
}

impl BackendProfile {
    /// Mastodon over a single multiplexed websocket.
    pub fn mastodon(backend_id: impl Into<String>, base_url: &str) -> Self {
        Self {
            backend_id: backend_id.into(),
            transport: TransportKind::WebSocket,
            streaming_url: websocket_base(base_url),
            endpoint_path: "/api/v1/streaming".to_string(),
            stream_query_param: Some("stream".to_string()),
            multiplex_path: "/api/v1/streaming".to_string(),
            multiplex_capable: true,
            subscribe_frame: Some(serde_json::json!({
                "type": "subscribe",
                "stream": "{stream}",
                "{selector_param}": "{selector}",
            })),
            unsubscribe_frame: Some(serde_json::json!({
                "type": "unsubscribe",
                "stream": "{stream}",
                "{selector_param}": "{selector}",
            })),
            auth: AuthStyle::BearerHeader,
            streams: mastodon_streams(),
            frame: mastodon_frame(Routing::StreamName(path(&["stream"]))),
            event_types: mastodon_event_types(),
            ignored_events: BTreeSet::new(),
            field_remap: FieldRemap::default(),
            sequence_field: Some("id".to_string()),
            timelines: mastodon_timelines(),
            cursor_param: "since_id".to_string(),
        }
    }

    /// Mastodon over the server-push text stream, one stream per channel.
    pub fn mastodon_event_stream(backend_id: impl Into<String>, base_url: &str) -> Self {
        let mut streams = BTreeMap::new();
        streams.insert(ChannelKind::User, StreamSpec::named("user"));
        streams.insert(ChannelKind::Public, StreamSpec::named("public"));
        streams.insert(ChannelKind::PublicLocal, StreamSpec::named("public/local"));
        streams.insert(
            ChannelKind::Hashtag,
            StreamSpec::named("hashtag").with_selector("tag", SelectorShape::Plain),
        );
        streams.insert(
            ChannelKind::List,
            StreamSpec::named("list").with_selector("list", SelectorShape::Plain),
        );
        streams.insert(ChannelKind::Direct, StreamSpec::named("direct"));
        streams.insert(ChannelKind::Conversation, StreamSpec::named("direct"));

        Self {
            transport: TransportKind::EventStream,
            streaming_url: base_url.trim_end_matches('/').to_string(),
            endpoint_path: "/api/v1/streaming/{stream}".to_string(),
            stream_query_param: None,
            multiplex_capable: false,
            subscribe_frame: None,
            unsubscribe_frame: None,
            streams,
            frame: mastodon_frame(Routing::Single),
            ..Self::mastodon(backend_id, base_url)
        }
    }

    /// Pleroma and Akkoma: one websocket per channel, Mastodon frames.
    pub fn pleroma(backend_id: impl Into<String>, base_url: &str) -> Self {
        let field_remap = FieldRemap::default()
            .rename(EntityKind::Status, "pleroma.emoji_reactions", "emoji_reactions")
            .rename(EntityKind::Notification, "pleroma.is_seen", "is_seen")
            .value(EntityKind::Notification, "type", "pleroma:emoji_reaction", "emoji_reaction");

        Self {
            multiplex_capable: false,
            subscribe_frame: None,
            unsubscribe_frame: None,
            frame: mastodon_frame(Routing::Single),
            field_remap,
            ..Self::mastodon(backend_id, base_url)
        }
    }

    /// Misskey: one websocket multiplexing channels by connect frames.
    pub fn misskey(backend_id: impl Into<String>, base_url: &str) -> Self {
        let mut streams = BTreeMap::new();
        streams.insert(
            ChannelKind::User,
            StreamSpec::named("homeTimeline").with_companion("main"),
        );
        streams.insert(ChannelKind::Public, StreamSpec::named("globalTimeline"));
        streams.insert(ChannelKind::PublicLocal, StreamSpec::named("localTimeline"));
        streams.insert(
            ChannelKind::Hashtag,
            StreamSpec::named("hashtag").with_selector("q", SelectorShape::NestedList),
        );
        streams.insert(
            ChannelKind::List,
            StreamSpec::named("userList").with_selector("listId", SelectorShape::Plain),
        );

        let mut event_types = BTreeMap::new();
        event_types.insert("note".to_string(), EventType::Update);
        event_types.insert("notification".to_string(), EventType::Notification);
        event_types.insert("noteUpdated".to_string(), EventType::StatusUpdate);
        event_types.insert("announcementCreated".to_string(), EventType::Announcement);

        let field_remap = FieldRemap::default()
            .rename(EntityKind::Status, "text", "content")
            .rename(EntityKind::Status, "createdAt", "created_at")
            .rename(EntityKind::Status, "user", "account")
            .rename(EntityKind::Status, "renote", "reblog")
            .rename(EntityKind::Status, "cw", "spoiler_text")
            .rename(EntityKind::Status, "repliesCount", "replies_count")
            .rename(EntityKind::Status, "renoteCount", "reblogs_count")
            .rename(EntityKind::Account, "name", "display_name")
            .rename(EntityKind::Account, "avatarUrl", "avatar")
            .rename(EntityKind::Account, "isBot", "bot")
            .rename(EntityKind::Notification, "createdAt", "created_at")
            .rename(EntityKind::Notification, "user", "account")
            .rename(EntityKind::Notification, "note", "status")
            .value(EntityKind::Notification, "type", "reaction", "emoji_reaction")
            .value(EntityKind::Notification, "type", "renote", "reblog")
            .value(EntityKind::Notification, "type", "reply", "mention")
            .value(EntityKind::Notification, "type", "receiveFollowRequest", "follow_request")
            .rename(EntityKind::Announcement, "text", "content")
            .rename(EntityKind::Announcement, "createdAt", "published_at");

        Self {
            backend_id: backend_id.into(),
            transport: TransportKind::WebSocket,
            streaming_url: websocket_base(base_url),
            endpoint_path: "/streaming".to_string(),
            stream_query_param: None,
            multiplex_path: "/streaming".to_string(),
            multiplex_capable: true,
            subscribe_frame: Some(serde_json::json!({
                "type": "connect",
                "body": {
                    "channel": "{stream}",
                    "id": "{id}",
                    "params": { "{selector_param}": "{selector}" },
                },
            })),
            unsubscribe_frame: Some(serde_json::json!({
                "type": "disconnect",
                "body": { "id": "{id}" },
            })),
            auth: AuthStyle::QueryParam("i".to_string()),
            streams,
            frame: FrameLayout {
                envelope: Some((path(&["type"]), "channel".to_string())),
                event_path: path(&["body", "type"]),
                payload_path: path(&["body", "body"]),
                payload_encoding: PayloadEncoding::Embedded,
                routing: Routing::ChannelId(path(&["body", "id"])),
            },
            event_types,
            ignored_events: misskey_ignored_events(),
            field_remap,
            sequence_field: Some("id".to_string()),
            timelines: BTreeMap::new(),
            cursor_param: "sinceId".to_string(),
        }
    }

    /// Friendica: no push transport, Mastodon-compatible timelines polled.
    pub fn friendica(backend_id: impl Into<String>, base_url: &str) -> Self {
        let mut timelines = mastodon_timelines();
        timelines.remove(&ChannelKind::Conversation);
        let streams = timelines
            .keys()
            .map(|kind| (*kind, StreamSpec::named(kind.as_str())))
            .collect();

        Self {
            transport: TransportKind::Polling,
            streaming_url: base_url.trim_end_matches('/').to_string(),
            multiplex_capable: false,
            subscribe_frame: None,
            unsubscribe_frame: None,
            streams,
            frame: mastodon_frame(Routing::Single),
            timelines,
            ..Self::mastodon(backend_id, base_url)
        }
    }

    /// Overrides the streaming base URL (e.g. a dedicated streaming host).
    pub fn with_streaming_url(mut self, url: impl Into<String>) -> Self {
        self.streaming_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Transport used for a channel.
    pub fn transport_for(&self, _channel: &Channel) -> TransportKind {
        self.transport
    }

    pub fn supports(&self, channel: &Channel) -> bool {
        channel.backend_id == self.backend_id
            && self.streams.contains_key(&channel.kind)
            && (!channel.kind.needs_selector() || channel.selector.is_some())
    }

    pub fn stream_for(&self, channel: &Channel) -> Option<&StreamSpec> {
        self.streams.get(&channel.kind)
    }

    /// Whether this channel shares one physical connection with its siblings.
    pub fn multiplexes(&self) -> bool {
        self.multiplex_capable && self.transport == TransportKind::WebSocket
    }

    /// Endpoint address for a connection.
    ///
    /// `channel` is `None` for multiplexed connections. Query-parameter auth
    /// is applied by the transport opener, not here.
    pub fn address_for(&self, channel: Option<&Channel>) -> Option<Url> {
        let (path, spec) = match channel {
            None => (self.multiplex_path.clone(), None),
            Some(channel) => {
                let spec = self.stream_for(channel)?;
                (self.endpoint_path.replace("{stream}", &spec.stream), Some((channel, spec)))
            }
        };

        let mut url = Url::parse(&format!("{}{}", self.streaming_url, path)).ok()?;
        let mut pairs = Vec::new();
        if let Some((channel, spec)) = spec {
            if let Some(param) = &self.stream_query_param {
                pairs.push((param.as_str(), spec.stream.as_str()));
            }
            if let (Some(param), Some(selector)) = (&spec.selector_param, &channel.selector) {
                pairs.push((param.as_str(), selector.as_str()));
            }
        }
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        Some(url)
    }

    /// REST timeline used to resume or poll a channel.
    pub fn timeline_for(&self, channel: &Channel) -> Option<&RestEndpoint> {
        self.timelines.get(&channel.kind)
    }

    /// Whether a reconnect can resume from the channel cursor.
    pub fn supports_resume(&self, channel: &Channel) -> bool {
        self.sequence_field.is_some() && self.timeline_for(channel).is_some()
    }

    pub fn event_type(&self, discriminator: &str) -> Option<EventType> {
        self.event_types.get(discriminator).copied()
    }

    pub fn ignores(&self, discriminator: &str) -> bool {
        self.ignored_events.contains(discriminator)
    }
}

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|segment| segment.to_string()).collect()
}

fn websocket_base(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    }
}

fn mastodon_streams() -> BTreeMap<ChannelKind, StreamSpec> {
    let mut streams = BTreeMap::new();
    streams.insert(ChannelKind::User, StreamSpec::named("user"));
    streams.insert(ChannelKind::Public, StreamSpec::named("public"));
    streams.insert(ChannelKind::PublicLocal, StreamSpec::named("public:local"));
    streams.insert(
        ChannelKind::Hashtag,
        StreamSpec::named("hashtag").with_selector("tag", SelectorShape::Plain),
    );
    streams.insert(
        ChannelKind::List,
        StreamSpec::named("list").with_selector("list", SelectorShape::Plain),
    );
    streams.insert(ChannelKind::Direct, StreamSpec::named("direct"));
    streams.insert(ChannelKind::Conversation, StreamSpec::named("direct"));
    streams
}

fn mastodon_frame(routing: Routing) -> FrameLayout {
    FrameLayout {
        envelope: None,
        event_path: path(&["event"]),
        payload_path: path(&["payload"]),
        payload_encoding: PayloadEncoding::JsonString,
        routing,
    }
}

fn mastodon_event_types() -> BTreeMap<String, EventType> {
    [
        ("update", EventType::Update),
        ("notification", EventType::Notification),
        ("delete", EventType::Delete),
        ("status.update", EventType::StatusUpdate),
        ("conversation", EventType::Conversation),
        ("announcement", EventType::Announcement),
        ("announcement.reaction", EventType::AnnouncementReaction),
        ("announcement.delete", EventType::AnnouncementDelete),
        ("filters_changed", EventType::FiltersChanged),
    ]
    .into_iter()
    .map(|(name, event_type)| (name.to_string(), event_type))
    .collect()
}

/// `main` channel traffic other than notifications.
fn misskey_ignored_events() -> BTreeSet<String> {
    [
        "mention",
        "reply",
        "renote",
        "follow",
        "followed",
        "unfollow",
        "meUpdated",
        "readAllNotifications",
        "unreadNotification",
        "unreadMention",
        "readAllUnreadMentions",
        "unreadSpecifiedNote",
        "readAllUnreadSpecifiedNotes",
        "readAllAntennas",
        "unreadAntenna",
        "readAllAnnouncements",
        "myTokenRegenerated",
        "signin",
        "registryUpdated",
        "driveFileCreated",
        "urlUploadFinished",
        "receiveFollowRequest",
        "notificationFlushed",
        "pageEvent",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn mastodon_timelines() -> BTreeMap<ChannelKind, RestEndpoint> {
    let mut timelines = BTreeMap::new();
    timelines.insert(ChannelKind::User, RestEndpoint::new("/api/v1/timelines/home"));
    timelines.insert(ChannelKind::Public, RestEndpoint::new("/api/v1/timelines/public"));
    timelines.insert(
        ChannelKind::PublicLocal,
        RestEndpoint::new("/api/v1/timelines/public").param("local", "true"),
    );
    timelines.insert(
        ChannelKind::Hashtag,
        RestEndpoint::new("/api/v1/timelines/tag/{selector}"),
    );
    timelines.insert(
        ChannelKind::List,
        RestEndpoint::new("/api/v1/timelines/list/{selector}"),
    );
    timelines.insert(ChannelKind::Direct, RestEndpoint::new("/api/v1/timelines/direct"));
    timelines
}
