//! Logical stream channels and subscription identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of logical realtime feed.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// The authenticated user's home feed and notifications.
    User,
    /// Federated public feed.
    Public,
    /// Local-only public feed.
    PublicLocal,
    /// Public posts carrying one hashtag. Selector is the tag name.
    Hashtag,
    /// Posts from one list. Selector is the list id.
    List,
    /// Direct messages.
    Direct,
    /// Conversation updates.
    Conversation,
}

impl ChannelKind {
    /// Whether channels of this kind need a selector.
    pub fn needs_selector(self) -> bool {
        matches!(self, Self::Hashtag | Self::List)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Public => "public",
            Self::PublicLocal => "public_local",
            Self::Hashtag => "hashtag",
            Self::List => "list",
            Self::Direct => "direct",
            Self::Conversation => "conversation",
        }
    }
}

/// One logical subscription target. Equality is structural.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Channel {
    /// Identifier of the backend instance this channel belongs to.
    pub backend_id: String,
    pub kind: ChannelKind,
    /// Disambiguates hashtag and list channels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl Channel {
    pub fn new(backend_id: impl Into<String>, kind: ChannelKind, selector: Option<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            kind,
            selector,
        }
    }

    pub fn user(backend_id: impl Into<String>) -> Self {
        Self::new(backend_id, ChannelKind::User, None)
    }

    pub fn public(backend_id: impl Into<String>) -> Self {
        Self::new(backend_id, ChannelKind::Public, None)
    }

    pub fn public_local(backend_id: impl Into<String>) -> Self {
        Self::new(backend_id, ChannelKind::PublicLocal, None)
    }

    /// Hashtag channel. A leading `#` is stripped.
    pub fn hashtag(backend_id: impl Into<String>, tag: impl AsRef<str>) -> Self {
        let tag = tag.as_ref().trim().trim_start_matches('#').to_string();
        Self::new(backend_id, ChannelKind::Hashtag, Some(tag))
    }

    pub fn list(backend_id: impl Into<String>, list_id: impl Into<String>) -> Self {
        Self::new(backend_id, ChannelKind::List, Some(list_id.into()))
    }

    pub fn direct(backend_id: impl Into<String>) -> Self {
        Self::new(backend_id, ChannelKind::Direct, None)
    }

    pub fn conversation(backend_id: impl Into<String>) -> Self {
        Self::new(backend_id, ChannelKind::Conversation, None)
    }

    /// Stable textual key, also used as the wire id on multiplexed sockets.
    pub fn key(&self) -> String {
        match &self.selector {
            Some(selector) => format!("{}:{}:{}", self.backend_id, self.kind.as_str(), selector),
            None => format!("{}:{}", self.backend_id, self.kind.as_str()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Opaque handle returned by `subscribe`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}
