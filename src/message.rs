// src/message.rs
use serde::{Deserialize, Serialize};

/// A file attached to an [`Event`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Attachment {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Base64 text as sent by the producer; never decoded here.
    #[serde(default)]
    pub content: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.kind == "image"
    }
}

/// A notification published on the events queue.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Event {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attaches: Vec<Attachment>,
    /// Chat id to notify; 0 means nobody.
    #[serde(default)]
    pub recipient: i64,
}

/// How an event should be rendered by a chat transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Text,
    Photo,
    File,
    MediaGroup,
}

impl Event {
    pub fn text(recipient: i64, text: &str) -> Self {
        Self {
            text: text.to_string(),
            attaches: Vec::new(),
            recipient,
        }
    }

    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn has_recipient(&self) -> bool {
        self.recipient != 0
    }

    pub fn kind(&self) -> EventKind {
        match self.attaches.as_slice() {
            [] => EventKind::Text,
            [single] if single.is_image() => EventKind::Photo,
            [_] => EventKind::File,
            _ => EventKind::MediaGroup,
        }
    }
}
