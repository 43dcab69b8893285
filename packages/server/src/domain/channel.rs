//! Channel and message entities.

use serde::{Deserialize, Serialize};

/// Kind of a channel: text carries messages, voice carries media sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    pub position: i32,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    /// None once the author account is gone
    pub author_id: Option<String>,
    pub content: Option<String>,
    pub reply_to_id: Option<String>,
    pub created_at: String,
    pub edited_at: Option<String>,
    pub deleted_at: Option<String>,
}

/// Context of the message a reply points at, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    pub id: String,
    pub author_id: Option<String>,
    pub author_username: String,
    pub content: Option<String>,
    pub deleted: bool,
}

/// An uploaded file linked to a message. Uploading itself is handled by the
/// external API layer; the hub only reads the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub mime_type: String,
}
