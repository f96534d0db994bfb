//! Conversation model: roles, multi-part messages and the conversation itself.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::error::{ChatError, Result};
use crate::prompts;

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// Base64 payload of an inline binary part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

impl InlineData {
    pub fn decode(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ChatError::Deserialization(format!("invalid base64 in {} part: {}", self.mime_type, e)))
    }

    /// File extension matching the MIME type
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "bin",
        }
    }
}

/// One part of a message. Serializes to `{"text": ..}` or `{"inlineData": {..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePart {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn image(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        MessagePart::Image {
            inline_data: InlineData {
                mime_type: mime_type.into(),
                data: data.into(),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePart::Text { text } => Some(text),
            MessagePart::Image { .. } => None,
        }
    }
}

/// Lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Complete,
    /// Still receiving streamed fragments
    Streaming,
    /// Stands in for a turn that failed
    Failed,
}

impl MessageStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, MessageStatus::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<MessagePart>,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "MessageStatus::is_complete")]
    pub status: MessageStatus,
}

/// Current time at the resolution the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

impl Message {
    pub fn with_parts(role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            role,
            parts,
            timestamp: now(),
            status: MessageStatus::Complete,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_parts(Role::User, vec![MessagePart::text(text)])
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::with_parts(Role::Model, vec![MessagePart::text(text)])
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Concatenation of all text parts, in order
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(MessagePart::as_text).collect()
    }

    pub fn images(&self) -> impl Iterator<Item = &InlineData> {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::Image { inline_data } => Some(inline_data),
            MessagePart::Text { .. } => None,
        })
    }

    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }

    /// A model turn that represents a failure rather than a reply.
    pub fn is_failed_turn(&self) -> bool {
        if self.role != Role::Model {
            return false;
        }
        match self.status {
            MessageStatus::Failed => true,
            MessageStatus::Streaming => false,
            MessageStatus::Complete => self
                .parts
                .first()
                .and_then(MessagePart::as_text)
                .is_some_and(prompts::is_error_reply),
        }
    }
}

/// Ordered list of messages. Append-only, except that the tail may be swapped
/// for a new value while a reply streams in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_greeting(greeting: &str) -> Self {
        Self {
            messages: vec![Message::model(greeting)],
        }
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the tail message, returning the old one.
    pub fn replace_last(&mut self, message: Message) -> Option<Message> {
        match self.messages.last_mut() {
            Some(slot) => Some(std::mem::replace(slot, message)),
            None => {
                self.messages.push(message);
                None
            }
        }
    }

    /// Only the opening greeting (or nothing) so far
    pub fn is_pristine(&self) -> bool {
        self.messages.len() <= 1
    }

    /// Messages that seed a remote session: everything except a trailing failed turn.
    ///
    /// A pristine conversation seeds nothing; the greeting is local decoration
    /// until the user has said something.
    pub fn history(&self) -> &[Message] {
        if self.is_pristine() {
            return &[];
        }
        match self.messages.split_last() {
            Some((last, rest)) if last.is_failed_turn() => rest,
            _ => &self.messages,
        }
    }

    /// Turn an interrupted in-progress reply into a failed turn. Used on reload,
    /// where nothing can still be streaming.
    pub fn settle_interrupted(&mut self) {
        for message in self.messages.iter_mut().filter(|m| m.is_streaming()) {
            message.status = MessageStatus::Failed;
        }
    }
}

/// RFC 3339 timestamps with millisecond precision and a `Z` suffix.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
