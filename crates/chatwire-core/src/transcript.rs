//! Messages of the active conversation, in chronological order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::ConversationId;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    System,
    User,
    Assistant,
}

/// A single transcript entry.
///
/// Persisted messages carry the server `id`; optimistic and in-flight ones
/// do not. `local_id` is a client-side key that stays stable while an
/// in-flight message is rewritten, so views can update it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(default)]
    pub content: String,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_string_as_none"
    )]
    pub reasoning_content: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(skip, default = "Uuid::new_v4")]
    pub local_id: Uuid,

    /// Still being generated.
    #[serde(skip)]
    pub in_flight: bool,
}

impl Message {
    /// An optimistic user message, not yet acknowledged by the server.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageType::User, content.into())
    }

    /// An empty assistant message that a generation will fill.
    pub fn assistant_placeholder() -> Self {
        Self {
            in_flight: true,
            ..Self::new(MessageType::Assistant, String::new())
        }
    }

    fn new(message_type: MessageType, content: String) -> Self {
        Self {
            id: None,
            conversation_id: None,
            message_type,
            content,
            reasoning_content: None,
            created_at: Utc::now(),
            local_id: Uuid::new_v4(),
            in_flight: false,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.message_type == MessageType::Assistant
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// What the stream controller needs from a transcript.
pub trait Transcript {
    /// Append a message at the end.
    fn append(&mut self, message: Message);

    /// Replace the last message. Returns `false` when the transcript is empty.
    fn replace_last(&mut self, message: Message) -> bool;

    /// Whether the last message is an in-flight assistant placeholder.
    fn last_is_in_flight_placeholder(&self) -> bool;
}

/// Append-only list of messages for the active conversation.
///
/// At most one message is in flight, and it is always the last one.
#[derive(Debug, Clone, Default)]
pub struct ConversationTranscript {
    messages: Vec<Message>,
}

impl ConversationTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The in-flight assistant message, if a generation owns one.
    pub fn in_flight(&self) -> Option<&Message> {
        self.messages.last().filter(|m| m.in_flight)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Replace the contents with messages loaded from the server.
    pub fn load(&mut self, messages: Vec<Message>) {
        self.messages = messages
            .into_iter()
            .map(|mut m| {
                m.in_flight = false;
                m
            })
            .collect();
    }
}

impl Transcript for ConversationTranscript {
    fn append(&mut self, message: Message) {
        if let Some(last) = self.messages.last_mut().filter(|m| m.in_flight) {
            log::warn!("Appending behind an in-flight message; settling it");
            last.in_flight = false;
        }
        self.messages.push(message);
    }

    fn replace_last(&mut self, message: Message) -> bool {
        match self.messages.last_mut() {
            Some(last) => {
                *last = message;
                true
            }
            None => false,
        }
    }

    fn last_is_in_flight_placeholder(&self) -> bool {
        self.messages
            .last()
            .is_some_and(|m| m.in_flight && m.is_assistant())
    }
}
