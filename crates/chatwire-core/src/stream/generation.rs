//! State of one generation: buffers, status and epoch.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logging::LogHandle;
use crate::render::Rendered;
use crate::session::ConversationId;
use crate::transcript::{Message, MessageType};

use super::frame::FrameDecoder;

/// Counter distinguishing successive generations.
///
/// Every inbound item is tagged with the epoch of the session that opened
/// its connection; anything not matching the current epoch is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub fn next(self) -> Epoch {
        Epoch(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GenerationStatus {
    /// Connection open, deltas arriving.
    Streaming,

    /// `finish` received, message being finalized.
    Finishing,

    /// Completed normally.
    Finished,

    /// Ended by a server error, transport failure or idle timeout.
    Errored,

    /// Stopped by the client.
    Cancelled,
}

impl GenerationStatus {
    pub fn is_active(self) -> bool {
        matches!(self, GenerationStatus::Streaming | GenerationStatus::Finishing)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Which buffer a delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeltaChannel {
    Reasoning,
    Content,
}

/// One generation, owned by the stream controller.
///
/// Read access is public; every mutation goes through the controller.
#[derive(Debug)]
pub struct GenerationSession {
    conversation_id: ConversationId,
    epoch: Epoch,
    status: GenerationStatus,
    prompt: String,

    content: String,
    reasoning: String,
    reasoning_collapsed: bool,
    content_started: bool,

    rendered_content: Option<Rendered>,
    rendered_reasoning: Option<Rendered>,

    message_id: Uuid,
    started_at: DateTime<Utc>,
    last_activity: Instant,
    frames_received: u64,

    pub(crate) decoder: FrameDecoder,
    pub(crate) wire_log: LogHandle,
}

impl GenerationSession {
    pub(crate) fn new(
        conversation_id: ConversationId,
        epoch: Epoch,
        prompt: String,
        message_id: Uuid,
        wire_log: LogHandle,
    ) -> Self {
        Self {
            conversation_id,
            epoch,
            status: GenerationStatus::Streaming,
            prompt,
            content: String::new(),
            reasoning: String::new(),
            reasoning_collapsed: false,
            content_started: false,
            rendered_content: None,
            rendered_reasoning: None,
            message_id,
            started_at: Utc::now(),
            last_activity: Instant::now(),
            frames_received: 0,
            decoder: FrameDecoder::new(),
            wire_log,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn status(&self) -> GenerationStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn reasoning_collapsed(&self) -> bool {
        self.reasoning_collapsed
    }

    pub fn rendered_content(&self) -> Option<&Rendered> {
        self.rendered_content.as_ref()
    }

    pub fn rendered_reasoning(&self) -> Option<&Rendered> {
        self.rendered_reasoning.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn count_frame(&mut self) {
        self.frames_received += 1;
    }

    pub(crate) fn set_status(&mut self, status: GenerationStatus) {
        self.status = status;
    }

    pub(crate) fn push_reasoning(&mut self, delta: &str) {
        self.reasoning.push_str(delta);
    }

    /// Append a content delta.
    ///
    /// Returns `true` when this delta collapsed the reasoning panel: the
    /// first content delta of a session that already streamed reasoning.
    pub(crate) fn push_content(&mut self, delta: &str) -> bool {
        self.content.push_str(delta);

        if self.content_started {
            return false;
        }
        self.content_started = true;

        if !self.reasoning.is_empty() && !self.reasoning_collapsed {
            self.reasoning_collapsed = true;
            return true;
        }
        false
    }

    pub(crate) fn set_rendered(&mut self, channel: DeltaChannel, rendered: Rendered) {
        match channel {
            DeltaChannel::Reasoning => self.rendered_reasoning = Some(rendered),
            DeltaChannel::Content => self.rendered_content = Some(rendered),
        }
    }

    /// The assistant message this session owns, as of now.
    ///
    /// While in flight it keeps the session start time; the final message is
    /// stamped when it is settled.
    pub(crate) fn to_message(&self, in_flight: bool) -> Message {
        Message {
            id: None,
            conversation_id: Some(self.conversation_id),
            message_type: MessageType::Assistant,
            content: self.content.clone(),
            reasoning_content: Some(self.reasoning.clone()).filter(|r| !r.is_empty()),
            created_at: if in_flight { self.started_at } else { Utc::now() },
            local_id: self.message_id,
            in_flight,
        }
    }
}
