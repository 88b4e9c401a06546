//! Typed broadcasting of stream updates.
//!
//! The controller publishes every observable change of a generation on a
//! [`StreamBus`]. Views subscribe and redraw from the updates; nothing they
//! do can feed back into the controller.
//!
//! # Example
//!
//! ```rust
//! use chatwire_core::event_bus::{StreamBus, StreamUpdate};
//! use chatwire_core::stream::Epoch;
//!
//! let bus = StreamBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.emit(StreamUpdate::ReasoningCollapsed { epoch: Epoch(1) });
//! assert!(matches!(rx.try_recv(), Ok(StreamUpdate::ReasoningCollapsed { .. })));
//! ```

use serde::Serialize;
use tokio::sync::broadcast;

use crate::render::Rendered;
use crate::session::ConversationId;
use crate::stream::{DeltaChannel, Epoch};

/// Events beyond this capacity cause slow subscribers to lag.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A short, user-facing message about the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusNotice {
    pub level: NoticeLevel,
    pub text: String,
}

impl StatusNotice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == NoticeLevel::Error
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum SessionOutcome {
    Finished,
    ServerError { message: String },
    ConnectionLost { detail: String },
    TimedOut,
    Cancelled,
}

/// One observable change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StreamUpdate {
    #[serde(rename_all = "camelCase")]
    Started {
        epoch: Epoch,
        conversation_id: ConversationId,
    },

    /// Raw text appended to a buffer.
    Delta {
        epoch: Epoch,
        channel: DeltaChannel,
        text: String,
    },

    /// Fresh rendering of a whole buffer.
    #[serde(rename_all = "camelCase")]
    Rendered {
        epoch: Epoch,
        channel: DeltaChannel,
        rendered: Rendered,
        reasoning_collapsed: bool,
    },

    ReasoningCollapsed { epoch: Epoch },

    Status { epoch: Epoch, notice: StatusNotice },

    Ended { epoch: Epoch, outcome: SessionOutcome },
}

impl StreamUpdate {
    pub fn epoch(&self) -> Epoch {
        match self {
            StreamUpdate::Started { epoch, .. }
            | StreamUpdate::Delta { epoch, .. }
            | StreamUpdate::Rendered { epoch, .. }
            | StreamUpdate::ReasoningCollapsed { epoch }
            | StreamUpdate::Status { epoch, .. }
            | StreamUpdate::Ended { epoch, .. } => *epoch,
        }
    }
}

/// Broadcast channel for [`StreamUpdate`]s.
///
/// Uses a tokio broadcast channel internally, so any number of views can
/// follow the same generation.
pub struct StreamBus {
    sender: broadcast::Sender<StreamUpdate>,
}

impl StreamBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an update.
    ///
    /// Returns the number of subscribers that received it. With no
    /// subscribers the update is dropped and 0 is returned.
    pub fn emit(&self, update: StreamUpdate) -> usize {
        self.sender.send(update).unwrap_or(0)
    }

    /// Receive all future updates. Past updates are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamUpdate> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StreamBus {
    fn default() -> Self {
        Self::new()
    }
}
