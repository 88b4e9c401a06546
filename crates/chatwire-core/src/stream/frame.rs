//! Push-channel frame decoding.
//!
//! The server speaks server-sent events whose `data:` payload is one JSON
//! object per event:
//!
//! ```text
//! data: {"conversationId":7}
//!
//! data: {"type":"reasoning","content":"Let"}
//!
//! data: {"type":"token","content":"Hello"}
//!
//! data: {"type":"finish","conversationId":7,"content":"Hello","chunkCount":2}
//! ```
//!
//! Bare NDJSON lines (`{"type":"heartbeat"}`) are accepted too. SSE
//! comments and the `event:`, `id:` and `retry:` fields carry nothing this
//! client needs and are skipped.

use serde::Deserialize;
use thiserror::Error;

use crate::session::ConversationId;

/// A decoded push-channel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Untyped acknowledgement sent once when the channel opens.
    Connected { conversation_id: ConversationId },

    /// Liveness signal.
    Heartbeat,

    /// Reasoning ("thinking") delta.
    Reasoning { content: String },

    /// Answer content delta (`token` or `message` on the wire).
    Content { content: String },

    /// Generation finished. `content` and `chunk_count` are server-side
    /// totals, useful only for diagnostics.
    Finish {
        content: Option<String>,
        chunk_count: Option<u64>,
    },

    /// Server-signaled failure.
    Error {
        message: Option<String>,
        details: Option<String>,
    },
}

impl Frame {
    /// Decode one JSON payload.
    pub fn decode(data: &str) -> Result<Frame, FrameError> {
        let value: serde_json::Value = serde_json::from_str(data)?;
        let object = value.as_object().ok_or(FrameError::NotAnObject)?;

        match object.get("type") {
            None => {
                let ack: ConnectAck =
                    serde_json::from_value(value).map_err(|_| FrameError::MissingType)?;
                Ok(Frame::Connected {
                    conversation_id: ack.conversation_id,
                })
            }
            Some(serde_json::Value::String(kind)) if !KNOWN_TYPES.contains(&kind.as_str()) => {
                Err(FrameError::UnknownType(kind.clone()))
            }
            Some(_) => Ok(serde_json::from_value::<WireFrame>(value)?.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Finish { .. } | Frame::Error { .. })
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no type")]
    MissingType,

    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

const KNOWN_TYPES: &[&str] = &["heartbeat", "reasoning", "token", "message", "finish", "error"];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectAck {
    conversation_id: ConversationId,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireFrame {
    Heartbeat,
    Reasoning {
        #[serde(default)]
        content: String,
    },
    #[serde(alias = "message")]
    Token {
        #[serde(default)]
        content: String,
    },
    Finish {
        #[serde(default)]
        content: Option<String>,
        #[serde(default, rename = "chunkCount")]
        chunk_count: Option<u64>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        details: Option<String>,
    },
}

impl From<WireFrame> for Frame {
    fn from(wire: WireFrame) -> Self {
        match wire {
            WireFrame::Heartbeat => Frame::Heartbeat,
            WireFrame::Reasoning { content } => Frame::Reasoning { content },
            WireFrame::Token { content } => Frame::Content { content },
            WireFrame::Finish {
                content,
                chunk_count,
            } => Frame::Finish {
                content,
                chunk_count,
            },
            WireFrame::Error { message, details } => Frame::Error { message, details },
        }
    }
}

/// Incremental decoder for one connection.
///
/// Accepts arbitrary chunks, keeps incomplete lines buffered, and yields
/// frames (or per-frame decode errors) in wire order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Incomplete trailing line.
    buffer: String,

    /// `data:` lines of the SSE event being assembled.
    data: Vec<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw transport text and collect completed frames.
    pub fn feed(&mut self, chunk: &str) -> Vec<Result<Frame, FrameError>> {
        let mut frames = Vec::new();

        self.buffer.push_str(chunk);
        let buffer = std::mem::take(&mut self.buffer);
        let mut lines: Vec<&str> = buffer.split('\n').collect();

        if let Some(incomplete) = lines.pop() {
            self.buffer = incomplete.to_string();
        }

        for line in lines {
            self.process_line(line.strip_suffix('\r').unwrap_or(line), &mut frames);
        }

        frames
    }

    /// Decode whatever is left once the connection has closed.
    pub fn flush(&mut self) -> Vec<Result<Frame, FrameError>> {
        let mut frames = Vec::new();
        let remaining = std::mem::take(&mut self.buffer);
        if !remaining.trim().is_empty() {
            self.process_line(remaining.trim_end_matches('\r'), &mut frames);
        }
        self.dispatch(&mut frames);
        frames
    }

    fn process_line(&mut self, line: &str, frames: &mut Vec<Result<Frame, FrameError>>) {
        if line.trim().is_empty() {
            self.dispatch(frames);
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(data) = line.strip_prefix("data:") {
            self.data
                .push(data.strip_prefix(' ').unwrap_or(data).to_string());
            return;
        }

        if ["event:", "id:", "retry:"]
            .iter()
            .any(|field| line.starts_with(field))
        {
            log::trace!("Ignoring SSE field line: {}", line);
            return;
        }

        // Bare NDJSON line.
        self.dispatch(frames);
        frames.push(Frame::decode(line.trim()));
    }

    fn dispatch(&mut self, frames: &mut Vec<Result<Frame, FrameError>>) {
        if self.data.is_empty() {
            return;
        }
        let payload = self.data.join("\n");
        self.data.clear();

        let payload = payload.trim();
        if payload.is_empty() {
            return;
        }
        if payload == "[DONE]" {
            log::debug!("Ignoring upstream [DONE] marker");
            return;
        }
        frames.push(Frame::decode(payload));
    }
}
