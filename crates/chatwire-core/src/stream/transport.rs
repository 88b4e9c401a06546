//! Opening streaming connections.
//!
//! A transport owns the I/O side of a generation. It reads the response
//! body on its own thread and hands raw lines to a [`FrameSink`]; decoding
//! and every state change happen on the controller's side of the channel.

use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::{ConversationId, Credential};

use super::generation::Epoch;

/// Whether the model should stream its reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingMode {
    #[default]
    Enabled,
    Disabled,
}

impl ThinkingMode {
    pub fn as_param(self) -> &'static str {
        match self {
            ThinkingMode::Enabled => "enabled",
            ThinkingMode::Disabled => "disabled",
        }
    }
}

impl From<bool> for ThinkingMode {
    fn from(enabled: bool) -> Self {
        if enabled {
            ThinkingMode::Enabled
        } else {
            ThinkingMode::Disabled
        }
    }
}

/// Per-request generation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub thinking: ThinkingMode,
}

/// Everything a transport needs to open one generation stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub epoch: Epoch,
    pub conversation_id: ConversationId,
    pub prompt: String,
    pub credential: Option<Credential>,
    pub thinking: ThinkingMode,
}

impl StreamRequest {
    /// Path relative to the API base.
    pub fn path(&self) -> String {
        format!("/ai/stream/{}", self.conversation_id)
    }

    /// Query parameters. The prompt is omitted when empty and the token
    /// when there is no credential.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(3);
        if !self.prompt.is_empty() {
            pairs.push(("prompt", self.prompt.clone()));
        }
        if let Some(credential) = &self.credential {
            pairs.push(("token", credential.expose().to_string()));
        }
        pairs.push(("thinking", self.thinking.as_param().to_string()));
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("failed to start reader thread: {0}")]
    Spawn(String),
}

/// What a connection reports about its stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One line of the response body, line terminator included.
    Line(String),

    /// The server ended the stream.
    Closed,

    /// The connection could not be opened or broke mid-stream.
    Failed(TransportError),
}

/// A transport event tagged with the epoch of the connection it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub epoch: Epoch,
    pub event: TransportEvent,
}

/// Sending half handed to a connection.
///
/// Every method returns `false` once the controller is gone, which is the
/// reader's cue to stop.
#[derive(Debug, Clone)]
pub struct FrameSink {
    epoch: Epoch,
    sender: mpsc::Sender<Inbound>,
}

impl FrameSink {
    pub(crate) fn new(epoch: Epoch, sender: mpsc::Sender<Inbound>) -> Self {
        Self { epoch, sender }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn line(&self, line: impl Into<String>) -> bool {
        self.send(TransportEvent::Line(line.into()))
    }

    pub fn closed(&self) -> bool {
        self.send(TransportEvent::Closed)
    }

    pub fn failed(&self, error: TransportError) -> bool {
        self.send(TransportEvent::Failed(error))
    }

    fn send(&self, event: TransportEvent) -> bool {
        self.sender
            .send(Inbound {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// Handle on an open stream.
pub trait Connection: Send {
    /// Stop delivering. Idempotent.
    fn close(&mut self);
}

/// Opens generation streams.
pub trait Transport {
    fn open(
        &mut self,
        request: &StreamRequest,
        sink: FrameSink,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// Server-sent events over HTTP.
///
/// There is no read timeout on the agent; stalled streams are caught by the
/// controller's idle timer instead.
pub struct HttpTransport {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Transport for HttpTransport {
    fn open(
        &mut self,
        request: &StreamRequest,
        sink: FrameSink,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let url = format!("{}{}", self.base_url, request.path());
        let mut call = self
            .agent
            .get(&url)
            .set("Accept", "text/event-stream")
            .set("Cache-Control", "no-cache");
        for (key, value) in request.query_pairs() {
            call = call.query(key, &value);
        }

        let active = Arc::new(AtomicBool::new(true));
        let reader_active = Arc::clone(&active);
        let epoch = request.epoch;

        std::thread::Builder::new()
            .name(format!("chatwire-stream-{}", epoch))
            .spawn(move || read_stream(call, sink, reader_active))
            .map_err(|e| TransportError::Spawn(e.to_string()))?;

        log::debug!("Opened stream {} for epoch {}", url, epoch);
        Ok(Box::new(HttpConnection { active }))
    }
}

fn read_stream(call: ureq::Request, sink: FrameSink, active: Arc<AtomicBool>) {
    let response = match call.call() {
        Ok(r) => r,
        Err(ureq::Error::Status(status, response)) => {
            let message = response
                .into_string()
                .unwrap_or_default()
                .trim()
                .to_string();
            if active.load(Ordering::SeqCst) {
                sink.failed(TransportError::Status { status, message });
            }
            return;
        }
        Err(e) => {
            if active.load(Ordering::SeqCst) {
                sink.failed(TransportError::Connect(e.to_string()));
            }
            return;
        }
    };

    let mut reader = BufReader::new(response.into_reader());
    let mut buffer = Vec::new();

    while active.load(Ordering::SeqCst) {
        buffer.clear();

        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => {
                if active.load(Ordering::SeqCst) {
                    sink.closed();
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if active.load(Ordering::SeqCst) {
                    sink.failed(TransportError::Read(e.to_string()));
                }
                break;
            }
        }

        if !active.load(Ordering::SeqCst) {
            break;
        }
        let line = String::from_utf8_lossy(&buffer).into_owned();
        if !sink.line(line) {
            break;
        }
    }

    log::debug!("Stream reader for epoch {} ended", sink.epoch());
}

struct HttpConnection {
    active: Arc<AtomicBool>,
}

impl Connection for HttpConnection {
    fn close(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.close();
    }
}
