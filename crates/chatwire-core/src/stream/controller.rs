//! The generation stream controller.
//!
//! Owns at most one [`GenerationSession`] and the connection feeding it.
//! Reader threads only push epoch-tagged lines into a channel; every state
//! change happens on the caller's thread inside [`StreamController::pump`]
//! or [`StreamController::drain`], in arrival order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use crate::event_bus::{SessionOutcome, StatusNotice, StreamBus, StreamUpdate};
use crate::logging::{log_line, open_log_file};
use crate::render::{MarkdownRenderer, Render};
use crate::session::{ConversationId, SessionState};
use crate::transcript::Transcript;

use super::frame::{Frame, FrameError};
use super::generation::{DeltaChannel, Epoch, GenerationSession, GenerationStatus};
use super::transport::{
    Connection, FrameSink, Inbound, StreamOptions, StreamRequest, Transport, TransportError,
    TransportEvent,
};

/// Default idle timeout before a silent stream is treated as lost.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_ERROR_TEXT: &str = "Generation failed";
const CONNECTION_LOST_TEXT: &str = "Connection lost";
const TIMED_OUT_TEXT: &str = "Connection timed out";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Select or create a conversation first")]
    NoActiveConversation,

    #[error("conversation {requested} is not the active conversation ({active})")]
    ConversationMismatch {
        requested: ConversationId,
        active: ConversationId,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Shareable request to cancel the active generation.
///
/// The controller honours it at its next [`StreamController::pump`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// What applying a frame asks the controller to do next.
enum FrameAction {
    Continue,
    Finish,
    Fail(String),
}

pub struct StreamController<T: Transport, R: Render = MarkdownRenderer> {
    transport: T,
    renderer: R,
    bus: Arc<StreamBus>,

    session: Option<GenerationSession>,
    connection: Option<Box<dyn Connection>>,
    epoch: Epoch,

    sender: mpsc::Sender<Inbound>,
    receiver: mpsc::Receiver<Inbound>,
    cancel: CancelHandle,

    idle_timeout: Option<Duration>,
    log_dir: Option<PathBuf>,
    notice: Option<StatusNotice>,
}

impl<T: Transport, R: Render> StreamController<T, R> {
    pub fn new(transport: T, renderer: R, bus: Arc<StreamBus>) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            transport,
            renderer,
            bus,
            session: None,
            connection: None,
            epoch: Epoch::ZERO,
            sender,
            receiver,
            cancel: CancelHandle::default(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            log_dir: None,
            notice: None,
        }
    }

    /// `None` disables the idle timer.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Keep a raw wire log per generation under `dir`.
    pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }

    /// The current or most recent session.
    pub fn session(&self) -> Option<&GenerationSession> {
        self.session.as_ref()
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_generating(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_active())
    }

    /// The last status surfaced to the user, if any.
    pub fn status_notice(&self) -> Option<&StatusNotice> {
        self.notice.as_ref()
    }

    pub fn bus(&self) -> &Arc<StreamBus> {
        &self.bus
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Surface a status outside of any frame (e.g. an expired session).
    pub fn notify(&mut self, notice: StatusNotice) {
        self.bus.emit(StreamUpdate::Status {
            epoch: self.epoch,
            notice: notice.clone(),
        });
        self.notice = Some(notice);
    }

    /// Open a new generation for the active conversation.
    ///
    /// Any active generation is cancelled first. If the transport cannot be
    /// opened the new session ends as a lost connection and the error is
    /// returned.
    pub fn start(
        &mut self,
        state: &mut SessionState,
        transcript: &mut impl Transcript,
        conversation_id: ConversationId,
        prompt: impl Into<String>,
        options: StreamOptions,
    ) -> Result<Epoch, StreamError> {
        match state.active_conversation() {
            None => return Err(StreamError::NoActiveConversation),
            Some(active) if active != conversation_id => {
                return Err(StreamError::ConversationMismatch {
                    requested: conversation_id,
                    active,
                })
            }
            Some(_) => {}
        }

        if self.is_generating() {
            log::debug!("Superseding generation {}", self.epoch);
            self.end_session(
                state,
                transcript,
                GenerationStatus::Cancelled,
                SessionOutcome::Cancelled,
                None,
                true,
            );
        }

        self.epoch = self.epoch.next();
        let epoch = self.epoch;

        let stale = self.receiver.try_iter().count();
        if stale > 0 {
            log::debug!("Discarded {} queued items from earlier generations", stale);
        }
        self.cancel.take();
        self.notice = None;

        let request = StreamRequest {
            epoch,
            conversation_id,
            prompt: prompt.into(),
            credential: state.credential().cloned(),
            thinking: options.thinking,
        };

        let wire_log = open_log_file(
            self.log_dir.as_deref(),
            &format!("stream-{}-{}", conversation_id, epoch),
        );
        log_line(
            &wire_log,
            "OPEN",
            &format!("{} thinking={}", request.path(), request.thinking.as_param()),
        );

        let session = GenerationSession::new(
            conversation_id,
            epoch,
            request.prompt.clone(),
            Uuid::new_v4(),
            wire_log,
        );
        let placeholder = session.to_message(true);
        if transcript.last_is_in_flight_placeholder() {
            transcript.replace_last(placeholder);
        } else {
            transcript.append(placeholder);
        }
        self.session = Some(session);
        state.set_generating(true);

        self.bus.emit(StreamUpdate::Started {
            epoch,
            conversation_id,
        });

        let sink = FrameSink::new(epoch, self.sender.clone());
        match self.transport.open(&request, sink) {
            Ok(connection) => {
                self.connection = Some(connection);
                log::info!(
                    "Generation {} started for conversation {}",
                    epoch,
                    conversation_id
                );
                Ok(epoch)
            }
            Err(e) => {
                log::error!("Failed to open stream for conversation {}: {}", conversation_id, e);
                self.lose_connection(state, transcript, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Cancel the active generation. Returns `false` when there was none.
    pub fn stop(&mut self, state: &mut SessionState, transcript: &mut impl Transcript) -> bool {
        if !self.is_generating() {
            return false;
        }
        self.end_session(
            state,
            transcript,
            GenerationStatus::Cancelled,
            SessionOutcome::Cancelled,
            None,
            false,
        );
        true
    }

    /// Wait up to `wait` for inbound items, then process everything queued.
    ///
    /// The wait is cut short at the idle deadline. Returns the number of
    /// items handled.
    pub fn pump(
        &mut self,
        state: &mut SessionState,
        transcript: &mut impl Transcript,
        wait: Duration,
    ) -> usize {
        if self.cancel.take() && self.stop(state, transcript) {
            log::debug!("Generation {} cancelled on request", self.epoch);
        }

        if !self.is_generating() {
            return self.drain(state, transcript);
        }

        let wait = match self.idle_deadline() {
            Some(deadline) => wait.min(deadline.saturating_duration_since(Instant::now())),
            None => wait,
        };

        let mut handled = 0;
        if !wait.is_zero() {
            match self.receiver.recv_timeout(wait) {
                Ok(inbound) => {
                    self.handle(state, transcript, inbound);
                    handled += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }

        handled += self.drain(state, transcript);
        self.check_idle(state, transcript, Instant::now());
        handled
    }

    /// Process every queued item without waiting.
    pub fn drain(&mut self, state: &mut SessionState, transcript: &mut impl Transcript) -> usize {
        let mut handled = 0;
        while let Ok(inbound) = self.receiver.try_recv() {
            self.handle(state, transcript, inbound);
            handled += 1;
        }
        handled
    }

    /// Pump until the active generation ends. Returns its final status.
    ///
    /// Without an idle timeout this blocks for as long as the server keeps
    /// the stream open.
    pub fn run_to_completion(
        &mut self,
        state: &mut SessionState,
        transcript: &mut impl Transcript,
        poll: Duration,
    ) -> Option<GenerationStatus> {
        while self.is_generating() {
            self.pump(state, transcript, poll);
        }
        self.session.as_ref().map(|s| s.status())
    }

    /// End the session if it has been silent for longer than the idle
    /// timeout as of `now`.
    pub(crate) fn check_idle(
        &mut self,
        state: &mut SessionState,
        transcript: &mut impl Transcript,
        now: Instant,
    ) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let expired = self
            .session
            .as_ref()
            .filter(|s| s.is_active())
            .is_some_and(|s| now.saturating_duration_since(s.last_activity()) >= timeout);

        if expired {
            log::warn!(
                "Generation {} idle for {:?}, closing",
                self.epoch,
                timeout
            );
            self.end_session(
                state,
                transcript,
                GenerationStatus::Errored,
                SessionOutcome::TimedOut,
                Some(StatusNotice::error(TIMED_OUT_TEXT)),
                false,
            );
        }
    }

    fn idle_deadline(&self) -> Option<Instant> {
        let timeout = self.idle_timeout?;
        self.session
            .as_ref()
            .filter(|s| s.is_active())
            .and_then(|s| s.last_activity().checked_add(timeout))
    }

    fn handle(&mut self, state: &mut SessionState, transcript: &mut impl Transcript, inbound: Inbound) {
        let Some(session) = self.session.as_mut() else {
            log::debug!("Dropping item from epoch {}: no session", inbound.epoch);
            return;
        };
        if inbound.epoch != session.epoch() {
            log::debug!(
                "Dropping stale item from epoch {} (current {})",
                inbound.epoch,
                session.epoch()
            );
            return;
        }
        if !session.is_active() {
            log::debug!("Dropping item for finished generation {}", inbound.epoch);
            return;
        }
        session.touch();

        match inbound.event {
            TransportEvent::Line(line) => {
                if !line.trim().is_empty() {
                    log_line(&session.wire_log, "RECV", &line);
                }
                let frames = session.decoder.feed(&line);
                self.apply_all(state, transcript, frames);
            }
            TransportEvent::Closed => {
                let frames = session.decoder.flush();
                self.apply_all(state, transcript, frames);
                if self.is_generating() {
                    log::warn!("Stream {} closed without a terminal frame", inbound.epoch);
                    self.lose_connection(state, transcript, "closed by server".to_string());
                }
            }
            TransportEvent::Failed(e) => {
                log::error!("Stream {} failed: {}", inbound.epoch, e);
                let frames = session.decoder.flush();
                self.apply_all(state, transcript, frames);
                self.lose_connection(state, transcript, e.to_string());
            }
        }
    }

    fn apply_all(
        &mut self,
        state: &mut SessionState,
        transcript: &mut impl Transcript,
        frames: Vec<Result<Frame, FrameError>>,
    ) {
        for result in frames {
            if !self.is_generating() {
                break;
            }
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Skipping malformed frame: {}", e);
                    continue;
                }
            };

            match self.apply_frame(transcript, frame) {
                FrameAction::Continue => {}
                FrameAction::Finish => self.end_session(
                    state,
                    transcript,
                    GenerationStatus::Finished,
                    SessionOutcome::Finished,
                    None,
                    false,
                ),
                FrameAction::Fail(message) => self.end_session(
                    state,
                    transcript,
                    GenerationStatus::Errored,
                    SessionOutcome::ServerError {
                        message: message.clone(),
                    },
                    Some(StatusNotice::error(message)),
                    false,
                ),
            }
        }
    }

    fn apply_frame(&mut self, transcript: &mut impl Transcript, frame: Frame) -> FrameAction {
        let Some(session) = self.session.as_mut() else {
            return FrameAction::Continue;
        };
        session.count_frame();
        let epoch = session.epoch();

        let channel = match frame {
            Frame::Connected { conversation_id } => {
                if conversation_id != session.conversation_id() {
                    log::warn!(
                        "Stream {} acknowledged conversation {} (expected {})",
                        epoch,
                        conversation_id,
                        session.conversation_id()
                    );
                } else {
                    log::debug!("Stream {} connected", epoch);
                }
                return FrameAction::Continue;
            }
            Frame::Heartbeat => {
                log::trace!("Heartbeat on stream {}", epoch);
                return FrameAction::Continue;
            }
            Frame::Finish {
                content,
                chunk_count,
            } => {
                log::debug!(
                    "Stream {} finished: server chunks={:?} server chars={:?} client chars={}",
                    epoch,
                    chunk_count,
                    content.map(|c| c.chars().count()),
                    session.content().chars().count()
                );
                session.set_status(GenerationStatus::Finishing);
                return FrameAction::Finish;
            }
            Frame::Error { message, details } => {
                if let Some(details) = details {
                    log::warn!("Stream {} error details: {}", epoch, details);
                }
                let message = message
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| DEFAULT_ERROR_TEXT.to_string());
                return FrameAction::Fail(message);
            }
            Frame::Reasoning { content } => {
                if content.is_empty() {
                    return FrameAction::Continue;
                }
                session.push_reasoning(&content);
                self.bus.emit(StreamUpdate::Delta {
                    epoch,
                    channel: DeltaChannel::Reasoning,
                    text: content,
                });
                DeltaChannel::Reasoning
            }
            Frame::Content { content } => {
                if content.is_empty() {
                    return FrameAction::Continue;
                }
                if session.push_content(&content) {
                    self.bus.emit(StreamUpdate::ReasoningCollapsed { epoch });
                }
                self.bus.emit(StreamUpdate::Delta {
                    epoch,
                    channel: DeltaChannel::Content,
                    text: content,
                });
                DeltaChannel::Content
            }
        };

        let buffer = match channel {
            DeltaChannel::Reasoning => session.reasoning(),
            DeltaChannel::Content => session.content(),
        };
        let rendered = self.renderer.render(buffer);
        session.set_rendered(channel, rendered.clone());
        self.bus.emit(StreamUpdate::Rendered {
            epoch,
            channel,
            rendered,
            reasoning_collapsed: session.reasoning_collapsed(),
        });

        if transcript.last_is_in_flight_placeholder() {
            transcript.replace_last(session.to_message(true));
        }
        FrameAction::Continue
    }

    fn lose_connection(
        &mut self,
        state: &mut SessionState,
        transcript: &mut impl Transcript,
        reason: String,
    ) {
        self.end_session(
            state,
            transcript,
            GenerationStatus::Errored,
            SessionOutcome::ConnectionLost { detail: reason },
            Some(StatusNotice::error(CONNECTION_LOST_TEXT)),
            false,
        );
    }

    /// Tear down the active session. A no-op when there is none.
    ///
    /// The in-flight message is finalized with whatever was buffered. With
    /// `keep_empty_placeholder` an untouched placeholder stays in flight so
    /// the next session can take it over.
    fn end_session(
        &mut self,
        state: &mut SessionState,
        transcript: &mut impl Transcript,
        status: GenerationStatus,
        outcome: SessionOutcome,
        notice: Option<StatusNotice>,
        keep_empty_placeholder: bool,
    ) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_active()) else {
            return;
        };

        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        session.set_status(status);

        let untouched = session.content().is_empty() && session.reasoning().is_empty();
        if transcript.last_is_in_flight_placeholder() && !(keep_empty_placeholder && untouched) {
            transcript.replace_last(session.to_message(false));
        }
        state.set_generating(false);

        log_line(&session.wire_log, "CLOSE", &format!("{:?}", outcome));
        log::info!(
            "Generation {} ended ({:?}) after {} frames",
            session.epoch(),
            status,
            session.frames_received()
        );

        let epoch = session.epoch();
        if let Some(notice) = notice {
            self.bus.emit(StreamUpdate::Status {
                epoch,
                notice: notice.clone(),
            });
            self.notice = Some(notice);
        }
        self.bus.emit(StreamUpdate::Ended { epoch, outcome });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::NoticeLevel;
    use crate::session::Credential;
    use crate::stream::testing::ScriptedTransport;
    use crate::stream::ThinkingMode;
    use crate::transcript::{ConversationTranscript, Message};
    use tokio::sync::broadcast;

    const CONVERSATION: ConversationId = ConversationId(7);

    struct Fixture {
        controller: StreamController<ScriptedTransport>,
        transport: ScriptedTransport,
        state: SessionState,
        transcript: ConversationTranscript,
        updates: broadcast::Receiver<StreamUpdate>,
    }

    impl Fixture {
        fn new() -> Self {
            let transport = ScriptedTransport::new();
            let bus = Arc::new(StreamBus::new());
            let updates = bus.subscribe();
            let controller = StreamController::new(transport.clone(), MarkdownRenderer::new(), bus);

            let mut state = SessionState::with_credential(Credential::new("secret-token"));
            state.set_active_conversation(Some(CONVERSATION));

            Self {
                controller,
                transport,
                state,
                transcript: ConversationTranscript::new(),
                updates,
            }
        }

        fn start(&mut self) -> Epoch {
            self.controller
                .start(
                    &mut self.state,
                    &mut self.transcript,
                    CONVERSATION,
                    "hi",
                    StreamOptions::default(),
                )
                .unwrap()
        }

        fn send(&mut self, json: &str) {
            self.transport.send(json);
            self.drain();
        }

        fn drain(&mut self) -> usize {
            self.controller.drain(&mut self.state, &mut self.transcript)
        }

        fn stop(&mut self) -> bool {
            self.controller.stop(&mut self.state, &mut self.transcript)
        }

        fn session(&self) -> &GenerationSession {
            self.controller.session().unwrap()
        }

        fn updates(&mut self) -> Vec<StreamUpdate> {
            let mut out = Vec::new();
            while let Ok(update) = self.updates.try_recv() {
                out.push(update);
            }
            out
        }

        fn assistant_messages(&self) -> Vec<&Message> {
            self.transcript
                .messages()
                .iter()
                .filter(|m| m.is_assistant())
                .collect()
        }
    }

    mod start {
        use super::*;

        #[test]
        fn opens_connection_with_credential_and_thinking() {
            let mut f = Fixture::new();
            let epoch = f.controller
                .start(
                    &mut f.state,
                    &mut f.transcript,
                    CONVERSATION,
                    "hello",
                    StreamOptions {
                        thinking: ThinkingMode::Disabled,
                    },
                )
                .unwrap();

            assert_eq!(epoch, Epoch(1));
            let requests = f.transport.requests();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].conversation_id, CONVERSATION);
            assert_eq!(requests[0].prompt, "hello");
            assert_eq!(requests[0].thinking, ThinkingMode::Disabled);
            assert_eq!(
                requests[0].credential.as_ref().map(|c| c.expose()),
                Some("secret-token")
            );
        }

        #[test]
        fn sets_generating_and_appends_placeholder() {
            let mut f = Fixture::new();
            f.start();

            assert!(f.state.is_generating());
            assert!(f.controller.is_generating());
            assert_eq!(f.session().status(), GenerationStatus::Streaming);
            assert!(f.transcript.last_is_in_flight_placeholder());
            assert!(matches!(
                f.updates().first(),
                Some(StreamUpdate::Started { epoch: Epoch(1), .. })
            ));
        }

        #[test]
        fn requires_active_conversation() {
            let mut f = Fixture::new();
            f.state.set_active_conversation(None);

            let err = f
                .controller
                .start(&mut f.state, &mut f.transcript, CONVERSATION, "hi", StreamOptions::default())
                .unwrap_err();
            assert!(matches!(err, StreamError::NoActiveConversation));
            assert_eq!(err.to_string(), "Select or create a conversation first");
            assert!(f.transcript.is_empty());
            assert!(!f.state.is_generating());
            assert!(f.transport.requests().is_empty());
        }

        #[test]
        fn rejects_other_conversation() {
            let mut f = Fixture::new();
            let err = f
                .controller
                .start(
                    &mut f.state,
                    &mut f.transcript,
                    ConversationId(99),
                    "hi",
                    StreamOptions::default(),
                )
                .unwrap_err();
            assert!(matches!(
                err,
                StreamError::ConversationMismatch {
                    requested: ConversationId(99),
                    active: CONVERSATION
                }
            ));
            assert!(f.controller.session().is_none());
        }

        #[test]
        fn double_start_keeps_one_session_and_one_placeholder() {
            let mut f = Fixture::new();
            let first = f.start();
            let second = f.start();

            assert!(second > first);
            assert_eq!(f.controller.epoch(), second);
            assert_eq!(f.session().epoch(), second);
            assert!(f.controller.is_generating());
            assert_eq!(f.transport.closed(), vec![first]);

            let assistants = f.assistant_messages();
            assert_eq!(assistants.len(), 1);
            assert!(assistants[0].in_flight);

            f.send(r#"{"type":"token","content":"partial"}"#);
            let third = f.start();
            f.send(r#"{"type":"reasoning","content":"hmm"}"#);
            let fourth = f.start();

            assert!(fourth > third && third > second);
            assert_eq!(f.session().epoch(), fourth);
            assert!(f.session().content().is_empty());
            assert_eq!(f.transport.closed(), vec![first, second, third]);

            let assistants = f.assistant_messages();
            assert_eq!(assistants.len(), 3);
            assert_eq!(assistants[0].content, "partial");
            assert_eq!(assistants[1].reasoning_content.as_deref(), Some("hmm"));
            assert_eq!(assistants.iter().filter(|m| m.in_flight).count(), 1);
            assert!(assistants[2].in_flight);
            assert!(f.transcript.last_is_in_flight_placeholder());
        }

        #[test]
        fn superseded_partial_answer_is_kept() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"token","content":"partial"}"#);
            f.start();

            let assistants = f.assistant_messages();
            assert_eq!(assistants.len(), 2);
            assert_eq!(assistants[0].content, "partial");
            assert!(!assistants[0].in_flight);
            assert!(assistants[1].in_flight);
        }

        #[test]
        fn stale_epoch_items_are_dropped() {
            let mut f = Fixture::new();
            let first = f.start();
            let old_sink = f.transport.sink_for(first);
            f.start();

            old_sink.line("data: {\"type\":\"token\",\"content\":\"stale\"}\n\n");
            old_sink.closed();
            assert_eq!(f.drain(), 2);

            assert!(f.session().content().is_empty());
            assert!(f.controller.is_generating());
            assert!(f.transcript.last().unwrap().content.is_empty());
        }

        #[test]
        fn open_failure_ends_session_and_returns_error() {
            let mut f = Fixture::new();
            f.transport
                .fail_next(TransportError::Connect("refused".into()));

            let err = f
                .controller
                .start(&mut f.state, &mut f.transcript, CONVERSATION, "hi", StreamOptions::default())
                .unwrap_err();

            assert!(matches!(err, StreamError::Transport(TransportError::Connect(_))));
            assert!(!f.state.is_generating());
            assert_eq!(f.session().status(), GenerationStatus::Errored);
            assert_eq!(f.controller.status_notice().unwrap().text, "Connection lost");
            assert!(f.transcript.in_flight().is_none());
        }
    }

    mod frames {
        use super::*;

        #[test]
        fn reasoning_then_content_then_finish() {
            let mut f = Fixture::new();
            f.start();

            f.send(r#"{"type":"reasoning","content":"Let"}"#);
            f.send(r#"{"type":"reasoning","content":" me think"}"#);
            assert!(!f.session().reasoning_collapsed());

            f.send(r#"{"type":"token","content":"Hello"}"#);
            assert!(f.session().reasoning_collapsed());
            f.send(r#"{"type":"token","content":" there"}"#);
            f.send(r#"{"type":"finish"}"#);

            let session = f.session();
            assert_eq!(session.content(), "Hello there");
            assert_eq!(session.reasoning(), "Let me think");
            assert!(session.reasoning_collapsed());
            assert_eq!(session.status(), GenerationStatus::Finished);
            assert!(!f.state.is_generating());

            let last = f.transcript.last().unwrap();
            assert_eq!(last.content, "Hello there");
            assert_eq!(last.reasoning_content.as_deref(), Some("Let me think"));
            assert!(!last.in_flight);
        }

        #[test]
        fn buffers_only_grow_until_finish() {
            let mut f = Fixture::new();
            f.start();

            let frames = [
                r#"{"type":"reasoning","content":"Step one"}"#,
                r#"{"type":"token","content":"An"}"#,
                r#"{"type":"heartbeat"}"#,
                r#"{"type":"reasoning","content":", step two"}"#,
                r#"{"type":"token","content":"swer"}"#,
                r#"{"type":"token","content":""}"#,
                r#"{"type":"message","content":"!"}"#,
            ];
            let mut last = (0, 0);
            for frame in frames {
                f.send(frame);
                let lens = (f.session().content().len(), f.session().reasoning().len());
                assert!(lens.0 >= last.0, "content shrank after {}", frame);
                assert!(lens.1 >= last.1, "reasoning shrank after {}", frame);
                last = lens;
            }

            f.send(r#"{"type":"finish"}"#);
            assert_eq!(f.session().content(), "Answer!");
            assert_eq!(f.session().reasoning(), "Step one, step two");
        }

        #[test]
        fn message_type_is_a_content_delta() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"message","content":"Hi"}"#);
            assert_eq!(f.session().content(), "Hi");
        }

        #[test]
        fn collapse_is_announced_once() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"reasoning","content":"a"}"#);
            f.send(r#"{"type":"token","content":"b"}"#);
            f.send(r#"{"type":"reasoning","content":"c"}"#);
            f.send(r#"{"type":"token","content":"d"}"#);

            let collapses = f
                .updates()
                .into_iter()
                .filter(|u| matches!(u, StreamUpdate::ReasoningCollapsed { .. }))
                .count();
            assert_eq!(collapses, 1);
            assert!(f.session().reasoning_collapsed());
        }

        #[test]
        fn deltas_update_in_flight_message() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"token","content":"Hel"}"#);
            f.send(r#"{"type":"token","content":"lo"}"#);

            let in_flight = f.transcript.in_flight().unwrap();
            assert_eq!(in_flight.content, "Hello");
            assert_eq!(f.assistant_messages().len(), 1);
        }

        #[test]
        fn content_is_rendered_after_each_delta() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"token","content":"**bold"}"#);
            f.send(r#"{"type":"token","content":"**"}"#);

            let rendered = f.session().rendered_content().unwrap().clone();
            assert!(rendered.as_str().contains("<strong>bold</strong>"));

            let last_render = f
                .updates()
                .into_iter()
                .filter_map(|u| match u {
                    StreamUpdate::Rendered {
                        channel: DeltaChannel::Content,
                        rendered,
                        ..
                    } => Some(rendered),
                    _ => None,
                })
                .last()
                .unwrap();
            assert_eq!(last_render, rendered);
        }

        #[test]
        fn heartbeat_and_ack_change_nothing() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"conversationId":7}"#);
            f.send(r#"{"type":"heartbeat"}"#);

            assert!(f.session().content().is_empty());
            assert!(f.session().reasoning().is_empty());
            assert_eq!(f.session().frames_received(), 2);
            assert!(f.controller.is_generating());
        }

        #[test]
        fn malformed_frames_are_skipped() {
            let mut f = Fixture::new();
            f.start();
            f.transport.send("{broken");
            f.transport.send(r#"{"type":"bogus"}"#);
            f.transport.send(r#"{"type":"token","content":"ok"}"#);
            f.drain();

            assert_eq!(f.session().content(), "ok");
            assert!(f.controller.is_generating());
        }

        #[test]
        fn ndjson_and_sse_framing_agree() {
            let lines = [
                r#"{"type":"reasoning","content":"think"}"#,
                r#"{"type":"token","content":"answer"}"#,
                r#"{"type":"finish","chunkCount":2}"#,
            ];

            let mut sse = Fixture::new();
            sse.start();
            for line in lines {
                sse.send(line);
            }

            let mut ndjson = Fixture::new();
            let epoch = ndjson.start();
            let sink = ndjson.transport.sink_for(epoch);
            for line in lines {
                sink.line(format!("{}\n", line));
            }
            ndjson.drain();

            for f in [&sse, &ndjson] {
                assert_eq!(f.session().content(), "answer");
                assert_eq!(f.session().reasoning(), "think");
                assert_eq!(f.session().status(), GenerationStatus::Finished);
            }
        }

        #[test]
        fn lines_split_across_reads_are_reassembled() {
            let mut f = Fixture::new();
            let epoch = f.start();
            let sink = f.transport.sink_for(epoch);
            sink.line("data: {\"type\":\"tok");
            sink.line("en\",\"content\":\"joined\"}\n");
            sink.line("\n");
            f.drain();

            assert_eq!(f.session().content(), "joined");
        }

        #[test]
        fn items_after_finish_are_ignored() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"token","content":"done"}"#);
            f.send(r#"{"type":"finish"}"#);
            f.send(r#"{"type":"token","content":" more"}"#);
            f.transport.sink().closed();
            f.drain();

            assert_eq!(f.session().content(), "done");
            assert_eq!(f.session().status(), GenerationStatus::Finished);
            assert!(f.controller.status_notice().is_none());
        }

        #[test]
        fn frames_after_finish_in_same_read_are_ignored() {
            let mut f = Fixture::new();
            let epoch = f.start();
            f.transport.sink_for(epoch).line(
                "data: {\"type\":\"finish\"}\n\ndata: {\"type\":\"token\",\"content\":\"late\"}\n\n",
            );
            f.drain();

            assert!(f.session().content().is_empty());
            assert_eq!(f.session().status(), GenerationStatus::Finished);
        }

        #[test]
        fn finish_closes_connection_and_announces_end() {
            let mut f = Fixture::new();
            let epoch = f.start();
            f.send(r#"{"type":"finish","content":"x","chunkCount":1}"#);

            assert_eq!(f.transport.closed(), vec![epoch]);
            let updates = f.updates();
            assert!(matches!(
                updates.last(),
                Some(StreamUpdate::Ended {
                    outcome: SessionOutcome::Finished,
                    ..
                })
            ));
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn server_error_keeps_partial_and_surfaces_message() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"token","content":"partial"}"#);
            f.send(r#"{"type":"error","message":"rate limited","details":"429 upstream"}"#);

            assert!(!f.state.is_generating());
            assert_eq!(f.session().status(), GenerationStatus::Errored);
            let notice = f.controller.status_notice().unwrap();
            assert_eq!(notice.text, "rate limited");
            assert_eq!(notice.level, NoticeLevel::Error);

            let last = f.transcript.last().unwrap();
            assert_eq!(last.content, "partial");
            assert!(!last.in_flight);
        }

        #[test]
        fn blank_error_message_uses_default() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"error","message":"   "}"#);
            assert_eq!(f.controller.status_notice().unwrap().text, "Generation failed");

            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"error"}"#);
            assert_eq!(f.controller.status_notice().unwrap().text, "Generation failed");
        }

        #[test]
        fn disconnect_without_terminal_frame_is_connection_lost() {
            let mut f = Fixture::new();
            f.start();
            f.send(r#"{"type":"token","content":"half"}"#);
            f.transport.sink().closed();
            f.drain();

            assert!(!f.state.is_generating());
            assert_eq!(f.session().status(), GenerationStatus::Errored);
            assert_eq!(f.controller.status_notice().unwrap().text, "Connection lost");
            assert_eq!(f.transcript.last().unwrap().content, "half");
            assert!(f.transcript.in_flight().is_none());
        }

        #[test]
        fn pending_frame_is_flushed_on_close() {
            let mut f = Fixture::new();
            let epoch = f.start();
            let sink = f.transport.sink_for(epoch);
            sink.line("data: {\"type\":\"finish\"}");
            sink.closed();
            f.drain();

            assert_eq!(f.session().status(), GenerationStatus::Finished);
            assert!(f.controller.status_notice().is_none());
        }

        #[test]
        fn transport_failure_is_connection_lost() {
            let mut f = Fixture::new();
            f.start();
            f.transport
                .sink()
                .failed(TransportError::Read("reset by peer".into()));
            f.drain();

            assert_eq!(f.controller.status_notice().unwrap().text, "Connection lost");
            let ended = f.updates().into_iter().find_map(|u| match u {
                StreamUpdate::Ended { outcome, .. } => Some(outcome),
                _ => None,
            });
            assert!(matches!(ended, Some(SessionOutcome::ConnectionLost { .. })));
        }
    }

    mod stop {
        use super::*;

        #[test]
        fn stop_when_idle_is_a_noop() {
            let mut f = Fixture::new();
            assert!(!f.stop());
            assert!(f.updates().is_empty());
            assert!(!f.state.is_generating());
        }

        #[test]
        fn stop_cancels_and_finalizes() {
            let mut f = Fixture::new();
            let epoch = f.start();
            f.send(r#"{"type":"token","content":"so far"}"#);

            assert!(f.stop());
            assert!(!f.stop());

            assert_eq!(f.session().status(), GenerationStatus::Cancelled);
            assert!(!f.state.is_generating());
            assert_eq!(f.transport.closed(), vec![epoch]);

            let last = f.transcript.last().unwrap();
            assert_eq!(last.content, "so far");
            assert!(!last.in_flight);
        }

        #[test]
        fn items_after_stop_are_dropped() {
            let mut f = Fixture::new();
            f.start();
            f.stop();
            f.send(r#"{"type":"token","content":"late"}"#);
            assert!(f.session().content().is_empty());
        }

        #[test]
        fn cancel_handle_is_honoured_on_pump() {
            let mut f = Fixture::new();
            f.start();
            let handle = f.controller.cancel_handle();
            handle.cancel();
            assert!(handle.is_requested());

            f.controller
                .pump(&mut f.state, &mut f.transcript, Duration::ZERO);

            assert!(!handle.is_requested());
            assert_eq!(f.session().status(), GenerationStatus::Cancelled);
            assert!(!f.state.is_generating());
        }

        #[test]
        fn credential_cleared_hook_cancels_stream() {
            let mut f = Fixture::new();
            let handle = f.controller.cancel_handle();
            f.state.on_credential_cleared(move || handle.cancel());
            f.start();

            f.state.clear();
            f.controller
                .pump(&mut f.state, &mut f.transcript, Duration::ZERO);

            assert!(!f.controller.is_generating());
            assert!(!f.state.is_generating());
        }

        #[test]
        fn stale_cancel_request_does_not_hit_next_session() {
            let mut f = Fixture::new();
            f.controller.cancel_handle().cancel();
            f.start();
            f.controller
                .pump(&mut f.state, &mut f.transcript, Duration::ZERO);
            assert!(f.controller.is_generating());
        }
    }

    mod idle {
        use super::*;

        #[test]
        fn idle_timeout_ends_session() {
            let mut f = Fixture::new();
            f.controller = StreamController::new(
                f.transport.clone(),
                MarkdownRenderer::new(),
                Arc::new(StreamBus::new()),
            )
            .with_idle_timeout(Some(Duration::from_millis(20)));
            f.start();
            f.send(r#"{"type":"token","content":"slow"}"#);

            for _ in 0..50 {
                if !f.controller.is_generating() {
                    break;
                }
                f.controller
                    .pump(&mut f.state, &mut f.transcript, Duration::from_millis(50));
            }

            assert_eq!(f.session().status(), GenerationStatus::Errored);
            assert_eq!(f.controller.status_notice().unwrap().text, "Connection timed out");
            assert_eq!(f.transcript.last().unwrap().content, "slow");
            assert!(!f.state.is_generating());
        }

        #[test]
        fn check_idle_respects_deadline() {
            let mut f = Fixture::new();
            f.start();

            let now = Instant::now();
            f.controller.check_idle(&mut f.state, &mut f.transcript, now);
            assert!(f.controller.is_generating());

            f.controller.check_idle(
                &mut f.state,
                &mut f.transcript,
                now + DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1),
            );
            assert!(!f.controller.is_generating());
        }

        #[test]
        fn disabled_idle_timeout_never_fires() {
            let mut f = Fixture::new();
            f.controller = StreamController::new(
                f.transport.clone(),
                MarkdownRenderer::new(),
                Arc::new(StreamBus::new()),
            )
            .with_idle_timeout(None);
            f.start();

            f.controller.check_idle(
                &mut f.state,
                &mut f.transcript,
                Instant::now() + Duration::from_secs(3600),
            );
            assert!(f.controller.is_generating());
        }

        #[test]
        fn huge_idle_timeout_does_not_overflow() {
            let mut f = Fixture::new();
            f.controller = StreamController::new(
                f.transport.clone(),
                MarkdownRenderer::new(),
                Arc::new(StreamBus::new()),
            )
            .with_idle_timeout(Some(Duration::from_secs(u64::MAX)));
            f.start();

            f.controller
                .pump(&mut f.state, &mut f.transcript, Duration::from_millis(10));
            assert!(f.controller.is_generating());

            f.send(r#"{"type":"token","content":"ok"}"#);
            f.controller
                .pump(&mut f.state, &mut f.transcript, Duration::from_millis(10));
            assert!(f.controller.is_generating());
            assert_eq!(f.session().content(), "ok");
        }

        #[test]
        fn pump_returns_queued_items() {
            let mut f = Fixture::new();
            f.start();
            f.transport.send(r#"{"type":"heartbeat"}"#);
            let handled = f
                .controller
                .pump(&mut f.state, &mut f.transcript, Duration::from_millis(100));
            assert_eq!(handled, 1);
        }

        #[test]
        fn run_to_completion_returns_final_status() {
            let mut f = Fixture::new();
            f.start();
            f.transport.send(r#"{"type":"token","content":"a"}"#);
            f.transport.send(r#"{"type":"finish"}"#);

            let status = f.controller.run_to_completion(
                &mut f.state,
                &mut f.transcript,
                Duration::from_millis(10),
            );
            assert_eq!(status, Some(GenerationStatus::Finished));
        }
    }

    mod wire_log {
        use super::*;

        #[test]
        fn writes_open_recv_close_without_token() {
            let dir = tempfile::tempdir().unwrap();
            let mut f = Fixture::new();
            f.controller = StreamController::new(
                f.transport.clone(),
                MarkdownRenderer::new(),
                Arc::new(StreamBus::new()),
            )
            .with_log_dir(Some(dir.path().to_path_buf()));

            f.start();
            f.send(r#"{"type":"token","content":"hi"}"#);
            f.send(r#"{"type":"finish"}"#);

            let log = std::fs::read_to_string(dir.path().join("stream-7-1.log")).unwrap();
            assert!(log.contains("OPEN: /ai/stream/7 thinking=enabled"));
            assert!(log.contains(r#"RECV: data: {"type":"token","content":"hi"}"#));
            assert!(log.contains("CLOSE: Finished"));
            assert!(!log.contains("secret-token"));
        }
    }
}
