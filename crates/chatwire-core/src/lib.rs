//! # chatwire-core
//!
//! Core of a streaming AI chat client.
//!
//! The crate has no UI and needs no async runtime. Front ends (the
//! `chatwire` CLI, or any other view) drive a [`ChatClient`] and redraw from
//! the [`StreamBus`].
//!
//! ## Key Concepts
//!
//! - **Generation**: one streamed answer, owned by the [`StreamController`]
//! - **Epoch**: counter that tells a generation's traffic apart from stale
//!   traffic of earlier ones
//! - **Frame**: one decoded push-channel event (reasoning, content, finish...)
//! - **Transcript**: the messages of the active conversation

pub mod api;
pub mod client;
pub mod config;
pub mod event_bus;
pub mod logging;
pub mod paths;
pub mod render;
pub mod session;
pub mod stream;
pub mod transcript;

// Re-export commonly used types
pub use api::{ApiError, ChatApi, Conversation, HttpApi};
pub use client::{ChatClient, ClientError};
pub use config::ClientConfig;
pub use event_bus::{StatusNotice, StreamBus, StreamUpdate};
pub use render::{MarkdownRenderer, Render, Rendered};
pub use session::{ConversationId, Credential, SessionState};
pub use stream::{HttpTransport, StreamController, StreamOptions, ThinkingMode};
pub use transcript::{ConversationTranscript, Message, MessageType, Transcript};
