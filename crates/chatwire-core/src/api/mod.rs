//! The REST surface: authentication, conversations and messages.

mod http;
mod types;

pub use http::HttpApi;
pub use types::{Conversation, LoginResponse};

use thiserror::Error;

use crate::session::{ConversationId, Credential, UserProfile};
use crate::transcript::Message;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// A 2xx response whose body reports `success: false`.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

/// Conversation and message persistence plus authentication.
///
/// Every call but `login` carries the current credential, if any.
pub trait ChatApi {
    fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError>;

    fn profile(&self, credential: Option<&Credential>) -> Result<UserProfile, ApiError>;

    /// List conversations, optionally filtered by a search query.
    fn list_conversations(
        &self,
        credential: Option<&Credential>,
        query: Option<&str>,
    ) -> Result<Vec<Conversation>, ApiError>;

    fn create_conversation(
        &self,
        credential: Option<&Credential>,
        name: &str,
    ) -> Result<Conversation, ApiError>;

    fn rename_conversation(
        &self,
        credential: Option<&Credential>,
        id: ConversationId,
        name: &str,
    ) -> Result<(), ApiError>;

    fn delete_conversation(
        &self,
        credential: Option<&Credential>,
        id: ConversationId,
    ) -> Result<(), ApiError>;

    fn list_messages(
        &self,
        credential: Option<&Credential>,
        id: ConversationId,
    ) -> Result<Vec<Message>, ApiError>;

    /// Store a user message; returns the server's copy.
    fn persist_user_message(
        &self,
        credential: Option<&Credential>,
        id: ConversationId,
        content: &str,
    ) -> Result<Message, ApiError>;
}
