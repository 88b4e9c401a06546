//! Login, conversation selection and prompt submission on top of the
//! stream controller.

use std::time::Duration;

use thiserror::Error;

use crate::api::{ApiError, ChatApi, Conversation};
use crate::event_bus::{StatusNotice, StreamBus};
use crate::render::{MarkdownRenderer, Render};
use crate::session::{ConversationId, Credential, SessionState, UserProfile};
use crate::stream::{Epoch, GenerationStatus, StreamController, StreamError, StreamOptions, Transport};
use crate::transcript::{ConversationTranscript, Message, Transcript};

/// Name given to a conversation created from an empty-looking prompt.
pub const DEFAULT_CONVERSATION_NAME: &str = "New Chat";

/// Notice shown when the server rejects the credential.
pub const SESSION_EXPIRED: &str = "Session expired";

const CONVERSATION_NAME_CHARS: usize = 30;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("conversation name is empty")]
    EmptyName,

    #[error("a response is still being generated")]
    Busy,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Name for a conversation started by `prompt`: its first 30 characters.
pub fn conversation_name(prompt: &str) -> String {
    let name: String = prompt.trim().chars().take(CONVERSATION_NAME_CHARS).collect();
    let name = name.trim_end();
    if name.is_empty() {
        DEFAULT_CONVERSATION_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// One logged-in client: session, transcript, controller and the REST API.
pub struct ChatClient<A: ChatApi, T: Transport, R: Render = MarkdownRenderer> {
    api: A,
    state: SessionState,
    transcript: ConversationTranscript,
    controller: StreamController<T, R>,
    conversations: Vec<Conversation>,
}

impl<A: ChatApi, T: Transport, R: Render> ChatClient<A, T, R> {
    pub fn new(api: A, controller: StreamController<T, R>) -> Self {
        let mut state = SessionState::new();
        let cancel = controller.cancel_handle();
        state.on_credential_cleared(move || cancel.cancel());

        Self {
            api,
            state,
            transcript: ConversationTranscript::new(),
            controller,
            conversations: Vec::new(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn transcript(&self) -> &ConversationTranscript {
        &self.transcript
    }

    pub fn controller(&self) -> &StreamController<T, R> {
        &self.controller
    }

    pub fn bus(&self) -> &std::sync::Arc<StreamBus> {
        self.controller.bus()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn is_generating(&self) -> bool {
        self.state.is_generating()
    }

    /// Authenticate, then load the profile and conversation list.
    pub fn login(&mut self, email: &str, password: &str) -> Result<(), ClientError> {
        let response = self.api.login(email.trim(), password)?;
        log::info!("Logged in as {}", email.trim());
        self.establish(Credential::new(response.access_token), response.user)
    }

    /// Resume with a stored credential.
    pub fn restore(&mut self, credential: Credential) -> Result<(), ClientError> {
        self.establish(credential, None)
    }

    fn establish(
        &mut self,
        credential: Credential,
        user: Option<UserProfile>,
    ) -> Result<(), ClientError> {
        self.state.set_credential(credential);

        let user = match user {
            Some(user) => user,
            None => {
                let result = self.api.profile(self.state.credential());
                self.guard(result)?
            }
        };
        log::debug!("Session user: {}", user.display_name());
        self.state.set_user(Some(user));

        self.refresh_conversations(None)?;
        Ok(())
    }

    /// Forget the session. The credential-cleared hook cancels any stream.
    pub fn logout(&mut self, reason: Option<&str>) {
        self.state.clear();
        self.controller
            .pump(&mut self.state, &mut self.transcript, Duration::ZERO);
        self.controller.stop(&mut self.state, &mut self.transcript);

        self.transcript.clear();
        self.conversations.clear();

        match reason {
            Some(reason) => {
                log::info!("Logged out: {}", reason);
                self.controller.notify(StatusNotice::info(reason));
            }
            None => log::info!("Logged out"),
        }
    }

    /// Leave the current conversation; the next submission starts a new one.
    pub fn new_chat(&mut self) {
        self.controller.stop(&mut self.state, &mut self.transcript);
        self.state.set_active_conversation(None);
        self.transcript.clear();
    }

    /// Select a conversation and load its messages. A no-op when it is
    /// already active.
    pub fn open_conversation(&mut self, id: ConversationId) -> Result<(), ClientError> {
        if self.state.active_conversation() == Some(id) {
            return Ok(());
        }
        self.controller.stop(&mut self.state, &mut self.transcript);
        self.state.set_active_conversation(Some(id));
        self.transcript.clear();

        let result = self.api.list_messages(self.state.credential(), id);
        let messages = self.guard(result)?;
        log::debug!("Loaded {} messages for conversation {}", messages.len(), id);
        self.transcript.load(messages);
        Ok(())
    }

    /// The active conversation, or the error a submission would get without one.
    pub fn require_active_conversation(&self) -> Result<ConversationId, ClientError> {
        self.state
            .active_conversation()
            .ok_or(ClientError::Stream(StreamError::NoActiveConversation))
    }

    /// Send a prompt and start generating the answer.
    ///
    /// Creates a conversation first when none is active. On failure the
    /// optimistic user message stays in the transcript.
    pub fn submit(&mut self, prompt: &str, options: StreamOptions) -> Result<Epoch, ClientError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ClientError::EmptyPrompt);
        }
        if self.state.is_generating() {
            return Err(ClientError::Busy);
        }

        let mut optimistic = Message::user(prompt);
        optimistic.conversation_id = self.state.active_conversation();
        let optimistic_id = optimistic.local_id;
        self.transcript.append(optimistic);

        let conversation_id = match self.state.active_conversation() {
            Some(id) => id,
            None => {
                let name = conversation_name(prompt);
                let result = self.api.create_conversation(self.state.credential(), &name);
                let conversation = self.guard(result)?;
                log::info!("Created conversation {} ({})", conversation.id, conversation.name);

                let id = conversation.id;
                self.state.set_active_conversation(Some(id));
                self.conversations.insert(0, conversation);
                id
            }
        };

        let result = self
            .api
            .persist_user_message(self.state.credential(), conversation_id, prompt);
        let persisted = self.guard(result)?;
        if self.transcript.last().is_some_and(|m| m.local_id == optimistic_id) {
            self.transcript.replace_last(persisted);
        }

        let epoch = self.controller.start(
            &mut self.state,
            &mut self.transcript,
            conversation_id,
            prompt,
            options,
        )?;
        Ok(epoch)
    }

    /// Cancel the active generation, if any.
    pub fn stop(&mut self) -> bool {
        self.controller.stop(&mut self.state, &mut self.transcript)
    }

    pub fn rename_conversation(&mut self, id: ConversationId, name: &str) -> Result<(), ClientError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::EmptyName);
        }
        let result = self.api.rename_conversation(self.state.credential(), id, name);
        self.guard(result)?;

        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) {
            conversation.name = name.to_string();
        }
        Ok(())
    }

    /// Delete a conversation. Deleting the active one behaves like
    /// [`ChatClient::new_chat`].
    pub fn delete_conversation(&mut self, id: ConversationId) -> Result<(), ClientError> {
        let result = self.api.delete_conversation(self.state.credential(), id);
        self.guard(result)?;

        self.conversations.retain(|c| c.id != id);
        if self.state.active_conversation() == Some(id) {
            self.new_chat();
        }
        Ok(())
    }

    /// Reload the conversation list, optionally filtered by `query`.
    pub fn refresh_conversations(&mut self, query: Option<&str>) -> Result<&[Conversation], ClientError> {
        let result = self.api.list_conversations(self.state.credential(), query);
        self.conversations = self.guard(result)?;
        Ok(self.conversations.as_slice())
    }

    /// Process stream traffic for up to `wait`.
    pub fn pump(&mut self, wait: Duration) -> usize {
        self.controller
            .pump(&mut self.state, &mut self.transcript, wait)
    }

    /// Block until the active generation ends.
    pub fn wait_for_completion(&mut self, poll: Duration) -> Option<GenerationStatus> {
        self.controller
            .run_to_completion(&mut self.state, &mut self.transcript, poll)
    }

    /// Log out when the server rejected the credential.
    fn guard<V>(&mut self, result: Result<V, ApiError>) -> Result<V, ClientError> {
        if let Err(e) = &result {
            if e.is_unauthorized() {
                log::warn!("Credential rejected: {}", e);
                self.logout(None);
                self.controller.notify(StatusNotice::error(SESSION_EXPIRED));
            }
        }
        result.map_err(ClientError::from)
    }
}
