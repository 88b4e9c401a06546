//! Per-client session state.

use serde::{Deserialize, Serialize};

/// Server-assigned conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque bearer credential.
///
/// `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for placing on the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// The logged-in user as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl UserProfile {
    /// Name shown in the UI: display name, then username, then "User".
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(Some(self.username.as_str()).filter(|n| !n.trim().is_empty()))
            .unwrap_or("User")
    }
}

type CredentialClearedHook = Box<dyn FnMut() + Send>;

/// Credential, active conversation and the "generation in progress" flag.
///
/// `is_generating` is only ever written by the stream controller, so it is
/// true exactly while a generation is streaming or finishing.
#[derive(Default)]
pub struct SessionState {
    credential: Option<Credential>,
    user: Option<UserProfile>,
    active_conversation: Option<ConversationId>,
    generating: bool,
    credential_cleared: Vec<CredentialClearedHook>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Some(credential),
            ..Self::default()
        }
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn set_credential(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    pub fn set_user(&mut self, user: Option<UserProfile>) {
        self.user = user;
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.active_conversation
    }

    pub fn set_active_conversation(&mut self, conversation: Option<ConversationId>) {
        self.active_conversation = conversation;
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub(crate) fn set_generating(&mut self, generating: bool) {
        self.generating = generating;
    }

    /// Register a hook run whenever the credential is cleared (logout or an
    /// expired session).
    pub fn on_credential_cleared<F>(&mut self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.credential_cleared.push(Box::new(hook));
    }

    /// Forget the credential, user and active conversation, then run the
    /// credential-cleared hooks.
    ///
    /// The generation flag is left to the stream controller, which the hooks
    /// are expected to cancel.
    pub fn clear(&mut self) {
        let had_credential = self.credential.take().is_some();
        self.user = None;
        self.active_conversation = None;

        if had_credential {
            for hook in self.credential_cleared.iter_mut() {
                hook();
            }
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("credential", &self.credential)
            .field("user", &self.user)
            .field("active_conversation", &self.active_conversation)
            .field("generating", &self.generating)
            .field("credential_cleared_hooks", &self.credential_cleared.len())
            .finish()
    }
}
