//! Who is logged in, which conversation is open, and whether a generation
//! is running.

mod credentials;
mod state;

pub use credentials::{CredentialStore, CredentialStoreError, FileCredentialStore};
pub use state::{ConversationId, Credential, SessionState, UserProfile};
