//! [`ChatApi`] over HTTP with `ureq`.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::session::{ConversationId, Credential, UserProfile};
use crate::transcript::{Message, MessageType};

use super::types::{Conversation, ConversationName, LoginRequest, LoginResponse, NewMessage};
use super::{ApiError, ChatApi};

/// Blocking JSON client for the `/api/v1` surface.
#[derive(Clone)]
pub struct HttpApi {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: &str, path: &str, credential: Option<&Credential>) -> ureq::Request {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.agent.request(method, &url).set("Accept", "application/json");
        if let Some(credential) = credential {
            request = request.set("Authorization", &format!("Bearer {}", credential.expose()));
        }
        request
    }

    fn send<B: Serialize>(&self, request: ureq::Request, body: Option<&B>) -> Result<Value, ApiError> {
        let method = request.method().to_string();
        let url = request.url().to_string();
        log::debug!("{} {}", method, url);

        let result = match body {
            Some(body) => {
                let body = serde_json::to_value(body).map_err(|e| ApiError::Decode(e.to_string()))?;
                request.send_json(body)
            }
            None => request.call(),
        };

        match result {
            Ok(response) => {
                let text = response
                    .into_string()
                    .map_err(|e| ApiError::Transport(e.to_string()))?;
                parse_body(&text)
            }
            Err(ureq::Error::Status(status, response)) => {
                let text = response.into_string().unwrap_or_default();
                let error = status_error(status, &text);
                log::warn!("{} {} failed: {}", method, url, error);
                Err(error)
            }
            Err(e) => {
                log::error!("{} {} failed: {}", method, url, e);
                Err(ApiError::Transport(e.to_string()))
            }
        }
    }

    fn get(&self, path: &str, credential: Option<&Credential>) -> Result<Value, ApiError> {
        self.send::<Value>(self.request("GET", path, credential), None)
    }
}

impl ChatApi for HttpApi {
    fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let body = LoginRequest { email, password };
        let value = self.send(self.request("POST", "/auth/login", None), Some(&body))?;
        decode(value)
    }

    fn profile(&self, credential: Option<&Credential>) -> Result<UserProfile, ApiError> {
        decode(self.get("/users/profile", credential)?)
    }

    fn list_conversations(
        &self,
        credential: Option<&Credential>,
        query: Option<&str>,
    ) -> Result<Vec<Conversation>, ApiError> {
        let mut request = self.request("GET", "/conversations", credential);
        if let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) {
            request = request.query("q", query);
        }
        items(self.send::<Value>(request, None)?)
    }

    fn create_conversation(
        &self,
        credential: Option<&Credential>,
        name: &str,
    ) -> Result<Conversation, ApiError> {
        let body = ConversationName { name };
        let value = self.send(self.request("POST", "/conversations", credential), Some(&body))?;
        decode(value)
    }

    fn rename_conversation(
        &self,
        credential: Option<&Credential>,
        id: ConversationId,
        name: &str,
    ) -> Result<(), ApiError> {
        let body = ConversationName { name };
        let path = format!("/conversations/{}", id);
        self.send(self.request("PUT", &path, credential), Some(&body))?;
        Ok(())
    }

    fn delete_conversation(
        &self,
        credential: Option<&Credential>,
        id: ConversationId,
    ) -> Result<(), ApiError> {
        let path = format!("/conversations/{}", id);
        self.send::<Value>(self.request("DELETE", &path, credential), None)?;
        Ok(())
    }

    fn list_messages(
        &self,
        credential: Option<&Credential>,
        id: ConversationId,
    ) -> Result<Vec<Message>, ApiError> {
        let path = format!("/messages/conversation/{}", id);
        items(self.get(&path, credential)?)
    }

    fn persist_user_message(
        &self,
        credential: Option<&Credential>,
        id: ConversationId,
        content: &str,
    ) -> Result<Message, ApiError> {
        let body = NewMessage {
            conversation_id: id,
            content,
            message_type: MessageType::User,
        };
        let value = self.send(self.request("POST", "/messages", credential), Some(&body))?;
        decode(value)
    }
}

/// Parse a 2xx body and strip the `{data: ...}` envelope.
fn parse_body(text: &str) -> Result<Value, ApiError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let value: Value = serde_json::from_str(text).map_err(|e| ApiError::Decode(e.to_string()))?;
    unwrap_envelope(value)
}

fn unwrap_envelope(value: Value) -> Result<Value, ApiError> {
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let message = error_message(&value).unwrap_or_else(|| "Request failed".to_string());
        return Err(ApiError::Rejected(message));
    }
    match value {
        Value::Object(mut map) if map.get("data").is_some_and(|d| !d.is_null()) => {
            Ok(map.remove("data").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

/// Server error text: `message.message`, `message`, then `error`.
fn error_message(value: &Value) -> Option<String> {
    let message = value.get("message");
    message
        .and_then(|m| m.get("message"))
        .and_then(Value::as_str)
        .or_else(|| message.and_then(Value::as_str))
        .or_else(|| value.get("error").and_then(Value::as_str))
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

fn status_error(status: u16, body: &str) -> ApiError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| error_message(&v))
        .or_else(|| Some(body.trim().to_string()).filter(|b| !b.is_empty()))
        .unwrap_or_else(|| format!("HTTP {}", status));

    if status == 401 {
        ApiError::Unauthorized(message)
    } else {
        ApiError::Status { status, message }
    }
}

/// A list payload: a bare array, `{items: [...]}`, or nothing.
fn items<T: DeserializeOwned>(value: Value) -> Result<Vec<T>, ApiError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => decode(value),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(list) => decode(list),
        },
        other => Err(ApiError::Decode(format!("expected a list, got {}", other))),
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}
