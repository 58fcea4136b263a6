//! Wire envelopes exchanged with the streaming chat service.

use crate::types::Role;
use serde::{Deserialize, Serialize};

/// `choices.status` value marking the final fragment of a response
pub const TERMINAL_STATUS: i64 = 2;

/// Role tag on a wire fragment. Tags other than user and assistant (the
/// service may echo `system` entries) are kept as `Other` and ignored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FragmentRole {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

impl From<Role> for FragmentRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// One `{role, content}` entry in either direction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fragment {
    pub role: FragmentRole,
    #[serde(default)]
    pub content: String,
}

impl Fragment {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: FragmentRole::User,
            content: content.into(),
        }
    }
}

// Outbound

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEnvelope {
    pub header: RequestHeader,
    pub parameter: Parameter,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestHeader {
    pub app_id: String,
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub chat: ChatParameter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatParameter {
    pub domain: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestPayload {
    pub message: MessageText,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageText {
    pub text: Vec<Fragment>,
}

// Inbound

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    pub header: ResponseHeader,
    /// Absent on error frames
    #[serde(default)]
    pub payload: Option<ResponsePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseHeader {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    pub choices: Choices,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Choices {
    pub status: i64,
    #[serde(default)]
    pub text: Vec<Fragment>,
}

impl InboundEnvelope {
    pub fn is_success(&self) -> bool {
        self.header.code == 0
    }

    /// True when this frame closes the current response
    pub fn is_terminal(&self) -> bool {
        self.choices().is_some_and(|c| c.status == TERMINAL_STATUS)
    }

    pub fn choices(&self) -> Option<&Choices> {
        self.payload.as_ref().map(|p| &p.choices)
    }

    /// Assistant fragments carried by this frame, in order
    pub fn assistant_fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.choices()
            .into_iter()
            .flat_map(|c| c.text.iter())
            .filter(|f| f.role == FragmentRole::Assistant)
    }
}
