use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{ConversationGroup, ConversationId, Message, UserId};

/// Keys a frame must carry for the relay to fan it out.
pub const ENVELOPE_FIELDS: [&str; 5] = ["id", "name", "userIds", "messages", "unread"];

/// Full conversation state sent to the relay after a local send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub id: ConversationId,
    pub name: String,
    #[serde(rename = "userIds")]
    pub member_ids: Vec<UserId>,
    pub messages: Vec<Message>,
    /// Only the sender is marked; the relay marks everyone else.
    pub unread: BTreeMap<UserId, u8>,
}

impl OutboundEnvelope {
    pub fn from_group(group: &ConversationGroup, sender: &UserId) -> Self {
        Self {
            id: group.id.clone(),
            name: group.name.clone(),
            member_ids: group.member_ids.clone(),
            messages: group.messages.clone(),
            unread: BTreeMap::from([(sender.clone(), 1)]),
        }
    }
}

/// Authoritative snapshot of one conversation's messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub id: ConversationId,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        rename = "userIds",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub member_ids: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread: Option<Value>,
}

impl InboundEnvelope {
    pub fn snapshot(id: impl Into<ConversationId>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            messages,
            name: None,
            member_ids: None,
            unread: None,
        }
    }
}

impl From<OutboundEnvelope> for InboundEnvelope {
    fn from(value: OutboundEnvelope) -> Self {
        Self {
            id: value.id,
            messages: value.messages,
            name: Some(value.name),
            member_ids: Some(value.member_ids),
            unread: serde_json::to_value(value.unread).ok(),
        }
    }
}

/// First frame on a connection; the relay only forwards to registered ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub user_id: UserId,
}

/// Out-of-band replies produced by the relay itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayReply {
    Ack { status: String, message: String },
    Error { error: String },
}

impl RelayReply {
    pub fn registered(user_id: &str) -> Self {
        Self::Ack {
            status: "success".to_string(),
            message: format!("User {user_id} connected."),
        }
    }

    pub fn invalid_structure() -> Self {
        Self::Error {
            error: "Invalid JSON structure".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Envelope(InboundEnvelope),
    Reply(RelayReply),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no `id` and is not a relay reply")]
    MissingId,
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),
}

impl InboundFrame {
    /// Sorts a parsed frame into an envelope or a relay reply.
    pub fn classify(value: Value) -> Result<Self, FrameError> {
        let Some(object) = value.as_object() else {
            return Err(FrameError::NotAnObject);
        };
        if object.contains_key("id") {
            return serde_json::from_value(value)
                .map(Self::Envelope)
                .map_err(FrameError::InvalidEnvelope);
        }
        if object.contains_key("status") || object.contains_key("error") {
            if let Ok(reply) = serde_json::from_value::<RelayReply>(value) {
                return Ok(Self::Reply(reply));
            }
        }
        Err(FrameError::MissingId)
    }
}

pub fn has_envelope_fields(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|object| ENVELOPE_FIELDS.iter().all(|key| object.contains_key(*key)))
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
