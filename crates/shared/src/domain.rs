use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Random v4 UUID rendered as a string.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);

/// Milliseconds since the Unix epoch, the unit of [`Message::timestamp`].
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    User,
    System,
}

/// The local participant. Stored under the `user` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(
        rename = "image",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar_ref: Option<String>,
}

impl User {
    pub fn generate() -> Self {
        Self {
            id: UserId::generate(),
            name: String::new(),
            avatar_ref: None,
        }
    }

    /// Name shown to peers; falls back to `User#<id>` until a profile is saved.
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("User#{}", self.id)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "message")]
    pub text: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: i64,
    #[serde(rename = "name")]
    pub sender_name: String,
    #[serde(
        rename = "image",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_avatar_ref: Option<String>,
}

impl Message {
    pub fn from_user(user: &User, text: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            text: text.into(),
            kind,
            timestamp: now_millis(),
            sender_name: user.display_name(),
            sender_avatar_ref: user.avatar_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationGroup {
    pub id: ConversationId,
    pub name: String,
    #[serde(rename = "userIds", default)]
    pub member_ids: Vec<UserId>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub unread: bool,
}

impl ConversationGroup {
    /// Builds a new, empty group with a generated id after normalizing its
    /// members and name.
    pub fn create(name: &str, member_ids: Vec<UserId>) -> Result<Self, ValidationError> {
        let member_ids = normalize_member_ids(member_ids);
        let name = group_display_name(name, &member_ids)?;
        Ok(Self {
            id: ConversationId::generate(),
            name,
            member_ids,
            messages: Vec::new(),
            unread: false,
        })
    }

    /// Applies a rename/membership change, keeping id, messages and unread.
    pub fn edited(&self, name: &str, member_ids: Vec<UserId>) -> Result<Self, ValidationError> {
        let member_ids = normalize_member_ids(member_ids);
        let name = group_display_name(name, &member_ids)?;
        Ok(Self {
            name,
            member_ids,
            ..self.clone()
        })
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn messages_newest_first(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().rev()
    }
}

/// Trims ids, drops blanks and keeps the first occurrence of duplicates.
pub fn normalize_member_ids(member_ids: Vec<UserId>) -> Vec<UserId> {
    let mut normalized: Vec<UserId> = Vec::with_capacity(member_ids.len());
    for id in member_ids {
        let trimmed = id.0.trim();
        if trimmed.is_empty() || normalized.iter().any(|seen| seen.0 == trimmed) {
            continue;
        }
        normalized.push(UserId(trimmed.to_string()));
    }
    normalized
}

fn group_display_name(name: &str, member_ids: &[UserId]) -> Result<String, ValidationError> {
    if member_ids.is_empty() {
        return Err(ValidationError::NoMembers);
    }
    let trimmed = name.trim();
    if !trimmed.is_empty() {
        return Ok(trimmed.to_string());
    }
    let members = member_ids
        .iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("Group: {members}"))
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
