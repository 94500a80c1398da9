use shared::{domain::ConversationId, error::ValidationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
