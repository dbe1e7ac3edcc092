//! Infrastructure traits, used for DI on higher levels

use crate::infrastructure::entities;
use crate::infrastructure::entities::{ConversationChanges, Feedback, NewConversation, NewMessage};
use crate::infrastructure::feed::SnapshotReceiver;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("message {0} not found")]
    MessageNotFound(Uuid),

    #[error("not authorized to access conversation {0}")]
    Unauthorized(Uuid),
}

/// Conversations and their nested messages.
///
/// Every operation keyed by a conversation checks that `user_id` owns it.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Conversations of `user_id`, most recently updated first.
    async fn list_conversations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<entities::Conversation>, PersistenceError>;

    async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<entities::Conversation, PersistenceError>;

    async fn create_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<entities::Conversation, PersistenceError>;

    /// Applies `changes` and stamps a fresh `updated_at`.
    async fn update_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        changes: ConversationChanges,
    ) -> Result<(), PersistenceError>;

    /// Deletes the conversation row only. Its messages are left in place.
    async fn delete_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<(), PersistenceError>;

    /// Messages in chronological order.
    async fn list_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<entities::Message>, PersistenceError>;

    /// Stores `message` with a fresh id and timestamp, updates the parent's
    /// preview text and `updated_at`, and notifies subscribers.
    async fn append_message(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message: NewMessage,
    ) -> Result<Uuid, PersistenceError>;

    async fn update_message_feedback(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
        feedback: Option<Feedback>,
    ) -> Result<(), PersistenceError>;

    /// Opens the conversation's live feed. The receiver holds the current
    /// snapshot right away and the full ordered list again after every
    /// change. Dropping it unsubscribes.
    async fn subscribe_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<SnapshotReceiver, PersistenceError>;
}
