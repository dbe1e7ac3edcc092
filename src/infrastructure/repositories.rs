//! DB Repository abstractions

use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::entities::{
    Conversation, ConversationChanges, Feedback, Message, NewConversation, NewMessage,
};
use crate::infrastructure::feed::{MessageFeed, SnapshotReceiver};
use crate::infrastructure::traits::{ConversationRepository, PersistenceError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use di::{Ref, inject, injectable};
use log::{debug, error};
use sqlx::SqliteExecutor;
use sqlx::types::Json;
use uuid::Uuid;

pub struct DbConversationRepository {
    connection: Ref<DatabaseConnection>,
    feed: MessageFeed,
}

#[injectable(ConversationRepository)]
impl DbConversationRepository {
    #[inject]
    pub fn create(connection: Ref<DatabaseConnection>) -> DbConversationRepository {
        DbConversationRepository {
            connection,
            feed: MessageFeed::new(),
        }
    }
}

impl DbConversationRepository {
    async fn fetch_messages<'e, E>(
        executor: E,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, PersistenceError>
    where
        E: SqliteExecutor<'e>,
    {
        let messages = sqlx::query_as(
            "SELECT id, conversation_id, kind, text, suggestions, feedback, created_at FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(conversation_id)
        .fetch_all(executor)
        .await?;

        Ok(messages)
    }

    /// Pushes a fresh snapshot to the live subscribers of a conversation.
    async fn publish_snapshot(&self, conversation_id: Uuid) {
        if !self.feed.has_receivers(conversation_id).await {
            return;
        }

        let revision = self.feed.next_revision();
        match Self::fetch_messages(&**self.connection, conversation_id).await {
            Ok(messages) => {
                debug!(
                    "publishing revision {revision} of conversation {conversation_id} ({} messages)",
                    messages.len()
                );
                self.feed.publish(conversation_id, revision, messages).await;
            }
            Err(e) => error!("failed to read snapshot of conversation {conversation_id}: {e}"),
        }
    }
}

/// Checks that `conversation_id` exists and belongs to `user_id`.
async fn authorize<'e, E>(
    executor: E,
    user_id: Uuid,
    conversation_id: Uuid,
) -> Result<(), PersistenceError>
where
    E: SqliteExecutor<'e>,
{
    let owner: Option<Uuid> = sqlx::query_scalar("SELECT user FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_optional(executor)
        .await?;

    match owner {
        None => Err(PersistenceError::ConversationNotFound(conversation_id)),
        Some(owner) if owner != user_id => Err(PersistenceError::Unauthorized(conversation_id)),
        Some(_) => Ok(()),
    }
}

#[async_trait]
impl ConversationRepository for DbConversationRepository {
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, PersistenceError> {
        let conversations = sqlx::query_as(
            "SELECT * FROM conversations WHERE user = ? ORDER BY updated_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&**self.connection)
        .await?;

        Ok(conversations)
    }

    async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Conversation, PersistenceError> {
        let conversation: Option<Conversation> =
            sqlx::query_as("SELECT * FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_optional(&**self.connection)
                .await?;

        match conversation {
            None => Err(PersistenceError::ConversationNotFound(conversation_id)),
            Some(c) if c.user != user_id => Err(PersistenceError::Unauthorized(conversation_id)),
            Some(c) => Ok(c),
        }
    }

    async fn create_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, PersistenceError> {
        let now = Utc::now();

        let created = sqlx::query_as(
            "INSERT INTO conversations (id, user, summary, last_message_text, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(conversation.id)
        .bind(conversation.user)
        .bind(conversation.summary)
        .bind(conversation.last_message_text)
        .bind(now)
        .bind(now)
        .fetch_one(&**self.connection)
        .await?;

        Ok(created)
    }

    async fn update_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        changes: ConversationChanges,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.connection.begin().await?;
        authorize(&mut *tx, user_id, conversation_id).await?;

        let now = Utc::now();
        sqlx::query(
            "UPDATE conversations SET summary = COALESCE(?, summary), last_message_text = COALESCE(?, last_message_text), updated_at = CASE WHEN updated_at > ? THEN updated_at ELSE ? END WHERE id = ?",
        )
        .bind(changes.summary)
        .bind(changes.last_message_text)
        .bind(now)
        .bind(now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.connection.begin().await?;
        authorize(&mut *tx, user_id, conversation_id).await?;

        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, PersistenceError> {
        authorize(&**self.connection, user_id, conversation_id).await?;
        Self::fetch_messages(&**self.connection, conversation_id).await
    }

    async fn append_message(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message: NewMessage,
    ) -> Result<Uuid, PersistenceError> {
        let mut tx = self.connection.begin().await?;
        authorize(&mut *tx, user_id, conversation_id).await?;

        // Timestamps are strictly increasing within a conversation.
        let newest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT created_at FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let created_at = match newest {
            Some(newest) if now <= newest => newest + Duration::microseconds(1),
            _ => now,
        };

        let id = Uuid::new_v4();
        let preview = message.preview_text();

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, kind, text, suggestions, feedback, created_at) VALUES (?, ?, ?, ?, ?, NULL, ?)",
        )
        .bind(id)
        .bind(conversation_id)
        .bind(message.kind)
        .bind(message.text)
        .bind(message.suggestions.map(Json))
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations SET last_message_text = ?, updated_at = CASE WHEN updated_at > ? THEN updated_at ELSE ? END WHERE id = ?",
        )
        .bind(preview)
        .bind(created_at)
        .bind(created_at)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.publish_snapshot(conversation_id).await;
        Ok(id)
    }

    async fn update_message_feedback(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
        feedback: Option<Feedback>,
    ) -> Result<(), PersistenceError> {
        authorize(&**self.connection, user_id, conversation_id).await?;

        let result = sqlx::query("UPDATE messages SET feedback = ? WHERE id = ? AND conversation_id = ?")
            .bind(feedback)
            .bind(message_id)
            .bind(conversation_id)
            .execute(&**self.connection)
            .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::MessageNotFound(message_id));
        }

        self.publish_snapshot(conversation_id).await;
        Ok(())
    }

    async fn subscribe_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<SnapshotReceiver, PersistenceError> {
        authorize(&**self.connection, user_id, conversation_id).await?;

        let receiver = self.feed.subscribe(conversation_id).await;
        let revision = self.feed.next_revision();
        let messages = Self::fetch_messages(&**self.connection, conversation_id).await?;
        self.feed.publish(conversation_id, revision, messages).await;

        Ok(receiver)
    }
}
