//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use di::{Injectable, Ref, ServiceCollection, ServiceProvider, singleton_factory};
use lumen_chat::config::{API_KEY_VAR, AppConfig, ChatSettings};
use lumen_chat::core::chat::ChatOrchestrator;
use lumen_chat::core::services::{ConversationStore, MessageStore};
use lumen_chat::core::traits::{AiError, AiGateway};
use lumen_chat::infrastructure::database::DatabaseConnection;
use lumen_chat::infrastructure::entities::{
    Conversation, ConversationChanges, Feedback, Message, MessageKind, NewConversation,
    NewMessage,
};
use lumen_chat::infrastructure::feed::SnapshotReceiver;
use lumen_chat::infrastructure::repositories::DbConversationRepository;
use lumen_chat::infrastructure::traits::{ConversationRepository, PersistenceError};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Single-connection in-memory database with the schema applied.
///
/// The connection is never recycled, otherwise the database would vanish with it.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub fn test_settings() -> ChatSettings {
    ChatSettings {
        reply_timeout: Duration::from_millis(200),
        history_window: 10,
    }
}

pub fn test_config() -> AppConfig {
    let mut config =
        AppConfig::from_lookup(|key| (key == API_KEY_VAR).then(|| "test-key".to_owned())).unwrap();
    config.chat = test_settings();
    config
}

enum Reply {
    Text(String),
    Fail,
}

/// Scripted `AiGateway` that records what it was asked.
pub struct FakeAi {
    reply: Reply,
    delay: Duration,
    summary: Option<String>,
    suggestions: Vec<String>,
    pub replies: Mutex<Vec<(String, Option<String>)>>,
    pub summaries: Mutex<Vec<String>>,
}

impl FakeAi {
    pub fn replying(text: &str) -> FakeAi {
        FakeAi {
            reply: Reply::Text(text.to_owned()),
            delay: Duration::ZERO,
            summary: Some("Card payment question".to_owned()),
            suggestions: vec!["Show my recent payments".to_owned(), "Freeze my card".to_owned()],
            replies: Mutex::new(Vec::new()),
            summaries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> FakeAi {
        FakeAi {
            reply: Reply::Fail,
            ..FakeAi::replying("")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> FakeAi {
        self.delay = delay;
        self
    }

    pub fn without_summary(mut self) -> FakeAi {
        self.summary = None;
        self
    }

    pub fn without_suggestions(mut self) -> FakeAi {
        self.suggestions.clear();
        self
    }

    pub fn reply_count(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    pub fn summary_count(&self) -> usize {
        self.summaries.lock().unwrap().len()
    }

    pub fn last_history(&self) -> Option<String> {
        self.replies
            .lock()
            .unwrap()
            .last()
            .and_then(|(_, history)| history.clone())
    }
}

#[async_trait]
impl AiGateway for FakeAi {
    async fn generate_reply(
        &self,
        current_message: &str,
        conversation_history: Option<&str>,
    ) -> Result<String, AiError> {
        self.replies.lock().unwrap().push((
            current_message.to_owned(),
            conversation_history.map(str::to_owned),
        ));
        tokio::time::sleep(self.delay).await;

        match &self.reply {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Fail => Err(AiError::QuotaExceeded("quota exhausted".to_owned())),
        }
    }

    async fn summarize(&self, conversation_history: &str) -> Result<String, AiError> {
        self.summaries
            .lock()
            .unwrap()
            .push(conversation_history.to_owned());
        self.summary.clone().ok_or(AiError::EmptyResponse)
    }

    async fn suggest_follow_ups(&self, _conversation_history: &str) -> Result<Vec<String>, AiError> {
        Ok(self.suggestions.clone())
    }

    async fn initial_prompt(&self) -> Result<String, AiError> {
        Ok("How can I set up a savings goal?".to_owned())
    }
}

pub fn repository(pool: SqlitePool) -> DbConversationRepository {
    DbConversationRepository::create(Ref::new(DatabaseConnection::from_pool(pool)))
}

/// Database repository that fails selected writes.
pub struct FlakyRepository {
    inner: DbConversationRepository,
    fail_appends_of: Option<MessageKind>,
    fail_deletes: bool,
}

impl FlakyRepository {
    pub fn new(pool: SqlitePool) -> FlakyRepository {
        FlakyRepository {
            inner: repository(pool),
            fail_appends_of: None,
            fail_deletes: false,
        }
    }

    pub fn failing_appends_of(mut self, kind: MessageKind) -> FlakyRepository {
        self.fail_appends_of = Some(kind);
        self
    }

    pub fn failing_deletes(mut self) -> FlakyRepository {
        self.fail_deletes = true;
        self
    }
}

fn write_failure() -> PersistenceError {
    PersistenceError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl ConversationRepository for FlakyRepository {
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, PersistenceError> {
        self.inner.list_conversations(user_id).await
    }

    async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Conversation, PersistenceError> {
        self.inner.get_conversation(user_id, conversation_id).await
    }

    async fn create_conversation(
        &self,
        conversation: NewConversation,
    ) -> Result<Conversation, PersistenceError> {
        self.inner.create_conversation(conversation).await
    }

    async fn update_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        changes: ConversationChanges,
    ) -> Result<(), PersistenceError> {
        self.inner
            .update_conversation(user_id, conversation_id, changes)
            .await
    }

    async fn delete_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<(), PersistenceError> {
        if self.fail_deletes {
            return Err(write_failure());
        }
        self.inner.delete_conversation(user_id, conversation_id).await
    }

    async fn list_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, PersistenceError> {
        self.inner.list_messages(user_id, conversation_id).await
    }

    async fn append_message(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message: NewMessage,
    ) -> Result<Uuid, PersistenceError> {
        if self.fail_appends_of == Some(message.kind) {
            return Err(write_failure());
        }
        self.inner
            .append_message(user_id, conversation_id, message)
            .await
    }

    async fn update_message_feedback(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
        feedback: Option<Feedback>,
    ) -> Result<(), PersistenceError> {
        self.inner
            .update_message_feedback(user_id, conversation_id, message_id, feedback)
            .await
    }

    async fn subscribe_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<SnapshotReceiver, PersistenceError> {
        self.inner.subscribe_messages(user_id, conversation_id).await
    }
}

pub struct Services {
    pub repo: Ref<dyn ConversationRepository>,
    pub conversations: Ref<ConversationStore>,
    pub messages: Ref<MessageStore>,
    pub chat: ChatOrchestrator,
}

/// Wires the stores and the orchestrator by hand around `ai`.
pub fn services(pool: SqlitePool, ai: Ref<dyn AiGateway>) -> Services {
    services_with(Ref::new(repository(pool)), ai)
}

pub fn services_with(repo: Ref<dyn ConversationRepository>, ai: Ref<dyn AiGateway>) -> Services {
    let conversations = Ref::new(ConversationStore::create(repo.clone()));
    let messages = Ref::new(MessageStore::create(repo.clone(), conversations.clone()));
    let chat = ChatOrchestrator::new(
        messages.clone(),
        conversations.clone(),
        ai,
        test_settings(),
    );

    Services {
        repo,
        conversations,
        messages,
        chat,
    }
}

/// The production container with the database and AI gateway swapped out.
pub fn test_provider(pool: SqlitePool, ai: Ref<dyn AiGateway>) -> ServiceProvider {
    let config = Ref::new(test_config());

    ServiceCollection::new()
        .add(singleton_factory(move |_| config.clone()))
        .add(singleton_factory(move |_| {
            Ref::new(DatabaseConnection::from_pool(pool.clone()))
        }))
        .add(singleton_factory(move |_| -> Ref<dyn AiGateway> { ai.clone() }))
        .add(DbConversationRepository::singleton())
        .add(ConversationStore::singleton())
        .add(MessageStore::singleton())
        .add(ChatOrchestrator::singleton())
        .build_provider()
        .unwrap()
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
