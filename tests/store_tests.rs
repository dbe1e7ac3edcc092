//! Conversation and message store tests
//!
//! Covers the caching behavior in front of the repository.

mod common;

use common::{FlakyRepository, repository, setup_test_db};
use di::Ref;
use lumen_chat::core::services::{ConversationStore, MessageStore};
use lumen_chat::infrastructure::entities::NewMessage;
use lumen_chat::infrastructure::traits::{ConversationRepository, PersistenceError};
use std::sync::Arc;
use tokio_test::assert_err;
use uuid::Uuid;

#[tokio::test]
async fn test_failed_remove_is_not_rolled_back() {
    let repo: Ref<dyn ConversationRepository> =
        Arc::new(FlakyRepository::new(setup_test_db().await).failing_deletes());
    let conversations = ConversationStore::create(repo.clone());
    let user = Uuid::new_v4();
    let conversation_id = conversations
        .create_conversation(user, Some("Dispute a charge"))
        .await
        .unwrap();
    assert_eq!(conversations.list(user).await.unwrap().len(), 1);

    let result = conversations.remove(user, conversation_id).await;
    assert!(matches!(result, Err(PersistenceError::Database(_))));

    // The cached list keeps the removal while the row is still stored.
    assert!(conversations.list(user).await.unwrap().is_empty());
    assert!(conversations.get(user, conversation_id).await.is_ok());

    let reconciled = conversations.reconcile(user).await.unwrap();
    assert_eq!(reconciled.len(), 1);
    assert_eq!(reconciled[0].conversation.id, conversation_id);
}

#[tokio::test]
async fn test_message_cache_evicts_least_recently_read() {
    let repo: Ref<dyn ConversationRepository> = Arc::new(repository(setup_test_db().await));
    let conversations = Ref::new(ConversationStore::create(repo.clone()));
    let messages = MessageStore::with_capacity(repo.clone(), conversations.clone(), 2);
    let user = Uuid::new_v4();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(conversations.create_conversation(user, None).await.unwrap());
    }

    messages.list(user, ids[0]).await.unwrap();
    messages.list(user, ids[1]).await.unwrap();
    // Touch the first one so the second becomes the oldest.
    messages.list(user, ids[0]).await.unwrap();
    messages.list(user, ids[2]).await.unwrap();

    assert!(messages.is_cached(ids[0]));
    assert!(!messages.is_cached(ids[1]));
    assert!(messages.is_cached(ids[2]));

    // An evicted conversation is read again from the database.
    messages
        .append(user, ids[1], NewMessage::user("Where is my refund?"))
        .await
        .unwrap();
    let listed = messages.list(user, ids[1]).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(messages.is_cached(ids[1]));
}

#[tokio::test]
async fn test_cached_list_follows_appends() {
    let repo: Ref<dyn ConversationRepository> = Arc::new(repository(setup_test_db().await));
    let conversations = Ref::new(ConversationStore::create(repo.clone()));
    let messages = MessageStore::create(repo.clone(), conversations.clone());
    let user = Uuid::new_v4();
    let conversation_id = conversations.create_conversation(user, None).await.unwrap();

    assert!(messages.list(user, conversation_id).await.unwrap().is_empty());

    messages
        .append(user, conversation_id, NewMessage::user("Raise my limit"))
        .await
        .unwrap();
    messages
        .append(user, conversation_id, NewMessage::ai("Done."))
        .await
        .unwrap();

    let texts: Vec<String> = messages
        .list(user, conversation_id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["Raise my limit", "Done."]);
}

#[tokio::test]
async fn test_forgotten_conversation_is_dropped_from_cache() {
    let repo: Ref<dyn ConversationRepository> = Arc::new(repository(setup_test_db().await));
    let conversations = Ref::new(ConversationStore::create(repo.clone()));
    let messages = MessageStore::create(repo.clone(), conversations.clone());
    let user = Uuid::new_v4();
    let conversation_id = conversations.create_conversation(user, None).await.unwrap();

    messages.list(user, conversation_id).await.unwrap();
    conversations.remove(user, conversation_id).await.unwrap();
    messages.forget(conversation_id);

    assert!(!messages.is_cached(conversation_id));
    assert_err!(messages.list(user, conversation_id).await);
}
