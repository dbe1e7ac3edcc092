//! Implementations for the service the app needs.
//!
//! Both stores are process-wide caches in front of the repository.

use crate::infrastructure::entities::{
    Conversation, ConversationChanges, Feedback, Message, NewConversation, NewMessage,
    truncate_chars,
};
use crate::infrastructure::feed::SnapshotReceiver;
use crate::infrastructure::traits::{ConversationRepository, PersistenceError};
use chrono::Utc;
use di::{Ref, inject, injectable};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use uuid::Uuid;

pub const NEW_CONVERSATION_SUMMARY: &str = "New Conversation";

/// Summary given to a conversation started from a first message.
pub fn seed_summary(seed: Option<&str>) -> String {
    match seed.map(str::trim).filter(|s| !s.is_empty()) {
        Some(seed) => format!("Regarding: \"{}...\"", truncate_chars(seed, 50)),
        None => NEW_CONVERSATION_SUMMARY.to_owned(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedConversation {
    pub conversation: Conversation,
    /// Inserted locally and not yet seen in a server listing.
    pub pending: bool,
}

#[derive(Debug, Default)]
struct OwnerCache {
    entries: Vec<CachedConversation>,
    stale: bool,
}

/// Merges a fresh server listing into the cached entries.
///
/// Server rows are authoritative and replace any optimistic row with the same
/// id. Pending rows the server does not list yet stay at the head.
pub fn reconcile_entries(
    cached: &[CachedConversation],
    confirmed: Vec<Conversation>,
) -> Vec<CachedConversation> {
    let mut merged: Vec<CachedConversation> = cached
        .iter()
        .filter(|entry| entry.pending)
        .filter(|entry| !confirmed.iter().any(|c| c.id == entry.conversation.id))
        .cloned()
        .collect();

    merged.extend(confirmed.into_iter().map(|conversation| CachedConversation {
        conversation,
        pending: false,
    }));
    merged
}

/// Cached conversation lists, one per owner.
pub struct ConversationStore {
    repo: Ref<dyn ConversationRepository>,
    cache: Mutex<HashMap<Uuid, OwnerCache>>,
}

#[injectable]
impl ConversationStore {
    #[inject]
    pub fn create(repo: Ref<dyn ConversationRepository>) -> ConversationStore {
        ConversationStore {
            repo,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl ConversationStore {
    /// The owner's conversations, newest activity first. Pending optimistic
    /// entries are included at the head.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<CachedConversation>, PersistenceError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(owner) = cache.get(&user_id).filter(|owner| !owner.stale) {
                return Ok(owner.entries.clone());
            }
        }

        self.reconcile(user_id).await
    }

    /// Refetches the owner's list and merges it into the cache.
    pub async fn reconcile(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<CachedConversation>, PersistenceError> {
        let confirmed = self.repo.list_conversations(user_id).await?;

        let mut cache = self.cache.lock().unwrap();
        let owner = cache.entry(user_id).or_default();
        owner.entries = reconcile_entries(&owner.entries, confirmed);
        owner.stale = false;
        Ok(owner.entries.clone())
    }

    pub async fn get(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Conversation, PersistenceError> {
        self.repo.get_conversation(user_id, conversation_id).await
    }

    /// Creates a conversation, optionally named after its first message.
    pub async fn create_conversation(
        &self,
        user_id: Uuid,
        seed: Option<&str>,
    ) -> Result<Uuid, PersistenceError> {
        let id = Uuid::new_v4();
        let summary = seed_summary(seed);
        let preview = seed.map(str::trim).unwrap_or_default().to_owned();

        self.repo
            .create_conversation(NewConversation {
                id,
                user: user_id,
                summary: Some(summary.clone()),
                last_message_text: Some(preview.clone()),
            })
            .await?;

        let now = Utc::now();
        self.insert_optimistic(
            user_id,
            Conversation {
                id,
                user: user_id,
                summary: Some(summary),
                last_message_text: Some(if preview.is_empty() {
                    NEW_CONVERSATION_SUMMARY.to_owned()
                } else {
                    preview
                }),
                created_at: now,
                updated_at: now,
            },
        );

        if let Err(e) = self.reconcile(user_id).await {
            warn!("conversation list of {user_id} not reconciled after create: {e}");
            self.invalidate(user_id);
        }

        debug!("created conversation {id} for {user_id}");
        Ok(id)
    }

    fn insert_optimistic(&self, user_id: Uuid, conversation: Conversation) {
        let mut cache = self.cache.lock().unwrap();
        let owner = cache.entry(user_id).or_default();
        owner.entries.retain(|entry| entry.conversation.id != conversation.id);
        owner.entries.insert(
            0,
            CachedConversation {
                conversation,
                pending: true,
            },
        );
    }

    pub async fn update(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        changes: ConversationChanges,
    ) -> Result<(), PersistenceError> {
        self.repo
            .update_conversation(user_id, conversation_id, changes)
            .await?;
        self.invalidate(user_id);
        Ok(())
    }

    /// Removes the conversation from the cached list first, then deletes it.
    ///
    /// A failed delete is reported but the cached list keeps the removal.
    pub async fn remove(&self, user_id: Uuid, conversation_id: Uuid) -> Result<(), PersistenceError> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(owner) = cache.get_mut(&user_id) {
                owner
                    .entries
                    .retain(|entry| entry.conversation.id != conversation_id);
            }
        }

        self.repo
            .delete_conversation(user_id, conversation_id)
            .await
            .inspect_err(|e| error!("failed to delete conversation {conversation_id}: {e}"))
    }

    /// Marks the owner's cached list as outdated; the next `list` refetches.
    pub fn invalidate(&self, user_id: Uuid) {
        if let Some(owner) = self.cache.lock().unwrap().get_mut(&user_id) {
            owner.stale = true;
        }
    }
}

/// Conversations whose message lists are kept live at most.
pub const MESSAGE_CACHE_CAPACITY: usize = 256;

struct MessageCache {
    owner: Uuid,
    feed: SnapshotReceiver,
    last_used: Instant,
}

/// Live message lists of recently opened conversations.
pub struct MessageStore {
    repo: Ref<dyn ConversationRepository>,
    conversations: Ref<ConversationStore>,
    capacity: usize,
    cache: Mutex<HashMap<Uuid, MessageCache>>,
}

#[injectable]
impl MessageStore {
    #[inject]
    pub fn create(
        repo: Ref<dyn ConversationRepository>,
        conversations: Ref<ConversationStore>,
    ) -> MessageStore {
        MessageStore::with_capacity(repo, conversations, MESSAGE_CACHE_CAPACITY)
    }
}

impl MessageStore {
    /// Keeps at most `capacity` conversations live; the least recently read
    /// one is evicted first.
    pub fn with_capacity(
        repo: Ref<dyn ConversationRepository>,
        conversations: Ref<ConversationStore>,
        capacity: usize,
    ) -> MessageStore {
        MessageStore {
            repo,
            conversations,
            capacity: capacity.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Messages of a conversation in chronological order.
    ///
    /// The first read opens the conversation's live feed; later reads are
    /// served from it for the owner only.
    pub async fn list(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, PersistenceError> {
        if let Some(messages) = self.cached(user_id, conversation_id)? {
            return Ok(messages);
        }

        let feed = self
            .repo
            .subscribe_messages(user_id, conversation_id)
            .await?;
        let messages = feed.borrow().messages.to_vec();
        self.keep(user_id, conversation_id, feed);
        Ok(messages)
    }

    fn cached(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Option<Vec<Message>>, PersistenceError> {
        let mut cache = self.cache.lock().unwrap();
        let Some(entry) = cache.get_mut(&conversation_id) else {
            return Ok(None);
        };
        if entry.owner != user_id {
            return Err(PersistenceError::Unauthorized(conversation_id));
        }

        entry.last_used = Instant::now();
        let messages = entry.feed.borrow().messages.to_vec();
        Ok(Some(messages))
    }

    fn keep(&self, owner: Uuid, conversation_id: Uuid, feed: SnapshotReceiver) {
        let mut cache = self.cache.lock().unwrap();
        cache.entry(conversation_id).or_insert(MessageCache {
            owner,
            feed,
            last_used: Instant::now(),
        });

        while cache.len() > self.capacity {
            let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| *id)
            else {
                break;
            };
            cache.remove(&oldest);
            debug!("conversation {oldest} evicted from the message cache");
        }
    }

    /// Whether the conversation's messages are currently held live.
    pub fn is_cached(&self, conversation_id: Uuid) -> bool {
        self.cache.lock().unwrap().contains_key(&conversation_id)
    }

    /// Appends a message. The cached list picks it up from the live feed.
    pub async fn append(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message: NewMessage,
    ) -> Result<Uuid, PersistenceError> {
        let id = self
            .repo
            .append_message(user_id, conversation_id, message)
            .await?;
        self.conversations.invalidate(user_id);
        Ok(id)
    }

    pub async fn set_feedback(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
        feedback: Option<Feedback>,
    ) -> Result<(), PersistenceError> {
        self.repo
            .update_message_feedback(user_id, conversation_id, message_id, feedback)
            .await
    }

    /// A separate live feed of the conversation, for streaming to a client.
    pub async fn watch(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<SnapshotReceiver, PersistenceError> {
        self.repo.subscribe_messages(user_id, conversation_id).await
    }

    /// Drops the cached list and its feed.
    pub fn forget(&self, conversation_id: Uuid) {
        self.cache.lock().unwrap().remove(&conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conversation(user: Uuid, minutes_ago: i64) -> Conversation {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        Conversation {
            id: Uuid::new_v4(),
            user,
            summary: Some(NEW_CONVERSATION_SUMMARY.to_owned()),
            last_message_text: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_seed_summary() {
        assert_eq!(seed_summary(None), "New Conversation");
        assert_eq!(seed_summary(Some("  ")), "New Conversation");
        assert_eq!(
            seed_summary(Some("Why was my card declined?")),
            "Regarding: \"Why was my card declined?...\""
        );
        let long = "a".repeat(80);
        assert_eq!(seed_summary(Some(&long)), format!("Regarding: \"{}...\"", "a".repeat(50)));
    }

    #[test]
    fn test_confirmed_row_replaces_optimistic_row() {
        let user = Uuid::new_v4();
        let older = conversation(user, 10);
        let mut optimistic = conversation(user, 0);
        optimistic.summary = Some("client copy".to_owned());

        let cached = vec![
            CachedConversation {
                conversation: optimistic.clone(),
                pending: true,
            },
            CachedConversation {
                conversation: older.clone(),
                pending: false,
            },
        ];

        let mut confirmed = optimistic.clone();
        confirmed.summary = Some("server copy".to_owned());
        let merged = reconcile_entries(&cached, vec![confirmed.clone(), older.clone()]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].conversation, confirmed);
        assert!(!merged[0].pending);
        assert_eq!(merged[1].conversation, older);
    }

    #[test]
    fn test_pending_row_survives_lagging_listing() {
        let user = Uuid::new_v4();
        let older = conversation(user, 10);
        let optimistic = conversation(user, 0);
        let cached = vec![CachedConversation {
            conversation: optimistic.clone(),
            pending: true,
        }];

        let merged = reconcile_entries(&cached, vec![older.clone()]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].conversation.id, optimistic.id);
        assert!(merged[0].pending);
        assert_eq!(merged[1].conversation.id, older.id);
    }

    #[test]
    fn test_rows_deleted_on_the_server_disappear() {
        let user = Uuid::new_v4();
        let gone = conversation(user, 5);
        let kept = conversation(user, 10);
        let cached = vec![
            CachedConversation {
                conversation: gone,
                pending: false,
            },
            CachedConversation {
                conversation: kept.clone(),
                pending: false,
            },
        ];

        let merged = reconcile_entries(&cached, vec![kept.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].conversation, kept);
    }
}
