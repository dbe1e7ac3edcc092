//! In-process fan-out of message snapshots to live subscribers.
//!
//! Each conversation with at least one subscriber owns a `watch` channel
//! holding its latest snapshot. Slow receivers skip intermediate snapshots
//! and only ever see the newest one.

use crate::infrastructure::entities::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

/// Full, ordered message list of one conversation.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Zero until the first snapshot has been published.
    pub revision: u64,
    pub messages: Arc<Vec<Message>>,
}

/// Receiving end of a conversation feed. Dropping it unsubscribes.
pub type SnapshotReceiver = watch::Receiver<Snapshot>;

#[derive(Clone, Default)]
pub struct MessageFeed {
    channels: Arc<Mutex<HashMap<Uuid, watch::Sender<Snapshot>>>>,
    revisions: Arc<AtomicU64>,
}

impl MessageFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a receiver on the conversation's channel, creating it if needed.
    ///
    /// Channels whose receivers are all gone are dropped on the way.
    pub async fn subscribe(&self, conversation_id: Uuid) -> SnapshotReceiver {
        let mut channels = self.channels.lock().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(conversation_id)
            .or_insert_with(|| watch::channel(Snapshot::default()).0)
            .subscribe()
    }

    pub async fn has_receivers(&self, conversation_id: Uuid) -> bool {
        let mut channels = self.channels.lock().await;
        match channels.get(&conversation_id) {
            Some(sender) if sender.receiver_count() > 0 => true,
            Some(_) => {
                channels.remove(&conversation_id);
                false
            }
            None => false,
        }
    }

    /// Reserves the revision for a snapshot that is about to be read.
    ///
    /// A snapshot read later never carries a smaller revision than one read
    /// earlier.
    pub fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Makes `messages` the current snapshot unless a newer revision is
    /// already there.
    pub async fn publish(&self, conversation_id: Uuid, revision: u64, messages: Vec<Message>) {
        let channels = self.channels.lock().await;
        let Some(sender) = channels.get(&conversation_id) else {
            return;
        };

        sender.send_if_modified(|current| {
            if current.revision >= revision {
                return false;
            }
            *current = Snapshot {
                revision,
                messages: Arc::new(messages),
            };
            true
        });
    }
}
