//! Database entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

/// Length of the preview text kept on a conversation.
pub const PREVIEW_LENGTH: usize = 100;

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub user: Uuid,
    pub summary: Option<String>,
    pub last_message_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A conversation about to be written. The id doubles as the correlation id of
/// the optimistic cache entry created for it.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub id: Uuid,
    pub user: Uuid,
    pub summary: Option<String>,
    pub last_message_text: Option<String>,
}

/// Partial update of a conversation. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationChanges {
    pub summary: Option<String>,
    pub last_message_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[repr(u8)]
pub enum MessageKind {
    System = 1,
    Ai = 2,
    User = 3,
}

impl MessageKind {
    /// Speaker label used when a conversation is flattened into a prompt.
    pub fn speaker(self) -> &'static str {
        match self {
            MessageKind::System => "System",
            MessageKind::Ai => "AI",
            MessageKind::User => "User",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Feedback {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub kind: MessageKind,
    pub text: String,
    pub suggestions: Option<Json<Vec<String>>>,
    pub feedback: Option<Feedback>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn suggestions(&self) -> &[String] {
        self.suggestions.as_ref().map(|s| s.0.as_slice()).unwrap_or(&[])
    }

    /// `"<Speaker>: <text>"`, one line of a flattened transcript.
    pub fn transcript_line(&self) -> String {
        format!("{}: {}", self.kind.speaker(), self.text)
    }
}

/// A message without id or timestamp; both are assigned by the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub kind: MessageKind,
    pub text: String,
    pub suggestions: Option<Vec<String>>,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::User,
            text: text.into(),
            suggestions: None,
        }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Ai,
            text: text.into(),
            suggestions: None,
        }
    }

    /// An AI actions block: no text, only follow-up suggestions.
    pub fn suggestions(suggestions: Vec<String>) -> Self {
        Self {
            kind: MessageKind::Ai,
            text: String::new(),
            suggestions: Some(suggestions),
        }
    }

    /// Text shown for the parent conversation in the conversation list.
    pub fn preview_text(&self) -> String {
        if !self.text.is_empty() {
            truncate_chars(&self.text, PREVIEW_LENGTH)
        } else if self.suggestions.is_some() {
            "AI Suggestions".to_owned()
        } else {
            "New Message".to_owned()
        }
    }
}

/// Cuts `text` to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => text[..index].to_owned(),
        None => text.to_owned(),
    }
}
