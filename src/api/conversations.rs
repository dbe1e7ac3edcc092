//! Conversations endpoints

use crate::api::conversations::schemas::{
    ConversationList, CreateConversation, CreateMessage, CreatedConversation, CreatedMessage,
    MessagesList, SetFeedback, TurnAccepted, UpdateConversation,
};
use crate::api::{ApiError, ExtractUser};
use crate::core::chat::ChatOrchestrator;
use crate::core::services::{ConversationStore, MessageStore};
use crate::infrastructure::entities::ConversationChanges;
use async_stream::stream;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use di_axum::Inject;
use futures_util::Stream;
use log::debug;
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_conversations).post(new_conversation))
        .route("/:id", patch(rename_conversation).delete(delete_conversation))
        .route(
            "/:id/messages",
            get(conversation_messages).post(post_message),
        )
        .route("/:id/messages/live", get(live_messages))
        .route(
            "/:id/messages/:message_id/feedback",
            put(set_message_feedback),
        )
        .route("/:id/suggestions", post(suggest_follow_ups))
}

async fn list_conversations(
    Inject(conversations): Inject<ConversationStore>,
    ExtractUser(current_user): ExtractUser,
) -> Result<Json<ConversationList>, ApiError> {
    let entries = conversations.list(current_user).await?;

    Ok(Json(ConversationList {
        conversations: entries
            .into_iter()
            .map(schemas::Conversation::from)
            .collect(),
    }))
}

/// Creates a conversation. A non-blank first message also starts a turn in it.
async fn new_conversation(
    Inject(conversations): Inject<ConversationStore>,
    Inject(chat): Inject<ChatOrchestrator>,
    ExtractUser(current_user): ExtractUser,
    Json(create_conversation): Json<CreateConversation>,
) -> Result<(StatusCode, Json<CreatedConversation>), ApiError> {
    let seed = create_conversation
        .message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty());

    let conversation_id = conversations
        .create_conversation(current_user, seed)
        .await?;

    let turn = match seed {
        Some(message) => Some(chat.submit(current_user, conversation_id, message).await?.turn),
        None => {
            chat.select_conversation(current_user, Some(conversation_id));
            None
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(CreatedConversation {
            id: conversation_id,
            turn,
        }),
    ))
}

async fn rename_conversation(
    Inject(conversations): Inject<ConversationStore>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
    Json(update): Json<UpdateConversation>,
) -> Result<StatusCode, ApiError> {
    let summary = update.summary.trim();
    if summary.is_empty() {
        return Err(ApiError::BadRequest("summary is empty"));
    }

    conversations
        .update(
            current_user,
            conversation_id,
            ConversationChanges {
                summary: Some(summary.to_owned()),
                last_message_text: None,
            },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_conversation(
    Inject(conversations): Inject<ConversationStore>,
    Inject(messages): Inject<MessageStore>,
    Inject(chat): Inject<ChatOrchestrator>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if chat.session(current_user).selected_conversation_id == Some(conversation_id) {
        chat.select_conversation(current_user, None);
    }

    conversations.remove(current_user, conversation_id).await?;
    messages.forget(conversation_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn conversation_messages(
    Inject(messages): Inject<MessageStore>,
    Path(conversation_id): Path<Uuid>,
    ExtractUser(current_user): ExtractUser,
) -> Result<Json<MessagesList>, ApiError> {
    let messages = messages.list(current_user, conversation_id).await?;

    Ok(Json(MessagesList {
        messages: messages.into_iter().map(schemas::Message::from).collect(),
    }))
}

async fn post_message(
    Inject(chat): Inject<ChatOrchestrator>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
    Json(message): Json<CreateMessage>,
) -> Result<(StatusCode, Json<TurnAccepted>), ApiError> {
    let turn = chat
        .submit(current_user, conversation_id, &message.text)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TurnAccepted {
            conversation_id: turn.conversation_id,
            turn: turn.turn,
        }),
    ))
}

/// Streams the full ordered message list every time it changes.
///
/// A client that falls behind skips straight to the newest list.
async fn live_messages(
    Inject(messages): Inject<MessageStore>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let mut feed = messages.watch(current_user, conversation_id).await?;
    debug!("live feed of conversation {conversation_id} opened for {current_user}");

    let stream = stream! {
        loop {
            let snapshot = feed.borrow_and_update().clone();
            yield Event::default()
                .event("messages")
                .json_data(MessagesList {
                    messages: snapshot
                        .messages
                        .iter()
                        .cloned()
                        .map(schemas::Message::from)
                        .collect(),
                });

            if feed.changed().await.is_err() {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn set_message_feedback(
    Inject(messages): Inject<MessageStore>,
    ExtractUser(current_user): ExtractUser,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Json(feedback): Json<SetFeedback>,
) -> Result<StatusCode, ApiError> {
    messages
        .set_feedback(current_user, conversation_id, message_id, feedback.feedback)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn suggest_follow_ups(
    Inject(chat): Inject<ChatOrchestrator>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CreatedMessage>), ApiError> {
    let id = chat.suggest_follow_ups(current_user, conversation_id).await?;
    Ok((StatusCode::CREATED, Json(CreatedMessage { id })))
}

pub mod schemas {
    use crate::core::services::CachedConversation;
    use crate::infrastructure::entities::{self, Feedback};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Deserialize, Debug, Default)]
    pub struct CreateConversation {
        #[serde(default)]
        pub message: Option<String>,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct CreatedConversation {
        pub id: Uuid,
        pub turn: Option<u64>,
    }

    #[derive(Deserialize, Debug)]
    pub struct UpdateConversation {
        pub summary: String,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct Conversation {
        pub id: Uuid,
        pub summary: Option<String>,
        pub last_message_text: Option<String>,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
        pub pending: bool,
    }

    impl From<CachedConversation> for Conversation {
        fn from(entry: CachedConversation) -> Self {
            let conversation = entry.conversation;
            Conversation {
                id: conversation.id,
                summary: conversation.summary,
                last_message_text: conversation.last_message_text,
                created_at: conversation.created_at,
                updated_at: conversation.updated_at,
                pending: entry.pending,
            }
        }
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct ConversationList {
        pub conversations: Vec<Conversation>,
    }

    #[derive(Serialize, Deserialize, Debug, Default)]
    pub struct MessagesList {
        pub messages: Vec<Message>,
    }

    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum Sender {
        System,
        Ai,
        User,
    }

    impl From<entities::MessageKind> for Sender {
        fn from(kind: entities::MessageKind) -> Self {
            match kind {
                entities::MessageKind::System => Sender::System,
                entities::MessageKind::Ai => Sender::Ai,
                entities::MessageKind::User => Sender::User,
            }
        }
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct Message {
        pub conversation_id: Uuid,
        pub id: Uuid,
        pub sender: Sender,
        pub text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub suggestions: Vec<String>,
        pub feedback: Option<Feedback>,
        pub created_at: DateTime<Utc>,
    }

    impl From<entities::Message> for Message {
        fn from(message: entities::Message) -> Self {
            Message {
                conversation_id: message.conversation_id,
                id: message.id,
                sender: message.kind.into(),
                suggestions: message.suggestions().to_vec(),
                text: message.text,
                feedback: message.feedback,
                created_at: message.created_at,
            }
        }
    }

    #[derive(Deserialize, Debug)]
    pub struct CreateMessage {
        pub text: String,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct TurnAccepted {
        pub conversation_id: Uuid,
        pub turn: u64,
    }

    #[derive(Deserialize, Debug)]
    pub struct SetFeedback {
        pub feedback: Option<Feedback>,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct CreatedMessage {
        pub id: Uuid,
    }
}
