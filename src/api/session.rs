//! Per-user chat session endpoints

use crate::api::{ApiError, ExtractUser};
use crate::core::chat::{ChatOrchestrator, SessionView};
use crate::core::services::ConversationStore;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use di_axum::Inject;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .route("/", get(current_session))
        .route("/selection", put(select_conversation))
        .route("/cancel", post(cancel_turn))
}

#[derive(Deserialize, Debug)]
pub struct Selection {
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Cancelled {
    pub cancelled: bool,
}

async fn current_session(
    Inject(chat): Inject<ChatOrchestrator>,
    ExtractUser(current_user): ExtractUser,
) -> Json<SessionView> {
    Json(chat.session(current_user))
}

async fn select_conversation(
    Inject(chat): Inject<ChatOrchestrator>,
    Inject(conversations): Inject<ConversationStore>,
    ExtractUser(current_user): ExtractUser,
    Json(selection): Json<Selection>,
) -> Result<Json<SessionView>, ApiError> {
    if let Some(conversation_id) = selection.conversation_id {
        conversations.get(current_user, conversation_id).await?;
    }

    Ok(Json(
        chat.select_conversation(current_user, selection.conversation_id),
    ))
}

async fn cancel_turn(
    Inject(chat): Inject<ChatOrchestrator>,
    ExtractUser(current_user): ExtractUser,
) -> Json<Cancelled> {
    Json(Cancelled {
        cancelled: chat.cancel_turn(current_user),
    })
}
