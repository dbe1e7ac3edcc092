use crate::core::chat::ChatError;
use crate::core::traits::AiError;
use crate::infrastructure::traits::PersistenceError;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use log::error;
use serde_json::json;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod conversations;
pub mod prompts;
pub mod session;

const X_USER_ID: &str = "X-User-ID";

/// All JSON and SSE routes; the page and its assets are mounted by the binary.
pub fn router() -> Router {
    Router::new()
        .nest("/conversations", conversations::router())
        .nest("/session", session::router())
        .nest("/prompts", prompts::router())
}

#[derive(Debug)]
pub struct ExtractUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for ExtractUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        if let Some(user_id) = parts.headers.get(X_USER_ID) {
            let user_id = user_id
                .to_str()
                .map_err(|_| ApiError::BadRequest("invalid user id"))?;
            let user_id =
                Uuid::from_str(user_id).map_err(|_| ApiError::BadRequest("invalid user id"))?;
            Ok(ExtractUser(user_id))
        } else {
            Err(ApiError::BadRequest("`X-User-ID` header is missing"))
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Ai(#[from] AiError),
}

fn persistence_status(error: &PersistenceError) -> StatusCode {
    match error {
        PersistenceError::ConversationNotFound(_) | PersistenceError::MessageNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        PersistenceError::Unauthorized(_) => StatusCode::FORBIDDEN,
        PersistenceError::Database(_) | PersistenceError::Migration(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Chat(ChatError::EmptyMessage) => StatusCode::BAD_REQUEST,
            ApiError::Chat(ChatError::TurnInFlight) => StatusCode::CONFLICT,
            ApiError::Chat(ChatError::Persistence(e)) | ApiError::Persistence(e) => {
                persistence_status(e)
            }
            ApiError::Chat(ChatError::Ai(_)) | ApiError::Ai(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (ApiError::BadRequest("nope"), StatusCode::BAD_REQUEST),
            (ChatError::EmptyMessage.into(), StatusCode::BAD_REQUEST),
            (ChatError::TurnInFlight.into(), StatusCode::CONFLICT),
            (
                PersistenceError::ConversationNotFound(id).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                ChatError::Persistence(PersistenceError::Unauthorized(id)).into(),
                StatusCode::FORBIDDEN,
            ),
            (
                AiError::Timeout(Duration::from_secs(1)).into(),
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.status(), expected, "{error}");
        }
    }
}
