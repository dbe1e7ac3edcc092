//! Prompt helpers for the chat page

use crate::api::{ApiError, ExtractUser};
use crate::core::traits::AiGateway;
use axum::routing::get;
use axum::{Json, Router};
use di_axum::Inject;
use serde::{Deserialize, Serialize};

pub fn router() -> Router {
    Router::new().route("/initial", get(initial_prompt))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct InitialPrompt {
    pub prompt: String,
}

/// A starter question for the empty chat pane.
async fn initial_prompt(
    Inject(ai): Inject<dyn AiGateway>,
    ExtractUser(_): ExtractUser,
) -> Result<Json<InitialPrompt>, ApiError> {
    let prompt = ai.initial_prompt().await?;
    Ok(Json(InitialPrompt { prompt }))
}
