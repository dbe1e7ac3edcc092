//! DI "Interfaces"

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Substituted for a reply the model left empty.
pub const EMPTY_REPLY_FALLBACK: &str = "I seem to be having trouble formulating a full response. Could you try rephrasing or asking something different?";

#[derive(Debug, Error)]
pub enum AiError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("billing problem: {0}")]
    Billing(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("the model returned no text")]
    EmptyResponse,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("prompt template error: {0}")]
    Template(#[from] minijinja::Error),
}

/// Text generation backend.
///
/// Implementations fail with an `AiError` instead of hanging, but offer no
/// hard time bound; callers that need one race the call against a timer.
#[async_trait]
pub trait AiGateway: Send + Sync {
    /// Replies to `current_message`. A blank model output comes back as
    /// [`EMPTY_REPLY_FALLBACK`], not as an error.
    async fn generate_reply(
        &self,
        current_message: &str,
        conversation_history: Option<&str>,
    ) -> Result<String, AiError>;

    /// One or two sentence summary of a conversation transcript.
    async fn summarize(&self, conversation_history: &str) -> Result<String, AiError>;

    /// Follow-up actions the user might want to take next.
    async fn suggest_follow_ups(&self, conversation_history: &str) -> Result<Vec<String>, AiError>;

    /// A starter question for someone who has never used the assistant.
    async fn initial_prompt(&self) -> Result<String, AiError>;
}
