//! LLM Assistant service.
//!
//! Talks to Gemini's `generateContent` endpoint. Prompts are minijinja
//! templates rendered per call.

use crate::config::AppConfig;
use crate::core::gemini::{ErrorEnvelope, GenerateContentRequest, GenerateContentResponse, GenerationConfig};
use crate::core::traits::{AiError, AiGateway, EMPTY_REPLY_FALLBACK};
use async_trait::async_trait;
use di::{Ref, inject, injectable};
use log::{debug, warn};
use minijinja::context;
use reqwest::{Client, StatusCode};

const MAX_SUGGESTIONS: usize = 3;

const SYSTEM_INSTRUCTION: &str = "You are LUMEN, an AI assistant for a neobank. \
You help customers with their accounts, cards, payments, savings and budgeting. \
Answer in plain, friendly language and never ask for passwords, PINs or full card numbers.";

const REPLY_PROMPT: &str = r#"The user's latest message is: "{{ current_message }}"

Consider the following conversation history (if any):
{{ conversation_history }}

Generate a direct, helpful and conversational textual response to the user's current message.
Focus on the most relevant and concise answer. The output is shown to the user as is.
"#;

const SUMMARY_PROMPT: &str = r#"Summarize the following conversation between a neobank customer and LUMEN in one short sentence, suitable as a title in a list of conversations.
Do not add quotes or a trailing period.

Conversation History:
{{ conversation_history }}
"#;

const SUGGESTIONS_PROMPT: &str = r#"Based on the following conversation history, suggest {{ count }} relevant follow-up actions the user might want to take.
Each action is a short request written from the user's point of view. Return the suggestions as an array of strings.

Conversation History:
{{ conversation_history }}
"#;

const INITIAL_PROMPT: &str = r#"Generate a single helpful starting prompt for a new user who is unfamiliar with your capabilities.
The prompt should be concise and encourage the user to explore LUMEN's features related to finance.
Do not greet the user, just provide the starting prompt.
"#;

pub struct GeminiAssistant {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    prompts: minijinja::Environment<'static>,
}

#[injectable(AiGateway)]
impl GeminiAssistant {
    #[inject]
    pub fn create(config: Ref<AppConfig>) -> GeminiAssistant {
        GeminiAssistant::new(&config.api_key, &config.model, &config.gemini_base_url)
    }
}

impl GeminiAssistant {
    pub fn new(api_key: &str, model: &str, base_url: &str) -> GeminiAssistant {
        let mut prompts = minijinja::Environment::new();
        prompts.set_trim_blocks(true);

        GeminiAssistant {
            client: Client::new(),
            api_key: api_key.to_owned(),
            model: model.to_owned(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            prompts,
        }
    }

    fn render(&self, name: &str, source: &str, ctx: minijinja::Value) -> Result<String, AiError> {
        Ok(self.prompts.render_named_str(name, source, ctx)?)
    }

    /// Sends one prompt and returns the text of the first candidate, which may be empty.
    async fn generate(&self, request: GenerateContentRequest) -> Result<String, AiError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(AiError::Request(
                error.message.unwrap_or_else(|| "unknown error".to_owned()),
            ));
        }

        Ok(body.text().unwrap_or_default())
    }
}

/// Maps a non-2xx provider response onto the error taxonomy.
fn classify_failure(status: StatusCode, body: &str) -> AiError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error.message)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            if message.to_lowercase().contains("billing") =>
        {
            AiError::Billing(message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AiError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => AiError::QuotaExceeded(message),
        StatusCode::NOT_FOUND => AiError::ModelNotFound(message),
        _ => AiError::Request(format!("HTTP {}: {message}", status.as_u16())),
    }
}

/// Models sometimes wrap JSON answers in a markdown code fence.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn parse_suggestions(text: &str) -> Result<Vec<String>, AiError> {
    let suggestions: Vec<String> = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| AiError::InvalidResponse(format!("suggestions are not a string list: {e}")))?;

    Ok(suggestions
        .into_iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .take(MAX_SUGGESTIONS)
        .collect())
}

#[async_trait]
impl AiGateway for GeminiAssistant {
    async fn generate_reply(
        &self,
        current_message: &str,
        conversation_history: Option<&str>,
    ) -> Result<String, AiError> {
        debug!("generating reply for {current_message:?}");
        let prompt = self.render(
            "reply",
            REPLY_PROMPT,
            context! {
                current_message => current_message,
                conversation_history => conversation_history.unwrap_or_default(),
            },
        )?;

        let request =
            GenerateContentRequest::from_prompt(prompt).with_system_instruction(SYSTEM_INSTRUCTION);
        let reply = self.generate(request).await?;

        if reply.trim().is_empty() {
            warn!("model returned an empty reply, substituting the fallback");
            return Ok(EMPTY_REPLY_FALLBACK.to_owned());
        }

        Ok(reply)
    }

    async fn summarize(&self, conversation_history: &str) -> Result<String, AiError> {
        let prompt = self.render(
            "summary",
            SUMMARY_PROMPT,
            context! { conversation_history => conversation_history },
        )?;

        let summary = self
            .generate(GenerateContentRequest::from_prompt(prompt))
            .await?;
        let summary = summary.trim();

        if summary.is_empty() {
            return Err(AiError::EmptyResponse);
        }
        Ok(summary.to_owned())
    }

    async fn suggest_follow_ups(&self, conversation_history: &str) -> Result<Vec<String>, AiError> {
        let prompt = self.render(
            "suggestions",
            SUGGESTIONS_PROMPT,
            context! {
                conversation_history => conversation_history,
                count => MAX_SUGGESTIONS,
            },
        )?;

        let request = GenerateContentRequest::from_prompt(prompt)
            .with_system_instruction(SYSTEM_INSTRUCTION)
            .with_generation_config(GenerationConfig::string_list());
        let text = self.generate(request).await?;

        if text.trim().is_empty() {
            return Err(AiError::EmptyResponse);
        }
        parse_suggestions(&text)
    }

    async fn initial_prompt(&self) -> Result<String, AiError> {
        let request = GenerateContentRequest::from_prompt(INITIAL_PROMPT.to_owned())
            .with_system_instruction(SYSTEM_INSTRUCTION);
        let prompt = self.generate(request).await?;
        let prompt = prompt.trim();

        if prompt.is_empty() {
            return Err(AiError::EmptyResponse);
        }
        Ok(prompt.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_and_billing() {
        let body = r#"{"error":{"code":403,"message":"Billing account is disabled","status":"PERMISSION_DENIED"}}"#;
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, body),
            AiError::Billing(_)
        ));

        let body = r#"{"error":{"code":401,"message":"API key not valid","status":"UNAUTHENTICATED"}}"#;
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, body),
            AiError::Auth(message) if message == "API key not valid"
        ));
    }

    #[test]
    fn test_classify_quota_model_and_other() {
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, ""),
            AiError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, "not json"),
            AiError::ModelNotFound(message) if message == "HTTP 404"
        ));
        assert!(matches!(
            classify_failure(StatusCode::INTERNAL_SERVER_ERROR, ""),
            AiError::Request(_)
        ));
    }

    #[test]
    fn test_parse_suggestions_with_code_fence() {
        let text = "```json\n[\"Check my balance\", \" \", \"Freeze my card\"]\n```";
        assert_eq!(
            parse_suggestions(text).unwrap(),
            vec!["Check my balance", "Freeze my card"]
        );
    }

    #[test]
    fn test_parse_suggestions_caps_the_list() {
        let text = r#"["a", "b", "c", "d"]"#;
        assert_eq!(parse_suggestions(text).unwrap().len(), MAX_SUGGESTIONS);
        assert!(matches!(
            parse_suggestions("Check my balance"),
            Err(AiError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_reply_prompt_renders_history() {
        let assistant = GeminiAssistant::new("key", "model", "http://localhost/");
        let prompt = assistant
            .render(
                "reply",
                REPLY_PROMPT,
                context! {
                    current_message => "What's my balance?",
                    conversation_history => "User: What's my balance?",
                },
            )
            .unwrap();

        assert!(prompt.contains(r#"The user's latest message is: "What's my balance?""#));
        assert!(prompt.contains("User: What's my balance?"));
        assert_eq!(assistant.base_url, "http://localhost");
    }
}
