//! Process configuration, read from the environment (and `.env`) once at startup.

use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const API_KEY_VAR: &str = "GOOGLE_GENAI_API_KEY";

const DEFAULT_DATABASE_URL: &str = "sqlite://lumen.db?mode=rwc";
const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_REPLY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HISTORY_WINDOW: usize = 10;
const DEFAULT_ALLOWED_ORIGINS: &[&str] = &["http://localhost:3000", "http://localhost:5173"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("GOOGLE_GENAI_API_KEY is not set. The application cannot start without it.")]
    MissingApiKey,

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Settings for one chat turn.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Deadline raced against the AI reply.
    pub reply_timeout: Duration,
    /// Number of previous messages included in the reply prompt.
    pub history_window: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: SqliteConnectOptions,
    pub api_key: String,
    pub model: String,
    pub gemini_base_url: String,
    pub listen_addr: String,
    pub allowed_origins: Vec<String>,
    pub chat: ChatSettings,
}

impl AppConfig {
    /// Loads `.env` if present and reads the process environment.
    pub fn from_env() -> Result<AppConfig, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = non_empty(API_KEY_VAR).ok_or(ConfigError::MissingApiKey)?;

        let database_url =
            non_empty("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned());
        let database =
            SqliteConnectOptions::from_str(&database_url).map_err(|e| ConfigError::Invalid {
                key: "DATABASE_URL",
                reason: e.to_string(),
            })?;

        let reply_timeout = match non_empty("AI_RESPONSE_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse_number("AI_RESPONSE_TIMEOUT_MS", &raw)?),
            None => Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
        };
        let history_window = match non_empty("CHAT_HISTORY_WINDOW") {
            Some(raw) => parse_number("CHAT_HISTORY_WINDOW", &raw)?,
            None => DEFAULT_HISTORY_WINDOW,
        };

        let allowed_origins = match non_empty("CORS_ALLOWED_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_owned)
                .collect(),
            None => DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect(),
        };

        Ok(AppConfig {
            database,
            api_key,
            model: non_empty("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            gemini_base_url: non_empty("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_owned()),
            listen_addr: non_empty("LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_owned()),
            allowed_origins,
            chat: ChatSettings {
                reply_timeout,
                history_window,
            },
        })
    }
}

fn parse_number<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}
