//! Chat turn orchestration.
//!
//! A turn is one user submission and the AI reply it produces:
//!
//! ```text
//! Idle -> Sending -> AwaitingAi -> Settling -> Idle
//! ```
//!
//! Each user has one session holding the selected conversation, the turn
//! state and a turn token. Superseding a turn (selecting another
//! conversation, or cancelling) bumps the token and cancels the in-flight AI
//! call; the stale turn compares its token at every suspension point and
//! stops writing once it no longer matches.

use crate::config::{AppConfig, ChatSettings};
use crate::core::services::{ConversationStore, MessageStore};
use crate::core::traits::{AiError, AiGateway, EMPTY_REPLY_FALLBACK};
use crate::infrastructure::entities::{
    ConversationChanges, Message, NewMessage, PREVIEW_LENGTH, truncate_chars,
};
use crate::infrastructure::traits::PersistenceError;
use di::{Ref, inject, injectable};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::iter;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const TIMEOUT_REPLY: &str = "Sorry, I'm taking too long to respond. Please try again.";
pub const ERROR_REPLY: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("a reply is still being generated")]
    TurnInFlight,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Ai(#[from] AiError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    Sending,
    AwaitingAi,
    Settling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    /// The model's own text.
    Generated,
    /// The model answered with nothing usable.
    EmptyFallback,
    /// The reply deadline passed first.
    TimedOut,
    /// The AI call failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// An AI message was appended.
    Replied { kind: ReplyKind, text: String },
    /// The reply was produced but could not be saved.
    Unsaved { kind: ReplyKind, text: String },
    /// Another action took over the session; nothing more was written.
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub selected_conversation_id: Option<Uuid>,
    pub state: TurnState,
    pub is_ai_responding: bool,
}

/// Idle sessions untouched for this long are dropped.
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
struct Session {
    selected: Option<Uuid>,
    state: TurnState,
    token: u64,
    cancel: Option<CancellationToken>,
    touched: Instant,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            selected: None,
            state: TurnState::Idle,
            token: 0,
            cancel: None,
            touched: Instant::now(),
        }
    }
}

impl Session {
    fn select(&mut self, conversation_id: Option<Uuid>) {
        if self.selected != conversation_id {
            self.supersede();
            self.selected = conversation_id;
        }
    }

    /// Invalidates the in-flight turn, if any. Returns whether there was one.
    fn supersede(&mut self) -> bool {
        if self.state == TurnState::Idle {
            return false;
        }
        self.token += 1;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.state = TurnState::Idle;
        true
    }
}

/// Drops idle sessions not touched within `ttl`. Turns in flight are kept.
fn prune_sessions(sessions: &mut HashMap<Uuid, Session>, now: Instant, ttl: Duration) {
    sessions.retain(|_, session| {
        session.state != TurnState::Idle || now.duration_since(session.touched) < ttl
    });
}

/// The caller's session, created on first use and marked as touched.
fn session_mut(sessions: &mut HashMap<Uuid, Session>, user_id: Uuid) -> &mut Session {
    let now = Instant::now();
    prune_sessions(sessions, now, SESSION_IDLE_TTL);
    let session = sessions.entry(user_id).or_default();
    session.touched = now;
    session
}

/// A started turn.
#[derive(Debug)]
pub struct TurnHandle {
    pub turn: u64,
    pub conversation_id: Uuid,
    handle: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    pub async fn wait(self) -> Result<TurnOutcome, JoinError> {
        self.handle.await
    }
}

struct Turn {
    user_id: Uuid,
    conversation_id: Uuid,
    token: u64,
    cancel: CancellationToken,
    text: String,
    history: Vec<Message>,
}

/// `"<Speaker>: <text>"` lines of `messages`, newline-joined.
pub fn transcript<'a>(messages: impl IntoIterator<Item = &'a Message>) -> String {
    messages
        .into_iter()
        .map(Message::transcript_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// The last `window` messages followed by the new user line.
fn prompt_history(history: &[Message], current: &str, window: usize) -> String {
    let recent = &history[history.len().saturating_sub(window)..];
    recent
        .iter()
        .map(Message::transcript_line)
        .chain(iter::once(format!("User: {current}")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn settle_reply(turn: u64, reply: Result<String, AiError>) -> (ReplyKind, String) {
    match reply {
        Ok(text) if text.trim().is_empty() || text == EMPTY_REPLY_FALLBACK => {
            warn!("turn {turn}: empty reply, using the fallback");
            (ReplyKind::EmptyFallback, EMPTY_REPLY_FALLBACK.to_owned())
        }
        Ok(text) => (ReplyKind::Generated, text),
        Err(AiError::Timeout(limit)) => {
            warn!("turn {turn}: no reply within {limit:?}");
            (ReplyKind::TimedOut, TIMEOUT_REPLY.to_owned())
        }
        Err(e) => {
            error!("turn {turn}: reply failed: {e}");
            (ReplyKind::Failed, ERROR_REPLY.to_owned())
        }
    }
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    messages: Ref<MessageStore>,
    conversations: Ref<ConversationStore>,
    ai: Ref<dyn AiGateway>,
    settings: ChatSettings,
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
}

#[injectable]
impl ChatOrchestrator {
    #[inject]
    pub fn create(
        messages: Ref<MessageStore>,
        conversations: Ref<ConversationStore>,
        ai: Ref<dyn AiGateway>,
        config: Ref<AppConfig>,
    ) -> ChatOrchestrator {
        ChatOrchestrator::new(messages, conversations, ai, config.chat.clone())
    }
}

impl ChatOrchestrator {
    pub fn new(
        messages: Ref<MessageStore>,
        conversations: Ref<ConversationStore>,
        ai: Ref<dyn AiGateway>,
        settings: ChatSettings,
    ) -> ChatOrchestrator {
        ChatOrchestrator {
            messages,
            conversations,
            ai,
            settings,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn session(&self, user_id: Uuid) -> SessionView {
        let sessions = self.sessions.lock().unwrap();
        let (selected, state) = sessions
            .get(&user_id)
            .map(|s| (s.selected, s.state))
            .unwrap_or_default();

        SessionView {
            selected_conversation_id: selected,
            state,
            is_ai_responding: state != TurnState::Idle,
        }
    }

    /// Changes the selected conversation. A turn still running for the
    /// previous selection is superseded.
    pub fn select_conversation(&self, user_id: Uuid, conversation_id: Option<Uuid>) -> SessionView {
        session_mut(&mut self.sessions.lock().unwrap(), user_id).select(conversation_id);
        self.session(user_id)
    }

    /// Abandons the in-flight turn. Returns whether there was one.
    pub fn cancel_turn(&self, user_id: Uuid) -> bool {
        let cancelled = self
            .sessions
            .lock()
            .unwrap()
            .get_mut(&user_id)
            .is_some_and(Session::supersede);
        if cancelled {
            info!("turn of {user_id} cancelled");
        }
        cancelled
    }

    /// Starts a turn in `conversation_id`, which becomes the selected conversation.
    ///
    /// The turn runs in the background; the returned handle resolves once the
    /// AI message (or its fallback) has been appended.
    pub async fn submit(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        text: &str,
    ) -> Result<TurnHandle, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        // Unknown and foreign conversations must not disturb the session.
        self.conversations.get(user_id, conversation_id).await?;

        let (token, cancel) = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = session_mut(&mut sessions, user_id);
            session.select(Some(conversation_id));
            if session.state != TurnState::Idle {
                return Err(ChatError::TurnInFlight);
            }
            session.token += 1;
            session.state = TurnState::Sending;
            let cancel = CancellationToken::new();
            session.cancel = Some(cancel.clone());
            (session.token, cancel)
        };
        debug!("turn {token} of {user_id} started in {conversation_id}");

        let history = match self.messages.list(user_id, conversation_id).await {
            Ok(history) => history,
            Err(e) => {
                self.finish(user_id, token);
                return Err(e.into());
            }
        };

        let turn = Turn {
            user_id,
            conversation_id,
            token,
            cancel,
            text: text.to_owned(),
            history,
        };
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_turn(turn).await });

        Ok(TurnHandle {
            turn: token,
            conversation_id,
            handle,
        })
    }

    async fn run_turn(self, turn: Turn) -> TurnOutcome {
        let Turn {
            user_id,
            conversation_id,
            token,
            cancel,
            text,
            history,
        } = turn;

        if let Err(e) = self
            .messages
            .append(user_id, conversation_id, NewMessage::user(&text))
            .await
        {
            error!("turn {token}: user message not saved, requesting a reply anyway: {e}");
        }

        if !self.advance(user_id, token, TurnState::AwaitingAi) {
            debug!("turn {token} superseded before the AI call");
            return TurnOutcome::Superseded;
        }

        let prompt_history = prompt_history(&history, &text, self.settings.history_window);
        let reply = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("turn {token} superseded while awaiting the AI");
                return TurnOutcome::Superseded;
            }
            reply = self.request_reply(&text, &prompt_history) => reply,
        };

        if !self.is_current(user_id, token) {
            debug!("turn {token} superseded, discarding its reply");
            return TurnOutcome::Superseded;
        }

        let (kind, reply_text) = settle_reply(token, reply);
        if let Err(e) = self
            .messages
            .append(user_id, conversation_id, NewMessage::ai(&reply_text))
            .await
        {
            error!("turn {token}: AI message not saved: {e}");
            self.finish(user_id, token);
            return TurnOutcome::Unsaved {
                kind,
                text: reply_text,
            };
        }

        if self.advance(user_id, token, TurnState::Settling) && kind == ReplyKind::Generated {
            self.summarize_in_background(user_id, conversation_id, &history, &text, &reply_text);
        }
        self.finish(user_id, token);

        TurnOutcome::Replied {
            kind,
            text: reply_text,
        }
    }

    async fn request_reply(&self, text: &str, history: &str) -> Result<String, AiError> {
        let limit = self.settings.reply_timeout;
        match tokio::time::timeout(limit, self.ai.generate_reply(text, Some(history))).await {
            Ok(reply) => reply,
            Err(_) => Err(AiError::Timeout(limit)),
        }
    }

    /// Fire-and-forget: refreshes the conversation's summary and preview.
    fn summarize_in_background(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        history: &[Message],
        user_text: &str,
        reply: &str,
    ) {
        let mut full_history = transcript(history);
        if !full_history.is_empty() {
            full_history.push('\n');
        }
        full_history.push_str(&format!("User: {user_text}\nAI: {reply}"));

        let preview = truncate_chars(reply, PREVIEW_LENGTH);
        let ai = self.ai.clone();
        let conversations = self.conversations.clone();

        tokio::spawn(async move {
            let summary = match ai.summarize(&full_history).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!("summarizing conversation {conversation_id} failed: {e}");
                    return;
                }
            };

            let changes = ConversationChanges {
                summary: Some(summary),
                last_message_text: Some(preview),
            };
            match conversations.update(user_id, conversation_id, changes).await {
                Ok(()) => debug!("conversation {conversation_id} summary updated"),
                Err(e) => warn!("saving summary of conversation {conversation_id} failed: {e}"),
            }
        });
    }

    fn is_current(&self, user_id: Uuid, token: u64) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(&user_id)
            .is_some_and(|s| s.token == token && s.state != TurnState::Idle)
    }

    /// Moves the session to `state` if `token` is still the current turn.
    fn advance(&self, user_id: Uuid, token: u64, state: TurnState) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&user_id) {
            Some(session) if session.token == token && session.state != TurnState::Idle => {
                session.state = state;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, user_id: Uuid, token: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(&user_id) {
            if session.token == token && session.state != TurnState::Idle {
                session.state = TurnState::Idle;
                session.cancel = None;
                debug!("turn {token} of {user_id} finished");
            }
        }
    }

    /// Appends an AI actions block with follow-up suggestions for the conversation.
    pub async fn suggest_follow_ups(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Uuid, ChatError> {
        let history = self.messages.list(user_id, conversation_id).await?;
        let suggestions = self.ai.suggest_follow_ups(&transcript(&history)).await?;
        if suggestions.is_empty() {
            return Err(AiError::EmptyResponse.into());
        }

        let id = self
            .messages
            .append(user_id, conversation_id, NewMessage::suggestions(suggestions))
            .await?;
        Ok(id)
    }
}
