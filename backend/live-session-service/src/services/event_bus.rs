//! Per-session chat sequencing and fan-out
//!
//! Each session has one chat log behind an async mutex. Sequence assignment,
//! history append and hub fan-out all happen while holding it, so every
//! connection sees messages in sequence order with no gaps. Logs exist from
//! go-live until the ended session is evicted; reads never create one.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{
    Actor, ChatMessage, Donation, MessageKind, ModerationAction, ModerationState, SessionState,
    StreamSession, ViewerIdentity,
};
use crate::services::access::AccessGate;
use crate::services::events::{SessionEvent, SessionEventSink};
use crate::services::hub::SignalingHub;
use crate::websocket::message_types::WsOutboundEvent;

#[derive(Default)]
struct ChatLog {
    last_sequence: u64,
    history: VecDeque<ChatMessage>,
    closed: bool,
}

/// Result of a moderation request
#[derive(Debug, Clone, PartialEq)]
pub enum ModerationOutcome {
    Applied(ChatMessage),
    /// Message was already removed; nothing was broadcast
    AlreadyApplied(ChatMessage),
}

struct Draft {
    sender_id: Option<Uuid>,
    display_name: String,
    body: String,
    kind: MessageKind,
    amount: Option<i64>,
}

pub struct EventBus {
    logs: DashMap<Uuid, Arc<Mutex<ChatLog>>>,
    hub: Arc<SignalingHub>,
    gate: Arc<AccessGate>,
    events: SessionEventSink,
    max_body_chars: usize,
    history_limit: usize,
}

impl EventBus {
    pub fn new(
        hub: Arc<SignalingHub>,
        gate: Arc<AccessGate>,
        events: SessionEventSink,
        max_body_chars: usize,
        history_limit: usize,
    ) -> Self {
        Self {
            logs: DashMap::new(),
            hub,
            gate,
            events,
            max_body_chars,
            history_limit: history_limit.max(1),
        }
    }

    fn log(&self, session_id: Uuid) -> Option<Arc<Mutex<ChatLog>>> {
        self.logs.get(&session_id).map(|log| log.value().clone())
    }

    /// Start the session's chat log. Idempotent.
    pub fn open_session(&self, session_id: Uuid) {
        self.logs.entry(session_id).or_default();
    }

    fn validate_body(&self, body: &str) -> Result<String> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("message body is empty".to_string()));
        }
        if trimmed.chars().count() > self.max_body_chars {
            return Err(AppError::Validation(format!(
                "message body exceeds {} characters",
                self.max_body_chars
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Publish a viewer or broadcaster chat message
    pub async fn publish(
        &self,
        session: &StreamSession,
        sender: &ViewerIdentity,
        body: &str,
    ) -> Result<ChatMessage> {
        if session.state != SessionState::Live {
            return Err(AppError::Conflict(format!(
                "chat is only open while the session is live (session is {})",
                session.state
            )));
        }
        if !session.chat_enabled {
            return Err(AppError::ChatDisabled);
        }
        let Some(sender_id) = sender.user_id() else {
            return Err(AppError::NotAuthorized(
                "anonymous viewers cannot chat".to_string(),
            ));
        };
        if session.subscriber_only_chat
            && sender_id != session.broadcaster_id
            && !self.gate.is_subscriber(session, sender).await?
        {
            return Err(AppError::NotAuthorized(
                "chat is limited to subscribers".to_string(),
            ));
        }
        let body = self.validate_body(body)?;

        self.sequence(
            session.id,
            Draft {
                sender_id: Some(sender_id),
                display_name: sender.display_name(),
                body,
                kind: MessageKind::Text,
                amount: None,
            },
        )
        .await
    }

    /// Publish a platform message; bypasses chat settings
    pub async fn publish_system(&self, session_id: Uuid, body: &str) -> Result<ChatMessage> {
        let body = self.validate_body(body)?;
        self.sequence(
            session_id,
            Draft {
                sender_id: None,
                display_name: "system".to_string(),
                body,
                kind: MessageKind::System,
                amount: None,
            },
        )
        .await
    }

    /// Sequence the announcement for a settled donation. Returns `None` when
    /// the session already closed its chat.
    pub async fn announce_donation(&self, donation: &Donation) -> Option<ChatMessage> {
        let body = match &donation.message {
            Some(message) if !message.trim().is_empty() => message.trim().to_string(),
            _ => String::new(),
        };
        let draft = Draft {
            sender_id: Some(donation.donor_id),
            display_name: donation.donor_name.clone(),
            body,
            kind: MessageKind::DonationAnnouncement,
            amount: Some(donation.gross_amount),
        };
        match self.sequence(donation.session_id, draft).await {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(session_id = %donation.session_id, error = %e, "donation announcement not delivered");
                None
            }
        }
    }

    async fn sequence(&self, session_id: Uuid, draft: Draft) -> Result<ChatMessage> {
        let Some(log) = self.log(session_id) else {
            return Err(AppError::Conflict(format!("chat for session {session_id} is not open")));
        };
        let mut log = log.lock().await;
        if log.closed {
            return Err(AppError::Conflict("session has ended".to_string()));
        }

        log.last_sequence += 1;
        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            sequence: log.last_sequence,
            sender_id: draft.sender_id,
            display_name: draft.display_name,
            body: draft.body,
            kind: draft.kind,
            moderation_state: ModerationState::Visible,
            created_at: Utc::now(),
            amount: draft.amount,
        };

        log.history.push_back(message.clone());
        while log.history.len() > self.history_limit {
            log.history.pop_front();
        }

        let frame = match message.kind {
            MessageKind::DonationAnnouncement => WsOutboundEvent::DonationAnnouncement {
                message: message.clone(),
            },
            MessageKind::Text | MessageKind::System => WsOutboundEvent::Chat {
                message: message.clone(),
            },
        };
        let delivered = self.hub.fan_out(session_id, Arc::new(frame));
        self.events.emit(
            session_id,
            SessionEvent::MessagePublished { kind: message.kind },
        );
        metrics::chat_message(message.kind.as_str());
        debug!(%session_id, sequence = message.sequence, delivered, "message sequenced");
        Ok(message)
    }

    /// Remove a message. Only the broadcaster or an administrator may do so;
    /// repeating the action is a no-op.
    pub async fn moderate(
        &self,
        session: &StreamSession,
        message_id: Uuid,
        action: ModerationAction,
        actor: Actor,
    ) -> Result<ModerationOutcome> {
        if matches!(actor, Actor::System) || !actor.may_control(session) {
            return Err(AppError::NotAuthorized(
                "only the broadcaster may moderate chat".to_string(),
            ));
        }

        let Some(log) = self.log(session.id) else {
            return Err(AppError::NotFound(format!("message {message_id}")));
        };
        let mut log = log.lock().await;
        let Some(message) = log.history.iter_mut().find(|m| m.id == message_id) else {
            return Err(AppError::NotFound(format!("message {message_id}")));
        };
        if message.is_removed() {
            return Ok(ModerationOutcome::AlreadyApplied(message.redacted()));
        }

        match action {
            ModerationAction::Remove => message.moderation_state = ModerationState::Removed,
        }
        let sequence = message.sequence;
        let snapshot = message.redacted();
        self.hub.fan_out(
            session.id,
            Arc::new(WsOutboundEvent::Moderation {
                message_id,
                action,
                sequence,
            }),
        );
        info!(session_id = %session.id, %message_id, sequence, "message removed");
        Ok(ModerationOutcome::Applied(snapshot))
    }

    /// Up to `limit` most recent messages in sequence order
    pub async fn recent(&self, session_id: Uuid, limit: usize) -> Vec<ChatMessage> {
        let Some(log) = self.log(session_id) else {
            return Vec::new();
        };
        let log = log.lock().await;
        let skip = log.history.len().saturating_sub(limit);
        log.history.iter().skip(skip).map(ChatMessage::redacted).collect()
    }

    pub async fn last_sequence(&self, session_id: Uuid) -> u64 {
        match self.log(session_id) {
            Some(log) => log.lock().await.last_sequence,
            None => 0,
        }
    }

    /// Run `f` with the current last sequence while no message can be
    /// sequenced. Admissions use this so a new connection's welcome frame and
    /// the first message it receives are contiguous.
    pub async fn with_sequence_barrier<T>(
        &self,
        session_id: Uuid,
        f: impl FnOnce(u64) -> Result<T>,
    ) -> Result<T> {
        let Some(log) = self.log(session_id) else {
            return Err(AppError::Conflict(format!("chat for session {session_id} is not open")));
        };
        let log = log.lock().await;
        if log.closed {
            return Err(AppError::Conflict("session has ended".to_string()));
        }
        f(log.last_sequence)
    }

    /// Stop sequencing; history stays readable until eviction
    pub async fn close_session(&self, session_id: Uuid) {
        if let Some(log) = self.log(session_id) {
            log.lock().await.closed = true;
        }
    }

    /// Drop a closed log. Open logs are kept.
    pub async fn evict(&self, session_id: Uuid) -> bool {
        let Some(log) = self.log(session_id) else {
            return false;
        };
        if !log.lock().await.closed {
            return false;
        }
        self.logs.remove(&session_id).is_some()
    }

    pub fn tracks(&self, session_id: Uuid) -> bool {
        self.logs.contains_key(&session_id)
    }
}
