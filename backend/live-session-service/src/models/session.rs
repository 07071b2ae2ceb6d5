//! Stream session record and its lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Who may join a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    Public,
    Subscribers,
    TierGated,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "PUBLIC",
            Self::Subscribers => "SUBSCRIBERS",
            Self::TierGated => "TIER_GATED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PUBLIC" => Some(Self::Public),
            "SUBSCRIBERS" => Some(Self::Subscribers),
            "TIER_GATED" => Some(Self::TierGated),
            _ => None,
        }
    }
}

/// Session lifecycle state
///
/// Legal moves: `SCHEDULED -> LIVE`, `SCHEDULED -> ENDED`, `LIVE -> ENDED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Scheduled,
    Live,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Live => "LIVE",
            Self::Ended => "ENDED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SCHEDULED" => Some(Self::Scheduled),
            "LIVE" => Some(Self::Live),
            "ENDED" => Some(Self::Ended),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, target: SessionState) -> bool {
        matches!(
            (self, target),
            (Self::Scheduled, Self::Live) | (Self::Scheduled, Self::Ended) | (Self::Live, Self::Ended)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcaster-supplied configuration for a new session
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SessionConfig {
    pub visibility: Visibility,
    /// Tier reference, required for `TIER_GATED` and rejected otherwise
    #[validate(length(min = 1, max = 64))]
    #[serde(default)]
    pub minimum_tier: Option<String>,
    #[serde(default = "default_true")]
    pub chat_enabled: bool,
    #[serde(default)]
    pub subscriber_only_chat: bool,
    #[serde(default)]
    pub recording_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl SessionConfig {
    pub fn public() -> Self {
        Self {
            visibility: Visibility::Public,
            minimum_tier: None,
            chat_enabled: true,
            subscriber_only_chat: false,
            recording_enabled: false,
        }
    }

    /// Structural checks that need no external lookup
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|e| e.to_string())?;
        match (self.visibility, &self.minimum_tier) {
            (Visibility::TierGated, None) => {
                Err("minimum_tier is required for TIER_GATED sessions".to_string())
            }
            (Visibility::Public | Visibility::Subscribers, Some(_)) => {
                Err("minimum_tier only applies to TIER_GATED sessions".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Who is asking for a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    User(Uuid),
    /// Administrative override (operator token)
    Admin,
    /// Internal cascades: broadcaster disconnect, transcoder failure
    System,
}

impl Actor {
    pub fn may_control(&self, session: &StreamSession) -> bool {
        match self {
            Actor::User(id) => *id == session.broadcaster_id,
            Actor::Admin | Actor::System => true,
        }
    }
}

/// Authoritative session record, owned by the session registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub id: Uuid,
    pub broadcaster_id: Uuid,
    pub visibility: Visibility,
    pub minimum_tier: Option<String>,
    pub state: SessionState,
    pub chat_enabled: bool,
    pub subscriber_only_chat: bool,
    pub recording_enabled: bool,
    /// Set when the session was ended by a failure rather than the broadcaster
    pub fault_reason: Option<String>,
    /// Archive manifest recorded at teardown when recording was enabled
    pub archive_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StreamSession {
    pub fn scheduled(broadcaster_id: Uuid, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            broadcaster_id,
            visibility: config.visibility,
            minimum_tier: config.minimum_tier,
            state: SessionState::Scheduled,
            chat_enabled: config.chat_enabled,
            subscriber_only_chat: config.subscriber_only_chat,
            recording_enabled: config.recording_enabled,
            fault_reason: None,
            archive_location: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }
}
