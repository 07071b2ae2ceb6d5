use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    System,
    DonationAnnouncement,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::DonationAnnouncement => "donation_announcement",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationState {
    Visible,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Remove,
}

/// Chat entry in a session's ordered stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Strictly increasing and gap-free within a session, starting at 1
    pub sequence: u64,
    pub sender_id: Option<Uuid>,
    pub display_name: String,
    pub body: String,
    pub kind: MessageKind,
    pub moderation_state: ModerationState,
    pub created_at: DateTime<Utc>,
    /// Gross amount for donation announcements
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
}

impl ChatMessage {
    pub fn is_removed(&self) -> bool {
        self.moderation_state == ModerationState::Removed
    }

    /// Copy suitable for history reads; removed bodies are not served
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.is_removed() {
            copy.body.clear();
        }
        copy
    }
}
