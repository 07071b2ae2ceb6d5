use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-session counters; frozen once `finalized_at` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: Uuid,
    pub peak_concurrent_viewers: u64,
    pub unique_viewers: u64,
    pub total_watch_time_ms: u64,
    pub total_chat_messages: u64,
    pub total_donation_gross: i64,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl SessionMetrics {
    pub fn empty(session_id: Uuid) -> Self {
        Self {
            session_id,
            peak_concurrent_viewers: 0,
            unique_viewers: 0,
            total_watch_time_ms: 0,
            total_chat_messages: 0,
            total_donation_gross: 0,
            finalized_at: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.finalized_at.is_some()
    }
}
