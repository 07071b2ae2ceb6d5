use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque per-connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionRole {
    Broadcaster,
    Viewer,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcaster => "broadcaster",
            Self::Viewer => "viewer",
        }
    }
}

/// A viewer is either a signed-in user or an anonymous visitor keyed by a
/// client-chosen handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ViewerIdentity {
    User(Uuid),
    Anonymous(String),
}

impl ViewerIdentity {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::User(id) => Some(*id),
            Self::Anonymous(_) => None,
        }
    }

    /// Stable key used for unique-viewer accounting
    pub fn key(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Anonymous(handle) => format!("anon:{handle}"),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Self::User(id) => id.simple().to_string()[..8].to_string(),
            Self::Anonymous(handle) => handle.clone(),
        }
    }
}

/// Ordinal rank of a subscription tier within one broadcaster's catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierRank(pub u32);

/// One admitted real-time attachment
#[derive(Debug, Clone, Serialize)]
pub struct ViewerConnection {
    pub connection_id: ConnectionId,
    pub session_id: Uuid,
    pub identity: ViewerIdentity,
    pub role: ConnectionRole,
    pub joined_at: DateTime<Utc>,
    /// Tier observed at admission; never refreshed while connected
    pub tier_snapshot: Option<String>,
}

impl ViewerConnection {
    pub fn new(
        session_id: Uuid,
        identity: ViewerIdentity,
        role: ConnectionRole,
        tier_snapshot: Option<String>,
    ) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            session_id,
            identity,
            role,
            joined_at: Utc::now(),
            tier_snapshot,
        }
    }

    pub fn is_broadcaster(&self) -> bool {
        self.role == ConnectionRole::Broadcaster
    }
}
