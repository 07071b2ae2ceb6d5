use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatMessage, ConnectionId, ConnectionRole, ModerationAction};

/// Kind of negotiation blob being relayed; the blob itself is opaque
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationPayload {
    pub kind: SignalKind,
    /// SDP or candidate text, forwarded byte-for-byte
    pub data: String,
}

/// Inbound frames from a connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsInboundEvent {
    Negotiation {
        to: ConnectionId,
        payload: NegotiationPayload,
    },
    Chat {
        body: String,
    },
    Moderation {
        message_id: Uuid,
        action: ModerationAction,
    },
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlEvent {
    BroadcasterLeft,
    SessionEnded {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RecordingReady {
        manifest_location: String,
    },
    ViewerJoined {
        connection_id: ConnectionId,
        viewer_count: usize,
    },
    ViewerLeft {
        connection_id: ConnectionId,
        viewer_count: usize,
    },
}

/// Outbound frames to a connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsOutboundEvent {
    Welcome {
        connection_id: ConnectionId,
        role: ConnectionRole,
        /// Highest chat sequence at admission; history below it comes from
        /// the messages endpoint
        last_sequence: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        playback_url: Option<String>,
    },
    Negotiation {
        from: ConnectionId,
        payload: NegotiationPayload,
    },
    Chat {
        message: ChatMessage,
    },
    DonationAnnouncement {
        message: ChatMessage,
    },
    Moderation {
        message_id: Uuid,
        action: ModerationAction,
        sequence: u64,
    },
    Control(ControlEvent),
    RelayFailed {
        to: ConnectionId,
        reason: String,
    },
    Error {
        code: String,
        message: String,
    },
    HeartbeatAck {
        server_time: DateTime<Utc>,
    },
}

impl WsOutboundEvent {
    /// Critical frames are never shed under backpressure. Roster updates are
    /// advisory and shed like any other frame.
    pub fn is_critical(&self) -> bool {
        match self {
            WsOutboundEvent::Control(
                ControlEvent::ViewerJoined { .. } | ControlEvent::ViewerLeft { .. },
            ) => false,
            WsOutboundEvent::Control(_)
            | WsOutboundEvent::Moderation { .. }
            | WsOutboundEvent::Welcome { .. } => true,
            _ => false,
        }
    }

    pub fn error(error: &crate::error::AppError) -> Self {
        WsOutboundEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}
