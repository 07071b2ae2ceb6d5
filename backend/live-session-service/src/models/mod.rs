//! Domain models for live broadcast sessions
//!
//! These are the records the control plane reasons about. Wire envelopes for
//! the real-time channel live in `websocket::message_types`.

pub mod analytics;
pub mod chat;
pub mod connection;
pub mod donation;
pub mod session;

pub use analytics::SessionMetrics;
pub use chat::{ChatMessage, MessageKind, ModerationAction, ModerationState};
pub use connection::{ConnectionId, ConnectionRole, TierRank, ViewerConnection, ViewerIdentity};
pub use donation::{Donation, DonationRequest, FeePolicy, FeeRounding, SettlementState};
pub use session::{Actor, SessionConfig, SessionState, StreamSession, Visibility};
