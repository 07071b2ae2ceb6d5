//! Access control gate for joining a session

use resilience::CallPolicy;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::clients::{guarded, SubscriptionDirectory};
use crate::error::Result;
use crate::models::{SessionState, StreamSession, ViewerIdentity, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotSubscribed,
    TierTooLow,
    SessionEnded,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSubscribed => "not_subscribed",
            Self::TierTooLow => "tier_too_low",
            Self::SessionEnded => "session_ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Carries the tier snapshot observed during the check
    Allow { tier: Option<String> },
    Deny(DenyReason),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow { .. })
    }
}

/// Evaluates visibility rules against the subscription directory.
/// Nothing is cached between calls.
pub struct AccessGate {
    directory: Arc<dyn SubscriptionDirectory>,
    policy: CallPolicy,
}

impl AccessGate {
    pub fn new(directory: Arc<dyn SubscriptionDirectory>, policy: CallPolicy) -> Self {
        Self { directory, policy }
    }

    pub async fn authorize(
        &self,
        session: &StreamSession,
        viewer: &ViewerIdentity,
    ) -> Result<AccessDecision> {
        if session.state == SessionState::Ended {
            return Ok(AccessDecision::Deny(DenyReason::SessionEnded));
        }
        if viewer.user_id() == Some(session.broadcaster_id) {
            return Ok(AccessDecision::Allow { tier: None });
        }

        let decision = match session.visibility {
            Visibility::Public => AccessDecision::Allow { tier: None },
            Visibility::Subscribers => match self.active_tier(session, viewer).await? {
                Some(tier) => AccessDecision::Allow { tier: Some(tier) },
                None => AccessDecision::Deny(DenyReason::NotSubscribed),
            },
            Visibility::TierGated => self.check_tier(session, viewer).await?,
        };

        debug!(
            session_id = %session.id,
            viewer = %viewer.key(),
            allowed = decision.is_allowed(),
            "access evaluated"
        );
        Ok(decision)
    }

    async fn check_tier(
        &self,
        session: &StreamSession,
        viewer: &ViewerIdentity,
    ) -> Result<AccessDecision> {
        let Some(tier) = self.active_tier(session, viewer).await? else {
            return Ok(AccessDecision::Deny(DenyReason::NotSubscribed));
        };
        let required = session.minimum_tier.clone().unwrap_or_default();

        let viewer_rank = self.rank(session, &tier).await?;
        let required_rank = self.rank(session, &required).await?;
        match (viewer_rank, required_rank) {
            (Some(have), Some(need)) if have >= need => Ok(AccessDecision::Allow { tier: Some(tier) }),
            _ => Ok(AccessDecision::Deny(DenyReason::TierTooLow)),
        }
    }

    /// Whether `viewer` holds any active subscription to the broadcaster
    pub async fn is_subscriber(&self, session: &StreamSession, viewer: &ViewerIdentity) -> Result<bool> {
        Ok(self.active_tier(session, viewer).await?.is_some())
    }

    async fn active_tier(
        &self,
        session: &StreamSession,
        viewer: &ViewerIdentity,
    ) -> Result<Option<String>> {
        let Some(viewer_id) = viewer.user_id() else {
            return Ok(None);
        };
        let broadcaster = session.broadcaster_id;
        let directory = self.directory.clone();
        let tier = guarded("subscriptions", &self.policy, || {
            let directory = directory.clone();
            async move { directory.active_tier(viewer_id, broadcaster).await }
        })
        .await?;
        Ok(tier)
    }

    async fn rank(
        &self,
        session: &StreamSession,
        tier: &str,
    ) -> Result<Option<crate::models::TierRank>> {
        let broadcaster = session.broadcaster_id;
        let directory = self.directory.clone();
        let rank = guarded("subscriptions", &self.policy, || {
            let directory = directory.clone();
            let tier = tier.to_string();
            async move { directory.tier_rank(broadcaster, &tier).await }
        })
        .await?;
        Ok(rank)
    }
}
