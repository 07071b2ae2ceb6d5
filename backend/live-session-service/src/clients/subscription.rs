use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::ClientError;
use crate::models::TierRank;

const DEPENDENCY: &str = "subscriptions";

/// Source of truth for who subscribes to whom, and at which tier
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    /// Tier id of the viewer's active subscription to `broadcaster`, if any
    async fn active_tier(
        &self,
        viewer: Uuid,
        broadcaster: Uuid,
    ) -> Result<Option<String>, ClientError>;

    /// Rank of `tier_id` within the broadcaster's catalog; `None` when the
    /// broadcaster offers no such tier
    async fn tier_rank(
        &self,
        broadcaster: Uuid,
        tier_id: &str,
    ) -> Result<Option<TierRank>, ClientError>;
}

#[derive(Debug, Deserialize)]
struct ActiveSubscriptionResponse {
    tier_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TierResponse {
    rank: u32,
}

pub struct HttpSubscriptionDirectory {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpSubscriptionDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::unavailable(DEPENDENCY, format!("HTTP client error: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<Option<T>, ClientError> {
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::unavailable(DEPENDENCY, e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(ClientError::unavailable(DEPENDENCY, format!("status {status}")));
        }
        if !status.is_success() {
            return Err(ClientError::rejected(DEPENDENCY, format!("status {status}")));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| ClientError::unavailable(DEPENDENCY, format!("bad response body: {e}")))
    }
}

#[async_trait]
impl SubscriptionDirectory for HttpSubscriptionDirectory {
    async fn active_tier(
        &self,
        viewer: Uuid,
        broadcaster: Uuid,
    ) -> Result<Option<String>, ClientError> {
        let url = format!(
            "{}/api/v1/creators/{broadcaster}/subscribers/{viewer}",
            self.base_url
        );
        let body: Option<ActiveSubscriptionResponse> = self.get_optional(url).await?;
        Ok(body.and_then(|b| b.tier_id))
    }

    async fn tier_rank(
        &self,
        broadcaster: Uuid,
        tier_id: &str,
    ) -> Result<Option<TierRank>, ClientError> {
        let url = format!("{}/api/v1/creators/{broadcaster}/tiers/{tier_id}", self.base_url);
        let body: Option<TierResponse> = self.get_optional(url).await?;
        Ok(body.map(|b| TierRank(b.rank)))
    }
}

/// Directory backed by process memory
#[derive(Default)]
pub struct InMemorySubscriptionDirectory {
    subscriptions: DashMap<(Uuid, Uuid), String>,
    tiers: DashMap<(Uuid, String), TierRank>,
    unavailable: AtomicBool,
}

impl InMemorySubscriptionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tier(&self, broadcaster: Uuid, tier_id: &str, rank: u32) {
        self.tiers
            .insert((broadcaster, tier_id.to_string()), TierRank(rank));
    }

    pub fn subscribe(&self, viewer: Uuid, broadcaster: Uuid, tier_id: &str) {
        self.subscriptions
            .insert((viewer, broadcaster), tier_id.to_string());
    }

    pub fn unsubscribe(&self, viewer: Uuid, broadcaster: Uuid) {
        self.subscriptions.remove(&(viewer, broadcaster));
    }

    /// Make every lookup fail as if the directory were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ClientError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::unavailable(DEPENDENCY, "directory offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionDirectory for InMemorySubscriptionDirectory {
    async fn active_tier(
        &self,
        viewer: Uuid,
        broadcaster: Uuid,
    ) -> Result<Option<String>, ClientError> {
        self.check_available()?;
        Ok(self
            .subscriptions
            .get(&(viewer, broadcaster))
            .map(|tier| tier.value().clone()))
    }

    async fn tier_rank(
        &self,
        broadcaster: Uuid,
        tier_id: &str,
    ) -> Result<Option<TierRank>, ClientError> {
        self.check_available()?;
        Ok(self
            .tiers
            .get(&(broadcaster, tier_id.to_string()))
            .map(|rank| *rank.value()))
    }
}
