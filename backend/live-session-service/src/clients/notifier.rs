use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use super::ClientError;
use crate::models::StreamSession;

const DEPENDENCY: &str = "notifications";

/// Tells a broadcaster's subscribers that the session went live
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriberNotifier: Send + Sync {
    async fn notify_live(&self, session: &StreamSession) -> Result<(), ClientError>;
}

pub struct HttpSubscriberNotifier {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpSubscriberNotifier {
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
}

#[async_trait]
impl SubscriberNotifier for HttpSubscriberNotifier {
    async fn notify_live(&self, session: &StreamSession) -> Result<(), ClientError> {
        let response = self
            .http_client
            .post(format!("{}/api/v1/notifications/live-started", self.base_url))
            .json(&json!({
                "session_id": session.id,
                "broadcaster_id": session.broadcaster_id,
                "visibility": session.visibility,
                "started_at": session.started_at,
            }))
            .send()
            .await
            .map_err(|e| ClientError::unavailable(DEPENDENCY, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(ClientError::unavailable(DEPENDENCY, format!("status {status}")))
        } else {
            Err(ClientError::rejected(DEPENDENCY, format!("status {status}")))
        }
    }
}

/// Records which sessions were announced
#[derive(Default)]
pub struct InMemorySubscriberNotifier {
    sent: Mutex<Vec<Uuid>>,
}

impl InMemorySubscriberNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Uuid> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SubscriberNotifier for InMemorySubscriberNotifier {
    async fn notify_live(&self, session: &StreamSession) -> Result<(), ClientError> {
        self.sent.lock().push(session.id);
        Ok(())
    }
}
