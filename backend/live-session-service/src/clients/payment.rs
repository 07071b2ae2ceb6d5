use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use super::ClientError;

const DEPENDENCY: &str = "payments";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureRequest {
    pub donation_id: Uuid,
    pub donor_id: Uuid,
    pub payee_id: Uuid,
    pub amount: i64,
    /// Processor-side deduplication key; retries reuse it
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Settled { reference: String },
    Declined { reason: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, ClientError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct CaptureResponse {
    status: String,
    reference: Option<String>,
    reason: Option<String>,
}

pub struct HttpPaymentGateway {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpPaymentGateway {
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
impl PaymentGateway for HttpPaymentGateway {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, ClientError> {
        let response = self
            .http_client
            .post(format!("{}/api/v1/captures", self.base_url))
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::unavailable(DEPENDENCY, e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ClientError::unavailable(DEPENDENCY, format!("status {status}")));
        }

        let body: CaptureResponse = response
            .json()
            .await
            .map_err(|e| ClientError::unavailable(DEPENDENCY, format!("bad response body: {e}")))?;

        match (body.status.as_str(), body.reference) {
            ("settled", Some(reference)) => Ok(CaptureOutcome::Settled { reference }),
            ("declined", _) => Ok(CaptureOutcome::Declined {
                reason: body.reason.unwrap_or_else(|| "declined".to_string()),
            }),
            _ if !status.is_success() => Err(ClientError::rejected(
                DEPENDENCY,
                body.reason.unwrap_or_else(|| format!("status {status}")),
            )),
            (other, _) => Err(ClientError::unavailable(
                DEPENDENCY,
                format!("unexpected capture status {other:?}"),
            )),
        }
    }
}

/// Scripted behaviour for the in-memory processor
#[derive(Debug, Clone)]
pub enum ScriptedCapture {
    Settle,
    Decline(String),
    Fail,
    /// Settle, but hold the response open for this long. The charge is
    /// recorded before the wait, the way a processor that answers late would.
    Delay(Duration),
}

/// Processor backed by process memory. Settles by default; deduplicates by
/// idempotency key like a real processor would.
#[derive(Default)]
pub struct InMemoryPaymentGateway {
    script: Mutex<VecDeque<ScriptedCapture>>,
    captured: DashMap<String, CaptureOutcome>,
    calls: Mutex<Vec<CaptureRequest>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the behaviour for the next capture attempt
    pub fn push(&self, step: ScriptedCapture) {
        self.script.lock().push_back(step);
    }

    pub fn calls(&self) -> Vec<CaptureRequest> {
        self.calls.lock().clone()
    }

    /// Distinct processor keys that ended in a charge
    pub fn charged(&self) -> usize {
        self.captured
            .iter()
            .filter(|o| matches!(o.value(), CaptureOutcome::Settled { .. }))
            .count()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, ClientError> {
        self.calls.lock().push(request.clone());

        if let Some(previous) = self.captured.get(&request.idempotency_key) {
            return Ok(previous.value().clone());
        }

        let step = self.script.lock().pop_front().unwrap_or(ScriptedCapture::Settle);
        let (outcome, delay) = match step {
            ScriptedCapture::Settle => (settled(request), None),
            ScriptedCapture::Decline(reason) => (CaptureOutcome::Declined { reason }, None),
            ScriptedCapture::Fail => {
                return Err(ClientError::unavailable(DEPENDENCY, "processor unavailable"))
            }
            ScriptedCapture::Delay(delay) => (settled(request), Some(delay)),
        };
        self.captured
            .insert(request.idempotency_key.clone(), outcome.clone());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(outcome)
    }
}

fn settled(request: &CaptureRequest) -> CaptureOutcome {
    CaptureOutcome::Settled {
        reference: format!("mem_{}", request.donation_id.simple()),
    }
}
