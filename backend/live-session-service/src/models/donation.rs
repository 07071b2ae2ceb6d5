//! Donation records and the platform fee split

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    Pending,
    Settled,
    Failed,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Settled => "SETTLED",
            Self::Failed => "FAILED",
        }
    }
}

/// Inbound donation submission
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DonationRequest {
    /// Gross amount in minor currency units
    pub amount: i64,
    #[validate(length(max = 200))]
    #[serde(default)]
    pub message: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: String,
    #[validate(length(min = 1, max = 64))]
    #[serde(default)]
    pub donor_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    pub id: Uuid,
    pub session_id: Uuid,
    pub donor_id: Uuid,
    pub donor_name: String,
    pub gross_amount: i64,
    pub fee_amount: i64,
    pub net_amount: i64,
    pub message: Option<String>,
    pub idempotency_key: String,
    pub processor_reference: Option<String>,
    pub state: SettlementState,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Donation {
    pub fn pending(
        session_id: Uuid,
        donor_id: Uuid,
        donor_name: String,
        request: &DonationRequest,
        policy: &FeePolicy,
    ) -> Self {
        let (fee_amount, net_amount) = policy.split(request.amount);
        Self {
            id: Uuid::new_v4(),
            session_id,
            donor_id,
            donor_name,
            gross_amount: request.amount,
            fee_amount,
            net_amount,
            message: request.message.clone(),
            idempotency_key: request.idempotency_key.clone(),
            processor_reference: None,
            state: SettlementState::Pending,
            failure_reason: None,
            created_at: Utc::now(),
            settled_at: None,
        }
    }

    /// PENDING -> SETTLED. Returns false if the record already left PENDING.
    pub fn settle(&mut self, reference: String) -> bool {
        if self.state != SettlementState::Pending {
            return false;
        }
        self.state = SettlementState::Settled;
        self.processor_reference = Some(reference);
        self.settled_at = Some(Utc::now());
        true
    }

    /// PENDING -> FAILED. Returns false if the record already left PENDING.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.state != SettlementState::Pending {
            return false;
        }
        self.state = SettlementState::Failed;
        self.failure_reason = Some(reason.into());
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeRounding {
    Floor,
    HalfUp,
}

/// Platform fee in basis points of the gross amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    pub rate_bps: u32,
    pub rounding: FeeRounding,
}

impl FeePolicy {
    pub fn new(rate_bps: u32, rounding: FeeRounding) -> Self {
        Self { rate_bps, rounding }
    }

    /// Returns `(fee, net)` with `fee + net == gross`
    pub fn split(&self, gross: i64) -> (i64, i64) {
        let scaled = i128::from(gross) * i128::from(self.rate_bps);
        let fee = match self.rounding {
            FeeRounding::Floor => scaled / 10_000,
            FeeRounding::HalfUp => (scaled + 5_000) / 10_000,
        };
        let fee = fee.clamp(0, i128::from(gross)) as i64;
        (fee, gross - fee)
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self::new(1_000, FeeRounding::Floor)
    }
}
