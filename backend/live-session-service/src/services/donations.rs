//! Donation processor: the only writer of donation records

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use resilience::CallPolicy;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clients::{guarded, CaptureOutcome, CaptureRequest, PaymentGateway};
use crate::config::DonationConfig;
use crate::db::SessionStore;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{Donation, DonationRequest, SessionState, SettlementState, StreamSession};
use crate::services::event_bus::EventBus;
use crate::services::events::{SessionEvent, SessionEventSink};

type IdempotencyKey = (Uuid, Uuid, String);

/// Which record currently owns a caller key, and which capture attempt it is.
/// The attempt only advances after a definite decline.
#[derive(Debug, Clone, Copy)]
struct KeySlot {
    donation_id: Uuid,
    attempt: u32,
}

enum Reservation {
    /// New record; capture under this attempt's processor key
    Fresh(Donation, u32),
    /// Unresolved record nobody is capturing; capture again under the same key
    Resume(Donation, u32),
    /// Settled, or still being captured by another caller
    Existing(Donation),
}

/// Processor-side deduplication key. Deterministic, so a capture that charged
/// the donor but never answered is replayed rather than repeated.
pub fn processor_key(session_id: Uuid, donor_id: Uuid, attempt: u32, caller_key: &str) -> String {
    format!("{}.{}.{attempt}.{caller_key}", session_id.simple(), donor_id.simple())
}

/// Clears the in-flight mark even when the submitting request is dropped
struct CaptureClaim<'a> {
    in_flight: &'a DashSet<Uuid>,
    donation_id: Uuid,
}

impl Drop for CaptureClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.donation_id);
    }
}

pub struct DonationProcessor {
    records: DashMap<Uuid, Donation>,
    by_key: DashMap<IdempotencyKey, KeySlot>,
    in_flight: DashSet<Uuid>,
    gateway: Arc<dyn PaymentGateway>,
    bus: Arc<EventBus>,
    store: Arc<dyn SessionStore>,
    events: SessionEventSink,
    config: DonationConfig,
    policy: CallPolicy,
}

impl DonationProcessor {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        bus: Arc<EventBus>,
        store: Arc<dyn SessionStore>,
        events: SessionEventSink,
        config: DonationConfig,
        policy: CallPolicy,
    ) -> Self {
        Self {
            records: DashMap::new(),
            by_key: DashMap::new(),
            in_flight: DashSet::new(),
            gateway,
            bus,
            store,
            events,
            config,
            policy,
        }
    }

    fn validate(&self, session: &StreamSession, request: &DonationRequest) -> Result<()> {
        request.validate()?;
        if request.amount < self.config.min_amount || request.amount > self.config.max_amount {
            return Err(AppError::Validation(format!(
                "amount must be between {} and {}",
                self.config.min_amount, self.config.max_amount
            )));
        }
        if session.state != SessionState::Live {
            return Err(AppError::Conflict(
                "donations are only accepted while the session is live".to_string(),
            ));
        }
        Ok(())
    }

    /// Reserve the idempotency key. A settled record, or a pending one that
    /// another caller is capturing, is returned as is. A pending record left
    /// unresolved by an earlier outage is handed back for another capture
    /// under the same processor key. Only a failed record frees the key.
    fn reserve(&self, key: IdempotencyKey, fresh: Donation) -> Reservation {
        match self.by_key.entry(key) {
            Entry::Occupied(mut slot) => {
                let current = *slot.get();
                let existing = self.records.get(&current.donation_id).map(|d| d.value().clone());
                match existing {
                    Some(existing) if existing.state == SettlementState::Pending => {
                        if self.in_flight.insert(existing.id) {
                            Reservation::Resume(existing, current.attempt)
                        } else {
                            Reservation::Existing(existing)
                        }
                    }
                    Some(existing) if existing.state == SettlementState::Settled => {
                        Reservation::Existing(existing)
                    }
                    _ => {
                        let attempt = current.attempt + 1;
                        slot.insert(KeySlot {
                            donation_id: fresh.id,
                            attempt,
                        });
                        self.records.insert(fresh.id, fresh.clone());
                        self.in_flight.insert(fresh.id);
                        Reservation::Fresh(fresh, attempt)
                    }
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(KeySlot {
                    donation_id: fresh.id,
                    attempt: 1,
                });
                self.records.insert(fresh.id, fresh.clone());
                self.in_flight.insert(fresh.id);
                Reservation::Fresh(fresh, 1)
            }
        }
    }

    pub async fn submit(
        &self,
        session: &StreamSession,
        donor_id: Uuid,
        donor_name: String,
        request: DonationRequest,
    ) -> Result<Donation> {
        self.validate(session, &request)?;

        let key = (session.id, donor_id, request.idempotency_key.clone());
        let fresh = Donation::pending(session.id, donor_id, donor_name, &request, &self.config.fee);
        let (donation, attempt, resumed) = match self.reserve(key, fresh) {
            Reservation::Fresh(donation, attempt) => (donation, attempt, false),
            Reservation::Resume(donation, attempt) => {
                info!(donation_id = %donation.id, attempt, "resuming unresolved capture");
                (donation, attempt, true)
            }
            Reservation::Existing(existing) => {
                info!(donation_id = %existing.id, state = existing.state.as_str(), "idempotent donation replay");
                return Ok(existing);
            }
        };
        let _claim = CaptureClaim {
            in_flight: &self.in_flight,
            donation_id: donation.id,
        };

        if !resumed {
            if let Err(e) = self.store.save_donation(&donation).await {
                // Nothing was charged; the next submission moves to a new attempt
                if let Some(mut record) = self.records.get_mut(&donation.id) {
                    record.fail("ledger unavailable");
                }
                return Err(e);
            }
        }

        let capture = CaptureRequest {
            donation_id: donation.id,
            donor_id,
            payee_id: session.broadcaster_id,
            amount: donation.gross_amount,
            idempotency_key: processor_key(session.id, donor_id, attempt, &request.idempotency_key),
        };
        let gateway = self.gateway.clone();
        let outcome = guarded("payments", &self.policy, || {
            let gateway = gateway.clone();
            let capture = capture.clone();
            async move { gateway.capture(&capture).await }
        })
        .await;

        match outcome {
            Ok(CaptureOutcome::Settled { reference }) => {
                let settled = self.update(donation.id, |d| d.settle(reference)).await?;
                self.bus.announce_donation(&settled).await;
                self.events.emit(
                    settled.session_id,
                    SessionEvent::DonationSettled {
                        gross: settled.gross_amount,
                    },
                );
                metrics::donation("settled");
                info!(
                    donation_id = %settled.id,
                    session_id = %settled.session_id,
                    gross = settled.gross_amount,
                    "donation settled"
                );
                Ok(settled)
            }
            Ok(CaptureOutcome::Declined { reason }) => {
                self.update(donation.id, |d| d.fail(reason.clone())).await?;
                metrics::donation("declined");
                warn!(donation_id = %donation.id, %reason, "donation declined");
                Err(AppError::PaymentDeclined(reason))
            }
            Err(e) if !e.is_transient() => {
                self.update(donation.id, |d| d.fail(e.to_string())).await?;
                metrics::donation("failed");
                Err(e.into())
            }
            Err(e) => {
                // The processor may have charged; the record stays PENDING
                // and the key stays pinned to it.
                metrics::donation("unresolved");
                warn!(
                    donation_id = %donation.id,
                    processor_key = %capture.idempotency_key,
                    error = %e,
                    "capture outcome unknown; donation left pending"
                );
                Err(e.into())
            }
        }
    }

    async fn update(&self, donation_id: Uuid, apply: impl FnOnce(&mut Donation) -> bool) -> Result<Donation> {
        let updated = {
            let mut record = self
                .records
                .get_mut(&donation_id)
                .ok_or_else(|| AppError::Internal(format!("donation {donation_id} vanished")))?;
            if !apply(record.value_mut()) {
                return Err(AppError::Internal(format!(
                    "donation {donation_id} already left PENDING"
                )));
            }
            record.clone()
        };
        if let Err(e) = self.store.save_donation(&updated).await {
            error!(%donation_id, error = %e, "failed to persist donation outcome");
        }
        Ok(updated)
    }

    pub fn get(&self, donation_id: Uuid) -> Option<Donation> {
        self.records.get(&donation_id).map(|d| d.value().clone())
    }

    /// Settlement records for the ledger reader
    pub async fn list_donations(&self, session_id: Uuid) -> Result<Vec<Donation>> {
        self.store.list_donations(session_id).await
    }

    /// Drop an ended session's records and keys. Records with a capture still
    /// in flight are kept; returns how many, so the caller can come back.
    pub fn evict_session(&self, session_id: Uuid) -> usize {
        let in_flight = &self.in_flight;
        self.by_key.retain(|(session, _, _), slot| {
            *session != session_id || in_flight.contains(&slot.donation_id)
        });
        self.records
            .retain(|id, d| d.session_id != session_id || in_flight.contains(id));
        self.tracked_records(session_id)
    }

    pub fn tracked_records(&self, session_id: Uuid) -> usize {
        self.records.iter().filter(|d| d.session_id == session_id).count()
    }
}
