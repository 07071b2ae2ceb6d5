use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use super::SessionStore;
use crate::error::{AppError, Result};
use crate::models::{
    Donation, SessionMetrics, SessionState, SettlementState, StreamSession, Visibility,
};

pub struct PgSessionStore {
    pool: Pool<Postgres>,
}

impl PgSessionStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &PgRow) -> Result<StreamSession> {
    let visibility: String = row.try_get("visibility")?;
    let state: String = row.try_get("state")?;
    Ok(StreamSession {
        id: row.try_get("id")?,
        broadcaster_id: row.try_get("broadcaster_id")?,
        visibility: Visibility::parse(&visibility)
            .ok_or_else(|| AppError::Storage(format!("unknown visibility {visibility}")))?,
        minimum_tier: row.try_get("minimum_tier")?,
        state: SessionState::parse(&state)
            .ok_or_else(|| AppError::Storage(format!("unknown session state {state}")))?,
        chat_enabled: row.try_get("chat_enabled")?,
        subscriber_only_chat: row.try_get("subscriber_only_chat")?,
        recording_enabled: row.try_get("recording_enabled")?,
        fault_reason: row.try_get("fault_reason")?,
        archive_location: row.try_get("archive_location")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn donation_from_row(row: &PgRow) -> Result<Donation> {
    let state: String = row.try_get("state")?;
    let state = match state.as_str() {
        "PENDING" => SettlementState::Pending,
        "SETTLED" => SettlementState::Settled,
        "FAILED" => SettlementState::Failed,
        other => return Err(AppError::Storage(format!("unknown settlement state {other}"))),
    };
    Ok(Donation {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        donor_id: row.try_get("donor_id")?,
        donor_name: row.try_get("donor_name")?,
        gross_amount: row.try_get("gross_amount")?,
        fee_amount: row.try_get("fee_amount")?,
        net_amount: row.try_get("net_amount")?,
        message: row.try_get("message")?,
        idempotency_key: row.try_get("idempotency_key")?,
        processor_reference: row.try_get("processor_reference")?,
        state,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn save_session(&self, session: &StreamSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO live_sessions (
                id, broadcaster_id, visibility, minimum_tier, state, chat_enabled,
                subscriber_only_chat, recording_enabled, fault_reason, archive_location,
                created_at, started_at, ended_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                fault_reason = EXCLUDED.fault_reason,
                archive_location = EXCLUDED.archive_location,
                started_at = EXCLUDED.started_at,
                ended_at = EXCLUDED.ended_at
            "#,
        )
        .bind(session.id)
        .bind(session.broadcaster_id)
        .bind(session.visibility.as_str())
        .bind(&session.minimum_tier)
        .bind(session.state.as_str())
        .bind(session.chat_enabled)
        .bind(session.subscriber_only_chat)
        .bind(session.recording_enabled)
        .bind(&session.fault_reason)
        .bind(&session.archive_location)
        .bind(session.created_at)
        .bind(session.started_at)
        .bind(session.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_session(&self, id: Uuid) -> Result<Option<StreamSession>> {
        let row = sqlx::query("SELECT * FROM live_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn save_donation(&self, donation: &Donation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO live_donations (
                id, session_id, donor_id, donor_name, gross_amount, fee_amount, net_amount,
                message, idempotency_key, processor_reference, state, failure_reason,
                created_at, settled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                processor_reference = EXCLUDED.processor_reference,
                state = EXCLUDED.state,
                failure_reason = EXCLUDED.failure_reason,
                settled_at = EXCLUDED.settled_at
            "#,
        )
        .bind(donation.id)
        .bind(donation.session_id)
        .bind(donation.donor_id)
        .bind(&donation.donor_name)
        .bind(donation.gross_amount)
        .bind(donation.fee_amount)
        .bind(donation.net_amount)
        .bind(&donation.message)
        .bind(&donation.idempotency_key)
        .bind(&donation.processor_reference)
        .bind(donation.state.as_str())
        .bind(&donation.failure_reason)
        .bind(donation.created_at)
        .bind(donation.settled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_donations(&self, session_id: Uuid) -> Result<Vec<Donation>> {
        let rows = sqlx::query(
            "SELECT * FROM live_donations WHERE session_id = $1 ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(donation_from_row).collect()
    }

    async fn save_metrics(&self, metrics: &SessionMetrics) -> Result<()> {
        let finalized_at = metrics
            .finalized_at
            .ok_or_else(|| AppError::Internal("only finalized metrics are persisted".into()))?;

        // Metrics freeze once; a second write is ignored
        sqlx::query(
            r#"
            INSERT INTO live_session_metrics (
                session_id, peak_concurrent_viewers, unique_viewers, total_watch_time_ms,
                total_chat_messages, total_donation_gross, finalized_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(metrics.session_id)
        .bind(to_i64(metrics.peak_concurrent_viewers))
        .bind(to_i64(metrics.unique_viewers))
        .bind(to_i64(metrics.total_watch_time_ms))
        .bind(to_i64(metrics.total_chat_messages))
        .bind(metrics.total_donation_gross)
        .bind(finalized_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_metrics(&self, session_id: Uuid) -> Result<Option<SessionMetrics>> {
        let row = sqlx::query("SELECT * FROM live_session_metrics WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let count = |column: &str| -> Result<u64> {
            let value: i64 = row.try_get(column)?;
            Ok(u64::try_from(value).unwrap_or(0))
        };
        Ok(Some(SessionMetrics {
            session_id,
            peak_concurrent_viewers: count("peak_concurrent_viewers")?,
            unique_viewers: count("unique_viewers")?,
            total_watch_time_ms: count("total_watch_time_ms")?,
            total_chat_messages: count("total_chat_messages")?,
            total_donation_gross: row.try_get("total_donation_gross")?,
            finalized_at: row.try_get("finalized_at")?,
        }))
    }
}
