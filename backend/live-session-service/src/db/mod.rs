//! Write-through persistence for sessions, donations and frozen metrics
//!
//! In-process state stays authoritative while a session runs; the store keeps
//! a durable copy of every committed change.

pub mod postgres;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Donation, SessionMetrics, StreamSession};

pub use postgres::PgSessionStore;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn init_pool(database_url: &str, max_connections: u32) -> std::result::Result<Pool<Postgres>, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or overwrite the session record
    async fn save_session(&self, session: &StreamSession) -> Result<()>;

    async fn load_session(&self, id: Uuid) -> Result<Option<StreamSession>>;

    /// Insert or overwrite a donation, keyed by its id
    async fn save_donation(&self, donation: &Donation) -> Result<()>;

    /// Donations of one session, oldest first
    async fn list_donations(&self, session_id: Uuid) -> Result<Vec<Donation>>;

    async fn save_metrics(&self, metrics: &SessionMetrics) -> Result<()>;

    async fn load_metrics(&self, session_id: Uuid) -> Result<Option<SessionMetrics>>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<Uuid, StreamSession>,
    donations: DashMap<Uuid, Donation>,
    metrics: DashMap<Uuid, SessionMetrics>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save_session(&self, session: &StreamSession) -> Result<()> {
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn load_session(&self, id: Uuid) -> Result<Option<StreamSession>> {
        Ok(self.sessions.get(&id).map(|s| s.value().clone()))
    }

    async fn save_donation(&self, donation: &Donation) -> Result<()> {
        self.donations.insert(donation.id, donation.clone());
        Ok(())
    }

    async fn list_donations(&self, session_id: Uuid) -> Result<Vec<Donation>> {
        let mut donations: Vec<Donation> = self
            .donations
            .iter()
            .filter(|d| d.session_id == session_id)
            .map(|d| d.value().clone())
            .collect();
        donations.sort_by_key(|d| d.created_at);
        Ok(donations)
    }

    async fn save_metrics(&self, metrics: &SessionMetrics) -> Result<()> {
        self.metrics.insert(metrics.session_id, metrics.clone());
        Ok(())
    }

    async fn load_metrics(&self, session_id: Uuid) -> Result<Option<SessionMetrics>> {
        Ok(self.metrics.get(&session_id).map(|m| m.value().clone()))
    }
}
