//! Session registry: the only writer of session lifecycle state

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use resilience::CallPolicy;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info};
use uuid::Uuid;

use crate::clients::{guarded, SubscriptionDirectory};
use crate::db::SessionStore;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{Actor, SessionConfig, SessionState, StreamSession, Visibility};

/// Proof of exclusive mutation rights over one session
pub struct SessionGuard {
    session_id: Uuid,
    _lock: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

pub struct SessionRegistry {
    sessions: DashMap<Uuid, StreamSession>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    live_by_broadcaster: DashMap<Uuid, Uuid>,
    directory: Arc<dyn SubscriptionDirectory>,
    store: Arc<dyn SessionStore>,
    lookup_policy: CallPolicy,
}

impl SessionRegistry {
    pub fn new(
        directory: Arc<dyn SubscriptionDirectory>,
        store: Arc<dyn SessionStore>,
        lookup_policy: CallPolicy,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            locks: DashMap::new(),
            live_by_broadcaster: DashMap::new(),
            directory,
            store,
            lookup_policy,
        }
    }

    pub async fn create_session(
        &self,
        broadcaster_id: Uuid,
        config: SessionConfig,
    ) -> Result<StreamSession> {
        config.check().map_err(AppError::Validation)?;

        if config.visibility == Visibility::TierGated {
            let tier = config.minimum_tier.clone().unwrap_or_default();
            let directory = self.directory.clone();
            let rank = guarded("subscriptions", &self.lookup_policy, || {
                let directory = directory.clone();
                let tier = tier.clone();
                async move { directory.tier_rank(broadcaster_id, &tier).await }
            })
            .await?;
            if rank.is_none() {
                return Err(AppError::Validation(format!(
                    "tier {tier:?} does not exist for this broadcaster"
                )));
            }
        }

        if let Some(live) = self.live_by_broadcaster.get(&broadcaster_id) {
            return Err(AppError::Conflict(format!(
                "broadcaster already has live session {}",
                *live
            )));
        }

        let session = StreamSession::scheduled(broadcaster_id, config);
        self.store.save_session(&session).await?;

        self.locks.insert(session.id, Arc::new(Mutex::new(())));
        self.sessions.insert(session.id, session.clone());
        info!(session_id = %session.id, %broadcaster_id, visibility = session.visibility.as_str(), "session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: Uuid) -> Result<StreamSession> {
        self.sessions
            .get(&session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))
    }

    /// In-memory session, or the persisted record of one already evicted
    pub async fn find_session(&self, session_id: Uuid) -> Result<StreamSession> {
        if let Some(session) = self.sessions.get(&session_id) {
            return Ok(session.value().clone());
        }
        self.store
            .load_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))
    }

    /// Forget an ended session; reads fall through to the store afterwards
    pub fn evict(&self, guard: &SessionGuard) -> bool {
        let session_id = guard.session_id();
        let removed = self
            .sessions
            .remove_if(&session_id, |_, session| session.state.is_terminal())
            .is_some();
        if removed {
            self.locks.remove(&session_id);
        }
        removed
    }

    pub fn tracks(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id) || self.locks.contains_key(&session_id)
    }

    /// Wait for exclusive mutation rights over a session
    pub async fn lock(&self, session_id: Uuid) -> Result<SessionGuard> {
        let lock = self
            .locks
            .get(&session_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
        Ok(SessionGuard {
            session_id,
            _lock: lock.lock_owned().await,
        })
    }

    /// Apply a lifecycle move. The caller holds the session guard and runs
    /// the side effects of the move while still holding it.
    pub async fn transition(
        &self,
        guard: &SessionGuard,
        target: SessionState,
        actor: Actor,
        fault_reason: Option<String>,
    ) -> Result<StreamSession> {
        let current = self.get_session(guard.session_id())?;
        if !actor.may_control(&current) {
            return Err(AppError::NotAuthorized(
                "only the session's broadcaster may change its state".to_string(),
            ));
        }
        if !current.state.can_transition_to(target) {
            return Err(AppError::InvalidStateTransition {
                from: current.state,
                to: target,
            });
        }

        let mut next = current.clone();
        next.state = target;
        match target {
            SessionState::Live => {
                match self.live_by_broadcaster.entry(current.broadcaster_id) {
                    Entry::Occupied(other) if *other.get() != current.id => {
                        return Err(AppError::Conflict(format!(
                            "broadcaster already has live session {}",
                            other.get()
                        )));
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(slot) => {
                        slot.insert(current.id);
                    }
                }
                next.started_at = Some(Utc::now());
                if let Err(e) = self.store.save_session(&next).await {
                    self.live_by_broadcaster
                        .remove_if(&current.broadcaster_id, |_, id| *id == current.id);
                    return Err(e);
                }
                metrics::session_went_live();
            }
            SessionState::Ended => {
                next.ended_at = Some(Utc::now());
                next.fault_reason = fault_reason;
                self.live_by_broadcaster
                    .remove_if(&current.broadcaster_id, |_, id| *id == current.id);
                if current.state == SessionState::Live {
                    metrics::session_left_live();
                }
                if let Err(e) = self.store.save_session(&next).await {
                    error!(session_id = %current.id, error = %e, "failed to persist ended session");
                }
            }
            SessionState::Scheduled => {}
        }

        self.sessions.insert(next.id, next.clone());
        info!(
            session_id = %next.id,
            from = current.state.as_str(),
            to = next.state.as_str(),
            fault = next.fault_reason.as_deref().unwrap_or(""),
            "session transitioned"
        );
        Ok(next)
    }

    /// Record where the finished recording was archived
    pub async fn set_archive_location(&self, guard: &SessionGuard, location: String) -> Result<()> {
        let session = {
            let mut entry = self
                .sessions
                .get_mut(&guard.session_id())
                .ok_or_else(|| AppError::NotFound(format!("session {}", guard.session_id())))?;
            entry.archive_location = Some(location);
            entry.clone()
        };
        if let Err(e) = self.store.save_session(&session).await {
            error!(session_id = %session.id, error = %e, "failed to persist archive location");
        }
        Ok(())
    }

    pub fn live_session_of(&self, broadcaster_id: Uuid) -> Option<Uuid> {
        self.live_by_broadcaster.get(&broadcaster_id).map(|id| *id)
    }
}
