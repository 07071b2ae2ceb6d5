//! Per-session analytics
//!
//! Counters are increment-only atomics fed by [`SessionEvent`]s from the hub
//! and the event bus. `finalize` freezes them into a [`SessionMetrics`]
//! snapshot exactly once; later events land in the closeout count.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{MessageKind, SessionMetrics};
use crate::services::events::{SessionEvent, SessionObserver};

#[derive(Default)]
struct Counters {
    concurrent: AtomicU64,
    peak: AtomicU64,
    unique: DashSet<String>,
    watch_ms: AtomicU64,
    chat_messages: AtomicU64,
    donation_gross: AtomicI64,
    closeout_events: AtomicU64,
    finalized: OnceCell<SessionMetrics>,
}

impl Counters {
    fn apply(&self, event: &SessionEvent) {
        match event {
            SessionEvent::ViewerJoined { viewer_key } => {
                let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                self.unique.insert(viewer_key.clone());
            }
            SessionEvent::ViewerLeft { watch_time, .. } => {
                let _ = self
                    .concurrent
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
                self.watch_ms
                    .fetch_add(watch_time.as_millis() as u64, Ordering::Relaxed);
            }
            SessionEvent::MessagePublished { kind } => {
                if *kind == MessageKind::Text {
                    self.chat_messages.fetch_add(1, Ordering::Relaxed);
                }
            }
            SessionEvent::DonationSettled { gross } => {
                self.donation_gross.fetch_add(*gross, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self, session_id: Uuid) -> SessionMetrics {
        SessionMetrics {
            session_id,
            peak_concurrent_viewers: self.peak.load(Ordering::SeqCst),
            unique_viewers: self.unique.len() as u64,
            total_watch_time_ms: self.watch_ms.load(Ordering::SeqCst),
            total_chat_messages: self.chat_messages.load(Ordering::SeqCst),
            total_donation_gross: self.donation_gross.load(Ordering::SeqCst),
            finalized_at: None,
        }
    }
}

#[derive(Default)]
pub struct AnalyticsAggregator {
    sessions: DashMap<Uuid, Arc<Counters>>,
}

impl AnalyticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, session_id: Uuid) {
        self.sessions.entry(session_id).or_default();
    }

    fn counters(&self, session_id: Uuid) -> Option<Arc<Counters>> {
        self.sessions.get(&session_id).map(|c| c.value().clone())
    }

    /// Live counters, or the frozen snapshot once finalized
    pub fn snapshot(&self, session_id: Uuid) -> Option<SessionMetrics> {
        let counters = self.counters(session_id)?;
        match counters.finalized.get() {
            Some(frozen) => Some(frozen.clone()),
            None => Some(counters.snapshot(session_id)),
        }
    }

    /// Freeze the counters. Repeat calls return the first snapshot.
    pub fn finalize(&self, session_id: Uuid) -> SessionMetrics {
        let counters = self.sessions.entry(session_id).or_default().value().clone();
        counters
            .finalized
            .get_or_init(|| {
                let mut metrics = counters.snapshot(session_id);
                metrics.finalized_at = Some(Utc::now());
                info!(
                    %session_id,
                    peak = metrics.peak_concurrent_viewers,
                    unique = metrics.unique_viewers,
                    "session metrics finalized"
                );
                metrics
            })
            .clone()
    }

    /// Drop finalized counters. Open sessions are never evicted.
    pub fn evict(&self, session_id: Uuid) -> bool {
        self.sessions
            .remove_if(&session_id, |_, counters| counters.finalized.get().is_some())
            .is_some()
    }

    pub fn tracks(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn closeout_events(&self, session_id: Uuid) -> u64 {
        self.counters(session_id)
            .map(|c| c.closeout_events.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl SessionObserver for AnalyticsAggregator {
    fn observe(&self, session_id: Uuid, event: &SessionEvent) {
        let Some(counters) = self.counters(session_id) else {
            debug!(%session_id, ?event, "event for untracked session");
            return;
        };
        if counters.finalized.get().is_some() {
            counters.closeout_events.fetch_add(1, Ordering::SeqCst);
            return;
        }
        counters.apply(event);
    }
}
