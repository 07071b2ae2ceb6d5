//! Composition root for the live-session control plane
//!
//! Builds every component once per process and hands them to each other by
//! reference. The coordinator also owns the cascades that cross component
//! boundaries: going live starts the transcoder, ending a session closes the
//! hub, stops the transcoder and freezes analytics, and a departing
//! broadcaster ends the session. Ended sessions are evicted from memory after
//! a retention period; reads then go to the session store.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::{
    guarded, ArchiveStorage, CallPolicies, InMemoryArchiveStorage, InMemoryPaymentGateway,
    InMemorySubscriberNotifier, InMemorySubscriptionDirectory, InMemoryTranscoder,
    PaymentGateway, SubscriberNotifier, SubscriptionDirectory, TranscoderBackend,
};
use crate::config::Config;
use crate::db::{MemorySessionStore, SessionStore};
use crate::error::{AppError, Result};
use crate::models::{
    Actor, ChatMessage, ConnectionId, ConnectionRole, Donation, DonationRequest,
    ModerationAction, SessionConfig, SessionMetrics, SessionState, StreamSession,
    ViewerConnection, ViewerIdentity,
};
use crate::security::ConnectionTokens;
use crate::services::access::{AccessDecision, AccessGate, DenyReason};
use crate::services::analytics::AnalyticsAggregator;
use crate::services::donations::DonationProcessor;
use crate::services::event_bus::{EventBus, ModerationOutcome};
use crate::services::events::{SessionEventSink, SessionObserver};
use crate::services::hub::{OutboundQueue, RelayOutcome, SignalingHub};
use crate::services::registry::{SessionGuard, SessionRegistry};
use crate::services::transcoding::{PlaybackStatus, ReadySignal, TranscodeOrchestrator};
use crate::websocket::message_types::{
    ControlEvent, NegotiationPayload, WsInboundEvent, WsOutboundEvent,
};

/// External collaborators, chosen by the binary at startup
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn SubscriptionDirectory>,
    pub payments: Arc<dyn PaymentGateway>,
    pub archive: Arc<dyn ArchiveStorage>,
    pub notifier: Arc<dyn SubscriberNotifier>,
    pub transcoder: Arc<dyn TranscoderBackend>,
    pub store: Arc<dyn SessionStore>,
}

impl Collaborators {
    /// Everything in-process
    pub fn in_memory() -> Self {
        Self {
            directory: Arc::new(InMemorySubscriptionDirectory::new()),
            payments: Arc::new(InMemoryPaymentGateway::new()),
            archive: Arc::new(InMemoryArchiveStorage::new()),
            notifier: Arc::new(InMemorySubscriberNotifier::new()),
            transcoder: Arc::new(InMemoryTranscoder::new()),
            store: Arc::new(MemorySessionStore::new()),
        }
    }
}

/// Session snapshot as served to clients
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: StreamSession,
    pub playback: PlaybackStatus,
    pub viewer_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum JoinOutcome {
    Allow {
        token: String,
        role: ConnectionRole,
        playback: PlaybackStatus,
    },
    Deny {
        reason: DenyReason,
    },
}

/// An admitted real-time connection and the queue feeding its socket
pub struct Admission {
    pub connection: ViewerConnection,
    pub queue: OutboundQueue,
}

struct Inner {
    config: Config,
    registry: SessionRegistry,
    gate: Arc<AccessGate>,
    hub: Arc<SignalingHub>,
    bus: Arc<EventBus>,
    donations: DonationProcessor,
    transcoding: TranscodeOrchestrator,
    analytics: Arc<AnalyticsAggregator>,
    tokens: ConnectionTokens,
    notifier: Arc<dyn SubscriberNotifier>,
    store: Arc<dyn SessionStore>,
    policies: CallPolicies,
}

#[derive(Clone)]
pub struct LiveSessionCoordinator {
    inner: Arc<Inner>,
}

impl LiveSessionCoordinator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let policies = CallPolicies::from_config(&config.external);
        let analytics = Arc::new(AnalyticsAggregator::new());
        let events = SessionEventSink::new(vec![analytics.clone() as Arc<dyn SessionObserver>]);

        let gate = Arc::new(AccessGate::new(
            collaborators.directory.clone(),
            policies.subscription.clone(),
        ));
        let hub = Arc::new(SignalingHub::new(
            config.limits.max_viewers_per_session,
            config.limits.outbound_queue_capacity,
            events.clone(),
        ));
        let bus = Arc::new(EventBus::new(
            hub.clone(),
            gate.clone(),
            events.clone(),
            config.limits.chat_max_body_chars,
            config.limits.chat_history_limit,
        ));
        let donations = DonationProcessor::new(
            collaborators.payments,
            bus.clone(),
            collaborators.store.clone(),
            events,
            config.donations.clone(),
            policies.payment.clone(),
        );
        let transcoding = TranscodeOrchestrator::new(
            collaborators.transcoder,
            collaborators.archive,
            config.transcode.clone(),
            policies.transcoder.clone(),
        );
        let registry = SessionRegistry::new(
            collaborators.directory,
            collaborators.store.clone(),
            policies.subscription.clone(),
        );
        let tokens = ConnectionTokens::new(
            &config.security.connection_token_secret,
            config.security.connection_token_ttl_secs,
        );

        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                gate,
                hub,
                bus,
                donations,
                transcoding,
                analytics,
                tokens,
                notifier: collaborators.notifier,
                store: collaborators.store,
                policies,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn hub(&self) -> &SignalingHub {
        &self.inner.hub
    }

    pub fn analytics(&self) -> &AnalyticsAggregator {
        &self.inner.analytics
    }

    pub fn transcoding(&self) -> &TranscodeOrchestrator {
        &self.inner.transcoding
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub async fn create_session(
        &self,
        broadcaster_id: Uuid,
        config: SessionConfig,
    ) -> Result<StreamSession> {
        self.inner.registry.create_session(broadcaster_id, config).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<SessionView> {
        let session = self.inner.registry.find_session(session_id).await?;
        Ok(SessionView {
            playback: self.inner.transcoding.playback_status(&session),
            viewer_count: self.inner.hub.viewer_count(session_id),
            session,
        })
    }

    pub async fn transition_state(
        &self,
        session_id: Uuid,
        target: SessionState,
        actor: Actor,
    ) -> Result<StreamSession> {
        match target {
            SessionState::Live => self.go_live(session_id, actor).await,
            SessionState::Ended => {
                let guard = self.lock_for(session_id, target).await?;
                self.end_locked(&guard, actor, None).await
            }
            SessionState::Scheduled => {
                // Never legal; the registry reports why
                let guard = self.lock_for(session_id, target).await?;
                self.inner
                    .registry
                    .transition(&guard, SessionState::Scheduled, actor, None)
                    .await
            }
        }
    }

    /// Lock a session for a lifecycle move. An evicted session has ended, so
    /// any move on it is reported as illegal rather than unknown.
    async fn lock_for(&self, session_id: Uuid, target: SessionState) -> Result<SessionGuard> {
        match self.inner.registry.lock(session_id).await {
            Err(AppError::NotFound(what)) => match self.inner.store.load_session(session_id).await? {
                Some(archived) => Err(AppError::InvalidStateTransition {
                    from: archived.state,
                    to: target,
                }),
                None => Err(AppError::NotFound(what)),
            },
            locked => locked,
        }
    }

    async fn go_live(&self, session_id: Uuid, actor: Actor) -> Result<StreamSession> {
        let guard = self.lock_for(session_id, SessionState::Live).await?;
        let session = self
            .inner
            .registry
            .transition(&guard, SessionState::Live, actor, None)
            .await?;
        self.inner.analytics.open(session_id);
        self.inner.hub.open_session(session_id);
        self.inner.bus.open_session(session_id);

        match self.inner.transcoding.start_for_session(&session).await {
            Ok(signal) => self.watch_readiness(session_id, signal),
            Err(e) => {
                warn!(%session_id, error = %e, "transcoder failed to start; ending session");
                self.end_locked(&guard, Actor::System, Some(format!("transcoder failed to start: {e}")))
                    .await?;
                return Err(e);
            }
        }
        drop(guard);

        self.notify_subscribers(session.clone());
        Ok(session)
    }

    fn watch_readiness(&self, session_id: Uuid, signal: ReadySignal) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.inner.transcoding.await_ready(session_id, signal).await {
                Ok(manifest_location) => {
                    info!(%session_id, %manifest_location, "playback ready");
                    this.inner.hub.broadcast_control(
                        session_id,
                        ControlEvent::RecordingReady { manifest_location },
                    );
                }
                Err(AppError::Conflict(_)) => {
                    debug!(%session_id, "transcoder stopped before it became ready");
                }
                Err(e) => {
                    warn!(%session_id, error = %e, "transcoder never became ready; ending session");
                    if let Err(e) = this
                        .force_end(session_id, format!("transcoder failed: {e}"))
                        .await
                    {
                        debug!(%session_id, error = %e, "session already ended");
                    }
                }
            }
        });
    }

    fn notify_subscribers(&self, session: StreamSession) {
        let notifier = self.inner.notifier.clone();
        let policy = self.inner.policies.notification.clone();
        tokio::spawn(async move {
            let result = guarded("notifications", &policy, || {
                let notifier = notifier.clone();
                let session = session.clone();
                async move { notifier.notify_live(&session).await }
            })
            .await;
            if let Err(e) = result {
                warn!(session_id = %session.id, error = %e, "live notification not sent");
            }
        });
    }

    /// End a session on behalf of the platform. A no-op once ended.
    pub async fn force_end(&self, session_id: Uuid, reason: impl Into<String>) -> Result<StreamSession> {
        let guard = match self.inner.registry.lock(session_id).await {
            Ok(guard) => guard,
            // Evicted sessions have already ended
            Err(AppError::NotFound(_)) => return self.inner.registry.find_session(session_id).await,
            Err(e) => return Err(e),
        };
        let current = self.inner.registry.get_session(session_id)?;
        if current.state.is_terminal() {
            return Ok(current);
        }
        self.end_locked(&guard, Actor::System, Some(reason.into())).await
    }

    /// Teardown cascade, run while holding the session guard so no caller
    /// observes a half-ended session.
    async fn end_locked(
        &self,
        guard: &SessionGuard,
        actor: Actor,
        fault_reason: Option<String>,
    ) -> Result<StreamSession> {
        let session_id = guard.session_id();
        let ended = self
            .inner
            .registry
            .transition(guard, SessionState::Ended, actor, fault_reason.clone())
            .await?;

        let detached = self.inner.hub.close_session(
            session_id,
            ControlEvent::SessionEnded {
                reason: fault_reason,
            },
        );
        self.inner.bus.close_session(session_id).await;

        if let Some(location) = self.inner.transcoding.stop_for_session(session_id).await {
            self.inner.registry.set_archive_location(guard, location).await?;
        }

        let metrics = self.inner.analytics.finalize(session_id);
        if let Err(e) = self.inner.store.save_metrics(&metrics).await {
            error!(%session_id, error = %e, "failed to persist final session metrics");
        }

        info!(
            %session_id,
            detached = detached.len(),
            peak = metrics.peak_concurrent_viewers,
            "session torn down"
        );
        self.schedule_eviction(session_id);
        self.inner.registry.get_session(ended.id)
    }

    fn schedule_eviction(&self, session_id: Uuid) {
        let this = self.clone();
        let retention = self.inner.config.limits.ended_session_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            this.evict(session_id).await;
        });
    }

    /// Release an ended session's in-memory state. Everything later reads
    /// need was persisted at teardown. Returns false for sessions that are
    /// not ended or already gone.
    pub async fn evict(&self, session_id: Uuid) -> bool {
        let Ok(guard) = self.inner.registry.lock(session_id).await else {
            return false;
        };
        if !self.inner.registry.evict(&guard) {
            return false;
        }
        drop(guard);

        self.inner.bus.evict(session_id).await;
        self.inner.analytics.evict(session_id);
        self.inner.transcoding.evict(session_id);
        let mut capturing = self.inner.donations.evict_session(session_id);
        // Captures outlive the session by at most their deadline
        while capturing > 0 {
            tokio::time::sleep(self.inner.policies.payment.deadline).await;
            capturing = self.inner.donations.evict_session(session_id);
        }
        debug!(%session_id, "ended session evicted");
        true
    }

    /// Whether any component still holds in-memory state for the session
    pub fn holds_state(&self, session_id: Uuid) -> bool {
        self.inner.registry.tracks(session_id)
            || self.inner.bus.tracks(session_id)
            || self.inner.analytics.tracks(session_id)
            || self.inner.transcoding.tracks(session_id)
            || self.inner.donations.tracked_records(session_id) > 0
            || self.inner.hub.is_open(session_id)
    }

    // ------------------------------------------------------------------
    // Joining and the real-time channel
    // ------------------------------------------------------------------

    /// Pre-check before opening the real-time channel. Success carries a
    /// connection token bound to this session.
    pub async fn join_session(&self, session_id: Uuid, viewer: ViewerIdentity) -> Result<JoinOutcome> {
        let session = self.inner.registry.find_session(session_id).await?;
        let playback = self.inner.transcoding.playback_status(&session);

        if viewer.user_id() == Some(session.broadcaster_id) {
            if session.state.is_terminal() {
                return Ok(JoinOutcome::Deny {
                    reason: DenyReason::SessionEnded,
                });
            }
            let token = self.inner.tokens.issue(
                session_id,
                &viewer,
                ConnectionRole::Broadcaster,
                None,
            )?;
            return Ok(JoinOutcome::Allow {
                token,
                role: ConnectionRole::Broadcaster,
                playback,
            });
        }

        match self.inner.gate.authorize(&session, &viewer).await? {
            AccessDecision::Allow { tier } => {
                let token = self
                    .inner
                    .tokens
                    .issue(session_id, &viewer, ConnectionRole::Viewer, tier)?;
                Ok(JoinOutcome::Allow {
                    token,
                    role: ConnectionRole::Viewer,
                    playback,
                })
            }
            AccessDecision::Deny(reason) => {
                info!(%session_id, viewer = %viewer.key(), reason = reason.as_str(), "join denied");
                Ok(JoinOutcome::Deny { reason })
            }
        }
    }

    /// Admit a connection presenting a token from [`Self::join_session`]
    pub async fn connect(&self, session_id: Uuid, token: &str) -> Result<Admission> {
        let claims = self.inner.tokens.verify(token, session_id)?;
        let session = self.inner.registry.find_session(session_id).await?;
        if !session.is_live() {
            return Err(AppError::Conflict(format!(
                "session {session_id} is {}",
                session.state
            )));
        }

        let connection = ViewerConnection::new(session_id, claims.identity, claims.role, claims.tier);
        let playback_url = self.inner.transcoding.playback_status(&session).manifest_url();
        let hub = self.inner.hub.clone();
        let info = connection.clone();

        let queue = self
            .inner
            .bus
            .with_sequence_barrier(session_id, move |last_sequence| {
                let welcome = WsOutboundEvent::Welcome {
                    connection_id: info.connection_id,
                    role: info.role,
                    last_sequence,
                    playback_url,
                };
                match info.role {
                    ConnectionRole::Broadcaster => hub.admit_broadcaster(info, welcome),
                    ConnectionRole::Viewer => hub.admit_viewer(info, welcome),
                }
            })
            .await?;

        Ok(Admission { connection, queue })
    }

    /// Process one inbound frame from an admitted connection
    pub async fn handle_inbound(&self, connection: &ViewerConnection, event: WsInboundEvent) -> Result<()> {
        self.inner.hub.touch(connection.connection_id);
        match event {
            WsInboundEvent::Negotiation { to, payload } => {
                self.relay(connection.session_id, connection.connection_id, to, payload)?;
            }
            WsInboundEvent::Chat { body } => {
                self.publish_chat(connection.session_id, &connection.identity, &body)
                    .await?;
            }
            WsInboundEvent::Moderation { message_id, action } => {
                let Some(user_id) = connection.identity.user_id() else {
                    return Err(AppError::NotAuthorized(
                        "anonymous viewers cannot moderate".to_string(),
                    ));
                };
                self.moderate(connection.session_id, message_id, action, Actor::User(user_id))
                    .await?;
            }
            WsInboundEvent::Heartbeat => {
                self.inner.hub.send_to(
                    connection.connection_id,
                    WsOutboundEvent::HeartbeatAck {
                        server_time: Utc::now(),
                    },
                );
            }
        }
        Ok(())
    }

    pub fn relay(
        &self,
        session_id: Uuid,
        from: ConnectionId,
        to: ConnectionId,
        payload: NegotiationPayload,
    ) -> Result<RelayOutcome> {
        self.inner.hub.relay(session_id, from, to, payload)
    }

    pub fn touch(&self, connection_id: ConnectionId) {
        self.inner.hub.touch(connection_id);
    }

    /// Detach a connection. A departing broadcaster ends the session.
    pub async fn remove_connection(
        &self,
        session_id: Uuid,
        connection_id: ConnectionId,
    ) -> Option<ViewerConnection> {
        let removed = self.inner.hub.remove_connection(session_id, connection_id)?;
        if removed.is_broadcaster() {
            if let Err(e) = self.force_end(session_id, "broadcaster disconnected").await {
                warn!(%session_id, error = %e, "failed to end session after broadcaster left");
            }
        }
        Some(removed)
    }

    /// Remove every connection silent for longer than the heartbeat interval
    pub async fn reap_stale_connections(&self, now_ms: i64) -> usize {
        let stale = self
            .inner
            .hub
            .stale_connections(now_ms, self.inner.config.limits.heartbeat_interval);
        let mut reaped = 0;
        for (session_id, connection_id) in stale {
            if self.remove_connection(session_id, connection_id).await.is_some() {
                info!(%session_id, %connection_id, "reaped silent connection");
                reaped += 1;
            }
        }
        reaped
    }

    pub fn spawn_heartbeat_reaper(&self) -> JoinHandle<()> {
        let this = self.clone();
        let period = (self.inner.config.limits.heartbeat_interval / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                this.reap_stale_connections(Utc::now().timestamp_millis()).await;
            }
        })
    }

    // ------------------------------------------------------------------
    // Chat, donations and metrics
    // ------------------------------------------------------------------

    pub async fn publish_chat(
        &self,
        session_id: Uuid,
        sender: &ViewerIdentity,
        body: &str,
    ) -> Result<ChatMessage> {
        let session = self.inner.registry.find_session(session_id).await?;
        self.inner.bus.publish(&session, sender, body).await
    }

    pub async fn publish_system(&self, session_id: Uuid, body: &str) -> Result<ChatMessage> {
        let session = self.inner.registry.find_session(session_id).await?;
        if session.state.is_terminal() {
            return Err(AppError::Conflict("session has ended".to_string()));
        }
        self.inner.bus.publish_system(session_id, body).await
    }

    pub async fn moderate(
        &self,
        session_id: Uuid,
        message_id: Uuid,
        action: ModerationAction,
        actor: Actor,
    ) -> Result<ModerationOutcome> {
        let session = self.inner.registry.find_session(session_id).await?;
        self.inner.bus.moderate(&session, message_id, action, actor).await
    }

    pub async fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>> {
        self.inner.registry.find_session(session_id).await?;
        Ok(self.inner.bus.recent(session_id, limit).await)
    }

    pub async fn submit_donation(
        &self,
        session_id: Uuid,
        donor_id: Uuid,
        request: DonationRequest,
    ) -> Result<Donation> {
        let session = self.inner.registry.find_session(session_id).await?;
        let donor_name = request
            .donor_name
            .clone()
            .unwrap_or_else(|| ViewerIdentity::User(donor_id).display_name());
        self.inner
            .donations
            .submit(&session, donor_id, donor_name, request)
            .await
    }

    pub async fn list_donations(&self, session_id: Uuid) -> Result<Vec<Donation>> {
        self.inner.registry.find_session(session_id).await?;
        self.inner.donations.list_donations(session_id).await
    }

    /// Live counters while the session runs, the frozen snapshot after
    pub async fn session_metrics(&self, session_id: Uuid) -> Result<SessionMetrics> {
        self.inner.registry.find_session(session_id).await?;
        if let Some(metrics) = self.inner.analytics.snapshot(session_id) {
            return Ok(metrics);
        }
        Ok(self
            .inner
            .store
            .load_metrics(session_id)
            .await?
            .unwrap_or_else(|| SessionMetrics::empty(session_id)))
    }
}
