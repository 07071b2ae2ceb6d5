//! Signaling hub: per-session connection membership and relay
//!
//! The hub owns every admitted connection. Each session keeps at most one
//! broadcaster and a bounded set of viewers behind its own mutex, so sessions
//! never contend with each other. Frames reach clients only through each
//! connection's [`OutboundQueue`].

pub mod queue;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{ConnectionId, ConnectionRole, ViewerConnection};
use crate::services::events::{SessionEvent, SessionEventSink};
use crate::websocket::message_types::{ControlEvent, NegotiationPayload, WsOutboundEvent};

pub use queue::{OutboundQueue, PushOutcome};

struct ConnectionEntry {
    info: ViewerConnection,
    queue: OutboundQueue,
    last_activity_ms: AtomicI64,
}

impl ConnectionEntry {
    fn push(&self, event: Arc<WsOutboundEvent>) -> PushOutcome {
        self.queue.push(event)
    }
}

#[derive(Default)]
struct SessionPeers {
    broadcaster: Option<Arc<ConnectionEntry>>,
    viewers: HashMap<ConnectionId, Arc<ConnectionEntry>>,
}

impl SessionPeers {
    fn all(&self) -> impl Iterator<Item = &Arc<ConnectionEntry>> {
        self.broadcaster.iter().chain(self.viewers.values())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    /// Target is gone; the sender was told with a `RELAY_FAILED` frame
    PeerGone,
}

pub struct SignalingHub {
    sessions: DashMap<Uuid, Arc<Mutex<SessionPeers>>>,
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
    max_viewers: usize,
    queue_capacity: usize,
    events: SessionEventSink,
}

impl SignalingHub {
    pub fn new(max_viewers: usize, queue_capacity: usize, events: SessionEventSink) -> Self {
        Self {
            sessions: DashMap::new(),
            connections: DashMap::new(),
            max_viewers,
            queue_capacity,
            events,
        }
    }

    /// Start accepting connections for a session that just went live
    pub fn open_session(&self, session_id: Uuid) {
        self.sessions.entry(session_id).or_default();
    }

    fn peers(&self, session_id: Uuid) -> Result<Arc<Mutex<SessionPeers>>> {
        self.sessions
            .get(&session_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| AppError::Conflict(format!("session {session_id} is not accepting connections")))
    }

    fn new_entry(&self, info: ViewerConnection) -> Arc<ConnectionEntry> {
        Arc::new(ConnectionEntry {
            info,
            queue: OutboundQueue::new(self.queue_capacity),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        })
    }

    /// Admit the one broadcaster connection; `welcome` is its first frame
    pub fn admit_broadcaster(
        &self,
        info: ViewerConnection,
        welcome: WsOutboundEvent,
    ) -> Result<OutboundQueue> {
        let session_id = info.session_id;
        let peers = self.peers(session_id)?;
        let mut peers = peers.lock();
        if peers.broadcaster.is_some() {
            return Err(AppError::Conflict(format!(
                "session {session_id} already has a broadcaster connection"
            )));
        }

        let entry = self.new_entry(info);
        entry.push(Arc::new(welcome));
        let queue = entry.queue.clone();
        self.connections.insert(entry.info.connection_id, entry.clone());
        info!(%session_id, connection_id = %entry.info.connection_id, "broadcaster admitted");
        peers.broadcaster = Some(entry);
        metrics::connection_opened(ConnectionRole::Broadcaster.as_str());
        Ok(queue)
    }

    /// Admit a viewer that already passed authorization
    pub fn admit_viewer(
        &self,
        info: ViewerConnection,
        welcome: WsOutboundEvent,
    ) -> Result<OutboundQueue> {
        let session_id = info.session_id;
        let viewer_key = info.identity.key();
        let connection_id = info.connection_id;

        let queue = {
            let peers = self.peers(session_id)?;
            let mut peers = peers.lock();
            if peers.viewers.len() >= self.max_viewers {
                return Err(AppError::Capacity(format!(
                    "session {session_id} reached its limit of {} viewers",
                    self.max_viewers
                )));
            }

            let entry = self.new_entry(info);
            entry.push(Arc::new(welcome));
            let queue = entry.queue.clone();
            self.connections.insert(connection_id, entry.clone());
            peers.viewers.insert(connection_id, entry);

            let viewer_count = peers.viewers.len();
            if let Some(broadcaster) = &peers.broadcaster {
                broadcaster.push(Arc::new(WsOutboundEvent::Control(ControlEvent::ViewerJoined {
                    connection_id,
                    viewer_count,
                })));
            }
            // Emitted under the session lock so join/leave reach observers in order
            self.events
                .emit(session_id, SessionEvent::ViewerJoined { viewer_key });
            queue
        };

        debug!(%session_id, %connection_id, "viewer admitted");
        metrics::connection_opened(ConnectionRole::Viewer.as_str());
        Ok(queue)
    }

    /// Forward an opaque negotiation blob between the broadcaster and one
    /// viewer. Never retried.
    pub fn relay(
        &self,
        session_id: Uuid,
        from: ConnectionId,
        to: ConnectionId,
        payload: NegotiationPayload,
    ) -> Result<RelayOutcome> {
        let peers = self.peers(session_id)?;
        let peers = peers.lock();

        let sender_is_broadcaster = peers
            .broadcaster
            .as_ref()
            .map(|b| b.info.connection_id == from)
            .unwrap_or(false);
        let sender = if sender_is_broadcaster {
            peers.broadcaster.clone()
        } else {
            peers.viewers.get(&from).cloned()
        };
        let Some(sender) = sender else {
            return Err(AppError::NotFound(format!("connection {from} is not admitted")));
        };
        if from == to {
            return Err(AppError::Validation("cannot relay to self".to_string()));
        }

        let target = if sender_is_broadcaster {
            peers.viewers.get(&to).cloned()
        } else {
            match &peers.broadcaster {
                Some(b) if b.info.connection_id == to => Some(b.clone()),
                _ if peers.viewers.contains_key(&to) => {
                    return Err(AppError::NotAuthorized(
                        "viewers may only negotiate with the broadcaster".to_string(),
                    ))
                }
                _ => None,
            }
        };

        match target {
            Some(target) => {
                target.push(Arc::new(WsOutboundEvent::Negotiation { from, payload }));
                Ok(RelayOutcome::Delivered)
            }
            None => {
                sender.push(Arc::new(WsOutboundEvent::RelayFailed {
                    to,
                    reason: "peer disconnected".to_string(),
                }));
                Ok(RelayOutcome::PeerGone)
            }
        }
    }

    /// Detach a connection. Idempotent; returns the record the first time.
    pub fn remove_connection(
        &self,
        session_id: Uuid,
        connection_id: ConnectionId,
    ) -> Option<ViewerConnection> {
        let peers = self.sessions.get(&session_id).map(|p| p.value().clone())?;
        let mut peers = peers.lock();

        let removed = if peers
            .broadcaster
            .as_ref()
            .map(|b| b.info.connection_id == connection_id)
            .unwrap_or(false)
        {
            let entry = peers.broadcaster.take()?;
            let left = Arc::new(WsOutboundEvent::Control(ControlEvent::BroadcasterLeft));
            for viewer in peers.viewers.values() {
                viewer.push(left.clone());
            }
            info!(%session_id, %connection_id, viewers = peers.viewers.len(), "broadcaster left");
            entry
        } else {
            let entry = peers.viewers.remove(&connection_id)?;
            let viewer_count = peers.viewers.len();
            if let Some(broadcaster) = &peers.broadcaster {
                broadcaster.push(Arc::new(WsOutboundEvent::Control(ControlEvent::ViewerLeft {
                    connection_id,
                    viewer_count,
                })));
            }
            self.emit_left(&entry);
            entry
        };

        self.connections.remove(&connection_id);
        removed.queue.close();
        metrics::connection_closed(removed.info.role.as_str());
        Some(removed.info.clone())
    }

    fn emit_left(&self, entry: &ConnectionEntry) {
        let watch_time = (Utc::now() - entry.info.joined_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.events.emit(
            entry.info.session_id,
            SessionEvent::ViewerLeft {
                viewer_key: entry.info.identity.key(),
                watch_time,
            },
        );
    }

    /// Drop the session's whole membership after a final control frame.
    /// Returns the connections that were still attached.
    pub fn close_session(&self, session_id: Uuid, control: ControlEvent) -> Vec<ViewerConnection> {
        let Some((_, peers)) = self.sessions.remove(&session_id) else {
            return Vec::new();
        };
        let mut peers = peers.lock();
        let frame = Arc::new(WsOutboundEvent::Control(control));

        let mut closed = Vec::new();
        if let Some(broadcaster) = peers.broadcaster.take() {
            broadcaster.push(frame.clone());
            broadcaster.queue.close();
            self.connections.remove(&broadcaster.info.connection_id);
            metrics::connection_closed(ConnectionRole::Broadcaster.as_str());
            closed.push(broadcaster.info.clone());
        }
        for (connection_id, viewer) in peers.viewers.drain() {
            viewer.push(frame.clone());
            viewer.queue.close();
            self.connections.remove(&connection_id);
            self.emit_left(&viewer);
            metrics::connection_closed(ConnectionRole::Viewer.as_str());
            closed.push(viewer.info.clone());
        }
        info!(%session_id, closed = closed.len(), "session membership closed");
        closed
    }

    /// Push a control frame to every connection of a session
    pub fn broadcast_control(&self, session_id: Uuid, control: ControlEvent) -> usize {
        self.fan_out(session_id, Arc::new(WsOutboundEvent::Control(control)))
    }

    /// Push one frame to the broadcaster and every viewer. Never blocks on a
    /// slow consumer.
    pub fn fan_out(&self, session_id: Uuid, event: Arc<WsOutboundEvent>) -> usize {
        let Some(peers) = self.sessions.get(&session_id).map(|p| p.value().clone()) else {
            return 0;
        };
        let peers = peers.lock();
        let mut delivered = 0;
        for entry in peers.all() {
            if !entry.push(event.clone()).is_rejected() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn send_to(&self, connection_id: ConnectionId, event: WsOutboundEvent) -> bool {
        match self.connections.get(&connection_id) {
            Some(entry) => !entry.push(Arc::new(event)).is_rejected(),
            None => false,
        }
    }

    /// Record liveness for a connection
    pub fn touch(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.connections.get(&connection_id) {
            entry
                .last_activity_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }

    /// Connections silent for longer than `max_silence` as of `now_ms`
    pub fn stale_connections(&self, now_ms: i64, max_silence: Duration) -> Vec<(Uuid, ConnectionId)> {
        let limit = i64::try_from(max_silence.as_millis()).unwrap_or(i64::MAX);
        self.connections
            .iter()
            .filter(|e| now_ms - e.last_activity_ms.load(Ordering::Relaxed) > limit)
            .map(|e| (e.info.session_id, e.info.connection_id))
            .collect()
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<ViewerConnection> {
        self.connections.get(&connection_id).map(|e| e.info.clone())
    }

    pub fn viewer_count(&self, session_id: Uuid) -> usize {
        self.sessions
            .get(&session_id)
            .map(|p| p.lock().viewers.len())
            .unwrap_or(0)
    }

    pub fn has_broadcaster(&self, session_id: Uuid) -> bool {
        self.sessions
            .get(&session_id)
            .map(|p| p.lock().broadcaster.is_some())
            .unwrap_or(false)
    }

    pub fn is_open(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id)
    }
}
