//! One actor per admitted real-time connection
//!
//! Outbound frames come from the connection's [`OutboundQueue`], added to
//! the actor as a stream. Inbound frames are handed to a single task per
//! connection so they are processed in arrival order without blocking the
//! socket.

use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::ViewerConnection;
use crate::services::hub::OutboundQueue;
use crate::services::LiveSessionCoordinator;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};

const INBOUND_BUFFER: usize = 64;

pub struct LiveSessionSocket {
    coordinator: LiveSessionCoordinator,
    connection: ViewerConnection,
    queue: OutboundQueue,
    inbound: Option<mpsc::Sender<WsInboundEvent>>,
    hb: Instant,
    heartbeat_interval: Duration,
}

impl LiveSessionSocket {
    pub fn new(
        coordinator: LiveSessionCoordinator,
        connection: ViewerConnection,
        queue: OutboundQueue,
    ) -> Self {
        let heartbeat_interval = coordinator.config().limits.heartbeat_interval;
        Self {
            coordinator,
            connection,
            queue,
            inbound: None,
            hb: Instant::now(),
            heartbeat_interval,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let check_every = (self.heartbeat_interval / 2).max(Duration::from_millis(100));
        ctx.run_interval(check_every, |act, ctx| {
            if Instant::now().duration_since(act.hb) > act.heartbeat_interval {
                warn!(
                    session_id = %act.connection.session_id,
                    connection_id = %act.connection.connection_id,
                    "heartbeat missed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn alive(&mut self) {
        self.hb = Instant::now();
        self.coordinator.touch(self.connection.connection_id);
    }

    fn start_inbound_worker(&mut self) {
        let (tx, mut rx) = mpsc::channel::<WsInboundEvent>(INBOUND_BUFFER);
        let coordinator = self.coordinator.clone();
        let connection = self.connection.clone();
        actix::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = coordinator.handle_inbound(&connection, event).await {
                    debug!(
                        connection_id = %connection.connection_id,
                        error = %e,
                        "inbound frame rejected"
                    );
                    coordinator
                        .hub()
                        .send_to(connection.connection_id, WsOutboundEvent::error(&e));
                }
            }
        });
        self.inbound = Some(tx);
    }

    fn send_direct(ctx: &mut ws::WebsocketContext<Self>, event: &WsOutboundEvent) {
        match serde_json::to_string(event) {
            Ok(text) => ctx.text(text),
            Err(e) => warn!(error = %e, "failed to encode outbound frame"),
        }
    }
}

impl Actor for LiveSessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            session_id = %self.connection.session_id,
            connection_id = %self.connection.connection_id,
            role = self.connection.role.as_str(),
            "real-time connection started"
        );
        self.hb(ctx);
        self.start_inbound_worker();
        ctx.add_stream(self.queue.clone().into_stream());
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(
            session_id = %self.connection.session_id,
            connection_id = %self.connection.connection_id,
            "real-time connection stopped"
        );
        self.inbound.take();

        let coordinator = self.coordinator.clone();
        let session_id = self.connection.session_id;
        let connection_id = self.connection.connection_id;
        actix::spawn(async move {
            coordinator.remove_connection(session_id, connection_id).await;
        });
    }
}

/// Frames pushed by the hub
impl StreamHandler<Arc<WsOutboundEvent>> for LiveSessionSocket {
    fn handle(&mut self, event: Arc<WsOutboundEvent>, ctx: &mut Self::Context) {
        Self::send_direct(ctx, &event);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // Hub closed the queue: removal, reap or session end
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveSessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.alive();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => self.alive(),
            Ok(ws::Message::Text(text)) => {
                self.alive();
                let event = match serde_json::from_str::<WsInboundEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        let error = AppError::Validation(format!("malformed frame: {e}"));
                        Self::send_direct(ctx, &WsOutboundEvent::error(&error));
                        return;
                    }
                };
                let Some(inbound) = &self.inbound else {
                    return;
                };
                if inbound.try_send(event).is_err() {
                    let error = AppError::Capacity("too many frames in flight".to_string());
                    Self::send_direct(ctx, &WsOutboundEvent::error(&error));
                }
            }
            Ok(ws::Message::Binary(_)) => {
                let error = AppError::Validation("binary frames are not supported".to_string());
                Self::send_direct(ctx, &WsOutboundEvent::error(&error));
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, connection_id = %self.connection.connection_id, "client closed");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                warn!(error = %e, connection_id = %self.connection.connection_id, "websocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}
