#![allow(dead_code)]

use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use live_session_service::clients::{
    InMemoryArchiveStorage, InMemoryPaymentGateway, InMemorySubscriberNotifier,
    InMemorySubscriptionDirectory, InMemoryTranscoder,
};
use live_session_service::config::Config;
use live_session_service::db::MemorySessionStore;
use live_session_service::handlers;
use live_session_service::models::{Actor, SessionConfig, SessionState, ViewerIdentity};
use live_session_service::services::{
    Admission, Collaborators, JoinOutcome, LiveSessionCoordinator, SessionView,
};
use live_session_service::state::AppState;
use live_session_service::websocket::message_types::{ControlEvent, WsOutboundEvent};
use uuid::Uuid;

pub const ADMIN_TOKEN: &str = "operator-secret";

/// Coordinator over in-memory collaborators, with handles kept for scripting
pub struct Harness {
    pub coordinator: LiveSessionCoordinator,
    pub directory: Arc<InMemorySubscriptionDirectory>,
    pub payments: Arc<InMemoryPaymentGateway>,
    pub transcoder: Arc<InMemoryTranscoder>,
    pub archive: Arc<InMemoryArchiveStorage>,
    pub notifier: Arc<InMemorySubscriberNotifier>,
    pub store: Arc<MemorySessionStore>,
}

pub fn harness() -> Harness {
    harness_with(&[])
}

pub fn harness_with(overrides: &[(&str, &str)]) -> Harness {
    let mut settings = vec![("APP_ENV", "test"), ("ADMIN_TOKEN", ADMIN_TOKEN)];
    settings.extend_from_slice(overrides);
    let config = Config::from_lookup(|key| {
        settings
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    })
    .expect("test config");

    let directory = Arc::new(InMemorySubscriptionDirectory::new());
    let payments = Arc::new(InMemoryPaymentGateway::new());
    let transcoder = Arc::new(InMemoryTranscoder::new());
    let archive = Arc::new(InMemoryArchiveStorage::new());
    let notifier = Arc::new(InMemorySubscriberNotifier::new());
    let store = Arc::new(MemorySessionStore::new());

    let collaborators = Collaborators {
        directory: directory.clone(),
        payments: payments.clone(),
        archive: archive.clone(),
        notifier: notifier.clone(),
        transcoder: transcoder.clone(),
        store: store.clone(),
    };

    Harness {
        coordinator: LiveSessionCoordinator::new(config, collaborators),
        directory,
        payments,
        transcoder,
        archive,
        notifier,
        store,
    }
}

impl Harness {
    /// Create a session and take it live; returns `(broadcaster_id, session_id)`
    pub async fn live_session(&self, config: SessionConfig) -> (Uuid, Uuid) {
        let broadcaster = Uuid::new_v4();
        let session = self
            .coordinator
            .create_session(broadcaster, config)
            .await
            .expect("create session");
        self.coordinator
            .transition_state(session.id, SessionState::Live, Actor::User(broadcaster))
            .await
            .expect("go live");
        (broadcaster, session.id)
    }

    pub async fn token_for(&self, session_id: Uuid, identity: ViewerIdentity) -> String {
        match self
            .coordinator
            .join_session(session_id, identity)
            .await
            .expect("join pre-check")
        {
            JoinOutcome::Allow { token, .. } => token,
            JoinOutcome::Deny { reason } => panic!("join denied: {reason:?}"),
        }
    }

    pub async fn view(&self, session_id: Uuid) -> SessionView {
        self.coordinator
            .get_session(session_id)
            .await
            .expect("session view")
    }

    pub async fn wait_for_state(&self, session_id: Uuid, state: SessionState) -> bool {
        let coordinator = &self.coordinator;
        eventually(|| async move {
            matches!(coordinator.get_session(session_id).await, Ok(view) if view.session.state == state)
        })
        .await
    }

    /// Join and connect in one step
    pub async fn admit(&self, session_id: Uuid, identity: ViewerIdentity) -> Admission {
        let token = self.token_for(session_id, identity).await;
        self.coordinator
            .connect(session_id, &token)
            .await
            .expect("connect")
    }
}

pub fn control_events(frames: &[Arc<WsOutboundEvent>]) -> Vec<ControlEvent> {
    frames
        .iter()
        .filter_map(|frame| match frame.as_ref() {
            WsOutboundEvent::Control(event) => Some(event.clone()),
            _ => None,
        })
        .collect()
}

/// Poll until `check` holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..40 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check().await
}

pub fn app_state(harness: &Harness) -> web::Data<AppState> {
    web::Data::new(AppState::new(harness.coordinator.clone()))
}

pub async fn start_server(coordinator: LiveSessionCoordinator) -> std::io::Result<(SocketAddr, ServerHandle)> {
    let state = web::Data::new(AppState::new(coordinator));

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(handlers::configure)
    })
    .workers(1)
    .listen(listener)?
    .run();

    let handle = server.handle();
    actix_rt::spawn(server);
    Ok((addr, handle))
}
