//! HTTP handlers for the live-session control plane
//!
//! - Session lifecycle (create, read, transition)
//! - Join pre-check issuing connection tokens
//! - Donations, chat history, moderation and metrics
//! - WebSocket upgrade for the real-time channel

pub mod guards;
pub mod sessions;
pub mod sessions_ws;

use actix_web::{get, web, HttpResponse};

pub use guards::ActingUser;
pub use sessions_ws::session_ws;

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .route("/metrics", web::get().to(crate::metrics::serve_metrics))
        .service(sessions::create_session)
        .service(sessions::get_session)
        .service(sessions::transition_session)
        .service(sessions::join_session)
        .service(sessions::submit_donation)
        .service(sessions::list_donations)
        .service(sessions::session_metrics)
        .service(sessions::recent_messages)
        .service(sessions::moderate_message)
        .service(session_ws);
}
