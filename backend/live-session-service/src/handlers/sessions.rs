use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::handlers::guards::ActingUser;
use crate::models::{ChatMessage, DonationRequest, ModerationAction, SessionConfig, SessionState};
use crate::services::event_bus::ModerationOutcome;
use crate::services::JoinOutcome;
use crate::state::AppState;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Serialize)]
pub struct SessionStateResponse {
    pub session_id: Uuid,
    pub state: SessionState,
}

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub target_state: SessionState,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ModerateRequest {
    pub action: ModerationAction,
}

#[derive(Serialize)]
pub struct ModerateResponse {
    pub message: ChatMessage,
    /// False when the message had already been removed
    pub applied: bool,
}

const DEFAULT_HISTORY_PAGE: usize = 50;

// ============================================================================
// API Handlers
// ============================================================================

/// POST /api/v1/sessions
#[post("/api/v1/sessions")]
pub async fn create_session(
    state: web::Data<AppState>,
    user: ActingUser,
    body: web::Json<SessionConfig>,
) -> Result<HttpResponse, AppError> {
    let broadcaster_id = user.require_user()?;
    let session = state
        .coordinator
        .create_session(broadcaster_id, body.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(SessionStateResponse {
        session_id: session.id,
        state: session.state,
    }))
}

/// GET /api/v1/sessions/{id}
#[get("/api/v1/sessions/{session_id}")]
pub async fn get_session(
    state: web::Data<AppState>,
    session_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let view = state.coordinator.get_session(session_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(view))
}

/// POST /api/v1/sessions/{id}/transition
#[post("/api/v1/sessions/{session_id}/transition")]
pub async fn transition_session(
    state: web::Data<AppState>,
    user: ActingUser,
    session_id: web::Path<Uuid>,
    body: web::Json<TransitionRequest>,
) -> Result<HttpResponse, AppError> {
    let actor = user.actor()?;
    let session = state
        .coordinator
        .transition_state(session_id.into_inner(), body.target_state, actor)
        .await?;
    Ok(HttpResponse::Ok().json(SessionStateResponse {
        session_id: session.id,
        state: session.state,
    }))
}

/// POST /api/v1/sessions/{id}/join
///
/// Denials are a normal answer, not an error: 403 with the reason so the
/// client can offer the right upsell.
#[post("/api/v1/sessions/{session_id}/join")]
pub async fn join_session(
    state: web::Data<AppState>,
    user: ActingUser,
    session_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .coordinator
        .join_session(session_id.into_inner(), user.viewer())
        .await?;
    Ok(match outcome {
        JoinOutcome::Allow { .. } => HttpResponse::Ok().json(outcome),
        JoinOutcome::Deny { .. } => HttpResponse::Forbidden().json(outcome),
    })
}

/// POST /api/v1/sessions/{id}/donations
#[post("/api/v1/sessions/{session_id}/donations")]
pub async fn submit_donation(
    state: web::Data<AppState>,
    user: ActingUser,
    session_id: web::Path<Uuid>,
    body: web::Json<DonationRequest>,
) -> Result<HttpResponse, AppError> {
    let donor_id = user.require_user()?;
    let donation = state
        .coordinator
        .submit_donation(session_id.into_inner(), donor_id, body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(donation))
}

/// GET /api/v1/sessions/{id}/donations
#[get("/api/v1/sessions/{session_id}/donations")]
pub async fn list_donations(
    state: web::Data<AppState>,
    session_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let donations = state
        .coordinator
        .list_donations(session_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(donations))
}

/// GET /api/v1/sessions/{id}/metrics
#[get("/api/v1/sessions/{session_id}/metrics")]
pub async fn session_metrics(
    state: web::Data<AppState>,
    session_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let metrics = state
        .coordinator
        .session_metrics(session_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(metrics))
}

/// GET /api/v1/sessions/{id}/messages?limit=
#[get("/api/v1/sessions/{session_id}/messages")]
pub async fn recent_messages(
    state: web::Data<AppState>,
    session_id: web::Path<Uuid>,
    query: web::Query<MessagesQuery>,
) -> Result<HttpResponse, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_PAGE)
        .min(state.config.limits.chat_history_limit);
    let messages = state
        .coordinator
        .recent_messages(session_id.into_inner(), limit)
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

/// POST /api/v1/sessions/{id}/messages/{message_id}/moderate
#[post("/api/v1/sessions/{session_id}/messages/{message_id}/moderate")]
pub async fn moderate_message(
    state: web::Data<AppState>,
    user: ActingUser,
    path: web::Path<(Uuid, Uuid)>,
    body: web::Json<ModerateRequest>,
) -> Result<HttpResponse, AppError> {
    let (session_id, message_id) = path.into_inner();
    let actor = user.actor()?;
    let outcome = state
        .coordinator
        .moderate(session_id, message_id, body.action, actor)
        .await?;
    let response = match outcome {
        ModerationOutcome::Applied(message) => ModerateResponse {
            message,
            applied: true,
        },
        ModerationOutcome::AlreadyApplied(message) => ModerateResponse {
            message,
            applied: false,
        },
    };
    Ok(HttpResponse::Ok().json(response))
}
