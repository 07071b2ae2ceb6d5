//! WebSocket upgrade for the real-time channel
//!
//! `GET /ws/sessions/{session_id}?token=...` where the token comes from the
//! join pre-check. Admission happens before the upgrade so a refused
//! connection gets a plain HTTP error.

use actix_web::{get, web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::state::AppState;
use crate::websocket::LiveSessionSocket;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
}

#[get("/ws/sessions/{session_id}")]
pub async fn session_ws(
    req: HttpRequest,
    session_id: web::Path<Uuid>,
    params: web::Query<WsParams>,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let session_id = session_id.into_inner();
    let admission = state.coordinator.connect(session_id, &params.token).await?;
    let connection_id = admission.connection.connection_id;

    let actor = LiveSessionSocket::new(
        state.coordinator.clone(),
        admission.connection,
        admission.queue,
    );
    match ws::start(actor, &req, payload) {
        Ok(response) => Ok(response),
        Err(e) => {
            // The actor never started, so it will not clean up after itself
            warn!(%session_id, %connection_id, error = %e, "websocket handshake failed");
            state
                .coordinator
                .remove_connection(session_id, connection_id)
                .await;
            Err(e)
        }
    }
}
