/// WebSocket connect and status endpoints.
///
/// Identity resolution happens upstream (gateway); this layer re-checks ban
/// status before admitting a socket and bridges hub broadcasts into the
/// session actor.
use actix_web::{web, Error as ActixError, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde_json::json;
use uuid::Uuid;

use crate::metrics;
use crate::state::AppState;
use crate::websocket::session::{PushFrame, PushSession};

/// Endpoint: GET /ws/{user_id} (upgrade)
pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> std::result::Result<HttpResponse, ActixError> {
    let user_id = path.into_inner();

    match state.graph.is_banned(user_id).await {
        Ok(false) => {}
        Ok(true) => {
            tracing::warn!(user_id = %user_id, "WebSocket connection rejected: banned account");
            return Ok(HttpResponse::Forbidden().finish());
        }
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Ban check failed");
            return Ok(HttpResponse::InternalServerError().finish());
        }
    }

    // Register with the hub before the actor starts so no broadcast between
    // upgrade and registration is missed.
    let (subscriber_id, mut rx) = state.hub.subscribe(user_id).await;
    let session = PushSession::new(user_id, subscriber_id, state.hub.clone());

    let (addr, response) = ws::WsResponseBuilder::new(session, &req, stream).start_with_addr()?;
    metrics::record_ws_connected();

    // Bridge hub broadcasts to the WebSocket actor. The hub drops our sender
    // on unsubscribe, which ends this task.
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(frame) => addr.do_send(PushFrame(frame)),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize push frame"),
            }
        }
    });

    Ok(response)
}

/// Endpoint: GET /api/v1/ws/status/{user_id}
pub async fn ws_status(path: web::Path<Uuid>, state: web::Data<AppState>) -> HttpResponse {
    let user_id = path.into_inner();
    let connection_count = state.hub.connection_count(user_id).await;

    HttpResponse::Ok().json(json!({
        "user_id": user_id.to_string(),
        "connected": connection_count > 0,
        "connection_count": connection_count,
    }))
}

/// Endpoint: GET /api/v1/ws/metrics
pub async fn ws_metrics(state: web::Data<AppState>) -> HttpResponse {
    let total_connections = state.hub.total_connections().await;
    let connected_users = state.hub.connected_users_count().await;

    HttpResponse::Ok().json(json!({
        "total_connections": total_connections,
        "connected_users": connected_users,
    }))
}

/// Register WebSocket routes
pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/{user_id}", web::get().to(ws_connect)).service(
        web::scope("/api/v1/ws")
            .route("/status/{user_id}", web::get().to(ws_status))
            .route("/metrics", web::get().to(ws_metrics)),
    );
}
