/// Event ingress for the post service.
///
/// Internal endpoints that validate and enqueue fan-out jobs. Producing a job
/// is all that happens here; timelines converge asynchronously once the
/// consumer picks the job up.
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use event_schema::{EventEnvelope, FanoutMessage};

use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PostEventRequest {
    pub post_id: Uuid,
    pub author_id: Uuid,
    /// Milliseconds since epoch; defaults to now.
    pub timestamp: Option<i64>,
    /// Producing service, for tracing.
    pub source: Option<String>,
}

impl PostEventRequest {
    fn timestamp(&self) -> i64 {
        self.timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
    }

    fn source(&self) -> String {
        self.source.clone().unwrap_or_else(|| "content-service".into())
    }
}

async fn enqueue(state: &AppState, envelope: EventEnvelope<FanoutMessage>) -> Result<HttpResponse> {
    let payload = envelope.to_json()?;
    let stream_id = state.queue.publish(&payload).await?;

    tracing::info!(
        event_id = %envelope.event_id,
        post_id = %envelope.data.post_id,
        author_id = %envelope.data.author_id,
        stream_id = %stream_id,
        "Enqueued fan-out job"
    );

    Ok(HttpResponse::Accepted().json(json!({
        "event_id": envelope.event_id,
        "stream_id": stream_id,
    })))
}

/// Endpoint: POST /api/v1/events/post-published
pub async fn post_published(
    state: web::Data<AppState>,
    body: web::Json<PostEventRequest>,
) -> Result<HttpResponse> {
    let req = body.into_inner();
    let envelope = EventEnvelope::new(
        req.source(),
        FanoutMessage::new_post(req.post_id, req.author_id, req.timestamp()),
    );
    enqueue(&state, envelope).await
}

/// Endpoint: POST /api/v1/events/post-deleted
pub async fn post_deleted(
    state: web::Data<AppState>,
    body: web::Json<PostEventRequest>,
) -> Result<HttpResponse> {
    let req = body.into_inner();
    let envelope = EventEnvelope::new(
        req.source(),
        FanoutMessage::delete_post(req.post_id, req.author_id, req.timestamp()),
    );
    enqueue(&state, envelope).await
}

/// Register event ingress routes
pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/events")
            .route("/post-published", web::post().to(post_published))
            .route("/post-deleted", web::post().to(post_deleted)),
    );
}
