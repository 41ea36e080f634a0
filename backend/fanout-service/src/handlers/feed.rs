/// Timeline read endpoint.
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::Result;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    /// Return entries strictly older than this timestamp.
    pub cursor: Option<i64>,
    pub limit: Option<usize>,
}

/// Endpoint: GET /api/v1/feed/{user_id}
pub async fn read_feed(
    path: web::Path<Uuid>,
    query: web::Query<FeedQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);

    let page = state.feeds.read(user_id, query.cursor, limit).await?;
    Ok(HttpResponse::Ok().json(page))
}

/// Register feed routes
pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/api/v1/feed").route("/{user_id}", web::get().to(read_feed)));
}
