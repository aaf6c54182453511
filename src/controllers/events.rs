use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/events", get(upcoming_events))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

// GET /api/events?limit=
pub async fn upcoming_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let events = state.store.list_upcoming_events(Utc::now(), limit).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to list upcoming events");
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to retrieve events".to_string())
    })?;

    let count = events.len();
    Ok(Json(json!({
        "events": events,
        "count": count,
    })))
}
