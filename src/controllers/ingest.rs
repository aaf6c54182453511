use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use std::sync::Arc;

use crate::error::IngestError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ingest", post(ingest_all))
        .route("/ingest/{handle}", post(ingest_one))
        .route("/fixup", post(fixup))
}

// POST /api/ingest
async fn ingest_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ingest.ingest_all().await)
}

// POST /api/ingest/{handle}
async fn ingest_one(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    match state.ingest.ingest_one(&handle).await {
        Ok(report) => Ok(Json(report)),
        Err(e @ IngestError::UnknownSource(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => {
            tracing::error!(handle = %handle, error = %e, "Ingestion of one source failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

// POST /api/fixup
async fn fixup(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ingest.fixup().await)
}
