pub mod events;
pub mod ingest;

use axum::Router;
use std::sync::Arc;

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(ingest::routes())
        .merge(events::routes())
}
