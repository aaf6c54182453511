use serde::Serialize;
use sqlx::FromRow;
use chrono::{DateTime, Utc};

/// Аккаунт-источник событий. Уникален по `handle`.
#[derive(Debug, Clone, FromRow, Serialize, PartialEq)]
pub struct Organizer {
    pub id: i64,
    pub handle: String,
    pub city: String,
    pub context_clues: String,
    // Для новых организаторов — эпоха, поэтому они обрабатываются первыми
    pub last_updated_at: DateTime<Utc>,
}
