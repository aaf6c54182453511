use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ExtractedEvent {
    pub id: Uuid,
    pub post_id: i64,
    pub organizer_id: i64,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub post_id: i64,
    pub organizer_id: i64,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub url: String,
}
