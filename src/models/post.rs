use serde::Serialize;
use sqlx::FromRow;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Итог обработки поста. `Pending` — решение ещё не принято.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Accepted,
    Rejected,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Accepted => "accepted",
            PostStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown post status: {0}")]
pub struct UnknownStatus(String);

impl TryFrom<String> for PostStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(PostStatus::Pending),
            "accepted" => Ok(PostStatus::Accepted),
            "rejected" => Ok(PostStatus::Rejected),
            _ => Err(UnknownStatus(value)),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, PartialEq)]
pub struct Post {
    pub id: i64,
    pub organizer_id: i64,
    pub external_id: String,
    pub permalink: String,
    pub caption: Option<String>,
    pub posted_at: DateTime<Utc>,
    #[sqlx(json)]
    pub media_urls: Vec<String>,
    pub extracted_text: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: PostStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Данные для первичной вставки поста.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub organizer_id: i64,
    pub external_id: String,
    pub permalink: String,
    pub caption: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub media_urls: Vec<String>,
}
