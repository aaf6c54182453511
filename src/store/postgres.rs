use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use tracing::debug;

use crate::error::{is_unique_violation, IngestError, Result};
use crate::models::{ExtractedEvent, NewEvent, NewPost, Organizer, Post, PostStatus};
use crate::store::{CreatePostOutcome, EventStore};

const ORGANIZER_COLUMNS: &str = "id, handle, city, context_clues, last_updated_at";
const POST_COLUMNS: &str =
    "id, organizer_id, external_id, permalink, caption, posted_at, media_urls, extracted_text, status, completed_at";
const EVENT_COLUMNS: &str = "id, post_id, organizer_id, title, start_at, end_at, url";

/// Хранилище на Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_event_by_post(&self, post_id: i64) -> Result<ExtractedEvent> {
        let event = sqlx::query_as::<_, ExtractedEvent>(&format!(
            "SELECT {} FROM extracted_events WHERE post_id = $1",
            EVENT_COLUMNS
        ))
        .bind(post_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(event)
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn upsert_organizer(&self, handle: &str, city: &str, context_clues: &str) -> Result<Organizer> {
        // Вставка и чтение без промежутка "прочитал — создал": конфликт гасится индексом
        let inserted = sqlx::query_as::<_, Organizer>(&format!(
            "INSERT INTO organizers (handle, city, context_clues)
             VALUES ($1, $2, $3)
             ON CONFLICT (handle) DO NOTHING
             RETURNING {}",
            ORGANIZER_COLUMNS
        ))
        .bind(handle)
        .bind(city)
        .bind(context_clues)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                IngestError::PersistenceConflict(handle.to_string())
            } else {
                IngestError::Persistence(e)
            }
        })?;

        if let Some(organizer) = inserted {
            debug!(handle = %handle, id = organizer.id, "Organizer created");
            return Ok(organizer);
        }

        let existing = sqlx::query_as::<_, Organizer>(&format!(
            "SELECT {} FROM organizers WHERE handle = $1",
            ORGANIZER_COLUMNS
        ))
        .bind(handle)
        .fetch_one(&self.pool)
        .await?;
        Ok(existing)
    }

    async fn list_organizers(&self) -> Result<Vec<Organizer>> {
        let organizers = sqlx::query_as::<_, Organizer>(&format!(
            "SELECT {} FROM organizers ORDER BY last_updated_at, id",
            ORGANIZER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(organizers)
    }

    async fn touch_organizer(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE organizers SET last_updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_post_if_absent(&self, post: NewPost) -> Result<CreatePostOutcome> {
        let result = sqlx::query_as::<_, Post>(&format!(
            "INSERT INTO posts (organizer_id, external_id, permalink, caption, posted_at, media_urls)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (external_id) DO NOTHING
             RETURNING {}",
            POST_COLUMNS
        ))
        .bind(post.organizer_id)
        .bind(&post.external_id)
        .bind(&post.permalink)
        .bind(&post.caption)
        .bind(post.posted_at)
        .bind(Json(&post.media_urls))
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(created)) => Ok(CreatePostOutcome::Created(created)),
            Ok(None) => Ok(CreatePostOutcome::AlreadyKnown),
            Err(e) if is_unique_violation(&e) => Ok(CreatePostOutcome::AlreadyKnown),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_extracted_text(&self, post_id: i64, text: &str) -> Result<()> {
        sqlx::query("UPDATE posts SET extracted_text = $2 WHERE id = $1")
            .bind(post_id)
            .bind(text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_event(&self, event: NewEvent) -> Result<ExtractedEvent> {
        let created = sqlx::query_as::<_, ExtractedEvent>(&format!(
            "INSERT INTO extracted_events (id, post_id, organizer_id, title, start_at, end_at, url)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (post_id) DO NOTHING
             RETURNING {}",
            EVENT_COLUMNS
        ))
        .bind(uuid::Uuid::new_v4())
        .bind(event.post_id)
        .bind(event.organizer_id)
        .bind(&event.title)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(&event.url)
        .fetch_optional(&self.pool)
        .await?;

        match created {
            Some(created) => Ok(created),
            None => self.find_event_by_post(event.post_id).await,
        }
    }

    async fn mark_post_complete(&self, post_id: i64, status: PostStatus, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE posts
             SET status = $2, completed_at = COALESCE(completed_at, $3)
             WHERE id = $1",
        )
        .bind(post_id)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_unfinished_posts(&self, include_rejected: bool) -> Result<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(&format!(
            "SELECT {} FROM posts
             WHERE completed_at IS NULL OR ($1 AND status = 'rejected')
             ORDER BY posted_at",
            POST_COLUMNS
        ))
        .bind(include_rejected)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    async fn list_upcoming_events(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExtractedEvent>> {
        let events = sqlx::query_as::<_, ExtractedEvent>(&format!(
            "SELECT {} FROM extracted_events
             WHERE end_at > $1
             ORDER BY start_at
             LIMIT $2",
            EVENT_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
