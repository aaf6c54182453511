//! Хранилище организаторов, постов и извлечённых событий.
//!
//! Единственный общий изменяемый ресурс конвейера. Все изменения — одиночные
//! вставки/обновления; конфликты определяются уникальными индексами хранилища,
//! а не блокировками в приложении.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{ExtractedEvent, NewEvent, NewPost, Organizer, Post, PostStatus};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Результат попытки создать пост.
#[derive(Debug, Clone, PartialEq)]
pub enum CreatePostOutcome {
    Created(Post),
    /// Пост с таким внешним id уже есть: в этом запуске его пропускаем.
    AlreadyKnown,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Атомарно вставляет организатора или возвращает существующего.
    async fn upsert_organizer(&self, handle: &str, city: &str, context_clues: &str) -> Result<Organizer>;

    /// Все организаторы, самые давно обновлённые первыми.
    async fn list_organizers(&self) -> Result<Vec<Organizer>>;

    async fn touch_organizer(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    async fn create_post_if_absent(&self, post: NewPost) -> Result<CreatePostOutcome>;

    async fn save_extracted_text(&self, post_id: i64, text: &str) -> Result<()>;

    /// Создаёт событие поста. Повторный вызов для того же поста возвращает уже созданное.
    async fn create_event(&self, event: NewEvent) -> Result<ExtractedEvent>;

    /// Фиксирует решение по посту. Однажды выставленный `completed_at` не меняется.
    async fn mark_post_complete(&self, post_id: i64, status: PostStatus, at: DateTime<Utc>) -> Result<()>;

    /// Посты без решения; с `include_rejected` — ещё и отклонённые.
    async fn list_unfinished_posts(&self, include_rejected: bool) -> Result<Vec<Post>>;

    async fn list_upcoming_events(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExtractedEvent>>;
}
