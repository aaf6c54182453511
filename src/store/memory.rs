//! Хранилище в памяти: для тестов и пробных запусков без базы.
//! Повторяет ограничения уникальности Postgres-схемы.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::models::{ExtractedEvent, NewEvent, NewPost, Organizer, Post, PostStatus};
use crate::store::{CreatePostOutcome, EventStore};

#[derive(Default)]
struct Inner {
    organizers: Vec<Organizer>,
    posts: Vec<Post>,
    events: Vec<ExtractedEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn posts(&self) -> Vec<Post> {
        self.lock().posts.clone()
    }

    pub fn events(&self) -> Vec<ExtractedEvent> {
        self.lock().events.clone()
    }

    pub fn organizers(&self) -> Vec<Organizer> {
        self.lock().organizers.clone()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_organizer(&self, handle: &str, city: &str, context_clues: &str) -> Result<Organizer> {
        let mut inner = self.lock();
        if let Some(existing) = inner.organizers.iter().find(|o| o.handle == handle) {
            return Ok(existing.clone());
        }
        let organizer = Organizer {
            id: inner.organizers.len() as i64 + 1,
            handle: handle.to_string(),
            city: city.to_string(),
            context_clues: context_clues.to_string(),
            last_updated_at: DateTime::UNIX_EPOCH,
        };
        inner.organizers.push(organizer.clone());
        Ok(organizer)
    }

    async fn list_organizers(&self) -> Result<Vec<Organizer>> {
        let mut organizers = self.lock().organizers.clone();
        organizers.sort_by_key(|o| (o.last_updated_at, o.id));
        Ok(organizers)
    }

    async fn touch_organizer(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(organizer) = self.lock().organizers.iter_mut().find(|o| o.id == id) {
            organizer.last_updated_at = at;
        }
        Ok(())
    }

    async fn create_post_if_absent(&self, post: NewPost) -> Result<CreatePostOutcome> {
        let mut inner = self.lock();
        if inner.posts.iter().any(|p| p.external_id == post.external_id) {
            return Ok(CreatePostOutcome::AlreadyKnown);
        }
        let created = Post {
            id: inner.posts.len() as i64 + 1,
            organizer_id: post.organizer_id,
            external_id: post.external_id,
            permalink: post.permalink,
            caption: post.caption,
            posted_at: post.posted_at,
            media_urls: post.media_urls,
            extracted_text: None,
            status: PostStatus::Pending,
            completed_at: None,
        };
        inner.posts.push(created.clone());
        Ok(CreatePostOutcome::Created(created))
    }

    async fn save_extracted_text(&self, post_id: i64, text: &str) -> Result<()> {
        if let Some(post) = self.lock().posts.iter_mut().find(|p| p.id == post_id) {
            post.extracted_text = Some(text.to_string());
        }
        Ok(())
    }

    async fn create_event(&self, event: NewEvent) -> Result<ExtractedEvent> {
        let mut inner = self.lock();
        if let Some(existing) = inner.events.iter().find(|e| e.post_id == event.post_id) {
            return Ok(existing.clone());
        }
        let created = ExtractedEvent {
            id: uuid::Uuid::new_v4(),
            post_id: event.post_id,
            organizer_id: event.organizer_id,
            title: event.title,
            start_at: event.start_at,
            end_at: event.end_at,
            url: event.url,
        };
        inner.events.push(created.clone());
        Ok(created)
    }

    async fn mark_post_complete(&self, post_id: i64, status: PostStatus, at: DateTime<Utc>) -> Result<()> {
        if let Some(post) = self.lock().posts.iter_mut().find(|p| p.id == post_id) {
            post.status = status;
            post.completed_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn list_unfinished_posts(&self, include_rejected: bool) -> Result<Vec<Post>> {
        let mut posts: Vec<Post> = self
            .lock()
            .posts
            .iter()
            .filter(|p| p.completed_at.is_none() || (include_rejected && p.status == PostStatus::Rejected))
            .cloned()
            .collect();
        posts.sort_by_key(|p| p.posted_at);
        Ok(posts)
    }

    async fn list_upcoming_events(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExtractedEvent>> {
        let mut events: Vec<ExtractedEvent> = self
            .lock()
            .events
            .iter()
            .filter(|e| e.end_at > now)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.start_at);
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }
}
