use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use event_ingest::config::{IngestConfig, SourceConfig};
use event_ingest::error::{IngestError, Result};
use event_ingest::models::{ExtractedEvent, NewEvent, NewPost, Organizer, Post, PostStatus};
use event_ingest::services::inference::LanguageModel;
use event_ingest::services::ingestion::{Collaborators, IngestionService};
use event_ingest::services::ocr::TextExtractor;
use event_ingest::services::post_source::{ExternalPost, FetchedPosts, PostSource};
use event_ingest::services::rate_limit::UsageSignal;
use event_ingest::store::{CreatePostOutcome, EventStore, MemoryStore};

// --- Fakes ---

enum Feed {
    Posts(Vec<ExternalPost>),
    Limited(Vec<ExternalPost>),
    Broken(&'static str),
}

#[derive(Default)]
struct FakeSource {
    feeds: HashMap<String, Feed>,
}

impl FakeSource {
    fn with(mut self, handle: &str, feed: Feed) -> Self {
        self.feeds.insert(handle.to_string(), feed);
        self
    }
}

#[async_trait]
impl PostSource for FakeSource {
    async fn fetch_recent(&self, handle: &str) -> Result<FetchedPosts> {
        match self.feeds.get(handle) {
            Some(Feed::Posts(posts)) => Ok(FetchedPosts {
                posts: posts.clone(),
                usage: Some(UsageSignal { call_count: 12.0, total_cputime: 3.0, total_time: 4.0 }),
            }),
            Some(Feed::Limited(posts)) => Ok(FetchedPosts {
                posts: posts.clone(),
                usage: Some(UsageSignal { call_count: 100.0, total_cputime: 20.0, total_time: 30.0 }),
            }),
            Some(Feed::Broken(message)) => Err(IngestError::SourceFetchFailed(message.to_string())),
            None => Ok(FetchedPosts::default()),
        }
    }
}

struct FakeOcr {
    text: Option<&'static str>,
    calls: AtomicUsize,
}

impl FakeOcr {
    fn reading(text: &'static str) -> Self {
        Self { text: Some(text), calls: AtomicUsize::new(0) }
    }

    fn broken() -> Self {
        Self { text: None, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl TextExtractor for FakeOcr {
    async fn extract_text(&self, media_urls: &[String]) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if media_urls.is_empty() {
            return Ok(None);
        }
        match self.text {
            Some(text) => Ok(Some(text.to_string())),
            None => Err(IngestError::Ocr("image could not be downloaded".into())),
        }
    }
}

/// Отвечает по очереди; последний ответ повторяется.
struct FakeModel {
    replies: Mutex<VecDeque<Option<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl FakeModel {
    fn replying(replies: Vec<Option<String>>) -> Self {
        Self { replies: Mutex::new(replies.into()), prompts: Mutex::new(vec![]) }
    }

    fn always(reply: Value) -> Self {
        Self::replying(vec![Some(reply.to_string())])
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn complete(&self, prompt: &str) -> Result<Option<String>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut replies = self.replies.lock().unwrap();
        let reply = if replies.len() > 1 { replies.pop_front() } else { replies.front().cloned() };
        Ok(reply.flatten())
    }
}

/// Первое создание организатора проигрывает гонку с параллельным запуском.
struct ConflictOnceStore {
    inner: MemoryStore,
    upserts: AtomicUsize,
}

#[async_trait]
impl EventStore for ConflictOnceStore {
    async fn upsert_organizer(&self, handle: &str, city: &str, context_clues: &str) -> Result<Organizer> {
        if self.upserts.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.upsert_organizer(handle, city, context_clues).await?;
            return Err(IngestError::PersistenceConflict(handle.to_string()));
        }
        self.inner.upsert_organizer(handle, city, context_clues).await
    }

    async fn list_organizers(&self) -> Result<Vec<Organizer>> {
        self.inner.list_organizers().await
    }

    async fn touch_organizer(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.inner.touch_organizer(id, at).await
    }

    async fn create_post_if_absent(&self, post: NewPost) -> Result<CreatePostOutcome> {
        self.inner.create_post_if_absent(post).await
    }

    async fn save_extracted_text(&self, post_id: i64, text: &str) -> Result<()> {
        self.inner.save_extracted_text(post_id, text).await
    }

    async fn create_event(&self, event: NewEvent) -> Result<ExtractedEvent> {
        self.inner.create_event(event).await
    }

    async fn mark_post_complete(&self, post_id: i64, status: PostStatus, at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_post_complete(post_id, status, at).await
    }

    async fn list_unfinished_posts(&self, include_rejected: bool) -> Result<Vec<Post>> {
        self.inner.list_unfinished_posts(include_rejected).await
    }

    async fn list_upcoming_events(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExtractedEvent>> {
        self.inner.list_upcoming_events(now, limit).await
    }
}

// --- Fixtures ---

const DEMO_OCR_TEXT: &str = "Live Music 8pm-10pm Friday Dec 29";

fn demo_reply() -> Value {
    json!({
        "isEvent": true,
        "title": "Live Music",
        "startHourMilitaryTime": 20,
        "endHourMilitaryTime": 22,
        "startMinute": 0,
        "endMinute": 0,
        "startDay": 29,
        "endDay": 29,
        "startMonth": 12,
        "endMonth": 12,
        "startYear": 2023,
        "endYear": null,
        "hasStartHourInPost": true,
        "isPastEvent": false
    })
}

fn not_an_event_reply() -> Value {
    let mut reply = demo_reply();
    reply["isEvent"] = json!(false);
    reply
}

fn post(id: &str) -> ExternalPost {
    ExternalPost {
        id: id.to_string(),
        permalink: format!("https://www.instagram.com/p/{}/", id),
        caption: Some("Join us Friday!".to_string()),
        timestamp: Utc.with_ymd_and_hms(2023, 12, 26, 18, 0, 0).unwrap(),
        media_urls: vec![format!("https://cdn.example.com/{}.jpg", id)],
    }
}

fn source(handle: &str) -> SourceConfig {
    SourceConfig {
        handle: handle.to_string(),
        city: "Los Angeles".to_string(),
        context_clues: "Jazz bar in Echo Park".to_string(),
    }
}

fn utc(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    ocr: Arc<FakeOcr>,
    model: Arc<FakeModel>,
    service: IngestionService,
}

fn harness_with(
    sources: Vec<SourceConfig>,
    feed: FakeSource,
    ocr: FakeOcr,
    model: FakeModel,
    settings: IngestConfig,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let ocr = Arc::new(ocr);
    let model = Arc::new(model);
    let deps = Collaborators {
        store: store.clone(),
        post_source: Arc::new(feed),
        extractor: ocr.clone(),
        model: model.clone(),
    };
    let service = IngestionService::new(sources, deps, &settings);
    Harness { store, ocr, model, service }
}

fn harness(sources: Vec<SourceConfig>, feed: FakeSource, model: FakeModel) -> Harness {
    harness_with(sources, feed, FakeOcr::reading(DEMO_OCR_TEXT), model, IngestConfig::default())
}

// --- Scenarios ---

#[tokio::test]
async fn demo_post_becomes_one_event() {
    let h = harness(
        vec![source("demo_user")],
        FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeModel::always(demo_reply()),
    );

    let summary = h.service.ingest_all().await;
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.failed_organizers, 0);

    let events = h.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].title, "Live Music");
    assert_eq!(events[0].start_at, utc("2023-12-30T04:00:00Z"));
    assert_eq!(events[0].end_at, utc("2023-12-30T06:00:00Z"));
    assert_eq!(events[0].url, "https://www.instagram.com/p/p1/");

    let posts = h.store.posts();
    assert_eq!(posts[0].status, PostStatus::Accepted);
    assert!(posts[0].completed_at.is_some());
    assert_eq!(posts[0].extracted_text.as_deref(), Some(DEMO_OCR_TEXT));

    let organizer = &h.store.organizers()[0];
    assert!(organizer.last_updated_at > DateTime::UNIX_EPOCH);

    let prompt = h.model.last_prompt();
    assert!(prompt.contains("@demo_user"));
    assert!(prompt.contains("Join us Friday!"));
    assert!(prompt.contains(DEMO_OCR_TEXT));
}

#[tokio::test]
async fn rate_limited_organizer_does_not_stop_others() {
    let h = harness(
        vec![source("busy_venue"), source("demo_user")],
        FakeSource::default()
            .with("busy_venue", Feed::Limited(vec![post("busy-1")]))
            .with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeModel::always(demo_reply()),
    );

    let summary = h.service.ingest_all().await;
    assert_eq!(summary.failed_organizers, 1);
    assert_eq!(summary.accepted, 1);

    let busy = summary.report_for("busy_venue").unwrap();
    assert!(busy.error.is_some());
    assert_eq!(busy.fetched, 0);
    assert!(summary.report_for("demo_user").unwrap().error.is_none());

    // Посты ограниченного организатора не создаются
    let posts = h.store.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].external_id, "p1");

    let busy_organizer = h
        .store
        .organizers()
        .into_iter()
        .find(|o| o.handle == "busy_venue")
        .unwrap();
    assert_eq!(busy_organizer.last_updated_at, DateTime::UNIX_EPOCH);
}

#[tokio::test]
async fn failed_fetch_is_isolated_to_its_organizer() {
    let h = harness(
        vec![source("gone_venue"), source("demo_user")],
        FakeSource::default()
            .with("gone_venue", Feed::Broken("Invalid user id"))
            .with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeModel::always(demo_reply()),
    );

    let summary = h.service.ingest_all().await;
    let gone = summary.report_for("gone_venue").unwrap();
    assert!(gone.error.as_deref().unwrap().contains("Invalid user id"));
    assert_eq!(h.store.events().len(), 1);
}

#[tokio::test]
async fn replaying_a_run_creates_nothing_new() {
    let h = harness(
        vec![source("demo_user")],
        FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1"), post("p2")])),
        FakeModel::always(demo_reply()),
    );

    h.service.ingest_all().await;
    let second = h.service.ingest_all().await;

    assert_eq!(second.skipped, 2);
    assert_eq!(second.accepted, 0);
    assert_eq!(h.store.posts().len(), 2);
    assert_eq!(h.store.events().len(), 2);
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_output_leaves_post_for_fixup() {
    let h = harness(
        vec![source("demo_user")],
        FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeModel::replying(vec![Some("I could not find an event".into()), Some(demo_reply().to_string())]),
    );

    let run = h.service.ingest_all().await;
    assert_eq!(run.failed_posts, 1);
    assert!(h.store.events().is_empty());
    let pending = &h.store.posts()[0];
    assert_eq!(pending.status, PostStatus::Pending);
    assert!(pending.completed_at.is_none());

    let fixup = h.service.fixup().await;
    assert_eq!(fixup.attempted, 1);
    assert_eq!(fixup.accepted, 1);
    assert_eq!(h.store.events().len(), 1);
    assert_eq!(h.store.posts()[0].status, PostStatus::Accepted);

    // Fixup переиспользует сохранённый текст и не запускает OCR повторно
    assert_eq!(h.ocr.calls.load(Ordering::SeqCst), 1);
    assert!(h.model.last_prompt().contains(DEMO_OCR_TEXT));

    let again = h.service.fixup().await;
    assert_eq!(again.attempted, 0);
}

#[tokio::test]
async fn empty_model_reply_is_a_failure() {
    let h = harness(
        vec![source("demo_user")],
        FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeModel::replying(vec![None]),
    );

    let run = h.service.ingest_all().await;
    assert_eq!(run.failed_posts, 1);
    assert!(h.store.posts()[0].completed_at.is_none());
}

#[tokio::test]
async fn rejected_post_is_completed_without_event() {
    let h = harness(
        vec![source("demo_user")],
        FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeModel::always(not_an_event_reply()),
    );

    let run = h.service.ingest_all().await;
    assert_eq!(run.rejected, 1);
    assert!(h.store.events().is_empty());

    let stored = &h.store.posts()[0];
    assert_eq!(stored.status, PostStatus::Rejected);
    assert!(stored.completed_at.is_some());

    assert_eq!(h.service.fixup().await.attempted, 0);
}

#[tokio::test]
async fn rejected_posts_are_retried_when_enabled() {
    let settings = IngestConfig { retry_rejected: true, ..IngestConfig::default() };
    let h = harness_with(
        vec![source("demo_user")],
        FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeOcr::reading(DEMO_OCR_TEXT),
        FakeModel::replying(vec![Some(not_an_event_reply().to_string()), Some(demo_reply().to_string())]),
        settings,
    );

    h.service.ingest_all().await;
    let first_completion = h.store.posts()[0].completed_at;

    let fixup = h.service.fixup().await;
    assert_eq!(fixup.attempted, 1);
    assert_eq!(fixup.accepted, 1);

    let stored = &h.store.posts()[0];
    assert_eq!(stored.status, PostStatus::Accepted);
    assert_eq!(stored.completed_at, first_completion);
}

#[tokio::test]
async fn ocr_failure_is_treated_as_no_text() {
    let h = harness_with(
        vec![source("demo_user")],
        FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeOcr::broken(),
        FakeModel::always(demo_reply()),
        IngestConfig::default(),
    );

    let run = h.service.ingest_all().await;
    assert_eq!(run.accepted, 1);
    assert!(h.store.posts()[0].extracted_text.is_none());
    assert!(h.model.last_prompt().contains("No text could be read"));
}

#[tokio::test]
async fn ingest_one_rejects_unknown_handle() {
    let h = harness(vec![source("demo_user")], FakeSource::default(), FakeModel::always(demo_reply()));

    let err = h.service.ingest_one("nobody").await.unwrap_err();
    assert!(matches!(err, IngestError::UnknownSource(handle) if handle == "nobody"));
    assert!(h.store.organizers().is_empty());
}

#[tokio::test]
async fn ingest_one_processes_only_that_source() {
    let h = harness(
        vec![source("demo_user"), source("other_venue")],
        FakeSource::default()
            .with("demo_user", Feed::Posts(vec![post("p1")]))
            .with("other_venue", Feed::Posts(vec![post("o1")])),
        FakeModel::always(demo_reply()),
    );

    let report = h.service.ingest_one("@demo_user").await.unwrap();
    assert_eq!(report.handle, "demo_user");
    assert_eq!(report.accepted, 1);
    assert_eq!(h.store.posts().len(), 1);
    assert_eq!(h.store.organizers().len(), 1);
}

#[tokio::test]
async fn capped_runs_take_stalest_organizers_first() {
    let settings = IngestConfig { max_organizers_per_run: Some(1), ..IngestConfig::default() };
    let h = harness_with(
        vec![source("first_venue"), source("second_venue")],
        FakeSource::default()
            .with("first_venue", Feed::Posts(vec![post("f1")]))
            .with("second_venue", Feed::Posts(vec![post("s1")])),
        FakeOcr::reading(DEMO_OCR_TEXT),
        FakeModel::always(demo_reply()),
        settings,
    );

    let first = h.service.ingest_all().await;
    assert_eq!(first.organizers.len(), 1);
    assert_eq!(first.organizers[0].handle, "first_venue");

    let second = h.service.ingest_all().await;
    assert_eq!(second.organizers.len(), 1);
    assert_eq!(second.organizers[0].handle, "second_venue");
}

#[tokio::test]
async fn bounded_concurrency_still_processes_every_post() {
    let settings = IngestConfig { max_concurrency: Some(1), ..IngestConfig::default() };
    let h = harness_with(
        vec![source("demo_user"), source("other_venue")],
        FakeSource::default()
            .with("demo_user", Feed::Posts(vec![post("p1"), post("p2"), post("p3")]))
            .with("other_venue", Feed::Posts(vec![post("o1")])),
        FakeOcr::reading(DEMO_OCR_TEXT),
        FakeModel::always(demo_reply()),
        settings,
    );

    let summary = h.service.ingest_all().await;
    assert_eq!(summary.accepted, 4);
    assert_eq!(h.store.events().len(), 4);
}

#[tokio::test]
async fn cancelled_service_stores_nothing() {
    let h = harness(
        vec![source("demo_user")],
        FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeModel::always(demo_reply()),
    );
    h.service.cancellation_token().cancel();

    let summary = h.service.ingest_all().await;
    assert_eq!(summary.failed_organizers, 1);
    assert!(h.store.posts().is_empty());
    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn upcoming_events_are_listed_in_start_order() {
    let h = harness(
        vec![source("demo_user")],
        FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1")])),
        FakeModel::always(demo_reply()),
    );
    h.service.ingest_all().await;

    let before = utc("2023-12-01T00:00:00Z");
    let upcoming = h.store.list_upcoming_events(before, 10).await.unwrap();
    assert_eq!(upcoming.len(), 1);

    let after = utc("2024-01-01T00:00:00Z");
    assert!(h.store.list_upcoming_events(after, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn organizer_created_concurrently_is_reread_and_processed() {
    let store = Arc::new(ConflictOnceStore { inner: MemoryStore::new(), upserts: AtomicUsize::new(0) });
    let deps = Collaborators {
        store: store.clone(),
        post_source: Arc::new(FakeSource::default().with("demo_user", Feed::Posts(vec![post("p1")]))),
        extractor: Arc::new(FakeOcr::reading(DEMO_OCR_TEXT)),
        model: Arc::new(FakeModel::always(demo_reply())),
    };
    let service = IngestionService::new(vec![source("demo_user")], deps, &IngestConfig::default());

    let report = service.ingest_one("demo_user").await.unwrap();
    assert!(report.error.is_none());
    assert_eq!(report.accepted, 1);
    assert_eq!(store.upserts.load(Ordering::SeqCst), 2);

    assert_eq!(store.inner.organizers().len(), 1);
    let events = store.inner.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].organizer_id, store.inner.organizers()[0].id);
}
