//! ingestion.rs
//!
//! Оркестратор конвейера: организаторы → посты → OCR → модель → нормализация → хранилище.
//!
//! Ключевые свойства:
//! 1.  **Изоляция сбоев**: ошибка организатора (лимит, сбой загрузки) не мешает остальным;
//!     ошибка поста не мешает соседним постам.
//! 2.  **Параллельность**: все организаторы запускаются одновременно, внутри организатора —
//!     все его посты. Порядок завершения не гарантируется. Внутри одного поста шаги
//!     строго последовательны: OCR, затем модель, затем сохранение.
//! 3.  **Fixup**: повторный прогон модели для постов без решения, без повторного OCR.
//! 4.  **Ограничение и отмена**: необязательный семафор на число одновременно
//!     обрабатываемых постов и общий токен отмены для всех вызовов ввода-вывода.

use chrono::Utc;
use chrono_tz::Tz;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{IngestConfig, SourceConfig};
use crate::error::{IngestError, MalformedOutput, Result};
use crate::models::{NewEvent, NewPost, Organizer, Post, PostStatus};
use crate::services::inference::{build_prompt, LanguageModel, PromptContext};
use crate::services::ocr::TextExtractor;
use crate::services::post_source::{ExternalPost, PostSource};
use crate::services::sanitizer::{Normalizer, Verdict};
use crate::store::{CreatePostOutcome, EventStore};

/// Внешние зависимости оркестратора.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn EventStore>,
    pub post_source: Arc<dyn PostSource>,
    pub extractor: Arc<dyn TextExtractor>,
    pub model: Arc<dyn LanguageModel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostOutcome {
    /// Пост уже известен хранилищу.
    Skipped,
    Accepted,
    Rejected,
    /// Жёсткая ошибка; пост остаётся без решения до следующего fixup.
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OrganizerReport {
    pub handle: String,
    pub fetched: usize,
    pub skipped: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl OrganizerReport {
    fn new(handle: &str) -> Self {
        Self { handle: handle.to_string(), ..Default::default() }
    }

    fn record(&mut self, outcome: PostOutcome) {
        match outcome {
            PostOutcome::Skipped => self.skipped += 1,
            PostOutcome::Accepted => self.accepted += 1,
            PostOutcome::Rejected => self.rejected += 1,
            PostOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RunSummary {
    pub organizers: Vec<OrganizerReport>,
    pub accepted: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub failed_posts: usize,
    pub failed_organizers: usize,
}

impl RunSummary {
    fn from_reports(organizers: Vec<OrganizerReport>) -> Self {
        let mut summary = RunSummary::default();
        for report in &organizers {
            summary.accepted += report.accepted;
            summary.rejected += report.rejected;
            summary.skipped += report.skipped;
            summary.failed_posts += report.failed;
            if report.error.is_some() {
                summary.failed_organizers += 1;
            }
        }
        summary.organizers = organizers;
        summary
    }

    pub fn report_for(&self, handle: &str) -> Option<&OrganizerReport> {
        self.organizers.iter().find(|r| r.handle == handle)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FixupSummary {
    pub attempted: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub error: Option<String>,
}

pub struct IngestionService {
    sources: Vec<SourceConfig>,
    deps: Collaborators,
    timezone: Tz,
    limiter: Option<Arc<Semaphore>>,
    max_organizers_per_run: Option<usize>,
    retry_rejected: bool,
    cancel: CancellationToken,
}

impl IngestionService {
    pub fn new(sources: Vec<SourceConfig>, deps: Collaborators, settings: &IngestConfig) -> Self {
        Self {
            sources,
            deps,
            timezone: settings.timezone,
            limiter: settings.max_concurrency.map(|n| Arc::new(Semaphore::new(n))),
            max_organizers_per_run: settings.max_organizers_per_run,
            retry_rejected: settings.retry_rejected,
            cancel: CancellationToken::new(),
        }
    }

    /// Токен, отмена которого прерывает все текущие вызовы ввода-вывода.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Обрабатывает все настроенные источники; давно не обновлявшиеся — первыми.
    pub async fn ingest_all(&self) -> RunSummary {
        let sources = self.run_order().await;
        info!(sources = sources.len(), "Starting ingestion of all sources");

        let reports = join_all(sources.iter().map(|source| self.ingest_source(source))).await;
        let summary = RunSummary::from_reports(reports);

        info!(
            organizers = summary.organizers.len(),
            accepted = summary.accepted,
            rejected = summary.rejected,
            skipped = summary.skipped,
            failed_posts = summary.failed_posts,
            failed_organizers = summary.failed_organizers,
            "Ingestion of all sources completed"
        );
        summary
    }

    /// Обрабатывает один источник по имени. Неизвестное имя — ошибка.
    pub async fn ingest_one(&self, handle: &str) -> Result<OrganizerReport> {
        let wanted = handle.trim_start_matches('@');
        let source = self
            .sources
            .iter()
            .find(|s| s.handle == wanted)
            .ok_or_else(|| IngestError::UnknownSource(wanted.to_string()))?;

        info!(handle = %source.handle, "Starting ingestion of one source");
        let report = self.ingest_source(source).await;
        info!(
            handle = %report.handle,
            accepted = report.accepted,
            rejected = report.rejected,
            skipped = report.skipped,
            failed = report.failed,
            "Ingestion of one source completed"
        );
        Ok(report)
    }

    /// Повторяет модель и нормализацию для постов без решения. OCR не запускается.
    pub async fn fixup(&self) -> FixupSummary {
        info!(retry_rejected = self.retry_rejected, "Starting fixup pass");
        let mut summary = FixupSummary::default();

        let loaded = async {
            let posts = self.guarded(self.deps.store.list_unfinished_posts(self.retry_rejected)).await?;
            let organizers = self.guarded(self.deps.store.list_organizers()).await?;
            Ok::<_, IngestError>((posts, organizers))
        };
        let (posts, organizers) = match loaded.await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(error = %e, "Fixup pass could not load unfinished posts");
                summary.error = Some(e.to_string());
                return summary;
            }
        };
        let organizers: HashMap<i64, Organizer> = organizers.into_iter().map(|o| (o.id, o)).collect();

        let outcomes = join_all(posts.iter().map(|post| self.fixup_post(&organizers, post))).await;
        summary.attempted = outcomes.len();
        for outcome in outcomes {
            match outcome {
                PostOutcome::Accepted => summary.accepted += 1,
                PostOutcome::Rejected => summary.rejected += 1,
                PostOutcome::Failed => summary.failed += 1,
                PostOutcome::Skipped => {}
            }
        }

        info!(
            attempted = summary.attempted,
            accepted = summary.accepted,
            rejected = summary.rejected,
            failed = summary.failed,
            "Fixup pass completed"
        );
        summary
    }

    // --- Организатор ---

    async fn run_order(&self) -> Vec<&SourceConfig> {
        let mut sources: Vec<&SourceConfig> = self.sources.iter().collect();

        match self.guarded(self.deps.store.list_organizers()).await {
            Ok(known) => {
                let freshness: HashMap<&str, _> =
                    known.iter().map(|o| (o.handle.as_str(), o.last_updated_at)).collect();
                // Неизвестные хранилищу источники идут первыми, как и новые организаторы
                sources.sort_by_key(|s| freshness.get(s.handle.as_str()).copied());
            }
            Err(e) => warn!(error = %e, "Could not order sources by freshness, using configured order"),
        }

        if let Some(max) = self.max_organizers_per_run {
            sources.truncate(max);
        }
        sources
    }

    /// Граница изоляции организатора: любая ошибка превращается в отчёт без событий.
    async fn ingest_source(&self, source: &SourceConfig) -> OrganizerReport {
        match self.process_organizer(source).await {
            Ok(report) => {
                info!(
                    handle = %report.handle,
                    fetched = report.fetched,
                    accepted = report.accepted,
                    rejected = report.rejected,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Organizer processed"
                );
                report
            }
            Err(e) => {
                if e.is_rate_limited() {
                    warn!(handle = %source.handle, error = %e, "Organizer halted by rate limit");
                } else {
                    error!(handle = %source.handle, error = %e, "Organizer ingestion failed");
                }
                let mut report = OrganizerReport::new(&source.handle);
                report.error = Some(e.to_string());
                report
            }
        }
    }

    async fn process_organizer(&self, source: &SourceConfig) -> Result<OrganizerReport> {
        let organizer = self.upsert_organizer(source).await?;
        let fetched = self.guarded(self.deps.post_source.fetch_recent(&source.handle)).await?;
        let posts = fetched.into_checked(&source.handle)?;

        let mut report = OrganizerReport::new(&source.handle);
        report.fetched = posts.len();

        let outcomes = join_all(posts.into_iter().map(|post| self.ingest_post(&organizer, post))).await;
        for outcome in outcomes {
            report.record(outcome);
        }

        if let Err(e) = self.guarded(self.deps.store.touch_organizer(organizer.id, Utc::now())).await {
            warn!(handle = %organizer.handle, error = %e, "Failed to update organizer timestamp");
        }
        Ok(report)
    }

    async fn upsert_organizer(&self, source: &SourceConfig) -> Result<Organizer> {
        let upsert = || {
            self.deps
                .store
                .upsert_organizer(&source.handle, &source.city, &source.context_clues)
        };
        match self.guarded(upsert()).await {
            // Организатора только что создал параллельный запуск: перечитываем
            Err(IngestError::PersistenceConflict(handle)) => {
                debug!(handle = %handle, "Organizer created concurrently, re-reading");
                self.guarded(upsert()).await
            }
            other => other,
        }
    }

    // --- Пост ---

    /// Граница изоляции поста.
    async fn ingest_post(&self, organizer: &Organizer, external: ExternalPost) -> PostOutcome {
        let _permit = self.permit().await;
        let external_id = external.id.clone();

        match self.try_ingest_post(organizer, external).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(handle = %organizer.handle, external_id = %external_id, error = %e, "Post processing failed");
                PostOutcome::Failed
            }
        }
    }

    async fn try_ingest_post(&self, organizer: &Organizer, external: ExternalPost) -> Result<PostOutcome> {
        let new_post = NewPost {
            organizer_id: organizer.id,
            external_id: external.id,
            permalink: external.permalink,
            caption: external.caption,
            posted_at: external.timestamp,
            media_urls: external.media_urls,
        };
        let post = match self.guarded(self.deps.store.create_post_if_absent(new_post)).await? {
            CreatePostOutcome::Created(post) => post,
            CreatePostOutcome::AlreadyKnown => return Ok(PostOutcome::Skipped),
        };

        // Сбой OCR означает "текста нет", а не сбой поста
        let text = match self.guarded(self.deps.extractor.extract_text(&post.media_urls)).await {
            Ok(text) => text,
            Err(IngestError::Cancelled) => return Err(IngestError::Cancelled),
            Err(e) => {
                warn!(post_id = post.id, error = %e, "Text extraction failed, continuing without text");
                None
            }
        };
        if let Some(text) = &text {
            self.guarded(self.deps.store.save_extracted_text(post.id, text)).await?;
        }

        self.decide(organizer, &post, text.as_deref()).await
    }

    async fn fixup_post(&self, organizers: &HashMap<i64, Organizer>, post: &Post) -> PostOutcome {
        let _permit = self.permit().await;

        let Some(organizer) = organizers.get(&post.organizer_id) else {
            error!(post_id = post.id, organizer_id = post.organizer_id, "Post references unknown organizer");
            return PostOutcome::Failed;
        };

        match self.decide(organizer, post, post.extracted_text.as_deref()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(handle = %organizer.handle, post_id = post.id, error = %e, "Fixup of post failed");
                PostOutcome::Failed
            }
        }
    }

    /// Модель, нормализация и сохранение решения.
    async fn decide(&self, organizer: &Organizer, post: &Post, text: Option<&str>) -> Result<PostOutcome> {
        let normalizer = Normalizer::new(self.timezone);
        let prompt = build_prompt(&PromptContext {
            handle: &organizer.handle,
            city: &organizer.city,
            context_clues: &organizer.context_clues,
            caption: post.caption.as_deref(),
            media_urls: &post.media_urls,
            extracted_text: text,
            today: Utc::now().with_timezone(&self.timezone).date_naive(),
        });

        let raw = self
            .guarded(self.deps.model.complete(&prompt))
            .await?
            .ok_or(MalformedOutput::NoJsonObject)?;

        match normalizer.evaluate(&raw)? {
            Verdict::Accepted(accepted) => {
                let event = self
                    .guarded(self.deps.store.create_event(NewEvent {
                        post_id: post.id,
                        organizer_id: organizer.id,
                        title: accepted.title,
                        start_at: accepted.start,
                        end_at: accepted.end,
                        url: post.permalink.clone(),
                    }))
                    .await?;
                self.guarded(self.deps.store.mark_post_complete(post.id, PostStatus::Accepted, Utc::now()))
                    .await?;
                info!(
                    handle = %organizer.handle,
                    post_id = post.id,
                    event_id = %event.id,
                    title = %event.title,
                    start = %event.start_at,
                    end = %event.end_at,
                    "Event extracted"
                );
                Ok(PostOutcome::Accepted)
            }
            Verdict::Rejected(reason) => {
                self.guarded(self.deps.store.mark_post_complete(post.id, PostStatus::Rejected, Utc::now()))
                    .await?;
                info!(handle = %organizer.handle, post_id = post.id, reason = reason.as_str(), "Post is not an event");
                Ok(PostOutcome::Rejected)
            }
        }
    }

    // --- Утилиты ---

    async fn permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.limiter {
            Some(limiter) => limiter.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    /// Выполняет операцию, если она не была отменена раньше.
    async fn guarded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            result = operation => result,
        }
    }
}
