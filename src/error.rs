//! error.rs
//!
//! Таксономия ошибок конвейера извлечения событий.
//!
//! Ошибки ловятся на двух границах: на уровне организатора и на уровне поста.
//! Наружу из точек входа (`ingest_all`, `ingest_one`, `fixup`) они не выходят,
//! кроме `UnknownSource` для запуска по имени.

use thiserror::Error;

use crate::services::rate_limit::UsageSignal;

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Сервис постов сообщил о превышении лимита. Фатально для текущего организатора.
    #[error("rate limited while fetching posts for {handle}: {usage}")]
    RateLimited { handle: String, usage: UsageSignal },

    #[error("failed to fetch posts: {0}")]
    SourceFetchFailed(String),

    #[error("malformed inference output: {0}")]
    MalformedInferenceOutput(#[from] MalformedOutput),

    #[error("text extraction failed: {0}")]
    Ocr(String),

    #[error("inference request failed: {0}")]
    Inference(String),

    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Нарушение уникальности при создании организатора.
    #[error("organizer {0} was created concurrently")]
    PersistenceConflict(String),

    #[error("source {0} is not configured")]
    UnknownSource(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Причина, по которой ответ модели не удалось превратить в `InferenceResult`.
#[derive(Debug, Error)]
pub enum MalformedOutput {
    #[error("no JSON object found in model output")]
    NoJsonObject,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Отсутствует обязательный ключ или у значения неверный тип.
    #[error("schema mismatch: {0}")]
    Schema(String),
}

impl IngestError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, IngestError::RateLimited { .. })
    }
}

/// Проверка на нарушение уникального индекса Postgres (SQLSTATE 23505).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}
