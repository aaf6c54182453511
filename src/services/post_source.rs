//! post_source.rs
//!
//! Получение последних постов организатора через Graph API (business discovery).
//!
//! Вместе с постами возвращается сигнал загрузки из заголовка `x-app-usage`.
//! Перед использованием постов вызывающий код обязан пропустить ответ через
//! `FetchedPosts::into_checked`, который применяет проверку лимита.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::GraphConfig;
use crate::error::{IngestError, Result};
use crate::services::rate_limit::{check_usage, RateDecision, UsageSignal, USAGE_HEADER};

/// Пост в том виде, в каком его отдал источник.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalPost {
    pub id: String,
    pub permalink: String,
    pub caption: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub media_urls: Vec<String>,
}

/// Ответ источника: посты и (необязательный) сигнал загрузки.
#[derive(Debug, Clone, Default)]
pub struct FetchedPosts {
    pub posts: Vec<ExternalPost>,
    pub usage: Option<UsageSignal>,
}

impl FetchedPosts {
    /// Отдаёт посты, если лимит не исчерпан, иначе `RateLimited`.
    pub fn into_checked(self, handle: &str) -> Result<Vec<ExternalPost>> {
        match (check_usage(self.usage.as_ref()), self.usage) {
            (RateDecision::Halt, Some(usage)) => Err(IngestError::RateLimited {
                handle: handle.to_string(),
                usage,
            }),
            _ => Ok(self.posts),
        }
    }
}

#[async_trait]
pub trait PostSource: Send + Sync {
    async fn fetch_recent(&self, handle: &str) -> Result<FetchedPosts>;
}

// --- Модели ответа Graph API ---

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    business_discovery: Option<BusinessDiscovery>,
    error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct BusinessDiscovery {
    media: Option<MediaPage>,
}

#[derive(Debug, Deserialize)]
struct MediaPage {
    #[serde(default)]
    data: Vec<GraphMedia>,
}

#[derive(Debug, Deserialize)]
struct GraphMedia {
    id: String,
    #[serde(default)]
    permalink: String,
    caption: Option<String>,
    timestamp: String,
    media_type: Option<String>,
    media_url: Option<String>,
    thumbnail_url: Option<String>,
    children: Option<MediaChildren>,
}

#[derive(Debug, Deserialize)]
struct MediaChildren {
    #[serde(default)]
    data: Vec<ChildMedia>,
}

#[derive(Debug, Deserialize)]
struct ChildMedia {
    media_url: Option<String>,
}

impl GraphMedia {
    /// Для карусели берём картинки детей, для видео — превью.
    fn media_urls(&self) -> Vec<String> {
        match self.media_type.as_deref() {
            Some("CAROUSEL_ALBUM") => self
                .children
                .iter()
                .flat_map(|c| c.data.iter())
                .filter_map(|child| child.media_url.clone())
                .collect(),
            Some("VIDEO") => self.thumbnail_url.iter().cloned().collect(),
            _ => self.media_url.iter().cloned().collect(),
        }
    }

    fn into_post(self) -> Option<ExternalPost> {
        // Graph API отдаёт смещение без двоеточия: 2023-12-26T18:00:00+0000
        let timestamp = match DateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%z") {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => {
                warn!(post_id = %self.id, timestamp = %self.timestamp, error = %e, "Skipping post with unparsable timestamp");
                return None;
            }
        };
        let media_urls = self.media_urls();

        Some(ExternalPost {
            id: self.id,
            permalink: self.permalink,
            caption: self.caption,
            timestamp,
            media_urls,
        })
    }
}

/// Клиент Graph API.
#[derive(Clone)]
pub struct GraphClient {
    base_url: String,
    access_token: String,
    business_account_id: String,
    posts_per_source: u32,
    http_client: reqwest::Client,
}

impl GraphClient {
    pub fn from_config(config: &GraphConfig, posts_per_source: u32) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| IngestError::SourceFetchFailed(e.to_string()))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            business_account_id: config.business_account_id.clone(),
            posts_per_source,
            http_client,
        })
    }

    fn fields(&self, handle: &str) -> String {
        format!(
            "business_discovery.username({}){{media.limit({}){{id,permalink,caption,timestamp,media_type,media_url,thumbnail_url,children{{media_url}}}}}}",
            handle, self.posts_per_source
        )
    }
}

#[async_trait]
impl PostSource for GraphClient {
    async fn fetch_recent(&self, handle: &str) -> Result<FetchedPosts> {
        let fields = self.fields(handle);
        let response = self
            .http_client
            .get(format!("{}/{}", self.base_url, self.business_account_id))
            .query(&[("fields", fields.as_str()), ("access_token", self.access_token.as_str())])
            .send()
            .await
            .map_err(|e| IngestError::SourceFetchFailed(e.to_string()))?;

        let usage = response
            .headers()
            .get(USAGE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(UsageSignal::from_header);
        let status = response.status();

        let text = response
            .text()
            .await
            .map_err(|e| IngestError::SourceFetchFailed(e.to_string()))?;

        // Тело с объектом error — жёсткая ошибка, сообщение передаём как есть.
        let body: DiscoveryResponse = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if !status.is_success() => {
                return Err(IngestError::SourceFetchFailed(format!("graph api returned {}", status)));
            }
            Err(e) => return Err(IngestError::SourceFetchFailed(e.to_string())),
        };
        if let Some(error) = body.error {
            return Err(IngestError::SourceFetchFailed(error.message));
        }
        if !status.is_success() {
            return Err(IngestError::SourceFetchFailed(format!("graph api returned {}", status)));
        }

        let posts: Vec<ExternalPost> = body
            .business_discovery
            .and_then(|discovery| discovery.media)
            .map(|page| page.data)
            .unwrap_or_default()
            .into_iter()
            .filter_map(GraphMedia::into_post)
            .collect();

        debug!(handle = %handle, posts = posts.len(), usage = ?usage, "Fetched recent posts");

        Ok(FetchedPosts { posts, usage })
    }
}
