//! ocr.rs
//!
//! Извлечение текста из изображений поста через Cloud Vision (`images:annotate`).
//!
//! Результаты по всем картинкам склеиваются через перевод строки в исходном порядке.
//! Ошибка на любой картинке — ошибка всего вызова: частичных результатов нет.
//! Вызывающий код трактует такую ошибку как «текста нет», а не как сбой конвейера.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::VisionConfig;
use crate::error::{IngestError, Result};

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Текст со всех изображений. Пустой список даёт `None`.
    async fn extract_text(&self, media_urls: &[String]) -> Result<Option<String>>;
}

// --- Модели API Cloud Vision ---

#[derive(Debug, Serialize)]
struct AnnotateRequest<'a> {
    requests: Vec<ImageRequest<'a>>,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    image: Image<'a>,
    features: [Feature; 1],
}

#[derive(Debug, Serialize)]
struct Image<'a> {
    source: ImageSource<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageSource<'a> {
    image_uri: &'a str,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<VisionStatus>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct VisionStatus {
    #[serde(default)]
    message: String,
}

/// Клиент Cloud Vision.
#[derive(Clone)]
pub struct VisionClient {
    base_url: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl VisionClient {
    pub fn from_config(config: &VisionConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| IngestError::Ocr(e.to_string()))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http_client,
        })
    }

    /// Распознаёт одно изображение. Нет аннотации — пустая строка.
    async fn annotate(&self, image_uri: &str) -> Result<String> {
        let request = AnnotateRequest {
            requests: vec![ImageRequest {
                image: Image { source: ImageSource { image_uri } },
                features: [Feature { kind: "DOCUMENT_TEXT_DETECTION" }],
            }],
        };

        let response = self
            .http_client
            .post(format!("{}/v1/images:annotate", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| IngestError::Ocr(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Ocr(format!("vision returned {}: {}", status, body)));
        }

        let body: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Ocr(e.to_string()))?;

        match body.responses.into_iter().next() {
            Some(ImageResponse { error: Some(err), .. }) => Err(IngestError::Ocr(err.message)),
            Some(ImageResponse { full_text_annotation: Some(annotation), .. }) => Ok(annotation.text),
            _ => Ok(String::new()),
        }
    }
}

#[async_trait]
impl TextExtractor for VisionClient {
    async fn extract_text(&self, media_urls: &[String]) -> Result<Option<String>> {
        if media_urls.is_empty() {
            return Ok(None);
        }

        let mut texts = Vec::with_capacity(media_urls.len());
        for url in media_urls {
            texts.push(self.annotate(url).await?);
        }
        debug!(images = media_urls.len(), "Text extracted from post media");

        Ok(Some(texts.join("\n")))
    }
}
