//! inference.rs
//!
//! Построение промпта и единственный вызов языковой модели (chat completions).
//! Результат не сохраняется до успешной санитизации, поэтому повторный вызов безопасен.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{IngestError, Result};

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Сгенерированный текст или `None`, если модель ничего не вернула.
    async fn complete(&self, prompt: &str) -> Result<Option<String>>;
}

/// Всё, что попадает в промпт для одного поста.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub handle: &'a str,
    pub city: &'a str,
    pub context_clues: &'a str,
    pub caption: Option<&'a str>,
    pub media_urls: &'a [String],
    pub extracted_text: Option<&'a str>,
    pub today: NaiveDate,
}

const RESPONSE_SHAPE: &str = r#"{
  "isEvent": boolean,
  "title": string | null,
  "startHourMilitaryTime": number | null,
  "endHourMilitaryTime": number | null,
  "startMinute": number | null,
  "endMinute": number | null,
  "startDay": number | null,
  "endDay": number | null,
  "startMonth": number | null,
  "endMonth": number | null,
  "startYear": number | null,
  "endYear": number | null,
  "hasStartHourInPost": boolean,
  "isPastEvent": boolean
}"#;

pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are reading an Instagram post from @{}, an organizer based in {}.\n",
        ctx.handle, ctx.city
    ));
    if !ctx.context_clues.trim().is_empty() {
        prompt.push_str(&format!("Context about this organizer: {}\n", ctx.context_clues.trim()));
    }
    prompt.push_str(&format!("Today's date is {}.\n", ctx.today.format("%A, %B %-d, %Y")));

    prompt.push('\n');
    match ctx.caption {
        Some(caption) if !caption.trim().is_empty() => {
            prompt.push_str(&format!("Caption:\n{}\n", caption.trim()));
        }
        _ => prompt.push_str("The post has no caption.\n"),
    }

    match ctx.media_urls.len() {
        0 => prompt.push_str("The post has no images.\n"),
        1 => prompt.push_str("The post has 1 image.\n"),
        n => prompt.push_str(&format!("The post is a carousel of {} images.\n", n)),
    }

    match ctx.extracted_text {
        Some(text) if !text.trim().is_empty() => {
            prompt.push_str(&format!("Text found in the images:\n{}\n", text.trim()));
        }
        _ => prompt.push_str("No text could be read from the images.\n"),
    }

    prompt.push_str(
        "\nDecide whether this post announces a specific upcoming event with a date and start time. \
         Use 24-hour time. Leave a field null when the post does not say it. \
         Set hasStartHourInPost to true only if the start time is stated in the post. \
         Set isPastEvent to true if the event happened before today.\n\
         Respond with a single JSON object of exactly this shape and nothing else:\n",
    );
    prompt.push_str(RESPONSE_SHAPE);

    prompt
}

// --- Модели API chat completions ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Клиент OpenAI-совместимого API.
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    model: String,
    http_client: reqwest::Client,
}

impl OpenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| IngestError::Inference(e.to_string()))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            http_client,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<Option<String>> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage { role: "user", content: prompt }],
            response_format: ResponseFormat { kind: "json_object" },
            temperature: 0.0,
        };

        debug!(model = %self.model, prompt_chars = prompt.len(), "Requesting inference");

        let response = self
            .http_client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| IngestError::Inference(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Inference(format!("model returned {}: {}", status, body)));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Inference(e.to_string()))?;

        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content))
    }
}
