use chrono_tz::Tz;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use thiserror::Error;

pub mod sources;

pub use sources::{load_sources, SourceConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("failed to read sources: {0}")]
    Sources(#[from] config::ConfigError),

    #[error("source {handle:?} is invalid: {errors}")]
    InvalidSource { handle: String, errors: validator::ValidationErrors },

    #[error("source {0} is configured more than once")]
    DuplicateSource(String),
}

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub graph: GraphConfig,
    pub vision: VisionConfig,
    pub llm: LlmConfig,
    pub ingest: IngestConfig,
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    pub json_logs: bool,
}

// Настройки базы данных
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

// Источник постов (Graph API)
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    pub url: String,
    pub access_token: String,
    pub business_account_id: String,
    pub timeout_seconds: u64,
}

// Распознавание текста (Cloud Vision)
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
}

// Языковая модель
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_seconds: u64,
}

// Параметры конвейера
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub sources_path: String,
    pub posts_per_source: u32,
    /// 0 отключает фоновый цикл.
    pub interval_seconds: u64,
    #[serde(skip, default = "default_timezone")]
    pub timezone: Tz,
    /// `None` — без ограничения параллельности.
    pub max_concurrency: Option<usize>,
    pub max_organizers_per_run: Option<usize>,
    /// Повторять ли в fixup посты, которые модель уже отклонила.
    pub retry_rejected: bool,
}

fn default_timezone() -> Tz {
    chrono_tz::America::Los_Angeles
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sources_path: "sources.toml".to_string(),
            posts_per_source: 5,
            interval_seconds: 3600,
            timezone: default_timezone(),
            max_concurrency: None,
            max_organizers_per_run: None,
            retry_rejected: false,
        }
    }
}

/// Чтение переменных через произвольный поиск, чтобы конфиг можно было собрать в тестах.
struct Vars<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        (self.0)(name).ok_or(ConfigError::Missing(name))
    }

    fn or(&self, name: &'static str, default: &str) -> String {
        (self.0)(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.0)(name) {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
            None => Ok(default),
        }
    }

    /// Пустое значение или 0 означают "без ограничения".
    fn limit(&self, name: &'static str) -> Result<Option<usize>, ConfigError> {
        match (self.0)(name).filter(|v| !v.trim().is_empty()) {
            Some(value) => match value.parse::<usize>() {
                Ok(0) => Ok(None),
                Ok(n) => Ok(Some(n)),
                Err(_) => Err(ConfigError::Invalid { name, value }),
            },
            None => Ok(None),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        let defaults = IngestConfig::default();

        let timezone_name = vars.or("INGEST_TIMEZONE", "America/Los_Angeles");
        let timezone = timezone_name
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid { name: "INGEST_TIMEZONE", value: timezone_name.clone() })?;

        Ok(Config {
            app: AppConfig {
                host: vars.or("HOST", "0.0.0.0"),
                port: vars.parsed("PORT", 8000)?,
                environment: vars.or("ENVIRONMENT", "development"),
                rust_log: vars.or("RUST_LOG", "event_ingest=debug,tower_http=debug"),
                json_logs: vars.or("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),
            },
            database: DatabaseConfig {
                url: vars.required("DATABASE_URL")?,
                pool_size: vars.parsed("DB_POOL_SIZE", 10)?,
            },
            graph: GraphConfig {
                url: vars.or("GRAPH_API_URL", "https://graph.facebook.com/v19.0"),
                access_token: vars.required("GRAPH_ACCESS_TOKEN")?,
                business_account_id: vars.required("GRAPH_BUSINESS_ACCOUNT_ID")?,
                timeout_seconds: vars.parsed("GRAPH_TIMEOUT_SECONDS", 30)?,
            },
            vision: VisionConfig {
                url: vars.or("VISION_API_URL", "https://vision.googleapis.com"),
                api_key: vars.required("VISION_API_KEY")?,
                timeout_seconds: vars.parsed("VISION_TIMEOUT_SECONDS", 30)?,
            },
            llm: LlmConfig {
                url: vars.or("LLM_API_URL", "https://api.openai.com"),
                api_key: vars.required("LLM_API_KEY")?,
                model: vars.or("LLM_MODEL", "gpt-4o-mini"),
                timeout_seconds: vars.parsed("LLM_TIMEOUT_SECONDS", 60)?,
            },
            ingest: IngestConfig {
                sources_path: vars.or("INGEST_SOURCES_PATH", &defaults.sources_path),
                posts_per_source: vars.parsed("INGEST_POSTS_PER_SOURCE", defaults.posts_per_source)?,
                interval_seconds: vars.parsed("INGEST_INTERVAL_SECONDS", defaults.interval_seconds)?,
                timezone,
                max_concurrency: vars.limit("INGEST_MAX_CONCURRENCY")?,
                max_organizers_per_run: vars.limit("INGEST_MAX_ORGANIZERS_PER_RUN")?,
                retry_rejected: vars.parsed("INGEST_RETRY_REJECTED", defaults.retry_rejected)?,
            },
        })
    }
}
