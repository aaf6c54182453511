//! Список настроенных аккаунтов-источников.
//!
//! Файл в формате TOML:
//!
//! ```toml
//! [[sources]]
//! handle = "demo_user"
//! city = "Los Angeles"
//! context_clues = "Jazz bar in Echo Park"
//! ```

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use validator::Validate;

use super::ConfigError;

#[derive(Debug, Clone, Deserialize, Validate, PartialEq)]
pub struct SourceConfig {
    #[validate(length(min = 1))]
    pub handle: String,
    #[validate(length(min = 1))]
    pub city: String,
    #[serde(default)]
    pub context_clues: String,
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceConfig>,
}

pub fn load_sources(path: impl AsRef<Path>) -> Result<Vec<SourceConfig>, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .build()?;
    let file: SourcesFile = settings.try_deserialize()?;

    let mut seen = HashSet::new();
    let mut sources = Vec::with_capacity(file.sources.len());
    for mut source in file.sources {
        // "@demo_user" и "demo_user" — один и тот же аккаунт
        source.handle = source.handle.trim().trim_start_matches('@').to_string();
        source.city = source.city.trim().to_string();

        source.validate().map_err(|errors| ConfigError::InvalidSource {
            handle: source.handle.clone(),
            errors,
        })?;
        if !seen.insert(source.handle.clone()) {
            return Err(ConfigError::DuplicateSource(source.handle));
        }
        sources.push(source);
    }

    Ok(sources)
}
