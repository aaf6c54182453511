//! rate_limit.rs
//!
//! Проверка сигнала использования, который сервис постов возвращает в заголовке
//! `x-app-usage`. Если хотя бы одна метрика достигла 100%, дальнейшие запросы
//! для текущего организатора прекращаются.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Заголовок, в котором Graph API сообщает загрузку приложения.
pub const USAGE_HEADER: &str = "x-app-usage";

/// Порог, начиная с которого метрика считается исчерпанной.
const HALT_THRESHOLD: f64 = 100.0;

/// Загрузка приложения в процентах. Значения обычно в [0, 100], но сверху не ограничены.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageSignal {
    #[serde(default)]
    pub call_count: f64,
    #[serde(default)]
    pub total_cputime: f64,
    #[serde(default)]
    pub total_time: f64,
}

impl fmt::Display for UsageSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "call_count={}%, total_cputime={}%, total_time={}%",
            self.call_count, self.total_cputime, self.total_time
        )
    }
}

impl UsageSignal {
    /// Разбирает значение заголовка. Нечитаемый заголовок считается отсутствующим.
    pub fn from_header(value: &str) -> Option<Self> {
        match serde_json::from_str(value) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(header = %value, error = %e, "Unparsable usage header, ignoring");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Continue,
    Halt,
}

/// Отсутствие сигнала означает, что сервис не сообщил загрузку: продолжаем.
pub fn check_usage(signal: Option<&UsageSignal>) -> RateDecision {
    match signal {
        Some(usage)
            if usage.call_count >= HALT_THRESHOLD
                || usage.total_cputime >= HALT_THRESHOLD
                || usage.total_time >= HALT_THRESHOLD =>
        {
            RateDecision::Halt
        }
        _ => RateDecision::Continue,
    }
}
