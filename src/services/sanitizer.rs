//! sanitizer.rs
//!
//! Превращает сырой ответ языковой модели в проверенный `InferenceResult`
//! и затем в абсолютные моменты начала и конца события (UTC).
//!
//! Этапы:
//! 1.  **Извлечение**: отрезаем всё до первой `{` и после последней `}`, разбираем JSON.
//! 2.  **Схема**: все четырнадцать ключей обязательны (значения могут быть `null`).
//!     Разбор строго типизированный, частично заполненного объекта не бывает.
//! 3.  **Дополнение полей**: правила a–g применяются в фиксированном порядке.
//! 4.  **Фильтр**: событие принимается только при подтверждённых флагах и полном времени.
//! 5.  **Построение моментов**: локальное время источника переводится в UTC.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer};

use crate::error::MalformedOutput;

/// Значение по умолчанию для поля с `null`, но обязательного по наличию ключа.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

/// Кандидат в том виде, в каком его вернула модель.
///
/// `deserialize_with` отключает неявный `default` для `Option`, поэтому
/// отсутствие любого ключа даёт ошибку разбора, а `null` допустим.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandidate {
    #[serde(deserialize_with = "nullable")]
    pub is_event: Option<bool>,
    #[serde(deserialize_with = "nullable")]
    pub title: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub start_hour_military_time: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub end_hour_military_time: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub is_past_event: Option<bool>,
    #[serde(deserialize_with = "nullable")]
    pub has_start_hour_in_post: Option<bool>,
    #[serde(deserialize_with = "nullable")]
    pub start_minute: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub end_minute: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub start_day: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub end_day: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub start_month: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub end_month: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub start_year: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub end_year: Option<i64>,
}

/// Кандидат после применения правил дополнения. Годы и минуты всегда известны.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub is_event: Option<bool>,
    pub title: Option<String>,
    pub has_start_hour_in_post: Option<bool>,
    pub is_past_event: Option<bool>,
    pub start_year: i64,
    pub end_year: i64,
    pub start_month: Option<i64>,
    pub end_month: Option<i64>,
    pub start_day: Option<i64>,
    pub end_day: Option<i64>,
    pub start_hour: Option<i64>,
    pub end_hour: Option<i64>,
    pub start_minute: i64,
    pub end_minute: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotAnEvent,
    NoStartHour,
    PastEvent,
    IncompleteTime,
    /// Дату нельзя построить: нет месяца, месяц вне 1..=12 или локального времени не существует.
    UnresolvableDate,
    EndBeforeStart,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotAnEvent => "not_an_event",
            RejectReason::NoStartHour => "no_start_hour",
            RejectReason::PastEvent => "past_event",
            RejectReason::IncompleteTime => "incomplete_time",
            RejectReason::UnresolvableDate => "unresolvable_date",
            RejectReason::EndBeforeStart => "end_before_start",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedEvent {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted(AcceptedEvent),
    Rejected(RejectReason),
}

/// Оставляет подстроку от первой `{` до последней `}` включительно.
pub fn extract_json_object(raw: &str) -> Result<&str, MalformedOutput> {
    let start = raw.find('{').ok_or(MalformedOutput::NoJsonObject)?;
    let end = raw.rfind('}').ok_or(MalformedOutput::NoJsonObject)?;
    if end < start {
        return Err(MalformedOutput::NoJsonObject);
    }
    Ok(&raw[start..=end])
}

pub fn parse_candidate(raw: &str) -> Result<RawCandidate, MalformedOutput> {
    let json = extract_json_object(raw)?;
    serde_json::from_str(json).map_err(|e| {
        if e.is_data() {
            MalformedOutput::Schema(e.to_string())
        } else {
            MalformedOutput::InvalidJson(e.to_string())
        }
    })
}

/// Нормализатор, привязанный к часовому поясу источника и текущему году.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    tz: Tz,
    current_year: i64,
}

impl Normalizer {
    pub fn new(tz: Tz) -> Self {
        let current_year = Utc::now().with_timezone(&tz).year() as i64;
        Self { tz, current_year }
    }

    pub fn with_current_year(tz: Tz, current_year: i64) -> Self {
        Self { tz, current_year }
    }

    /// Полный проход: разбор, дополнение, фильтр, построение моментов.
    pub fn evaluate(&self, raw_output: &str) -> Result<Verdict, MalformedOutput> {
        let candidate = parse_candidate(raw_output)?;
        let result = self.complete(candidate);
        Ok(self.judge(&result))
    }

    /// Правила дополнения. Порядок важен: каждое правило видит результаты предыдущих.
    pub fn complete(&self, c: RawCandidate) -> InferenceResult {
        // a
        let start_year = c.start_year.unwrap_or(self.current_year);
        // b
        let mut end_year = c.end_year.unwrap_or(start_year);
        // c
        let start_minute = c.start_minute.unwrap_or(0);
        let end_minute = c.end_minute.unwrap_or(0);
        // d: декабрь -> январь переходит через границу года
        if c.start_month == Some(12) && c.end_month == Some(1) {
            end_year = start_year.saturating_add(1);
        }
        // e
        let end_month = c.end_month.or(c.start_month);
        // f
        let mut end_day = c.end_day.or(c.start_day);
        // g
        let end_hour = match (c.end_hour_military_time, c.start_hour_military_time) {
            (Some(hour), _) => Some(hour),
            (None, Some(start_hour)) => {
                let mut hour = start_hour.saturating_add(2);
                if hour > 23 {
                    hour -= 24;
                    end_day = end_day.map(|day| day.saturating_add(1));
                }
                Some(hour)
            }
            (None, None) => None,
        };

        InferenceResult {
            is_event: c.is_event,
            title: c.title,
            has_start_hour_in_post: c.has_start_hour_in_post,
            is_past_event: c.is_past_event,
            start_year,
            end_year,
            start_month: c.start_month,
            end_month,
            start_day: c.start_day,
            end_day,
            start_hour: c.start_hour_military_time,
            end_hour,
            start_minute,
            end_minute,
        }
    }

    pub fn judge(&self, r: &InferenceResult) -> Verdict {
        if r.is_event != Some(true) {
            return Verdict::Rejected(RejectReason::NotAnEvent);
        }
        if r.has_start_hour_in_post != Some(true) {
            return Verdict::Rejected(RejectReason::NoStartHour);
        }
        if r.is_past_event != Some(false) {
            return Verdict::Rejected(RejectReason::PastEvent);
        }
        let (Some(start_day), Some(end_day), Some(start_hour), Some(end_hour)) =
            (r.start_day, r.end_day, r.start_hour, r.end_hour)
        else {
            return Verdict::Rejected(RejectReason::IncompleteTime);
        };
        let (Some(start_month), Some(end_month)) = (r.start_month, r.end_month) else {
            return Verdict::Rejected(RejectReason::UnresolvableDate);
        };

        let start_local = wall_clock(r.start_year, start_month, start_day, start_hour, r.start_minute);
        // Конец строится от start_day и затем сдвигается на разницу дней;
        // переполнение месяца допустимо только в этом сдвиге.
        let end_local = wall_clock(r.end_year, end_month, start_day, end_hour, r.end_minute)
            .and_then(|t| t.checked_add_signed(TimeDelta::try_days(end_day.checked_sub(start_day)?)?));
        let (Some(start_local), Some(mut end_local)) = (start_local, end_local) else {
            return Verdict::Rejected(RejectReason::UnresolvableDate);
        };

        // Ночное событие: "22:00-02:00" без явного перехода на следующий день.
        if end_local < start_local {
            match end_local.checked_add_signed(TimeDelta::days(1)) {
                Some(next_day) if next_day >= start_local => end_local = next_day,
                _ => return Verdict::Rejected(RejectReason::EndBeforeStart),
            }
        }

        let (Some(start), Some(end)) = (self.to_utc(&start_local), self.to_utc(&end_local)) else {
            return Verdict::Rejected(RejectReason::UnresolvableDate);
        };
        if end < start {
            return Verdict::Rejected(RejectReason::EndBeforeStart);
        }

        Verdict::Accepted(AcceptedEvent {
            title: r.title.clone().unwrap_or_default().trim().to_string(),
            start,
            end,
        })
    }

    /// Неоднозначное время (осенний перевод часов) берём раннее; несуществующее отбрасываем.
    fn to_utc(&self, local: &NaiveDateTime) -> Option<DateTime<Utc>> {
        self.tz
            .from_local_datetime(local)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Локальное время без переноса: 30 февраля, день 0, 27 часов или 600 минут дают `None`.
fn wall_clock(year: i64, month: i64, day: i64, hour: i64, minute: i64) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(
        i32::try_from(year).ok()?,
        u32::try_from(month).ok()?,
        u32::try_from(day).ok()?,
    )?
    .and_hms_opt(u32::try_from(hour).ok()?, u32::try_from(minute).ok()?, 0)
}
