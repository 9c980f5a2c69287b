//! Core record model, error kinds and date/identity normalization for jobfeed.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobfeed-core";

pub const MS_PER_DAY: i64 = 86_400_000;
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Separator between the components of a composite record id.
pub const ID_SEPARATOR: &str = "::";
/// Number of characters of collapsed text that take part in a composite id.
pub const ID_TEXT_CHARS: usize = 80;

/// JavaScript-compatible bound on representable epoch milliseconds.
const MAX_EPOCH_MS: f64 = 8.64e15;
const MS_THRESHOLD: f64 = 1e11;
const SECONDS_THRESHOLD: f64 = 1e9;

/// Field-name candidates, tried in order. Each entry is a path into nested objects.
pub type FieldCandidates = &'static [&'static [&'static str]];

pub const ID_FIELDS: FieldCandidates = &[
    &["postId"],
    &["post_id"],
    &["id"],
    &["urn"],
    &["activityUrn"],
    &["jobId"],
    &["job_id"],
];

pub const LINK_FIELDS: FieldCandidates = &[
    &["url"],
    &["postUrl"],
    &["post_url"],
    &["link"],
    &["jobUrl"],
    &["applyUrl"],
];

pub const AUTHOR_ID_FIELDS: FieldCandidates = &[
    &["authorId"],
    &["author_id"],
    &["author", "id"],
    &["authorProfileId"],
    &["ownerId"],
    &["owner_id"],
    &["profileId"],
];

pub const TEXT_FIELDS: FieldCandidates = &[
    &["text"],
    &["content"],
    &["snippet"],
    &["description"],
    &["title"],
];

pub const POST_DATE_FIELDS: FieldCandidates = &[
    &["postDate"],
    &["postedAt"],
    &["posted_at"],
    &["publishedAt"],
    &["published_at"],
    &["datePosted"],
    &["date"],
    &["createdAt"],
    &["created_at"],
    &["timestamp"],
];

pub const IMPORTED_AT_FIELDS: FieldCandidates = &[
    &["importedAt"],
    &["imported_at"],
    &["fetched_at"],
    &["fetchedAt"],
    &["scrapedAt"],
    &["scraped_at"],
];

const OFFSET_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%a %b %d %H:%M:%S %z %Y",
];

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%B %d, %Y", "%b %d, %Y", "%d %B %Y"];

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("invalid JSON in {context}: {source}")]
    Parse {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected document shape in {context}: {message}")]
    Shape { context: String, message: String },
    #[error("network error for {url}: {message}")]
    Network {
        url: String,
        message: String,
        retryable: bool,
    },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse failure class, used by schedulers to pick retry vs alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedErrorKind {
    NotFound,
    Parse,
    Network,
    Io,
    Config,
}

impl FeedError {
    pub fn kind(&self) -> FeedErrorKind {
        match self {
            FeedError::NotFound { .. } => FeedErrorKind::NotFound,
            FeedError::Parse { .. } | FeedError::Shape { .. } => FeedErrorKind::Parse,
            FeedError::Network { .. } => FeedErrorKind::Network,
            FeedError::Io { .. } => FeedErrorKind::Io,
            FeedError::Config(_) => FeedErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Network { retryable: true, .. })
    }
}

impl FeedErrorKind {
    /// sysexits-style process exit code for this kind.
    pub fn exit_code(self) -> u8 {
        match self {
            FeedErrorKind::Parse => 65,
            FeedErrorKind::NotFound => 66,
            FeedErrorKind::Io => 74,
            FeedErrorKind::Network => 75,
            FeedErrorKind::Config => 78,
        }
    }
}

/// Source of "now" for retention and timestamps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// One normalized post/listing. Unknown fields pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(rename = "postDate", default, skip_serializing_if = "Option::is_none")]
    pub post_date: Option<String>,
    #[serde(rename = "importedAt", default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl Record {
    /// Builds a record from a raw source object: derives the id and normalizes
    /// `postDate` / `importedAt` from their candidate fields. `None` when the
    /// input is not an object or carries no identity material.
    pub fn from_raw(raw: &JsonValue) -> Option<Self> {
        let JsonValue::Object(map) = raw else {
            return None;
        };
        let id = derive_id(raw)?;
        let post_date = first_match(raw, POST_DATE_FIELDS, to_iso_date);
        let imported_at = first_match(raw, IMPORTED_AT_FIELDS, to_iso_date);

        let mut fields = map.clone();
        fields.remove("id");
        fields.remove("postDate");
        fields.remove("importedAt");

        Some(Self {
            id,
            post_date,
            imported_at,
            fields,
        })
    }

    /// `postDate`, else `importedAt`, as epoch milliseconds.
    pub fn resolved_epoch_ms(&self) -> Option<i64> {
        self.post_date
            .as_deref()
            .and_then(epoch_ms_from_str)
            .or_else(|| self.imported_at.as_deref().and_then(epoch_ms_from_str))
    }

    pub fn field(&self, path: &[&str]) -> Option<&JsonValue> {
        let (first, rest) = path.split_first()?;
        let value = self.fields.get(*first)?;
        json_path(value, rest)
    }

    pub fn field_str(&self, path: &[&str]) -> Option<&str> {
        self.field(path).and_then(JsonValue::as_str)
    }

    /// First non-blank string among `candidates`.
    pub fn first_str(&self, candidates: &[&[&str]]) -> Option<&str> {
        candidates.iter().find_map(|path| {
            self.field_str(path)
                .map(str::trim)
                .filter(|text| !text.is_empty())
        })
    }
}

/// The persisted feed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub items: Vec<Record>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Dataset {
    pub fn new(items: Vec<Record>, updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at: Some(iso_from_datetime(updated_at)),
            items,
            extra: Map::new(),
        }
    }
}

pub fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    Some(current)
}

/// First candidate path whose value `extract` accepts.
pub fn first_match<T>(
    value: &JsonValue,
    candidates: &[&[&str]],
    extract: impl Fn(&JsonValue) -> Option<T>,
) -> Option<T> {
    candidates
        .iter()
        .filter_map(|path| json_path(value, path))
        .find_map(extract)
}

/// Epoch milliseconds for a loosely typed timestamp.
///
/// Numbers with magnitude >= 1e11 are milliseconds, [1e9, 1e11) are seconds,
/// anything smaller is rejected. Numeric strings follow the number rules,
/// other strings are parsed as calendar dates (naive values are read as UTC).
pub fn to_epoch_ms(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(number) => number.as_f64().and_then(epoch_ms_from_number),
        JsonValue::String(text) => epoch_ms_from_str(text),
        _ => None,
    }
}

pub fn to_iso_date(value: &JsonValue) -> Option<String> {
    to_epoch_ms(value).and_then(iso_from_epoch_ms)
}

pub fn epoch_ms_from_number(number: f64) -> Option<i64> {
    if !number.is_finite() {
        return None;
    }
    let magnitude = number.abs();
    let ms = if magnitude >= MS_THRESHOLD {
        number
    } else if magnitude >= SECONDS_THRESHOLD {
        number * 1000.0
    } else {
        return None;
    };
    if ms.abs() > MAX_EPOCH_MS {
        return None;
    }
    Some(ms.trunc() as i64)
}

pub fn epoch_ms_from_str(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if is_numeric_literal(trimmed) {
        return trimmed.parse::<f64>().ok().and_then(epoch_ms_from_number);
    }
    parse_calendar(trimmed).map(|dt| dt.timestamp_millis())
}

pub fn iso_from_epoch_ms(ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(ms).map(iso_from_datetime)
}

pub fn iso_from_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_numeric_literal(text: &str) -> bool {
    let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (unsigned, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    all_digits(int_part) && frac_part.map_or(true, all_digits)
}

fn parse_calendar(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

fn coerce_identifier(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(text) => non_empty(text.trim()),
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn coerce_text(value: &JsonValue) -> Option<String> {
    value.as_str().and_then(|text| non_empty(text.trim()))
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn text_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(ID_TEXT_CHARS)
        .collect()
}

/// Stable identity for a raw record.
///
/// An explicit id field wins. Otherwise the id is composed from the link,
/// the author id and the first 80 collapsed characters of the text, using
/// whichever of those exist. A record with neither link nor text has no id.
pub fn derive_id(record: &JsonValue) -> Option<String> {
    if let Some(id) = first_match(record, ID_FIELDS, coerce_identifier) {
        return Some(id);
    }

    let link = first_match(record, LINK_FIELDS, coerce_text);
    let author = first_match(record, AUTHOR_ID_FIELDS, coerce_identifier);
    let text = first_match(record, TEXT_FIELDS, coerce_text).map(|t| text_key(&t));
    if link.is_none() && text.is_none() {
        return None;
    }

    let parts = [link, author, text].into_iter().flatten().collect::<Vec<_>>();
    Some(parts.join(ID_SEPARATOR))
}
