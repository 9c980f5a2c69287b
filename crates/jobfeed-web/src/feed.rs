//! Read-only feed view: search blob, filter predicate, sort and read marks.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use jobfeed_core::{first_match, FieldCandidates, Record, MS_PER_DAY};
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Key the read map is stored under in the read-state document.
pub const READ_STATE_KEY: &str = "jobfeed.readState";

/// Record id -> ISO timestamp it was marked read.
pub type ReadMap = BTreeMap<String, String>;

const SEARCH_GROUPS: &[FieldCandidates] = &[
    &[&["title"]],
    &[&["snippet"], &["text"], &["description"]],
    &[&["source"]],
    &[&["country"]],
    &[&["language"]],
    &[&["tags"]],
    &[&["authorName"], &["author", "name"], &["author"]],
];

#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub record: Record,
    pub timestamp_ms: Option<i64>,
    pub search_blob: String,
}

impl FeedEntry {
    pub fn new(record: Record) -> Self {
        Self {
            timestamp_ms: record.resolved_epoch_ms(),
            search_blob: search_blob(&record),
            record,
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.record.field_str(&["source"])
    }
}

fn searchable_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Lower-cased, space-joined text the query is matched against.
pub fn search_blob(record: &Record) -> String {
    let root = JsonValue::Object(record.fields.clone());
    SEARCH_GROUPS
        .iter()
        .filter_map(|group| first_match(&root, group, searchable_text))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

/// Raw dashboard query string; HTML forms send empty strings for unset fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DashboardParams {
    pub source: Option<String>,
    pub q: Option<String>,
    pub unread: Option<String>,
    pub max_age_days: Option<String>,
    pub sort: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedFilter {
    pub source: Option<String>,
    pub query: Option<String>,
    pub only_unread: bool,
    pub max_age_days: Option<i64>,
    pub sort: SortOrder,
}

fn present(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

impl From<&DashboardParams> for FeedFilter {
    fn from(params: &DashboardParams) -> Self {
        Self {
            source: present(params.source.as_ref()),
            query: present(params.q.as_ref()).map(|q| q.to_lowercase()),
            only_unread: params
                .unread
                .as_deref()
                .is_some_and(|v| matches!(v, "on" | "1" | "true")),
            max_age_days: present(params.max_age_days.as_ref())
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|days| *days > 0),
            sort: match params.sort.as_deref() {
                Some("oldest") => SortOrder::Oldest,
                _ => SortOrder::Newest,
            },
        }
    }
}

impl FeedFilter {
    pub fn matches(&self, entry: &FeedEntry, read: &ReadMap, now_ms: i64) -> bool {
        if let Some(source) = &self.source {
            if entry.source() != Some(source.as_str()) {
                return false;
            }
        }
        if let Some(query) = &self.query {
            if !entry.search_blob.contains(query.as_str()) {
                return false;
            }
        }
        if self.only_unread && read.contains_key(&entry.record.id) {
            return false;
        }
        // A window too wide for i64 milliseconds is no limit at all.
        match self.max_age_days.and_then(|days| days.checked_mul(MS_PER_DAY)) {
            None => true,
            Some(window_ms) => entry
                .timestamp_ms
                .is_some_and(|ts| now_ms.saturating_sub(ts) <= window_ms),
        }
    }
}

/// Applies the filter, then a stable sort on timestamp (missing sorts as 0).
pub fn filter_and_sort<'a>(
    entries: &'a [FeedEntry],
    filter: &FeedFilter,
    read: &ReadMap,
    now_ms: i64,
) -> Vec<&'a FeedEntry> {
    let mut shown = entries
        .iter()
        .filter(|entry| filter.matches(entry, read, now_ms))
        .collect::<Vec<_>>();
    match filter.sort {
        SortOrder::Newest => shown.sort_by_key(|e| Reverse(e.timestamp_ms.unwrap_or(0))),
        SortOrder::Oldest => shown.sort_by_key(|e| e.timestamp_ms.unwrap_or(0)),
    }
    shown
}

/// Source name -> number of records, for the source filter.
pub fn source_counts(entries: &[FeedEntry]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for entry in entries {
        if let Some(source) = entry.source() {
            *counts.entry(source.to_string()).or_default() += 1;
        }
    }
    counts
}

/// Marks `id` read on its first selection only. Returns true when newly marked.
pub fn mark_selected(read: &mut ReadMap, id: &str, now_iso: &str) -> bool {
    if read.contains_key(id) {
        return false;
    }
    read.insert(id.to_string(), now_iso.to_string());
    true
}

/// Flips the read mark. Returns the new state (true = read).
pub fn toggle_read(read: &mut ReadMap, id: &str, now_iso: &str) -> bool {
    if read.remove(id).is_some() {
        false
    } else {
        read.insert(id.to_string(), now_iso.to_string());
        true
    }
}
