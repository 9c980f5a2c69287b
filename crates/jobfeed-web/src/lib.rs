//! Axum + Askama feed dashboard for jobfeed.
//!
//! The dataset file is only ever read here. Read marks live in their own
//! document next to it.

mod feed;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Form, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::DateTime;
use jobfeed_core::{
    iso_from_datetime, Clock, FeedError, FeedErrorKind, Record, SystemClock, LINK_FIELDS,
};
use jobfeed_storage::JsonFileStore;
use jobfeed_sync::{split_document, SyncSettings};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub use feed::{
    filter_and_sort, mark_selected, search_blob, source_counts, toggle_read, DashboardParams,
    FeedEntry, FeedFilter, ReadMap, SortOrder, READ_STATE_KEY,
};

pub const CRATE_NAME: &str = "jobfeed-web";

const SNIPPET_CHARS: usize = 240;
const TEXT_FIELDS: &[&[&str]] = &[&["snippet"], &["text"], &["description"], &["content"]];

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReadStateDocument {
    #[serde(rename = "jobfeed.readState", default)]
    read: ReadMap,
}

/// File-backed read marks, keyed by record id.
#[derive(Debug)]
pub struct ReadStateStore {
    store: JsonFileStore,
    lock: Mutex<()>,
}

impl ReadStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonFileStore::new(path.into()),
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<ReadMap, FeedError> {
        match self.store.read_json::<ReadStateDocument>().await {
            Ok(document) => Ok(document.read),
            Err(FeedError::NotFound { .. }) => Ok(ReadMap::new()),
            Err(err) => Err(err),
        }
    }

    /// Marks `id` read on first selection; returns the stored read timestamp.
    pub async fn select(&self, id: &str, now_iso: &str) -> Result<String, FeedError> {
        let _guard = self.lock.lock().await;
        let mut read = self.load().await?;
        if mark_selected(&mut read, id, now_iso) {
            self.save(&read).await?;
        }
        Ok(read.get(id).cloned().unwrap_or_else(|| now_iso.to_string()))
    }

    /// Flips the read mark; returns true when the record is now read.
    pub async fn toggle(&self, id: &str, now_iso: &str) -> Result<bool, FeedError> {
        let _guard = self.lock.lock().await;
        let mut read = self.load().await?;
        let now_read = toggle_read(&mut read, id, now_iso);
        self.save(&read).await?;
        Ok(now_read)
    }

    async fn save(&self, read: &ReadMap) -> Result<(), FeedError> {
        let document = ReadStateDocument { read: read.clone() };
        self.store.write_json(&document).await.map(|_| ())
    }
}

#[derive(Debug)]
struct LoadedFeed {
    updated_at: Option<String>,
    entries: Vec<FeedEntry>,
}

impl LoadedFeed {
    /// Builds entries item by item; items without a derivable id are skipped
    /// rather than failing the whole load.
    fn from_document(document: JsonValue, path: &Path) -> Result<Self, FeedError> {
        let updated_at = document
            .get("updatedAt")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string);
        let (items, _) = split_document(document, path)?;
        let entries = items
            .iter()
            .filter_map(Record::from_raw)
            .map(FeedEntry::new)
            .collect::<Vec<_>>();
        if entries.len() < items.len() {
            debug!(
                path = %path.display(),
                skipped = items.len() - entries.len(),
                "skipped dataset items without identity"
            );
        }
        Ok(Self {
            updated_at,
            entries,
        })
    }
}

struct FeedLoad {
    feed: Option<Arc<LoadedFeed>>,
    error: Option<String>,
}

pub struct AppState {
    dataset_path: PathBuf,
    read_state: ReadStateStore,
    clock: Arc<dyn Clock>,
    last_good: RwLock<Option<Arc<LoadedFeed>>>,
}

impl AppState {
    pub fn new(dataset_path: impl Into<PathBuf>, read_state_path: impl Into<PathBuf>) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            read_state: ReadStateStore::new(read_state_path),
            clock: Arc::new(SystemClock),
            last_good: RwLock::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn read_document(&self) -> Result<JsonValue, FeedError> {
        JsonFileStore::new(&self.dataset_path).read_value().await
    }

    /// Re-reads the dataset. On failure the previous good load is kept and
    /// the error is handed back for inline display.
    async fn load_feed(&self) -> FeedLoad {
        let loaded = self
            .read_document()
            .await
            .and_then(|document| LoadedFeed::from_document(document, &self.dataset_path));
        match loaded {
            Ok(loaded) => {
                let loaded = Arc::new(loaded);
                *self.last_good.write().await = Some(loaded.clone());
                FeedLoad {
                    feed: Some(loaded),
                    error: None,
                }
            }
            Err(err) => {
                warn!(path = %self.dataset_path.display(), kind = ?err.kind(), "failed to load dataset: {err}");
                FeedLoad {
                    feed: self.last_good.read().await.clone(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn read_map_or_empty(&self) -> ReadMap {
        self.read_state.load().await.unwrap_or_else(|err| {
            warn!("ignoring unreadable read state: {err}");
            ReadMap::new()
        })
    }
}

#[derive(Debug, Clone)]
struct JobRow {
    id: String,
    title: String,
    source: String,
    posted: String,
    snippet: String,
    link: String,
    read: bool,
}

#[derive(Debug, Clone)]
struct SourceOption {
    name: String,
    count: usize,
    selected: bool,
}

#[derive(Debug, Deserialize)]
struct IdForm {
    id: String,
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    rows: Vec<JobRow>,
    total: usize,
    sources: Vec<SourceOption>,
    query: String,
    only_unread: bool,
    max_age_days: String,
    sort_oldest: bool,
    updated_at: String,
    error: String,
}

#[derive(Template)]
#[template(path = "job_detail_partial.html")]
struct JobDetailPartialTemplate {
    row: JobRow,
    text: String,
    read_at: String,
}

#[derive(Template)]
#[template(path = "read_toggle_partial.html")]
struct ReadTogglePartialTemplate {
    id: String,
    read: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/api/jobs", get(api_jobs_handler))
        .route("/api/read-state", get(api_read_state_handler))
        .route("/jobs/select", post(select_handler))
        .route("/jobs/toggle-read", post(toggle_read_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("JOBFEED_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let read_state_path = std::env::var("JOBFEED_READ_STATE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/read_state.json"));
    let settings = SyncSettings::from_env();
    let state = AppState::new(settings.dataset_path, read_state_path);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn format_timestamp(timestamp_ms: Option<i64>) -> String {
    timestamp_ms
        .and_then(DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "undated".to_string())
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out = text.chars().take(max).collect::<String>();
        out.push('…');
        out
    }
}

fn job_row(entry: &FeedEntry, read: &ReadMap) -> JobRow {
    let record = &entry.record;
    JobRow {
        id: record.id.clone(),
        title: record
            .first_str(&[&["title"]])
            .or_else(|| record.first_str(TEXT_FIELDS).map(|t| t.lines().next().unwrap_or(t)))
            .map(|t| truncate_chars(t, 120))
            .unwrap_or_else(|| "(untitled)".to_string()),
        source: entry.source().unwrap_or("unknown").to_string(),
        posted: format_timestamp(entry.timestamp_ms),
        snippet: record
            .first_str(TEXT_FIELDS)
            .map(|t| truncate_chars(t, SNIPPET_CHARS))
            .unwrap_or_default(),
        link: record.first_str(LINK_FIELDS).unwrap_or_default().to_string(),
        read: read.contains_key(&record.id),
    }
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DashboardParams>,
) -> Response {
    let load = state.load_feed().await;
    let read = state.read_map_or_empty().await;
    let filter = FeedFilter::from(&params);
    let now_ms = state.clock.now().timestamp_millis();

    let (rows, total, sources, updated_at) = match &load.feed {
        Some(feed) => {
            let rows = filter_and_sort(&feed.entries, &filter, &read, now_ms)
                .into_iter()
                .map(|entry| job_row(entry, &read))
                .collect::<Vec<_>>();
            let sources = source_counts(&feed.entries)
                .into_iter()
                .map(|(name, count)| SourceOption {
                    selected: filter.source.as_deref() == Some(name.as_str()),
                    name,
                    count,
                })
                .collect::<Vec<_>>();
            (
                rows,
                feed.entries.len(),
                sources,
                feed.updated_at.clone().unwrap_or_else(|| "n/a".into()),
            )
        }
        None => (Vec::new(), 0, Vec::new(), "n/a".to_string()),
    };

    render_html(DashboardTemplate {
        rows,
        total,
        sources,
        query: params.q.clone().unwrap_or_default(),
        only_unread: filter.only_unread,
        max_age_days: filter
            .max_age_days
            .map(|d| d.to_string())
            .unwrap_or_default(),
        sort_oldest: filter.sort == SortOrder::Oldest,
        updated_at,
        error: load.error.unwrap_or_default(),
    })
}

async fn api_jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.read_document().await {
        Ok(document) => ([(header::CACHE_CONTROL, "no-cache")], Json(document)).into_response(),
        Err(err) => json_error(err),
    }
}

async fn api_read_state_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.read_state.load().await {
        Ok(read) => Json(read).into_response(),
        Err(err) => json_error(err),
    }
}

async fn select_handler(State(state): State<Arc<AppState>>, Form(form): Form<IdForm>) -> Response {
    let load = state.load_feed().await;
    let Some(entry) = load
        .feed
        .as_ref()
        .and_then(|feed| feed.entries.iter().find(|e| e.record.id == form.id))
    else {
        return (StatusCode::NOT_FOUND, Html("Job not found".to_string())).into_response();
    };

    let now_iso = iso_from_datetime(state.clock.now());
    match state.read_state.select(&form.id, &now_iso).await {
        Ok(read_at) => {
            let mut row = job_row(entry, &ReadMap::new());
            row.read = true;
            render_html(JobDetailPartialTemplate {
                text: entry
                    .record
                    .first_str(TEXT_FIELDS)
                    .unwrap_or_default()
                    .to_string(),
                row,
                read_at,
            })
        }
        Err(err) => server_error(err.into()),
    }
}

async fn toggle_read_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<IdForm>,
) -> Response {
    let now_iso = iso_from_datetime(state.clock.now());
    match state.read_state.toggle(&form.id, &now_iso).await {
        Ok(read) => render_html(ReadTogglePartialTemplate { id: form.id, read }),
        Err(err) => server_error(err.into()),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn json_error(err: FeedError) -> Response {
    let status = match err.kind() {
        FeedErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use jobfeed_core::FixedClock;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    const DATASET: &str = r#"{
        "updatedAt": "2024-01-31T06:00:00.000Z",
        "items": [
            {"id": "a", "postDate": "2024-01-30T09:00:00.000Z", "title": "Rust Engineer", "source": "Board", "text": "Own the ingestion pipeline."},
            {"id": "b", "postDate": "2024-01-20T09:00:00.000Z", "title": "Go Developer", "source": "Other"}
        ]
    }"#;

    fn fixture() -> (TempDir, Router) {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("jobs.json"), DATASET).expect("seed dataset");
        let router = router_for(dir.path());
        (dir, router)
    }

    fn router_for(root: &Path) -> Router {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).single().unwrap();
        app(AppState::new(root.join("jobs.json"), root.join("read_state.json"))
            .with_clock(Arc::new(FixedClock(now))))
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, header::HeaderMap, String) {
        let resp = app
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post_form(app: &Router, uri: &str, body: &str) -> (StatusCode, String) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn dashboard_lists_and_filters_jobs() {
        let (_dir, app) = fixture();
        let (status, _, text) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Job Feed"));
        assert!(text.contains("Rust Engineer"));
        assert!(text.contains("Go Developer"));

        let (_, _, text) = get(&app, "/?q=rust&source=&max_age_days=&sort=newest").await;
        assert!(text.contains("Rust Engineer"));
        assert!(!text.contains("Go Developer"));
    }

    #[tokio::test]
    async fn dashboard_reports_load_failures_inline() {
        let dir = tempdir().expect("tempdir");
        let app = router_for(dir.path());
        let (status, _, text) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Failed to load"));
    }

    #[tokio::test]
    async fn dashboard_keeps_previous_data_when_dataset_turns_malformed() {
        let (dir, app) = fixture();
        let (_, _, first) = get(&app, "/").await;
        assert!(first.contains("Rust Engineer"));

        std::fs::write(dir.path().join("jobs.json"), "{ broken").unwrap();
        let (status, _, second) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(second.contains("Failed to load"));
        assert!(second.contains("Rust Engineer"));
    }

    #[tokio::test]
    async fn dashboard_skips_items_without_identity_instead_of_failing() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("jobs.json"),
            r#"{"items": [
                {"postDate": "2024-01-30T09:00:00.000Z", "source": "Board"},
                {"id": 4242, "postDate": "2024-01-29T09:00:00.000Z", "title": "Numeric Id Role"},
                {"id": "a", "postDate": "2024-01-28T09:00:00.000Z", "title": "Rust Engineer"}
            ]}"#,
        )
        .expect("seed dataset");
        let app = router_for(dir.path());

        let (status, _, text) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!text.contains("Failed to load"));
        assert!(text.contains("Numeric Id Role"));
        assert!(text.contains("Rust Engineer"));
        assert!(text.contains("Showing 2 of 2 jobs"));

        let (status, _) = post_form(&app, "/jobs/select", "id=4242").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn api_jobs_serves_dataset_without_caching() {
        let (_dir, app) = fixture();
        let (status, headers, text) = get(&app, "/api/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL].to_str().unwrap(), "no-cache");
        assert_eq!(
            headers[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["items"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn api_jobs_reports_missing_dataset_as_not_found() {
        let dir = tempdir().expect("tempdir");
        let app = router_for(dir.path());
        let (status, _, text) = get(&app, "/api/jobs").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(text.contains("not_found"));
    }

    #[tokio::test]
    async fn selecting_marks_read_without_touching_dataset() {
        let (dir, app) = fixture();
        let (status, detail) = post_form(&app, "/jobs/select", "id=a").await;
        assert_eq!(status, StatusCode::OK);
        assert!(detail.contains("Own the ingestion pipeline."));
        assert!(detail.contains("2024-02-01T00:00:00.000Z"));

        let (_, _, read_state) = get(&app, "/api/read-state").await;
        let read: ReadMap = serde_json::from_str(&read_state).unwrap();
        assert_eq!(read.get("a").map(String::as_str), Some("2024-02-01T00:00:00.000Z"));

        let raw = std::fs::read_to_string(dir.path().join("read_state.json")).unwrap();
        assert!(raw.contains(READ_STATE_KEY));
        assert_eq!(std::fs::read_to_string(dir.path().join("jobs.json")).unwrap(), DATASET);

        let (_, _, unread_only) = get(&app, "/?unread=on").await;
        assert!(!unread_only.contains("Rust Engineer"));
        assert!(unread_only.contains("Go Developer"));
    }

    #[tokio::test]
    async fn selecting_unknown_job_is_not_found() {
        let (_dir, app) = fixture();
        let (status, _) = post_form(&app, "/jobs/select", "id=missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn toggle_read_flips_the_mark() {
        let (_dir, app) = fixture();
        let (status, body) = post_form(&app, "/jobs/toggle-read", "id=b").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Mark unread"));

        let (_, body) = post_form(&app, "/jobs/toggle-read", "id=b").await;
        assert!(body.contains("Mark read"));
        let (_, _, read_state) = get(&app, "/api/read-state").await;
        assert_eq!(read_state, "{}");
    }

    #[tokio::test]
    async fn read_state_store_tolerates_missing_file() {
        let dir = tempdir().expect("tempdir");
        let store = ReadStateStore::new(dir.path().join("read_state.json"));
        assert!(store.load().await.unwrap().is_empty());
        let first = store.select("a", "2024-02-01T00:00:00.000Z").await.unwrap();
        let second = store.select("a", "2024-02-03T00:00:00.000Z").await.unwrap();
        assert_eq!(first, second);
    }
}
