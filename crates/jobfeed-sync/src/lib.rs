//! Collector + retention cleaner for the persisted job feed, and the run orchestration around them.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobfeed_core::{
    iso_from_datetime, Clock, Dataset, FeedError, FeedErrorKind, Record, SystemClock,
    DEFAULT_RETENTION_DAYS, MS_PER_DAY,
};
use jobfeed_sources::{adapter_for_source, fetch_stamped, FetchContext, SourceRegistry};
use jobfeed_storage::{HttpClientConfig, HttpFetcher, JsonFileStore, WriteReceipt};
use serde_json::{Map, Value as JsonValue};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-sync";

/// Explicit inputs of the collector and cleaner.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub destination: PathBuf,
    pub retention_days: i64,
    pub clock: Arc<dyn Clock>,
}

impl PipelineConfig {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            retention_days: DEFAULT_RETENTION_DAYS,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_retention_days(mut self, retention_days: i64) -> Self {
        self.retention_days = retention_days;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub dataset_path: PathBuf,
    pub retention_days: i64,
    pub sources_path: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
}

impl SyncSettings {
    pub fn from_env() -> Self {
        Self {
            dataset_path: std::env::var("JOBFEED_DATASET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/jobs.json")),
            retention_days: std::env::var("JOBFEED_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RETENTION_DAYS),
            sources_path: std::env::var("JOBFEED_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            workspace_root: PathBuf::from("."),
            user_agent: std::env::var("JOBFEED_USER_AGENT")
                .unwrap_or_else(|_| "jobfeed-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("JOBFEED_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("JOBFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            schedule_cron: std::env::var("JOBFEED_SCHEDULE_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new(self.dataset_path.clone()).with_retention_days(self.retention_days)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollectOutcome {
    Saved(Dataset),
    /// No usable records arrived; the destination was left untouched.
    EmptyBatch,
}

impl CollectOutcome {
    pub fn dataset(&self) -> Option<&Dataset> {
        match self {
            CollectOutcome::Saved(dataset) => Some(dataset),
            CollectOutcome::EmptyBatch => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanReport {
    pub kept: usize,
    pub dropped_without_id: usize,
    pub dropped_duplicates: usize,
    pub dropped_expired: usize,
    pub updated_at: String,
    pub receipt: WriteReceipt,
}

/// Normalizes a raw batch: derives ids and dates, keeps the first record per id
/// and orders newest first. Records without any timestamp sort last.
pub fn normalize_batch(raw: &[JsonValue]) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut records = raw
        .iter()
        .filter_map(Record::from_raw)
        .filter(|record| seen.insert(record.id.clone()))
        .collect::<Vec<_>>();
    sort_newest_first(&mut records);
    records
}

/// Stable descending sort on `postDate`, falling back to `importedAt`.
pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by_key(|record| Reverse(record.resolved_epoch_ms()));
}

/// Age in days of `timestamp_ms` relative to `now_ms`.
pub fn age_in_days(now_ms: i64, timestamp_ms: i64) -> f64 {
    (now_ms - timestamp_ms) as f64 / MS_PER_DAY as f64
}

/// Overwrites the destination with the normalized batch.
///
/// An empty or unusable batch never touches the destination, so a failed
/// scrape cannot wipe accumulated history.
pub async fn save_records(
    raw: &[JsonValue],
    config: &PipelineConfig,
) -> Result<CollectOutcome, FeedError> {
    let records = normalize_batch(raw);
    if records.is_empty() {
        warn!(
            destination = %config.destination.display(),
            received = raw.len(),
            "no records fetched; keeping existing dataset"
        );
        return Ok(CollectOutcome::EmptyBatch);
    }

    let dataset = Dataset::new(records, config.clock.now());
    let receipt = JsonFileStore::new(&config.destination)
        .write_json(&dataset)
        .await?;
    info!(
        destination = %receipt.path.display(),
        received = raw.len(),
        saved = dataset.items.len(),
        hash = %receipt.content_hash,
        "dataset saved"
    );
    Ok(CollectOutcome::Saved(dataset))
}

/// Dedups, ages out and re-sorts the persisted dataset in place.
pub async fn clean_jobs(config: &PipelineConfig) -> Result<CleanReport, FeedError> {
    let store = JsonFileStore::new(&config.destination);
    let (items, extra) = split_document(store.read_value().await?, &config.destination)?;

    let now = config.clock.now();
    let now_ms = now.timestamp_millis();
    let mut seen = HashSet::new();
    let mut dropped_without_id = 0usize;
    let mut dropped_duplicates = 0usize;
    let mut dropped_expired = 0usize;
    let mut survivors = Vec::with_capacity(items.len());

    for raw in &items {
        let Some(mut record) = Record::from_raw(raw) else {
            dropped_without_id += 1;
            continue;
        };
        if !seen.insert(record.id.clone()) {
            dropped_duplicates += 1;
            continue;
        }
        if record.post_date.is_none() {
            record.post_date = record.imported_at.clone();
        }
        match record.resolved_epoch_ms() {
            Some(ts) if age_in_days(now_ms, ts) <= config.retention_days as f64 => {
                survivors.push((ts, record));
            }
            _ => dropped_expired += 1,
        }
    }

    survivors.sort_by_key(|(ts, _)| Reverse(*ts));
    let updated_at = iso_from_datetime(now);
    let dataset = Dataset {
        updated_at: Some(updated_at.clone()),
        items: survivors.into_iter().map(|(_, record)| record).collect(),
        extra,
    };
    let receipt = store.write_json(&dataset).await?;

    let report = CleanReport {
        kept: dataset.items.len(),
        dropped_without_id,
        dropped_duplicates,
        dropped_expired,
        updated_at,
        receipt,
    };
    info!(
        destination = %config.destination.display(),
        kept = report.kept,
        dropped_without_id,
        dropped_duplicates,
        dropped_expired,
        retention_days = config.retention_days,
        "dataset cleaned"
    );
    Ok(report)
}

/// Splits a dataset document into its raw items and the remaining top-level
/// fields (minus `updatedAt`). Missing or null `items` is an empty list.
pub fn split_document(
    document: JsonValue,
    path: &Path,
) -> Result<(Vec<JsonValue>, Map<String, JsonValue>), FeedError> {
    let shape_error = |message: &str| FeedError::Shape {
        context: path.display().to_string(),
        message: message.to_string(),
    };
    let JsonValue::Object(mut document) = document else {
        return Err(shape_error("dataset root must be an object"));
    };
    let items = match document.remove("items") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items,
        Some(_) => return Err(shape_error("`items` must be an array")),
    };
    document.remove("updatedAt");
    Ok((items, document))
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry, FeedError> {
    let text = fs::read_to_string(path).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            FeedError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            FeedError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    serde_yaml::from_str(&text)
        .map_err(|err| FeedError::Config(format!("parsing {}: {err}", path.display())))
}

#[derive(Debug, Clone)]
pub struct CollectSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub fetched_records: usize,
    pub outcome: CollectOutcome,
}

/// Fetches every enabled source in registry order and saves the combined batch.
/// The first failing source aborts the run before anything is written.
pub async fn run_collect_once(settings: &SyncSettings) -> Result<CollectSummary> {
    run_collect_with(settings, &settings.pipeline_config()).await
}

pub async fn run_collect_with(
    settings: &SyncSettings,
    config: &PipelineConfig,
) -> Result<CollectSummary> {
    let run_id = Uuid::new_v4();
    let started_at = config.clock.now();
    let span = info_span!("collect", %run_id);

    async move {
        let registry = load_source_registry(&settings.sources_path)
            .await
            .with_context(|| format!("loading source registry {}", settings.sources_path.display()))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(settings.http_timeout_secs),
            user_agent: Some(settings.user_agent.clone()),
        })?;
        let ctx = FetchContext {
            run_id,
            fetched_at: started_at,
            workspace_root: settings.workspace_root.clone(),
        };

        let enabled = registry
            .sources
            .iter()
            .filter(|s| s.enabled)
            .collect::<Vec<_>>();
        let mut raw = Vec::new();
        for source in &enabled {
            let adapter = adapter_for_source(source)?;
            let batch = fetch_stamped(adapter.as_ref(), &http, &ctx)
                .await
                .with_context(|| format!("fetching source {}", source.source_id))?;
            raw.extend(batch);
        }

        let fetched_records = raw.len();
        let outcome = save_records(&raw, config)
            .await
            .context("saving collected records")?;

        Ok(CollectSummary {
            run_id,
            started_at,
            finished_at: config.clock.now(),
            enabled_sources: enabled.len(),
            fetched_records,
            outcome,
        })
    }
    .instrument(span)
    .await
}

pub async fn run_clean_once(settings: &SyncSettings) -> Result<CleanReport> {
    let config = settings.pipeline_config();
    clean_jobs(&config)
        .await
        .with_context(|| format!("cleaning {}", config.destination.display()))
}

/// Finds the typed pipeline error inside an anyhow chain.
pub fn error_kind(err: &anyhow::Error) -> Option<FeedErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<FeedError>())
        .map(FeedError::kind)
}

fn error_is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<FeedError>())
        .is_some_and(FeedError::is_retryable)
}

/// One collect-then-clean pass. Cycles never overlap: a tick that finds the
/// previous cycle still running is skipped.
pub async fn run_scheduled_cycle(settings: &SyncSettings, writer_lock: &Mutex<()>) {
    let Ok(_guard) = writer_lock.try_lock() else {
        warn!("previous cycle still running; skipping this tick");
        return;
    };

    match run_collect_once(settings).await {
        Ok(summary) => match &summary.outcome {
            CollectOutcome::Saved(dataset) => info!(
                run_id = %summary.run_id,
                sources = summary.enabled_sources,
                saved = dataset.items.len(),
                "scheduled collect finished"
            ),
            CollectOutcome::EmptyBatch => info!(run_id = %summary.run_id, "scheduled collect was a no-op"),
        },
        Err(err) => error!(
            kind = ?error_kind(&err),
            retryable = error_is_retryable(&err),
            "scheduled collect failed: {err:#}"
        ),
    }

    match run_clean_once(settings).await {
        Ok(report) => info!(kept = report.kept, "scheduled clean finished"),
        Err(err) => error!(kind = ?error_kind(&err), "scheduled clean failed: {err:#}"),
    }
}

pub async fn maybe_build_scheduler(settings: &SyncSettings) -> Result<Option<JobScheduler>> {
    if !settings.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let shared = Arc::new(settings.clone());
    let writer_lock = Arc::new(Mutex::new(()));
    let job = Job::new_async(settings.schedule_cron.as_str(), move |_uuid, _l| {
        let settings = shared.clone();
        let writer_lock = writer_lock.clone();
        Box::pin(async move {
            run_scheduled_cycle(&settings, &writer_lock).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", settings.schedule_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
