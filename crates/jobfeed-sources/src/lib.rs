//! Source adapter contracts + JSON API, HTML listing and fixture adapters.
//!
//! Every adapter turns one upstream endpoint into a batch of raw, loosely
//! post-shaped JSON objects. Nothing here knows about ids or retention.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfeed_core::{iso_from_datetime, FeedError};
use jobfeed_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-sources";

/// Keys probed, in order, when a JSON payload is an object rather than an array.
const ITEM_ARRAY_KEYS: &[&str] = &["items", "results", "data"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    JsonApi,
    HtmlListing,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub url: Option<String>,
    /// When present the JSON API is called with POST and this body.
    #[serde(default)]
    pub request_body: Option<JsonValue>,
    /// JSON pointer (RFC 6901) to the item array inside the payload.
    #[serde(default)]
    pub items_pointer: Option<String>,
    #[serde(default)]
    pub selectors: Option<HtmlSelectors>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HtmlSelectors {
    pub item: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub workspace_root: PathBuf,
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn display_name(&self) -> &str;

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<JsonValue>, FeedError>;
}

/// Fetches one source and stamps provenance on every object in the batch.
pub async fn fetch_stamped(
    source: &dyn RecordSource,
    http: &HttpFetcher,
    ctx: &FetchContext,
) -> Result<Vec<JsonValue>, FeedError> {
    let raw = source.fetch_batch(http, ctx).await?;
    let fetched = raw.len();
    let batch = stamp_batch(raw, source.display_name(), ctx.fetched_at);
    info!(
        run_id = %ctx.run_id,
        source_id = source.source_id(),
        fetched,
        usable = batch.len(),
        "source batch fetched"
    );
    Ok(batch)
}

/// Drops non-object items and fills `fetched_at` / `source` where absent.
pub fn stamp_batch(
    items: Vec<JsonValue>,
    display_name: &str,
    fetched_at: DateTime<Utc>,
) -> Vec<JsonValue> {
    let stamp = iso_from_datetime(fetched_at);
    items
        .into_iter()
        .filter_map(|item| match item {
            JsonValue::Object(mut map) => {
                map.entry("fetched_at")
                    .or_insert_with(|| JsonValue::String(stamp.clone()));
                map.entry("source")
                    .or_insert_with(|| JsonValue::String(display_name.to_string()));
                Some(JsonValue::Object(map))
            }
            _ => None,
        })
        .collect()
}

/// Locates the item array in a JSON payload.
pub fn extract_json_items(
    payload: JsonValue,
    pointer: Option<&str>,
    context: &str,
) -> Result<Vec<JsonValue>, FeedError> {
    let target = match pointer {
        Some(pointer) => payload
            .pointer(pointer)
            .cloned()
            .ok_or_else(|| FeedError::Shape {
                context: context.to_string(),
                message: format!("pointer {pointer} not present"),
            })?,
        None => payload,
    };

    match target {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => ITEM_ARRAY_KEYS
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(JsonValue::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| FeedError::Shape {
                context: context.to_string(),
                message: format!("no item array under {}", ITEM_ARRAY_KEYS.join("/")),
            }),
        other => Err(FeedError::Shape {
            context: context.to_string(),
            message: format!("expected an array or object, got {}", json_type_name(&other)),
        }),
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, FeedError> {
    Selector::parse(selector)
        .map_err(|e| FeedError::Config(format!("invalid selector `{selector}`: {e}")))
}

fn parse_optional_selector(selector: Option<&str>) -> Result<Option<Selector>, FeedError> {
    selector.map(parse_selector).transpose()
}

fn select_first_text(element: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    let selector = selector?;
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(
    element: ElementRef<'_>,
    selector: Option<&Selector>,
    attr: &str,
) -> Option<String> {
    let selector = selector?;
    element
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Scrapes one object per `item` match. Items without a title or a link are skipped.
pub fn parse_html_listing(
    html: &str,
    selectors: &HtmlSelectors,
) -> Result<Vec<JsonValue>, FeedError> {
    let item = parse_selector(&selectors.item)?;
    let title = parse_optional_selector(selectors.title.as_deref())?;
    let link = parse_optional_selector(selectors.link.as_deref())?;
    let date = parse_optional_selector(selectors.date.as_deref())?;
    let text = parse_optional_selector(selectors.text.as_deref())?;

    let document = Html::parse_document(html);
    let mut out = Vec::new();
    for element in document.select(&item) {
        let title_value = select_first_text(element, title.as_ref());
        let link_value = select_first_attr(element, link.as_ref(), "href");
        if title_value.is_none() && link_value.is_none() {
            continue;
        }
        let date_value = select_first_attr(element, date.as_ref(), "datetime")
            .or_else(|| select_first_text(element, date.as_ref()));
        let text_value = select_first_text(element, text.as_ref());

        let mut map = Map::new();
        for (key, value) in [
            ("title", title_value),
            ("url", link_value),
            ("postDate", date_value),
            ("text", text_value),
        ] {
            if let Some(value) = value {
                map.insert(key.to_string(), JsonValue::String(value));
            }
        }
        out.push(JsonValue::Object(map));
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct JsonApiSource {
    source_id: String,
    display_name: String,
    url: String,
    request_body: Option<JsonValue>,
    items_pointer: Option<String>,
}

#[async_trait]
impl RecordSource for JsonApiSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        _ctx: &FetchContext,
    ) -> Result<Vec<JsonValue>, FeedError> {
        let payload = match &self.request_body {
            Some(body) => http.post_json(&self.url, body).await?,
            None => http.get_json(&self.url).await?,
        };
        extract_json_items(payload, self.items_pointer.as_deref(), &self.url)
    }
}

#[derive(Debug, Clone)]
pub struct HtmlListingSource {
    source_id: String,
    display_name: String,
    url: String,
    selectors: HtmlSelectors,
}

#[async_trait]
impl RecordSource for HtmlListingSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        _ctx: &FetchContext,
    ) -> Result<Vec<JsonValue>, FeedError> {
        let response = http.get_bytes(&self.url).await?;
        debug!(
            source_id = %self.source_id,
            status = %response.status,
            final_url = %response.final_url,
            bytes = response.body.len(),
            "listing page fetched"
        );
        let html = String::from_utf8_lossy(&response.body);
        parse_html_listing(&html, &self.selectors)
    }
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    display_name: String,
    path: PathBuf,
    items_pointer: Option<String>,
}

impl FixtureSource {
    fn resolve_path(&self, workspace_root: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            workspace_root.join(&self.path)
        }
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn fetch_batch(
        &self,
        _http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<JsonValue>, FeedError> {
        let path = self.resolve_path(&ctx.workspace_root);
        let data = fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                FeedError::NotFound { path: path.clone() }
            } else {
                FeedError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        let payload: JsonValue = serde_json::from_str(&data).map_err(|source| FeedError::Parse {
            context: path.display().to_string(),
            source,
        })?;
        extract_json_items(
            payload,
            self.items_pointer.as_deref(),
            &path.display().to_string(),
        )
    }
}

fn required<T: Clone>(value: &Option<T>, field: &str, source_id: &str) -> Result<T, FeedError> {
    value
        .clone()
        .ok_or_else(|| FeedError::Config(format!("source {source_id} requires `{field}`")))
}

pub fn adapter_for_source(config: &SourceConfig) -> Result<Box<dyn RecordSource>, FeedError> {
    let source_id = config.source_id.clone();
    let display_name = config.display_name.clone();
    match config.kind {
        SourceKind::JsonApi => Ok(Box::new(JsonApiSource {
            url: required(&config.url, "url", &source_id)?,
            request_body: config.request_body.clone(),
            items_pointer: config.items_pointer.clone(),
            source_id,
            display_name,
        })),
        SourceKind::HtmlListing => Ok(Box::new(HtmlListingSource {
            url: required(&config.url, "url", &source_id)?,
            selectors: required(&config.selectors, "selectors", &source_id)?,
            source_id,
            display_name,
        })),
        SourceKind::Fixture => Ok(Box::new(FixtureSource {
            path: required(&config.fixture_path, "fixture_path", &source_id)?,
            items_pointer: config.items_pointer.clone(),
            source_id,
            display_name,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobfeed_core::FeedErrorKind;
    use jobfeed_storage::HttpClientConfig;
    use serde_json::json;
    use tempfile::tempdir;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 6, 0, 0).single().unwrap()
    }

    fn fixture_config(path: PathBuf) -> SourceConfig {
        SourceConfig {
            source_id: "fixture-board".into(),
            display_name: "Fixture Board".into(),
            enabled: true,
            kind: SourceKind::Fixture,
            url: None,
            request_body: None,
            items_pointer: None,
            selectors: None,
            fixture_path: Some(path),
        }
    }

    #[test]
    fn json_items_are_found_by_pointer_array_or_known_key() {
        let items = extract_json_items(json!([{"id": 1}]), None, "t").unwrap();
        assert_eq!(items.len(), 1);

        let items = extract_json_items(json!({"results": [{"id": 1}, {"id": 2}]}), None, "t").unwrap();
        assert_eq!(items.len(), 2);

        let nested = json!({"payload": {"posts": [{"id": 1}]}});
        let items = extract_json_items(nested, Some("/payload/posts"), "t").unwrap();
        assert_eq!(items, vec![json!({"id": 1})]);

        let err = extract_json_items(json!({"count": 0}), None, "t").unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::Parse);
        let err = extract_json_items(json!("oops"), None, "t").unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::Parse);
    }

    #[test]
    fn stamping_fills_missing_provenance_and_drops_non_objects() {
        let items = vec![
            json!({"id": "a"}),
            json!({"id": "b", "fetched_at": "2024-01-01T00:00:00Z", "source": "Upstream"}),
            json!("not an object"),
        ];
        let stamped = stamp_batch(items, "Board", fetched_at());
        assert_eq!(stamped.len(), 2);
        assert_eq!(stamped[0]["fetched_at"], "2024-02-01T06:00:00.000Z");
        assert_eq!(stamped[0]["source"], "Board");
        assert_eq!(stamped[1]["fetched_at"], "2024-01-01T00:00:00Z");
        assert_eq!(stamped[1]["source"], "Upstream");
    }

    #[test]
    fn html_listing_scrapes_cards_with_selectors() {
        let html = r#"
            <ul>
              <li class="job">
                <a class="title" href="https://jobs.example/1">  Rust   Engineer </a>
                <time datetime="2024-01-28T09:00:00Z">3 days ago</time>
                <p class="summary">Build ingestion pipelines.</p>
              </li>
              <li class="job">
                <a class="title" href="https://jobs.example/2">Data Engineer</a>
                <time>2024-01-20</time>
              </li>
              <li class="job"><p class="summary">No title or link here.</p></li>
            </ul>
        "#;
        let selectors = HtmlSelectors {
            item: "li.job".into(),
            title: Some("a.title".into()),
            link: Some("a.title".into()),
            date: Some("time".into()),
            text: Some("p.summary".into()),
        };
        let items = parse_html_listing(html, &selectors).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["title"], "Rust Engineer");
        assert_eq!(items[0]["url"], "https://jobs.example/1");
        assert_eq!(items[0]["postDate"], "2024-01-28T09:00:00Z");
        assert_eq!(items[0]["text"], "Build ingestion pipelines.");
        assert_eq!(items[1]["postDate"], "2024-01-20");
        assert!(items[1].get("text").is_none());
    }

    #[test]
    fn invalid_selectors_are_configuration_errors() {
        let selectors = HtmlSelectors {
            item: "li[".into(),
            title: None,
            link: None,
            date: None,
            text: None,
        };
        let err = parse_html_listing("<ul></ul>", &selectors).unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::Config);
    }

    #[test]
    fn adapters_require_their_settings() {
        let mut config = fixture_config(PathBuf::from("x.json"));
        config.kind = SourceKind::JsonApi;
        let err = adapter_for_source(&config).err().expect("missing url");
        assert_eq!(err.kind(), FeedErrorKind::Config);

        config.kind = SourceKind::HtmlListing;
        config.url = Some("https://jobs.example".into());
        let err = adapter_for_source(&config).err().expect("missing selectors");
        assert_eq!(err.kind(), FeedErrorKind::Config);
    }

    #[tokio::test]
    async fn fixture_source_reads_relative_to_workspace_root() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("batch.json"),
            r#"{"items": [{"id": "job-1", "title": "Rust"}, 7]}"#,
        )
        .expect("write fixture");

        let source = adapter_for_source(&fixture_config(PathBuf::from("batch.json"))).unwrap();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            fetched_at: fetched_at(),
            workspace_root: dir.path().to_path_buf(),
        };
        let batch = fetch_stamped(source.as_ref(), &http, &ctx).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["source"], "Fixture Board");
    }

    #[tokio::test]
    async fn missing_fixture_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let source = adapter_for_source(&fixture_config(PathBuf::from("absent.json"))).unwrap();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            fetched_at: fetched_at(),
            workspace_root: dir.path().to_path_buf(),
        };
        let err = source.fetch_batch(&http, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::NotFound);
    }
}
