//! Atomic JSON file storage + HTTP fetch utilities for jobfeed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use jobfeed_core::FeedError;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// A single JSON document on disk, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn read_bytes(&self) -> Result<Vec<u8>, FeedError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(FeedError::NotFound {
                path: self.path.clone(),
            }),
            Err(source) => Err(FeedError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub async fn read_value(&self) -> Result<JsonValue, FeedError> {
        self.read_json().await
    }

    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, FeedError> {
        let bytes = self.read_bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| FeedError::Parse {
            context: self.path.display().to_string(),
            source,
        })
    }

    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<WriteReceipt, FeedError> {
        let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| FeedError::Parse {
            context: format!("serializing {}", self.path.display()),
            source,
        })?;
        bytes.push(b'\n');
        self.write_bytes(&bytes).await
    }

    /// Write via a temp file in the target directory and rename it over the target.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<WriteReceipt, FeedError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(|source| FeedError::Io {
            path: parent.clone(),
            source,
        })?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        if let Err(source) = write_new_file(&temp_path, bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(FeedError::Io {
                path: temp_path,
                source,
            });
        }

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(FeedError::Io {
                path: self.path.clone(),
                source,
            });
        }

        let receipt = WriteReceipt {
            path: self.path.clone(),
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        };
        debug!(path = %receipt.path.display(), hash = %receipt.content_hash, bytes = receipt.byte_size, "json document written");
        Ok(receipt)
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Thin reqwest wrapper. One attempt per call; the caller's scheduler owns retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FeedError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| FeedError::Config(format!("building http client: {err}")))?;
        Ok(Self { client })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, FeedError> {
        self.execute(url, self.client.get(url)).await
    }

    pub async fn get_json(&self, url: &str) -> Result<JsonValue, FeedError> {
        let response = self.get_bytes(url).await?;
        parse_json_body(url, &response.body)
    }

    pub async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, FeedError> {
        let response = self.execute(url, self.client.post(url).json(body)).await?;
        parse_json_body(url, &response.body)
    }

    async fn execute(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FeedError> {
        let span = info_span!("http_fetch", url);
        async move {
            let response = request.send().await.map_err(|err| network_error(url, &err))?;
            let status = response.status();
            let final_url = response.url().to_string();

            if !status.is_success() {
                return Err(FeedError::Network {
                    url: final_url,
                    message: format!("http status {status}"),
                    retryable: classify_status(status) == RetryDisposition::Retryable,
                });
            }

            let body = response
                .bytes()
                .await
                .map_err(|err| network_error(url, &err))?
                .to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn network_error(url: &str, err: &reqwest::Error) -> FeedError {
    FeedError::Network {
        url: url.to_string(),
        message: err.to_string(),
        retryable: classify_reqwest_error(err) == RetryDisposition::Retryable,
    }
}

fn parse_json_body(url: &str, body: &[u8]) -> Result<JsonValue, FeedError> {
    serde_json::from_slice(body).map_err(|source| FeedError::Parse {
        context: format!("response from {url}"),
        source,
    })
}
