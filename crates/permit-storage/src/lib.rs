//! HTTP transport with shared retry policy, upsert destinations and raw payload archive.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use permit_core::RawRecord;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "permit-storage";

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
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff (`base * 2^attempt`, capped) plus uniform jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; used by tests and dry runs against fixtures.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let jitter_cap = self.max_jitter.as_millis() as u64;
        let jitter_ms = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        self.delay_for_attempt(attempt_index) + Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < policy.max_retries =>
            {
                let delay = policy.jittered_delay(attempt);
                warn!(
                    call = label,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// GET-only transport every source fetcher goes through.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url, headers: &[(String, String)]) -> Result<FetchedResponse, FetchError>;
}

pub async fn get_json<T: DeserializeOwned>(
    http: &dyn HttpTransport,
    url: &Url,
    headers: &[(String, String)],
) -> Result<T, FetchError> {
    let resp = http.get(url, headers).await?;
    serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
        url: resp.final_url,
        source,
    })
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    async fn get_once(&self, url: &Url, headers: &[(String, String)]) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let resp = request.send().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|source| FetchError::Request {
                url: final_url.clone(),
                source,
            })?
            .to_vec();
        debug!(url = %final_url, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status: status.as_u16(),
            final_url,
            body,
        })
    }
}

#[async_trait]
impl HttpTransport for HttpFetcher {
    async fn get(&self, url: &Url, headers: &[(String, String)]) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", url = %url);
        with_retry(&self.retry, url.as_str(), || async move { self.get_once(url, headers).await })
            .instrument(span)
            .await
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request to {table} failed: {source}")]
    Request {
        table: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{table} rejected request with status {status}: {body}")]
    Rejected {
        table: String,
        status: u16,
        body: String,
    },
    #[error("row for {table} is missing conflict column `{column}`")]
    MissingConflictColumn { table: String, column: String },
    #[error("{table} batch contains conflict key {key} more than once")]
    DuplicateConflictKey { table: String, key: String },
    #[error("unexpected response from {table}: {message}")]
    Malformed { table: String, message: String },
    #[error("invalid destination url: {0}")]
    Url(String),
}

/// Equality filter, rendered as PostgREST `column=eq.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqFilter {
    pub column: String,
    pub value: String,
}

impl EqFilter {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Row store addressed by table name. Upserts are all-or-nothing per call.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn upsert_rows(&self, table: &str, on_conflict: &str, rows: &[JsonValue]) -> Result<(), SinkError>;

    async fn select_rows(&self, table: &str, filters: &[EqFilter]) -> Result<Vec<JsonValue>, SinkError>;

    async fn count_rows(&self, table: &str, filters: &[EqFilter]) -> Result<u64, SinkError>;
}

/// PostgREST (Supabase) destination authenticated with a service-role key.
#[derive(Debug)]
pub struct RestDestination {
    client: reqwest::Client,
    base_url: String,
}

impl RestDestination {
    pub fn new(base_url: &str, service_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(service_key).context("service role key is not a valid header value")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {service_key}"))
            .context("service role key is not a valid header value")?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("building destination client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, table: &str, params: &[(String, String)]) -> Result<Url, SinkError> {
        rest_endpoint(&self.base_url, table, params)
    }

    async fn rejected(table: &str, resp: reqwest::Response) -> SinkError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        SinkError::Rejected {
            table: table.to_string(),
            status,
            body,
        }
    }
}

pub fn rest_endpoint(base_url: &str, table: &str, params: &[(String, String)]) -> Result<Url, SinkError> {
    let raw = format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table);
    Url::parse_with_params(&raw, params).map_err(|e| SinkError::Url(format!("{raw}: {e}")))
}

fn filter_params(filters: &[EqFilter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|f| (f.column.clone(), format!("eq.{}", f.value)))
        .collect()
}

/// Total from a PostgREST `Content-Range` header (`0-24/318` or `*/0`).
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl Destination for RestDestination {
    async fn upsert_rows(&self, table: &str, on_conflict: &str, rows: &[JsonValue]) -> Result<(), SinkError> {
        let url = self.endpoint(table, &[("on_conflict".to_string(), on_conflict.to_string())])?;
        let resp = self
            .client
            .post(url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await
            .map_err(|source| SinkError::Request {
                table: table.to_string(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(Self::rejected(table, resp).await);
        }
        Ok(())
    }

    async fn select_rows(&self, table: &str, filters: &[EqFilter]) -> Result<Vec<JsonValue>, SinkError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(filter_params(filters));
        let url = self.endpoint(table, &params)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| SinkError::Request {
                table: table.to_string(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(Self::rejected(table, resp).await);
        }
        resp.json::<Vec<JsonValue>>()
            .await
            .map_err(|e| SinkError::Malformed {
                table: table.to_string(),
                message: e.to_string(),
            })
    }

    async fn count_rows(&self, table: &str, filters: &[EqFilter]) -> Result<u64, SinkError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(filter_params(filters));
        let url = self.endpoint(table, &params)?;
        let resp = self
            .client
            .head(url)
            .header("Prefer", "count=exact")
            .header("Range-Unit", "items")
            .header("Range", "0-0")
            .send()
            .await
            .map_err(|source| SinkError::Request {
                table: table.to_string(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(Self::rejected(table, resp).await);
        }
        resp.headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| SinkError::Malformed {
                table: table.to_string(),
                message: "missing or unparseable Content-Range header".to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertCall {
    pub table: String,
    pub on_conflict: String,
    pub rows: usize,
}

/// In-process destination with PostgREST merge-duplicates semantics.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    tables: Mutex<BTreeMap<String, BTreeMap<Vec<String>, JsonValue>>>,
    calls: Mutex<Vec<UpsertCall>>,
}

fn render_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn row_matches(row: &JsonValue, filters: &[EqFilter]) -> bool {
    filters.iter().all(|f| {
        row.get(&f.column)
            .map(|v| render_cell(v) == f.value)
            .unwrap_or(false)
    })
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<UpsertCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn rows(&self, table: &str) -> Vec<JsonValue> {
        self.tables
            .lock()
            .map(|t| {
                t.get(table)
                    .map(|rows| rows.values().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn conflict_key(table: &str, columns: &[&str], row: &JsonValue) -> Result<Vec<String>, SinkError> {
        columns
            .iter()
            .map(|column| {
                row.get(*column)
                    .filter(|v| !v.is_null())
                    .map(render_cell)
                    .ok_or_else(|| SinkError::MissingConflictColumn {
                        table: table.to_string(),
                        column: column.to_string(),
                    })
            })
            .collect()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn upsert_rows(&self, table: &str, on_conflict: &str, rows: &[JsonValue]) -> Result<(), SinkError> {
        let columns = on_conflict.split(',').map(str::trim).collect::<Vec<_>>();

        // Validate the whole batch first so a bad row leaves the table untouched.
        let mut keyed = Vec::with_capacity(rows.len());
        let mut seen = std::collections::HashSet::new();
        for row in rows {
            let key = Self::conflict_key(table, &columns, row)?;
            if !seen.insert(key.clone()) {
                return Err(SinkError::DuplicateConflictKey {
                    table: table.to_string(),
                    key: key.join(","),
                });
            }
            keyed.push((key, row));
        }

        let mut tables = self.tables.lock().map_err(|_| SinkError::Malformed {
            table: table.to_string(),
            message: "memory destination lock poisoned".to_string(),
        })?;
        let stored = tables.entry(table.to_string()).or_default();
        for (key, row) in keyed {
            if let (Some(JsonValue::Object(existing)), Some(incoming)) = (stored.get_mut(&key), row.as_object()) {
                for (column, value) in incoming {
                    existing.insert(column.clone(), value.clone());
                }
                continue;
            }
            stored.insert(key, row.clone());
        }
        drop(tables);

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(UpsertCall {
                table: table.to_string(),
                on_conflict: on_conflict.to_string(),
                rows: rows.len(),
            });
        }
        Ok(())
    }

    async fn select_rows(&self, table: &str, filters: &[EqFilter]) -> Result<Vec<JsonValue>, SinkError> {
        Ok(self
            .rows(table)
            .into_iter()
            .filter(|row| row_matches(row, filters))
            .collect())
    }

    async fn count_rows(&self, table: &str, filters: &[EqFilter]) -> Result<u64, SinkError> {
        Ok(self.select_rows(table, filters).await?.len() as u64)
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw source payloads, kept for audit.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(&self, source_id: &str, fetched_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        PathBuf::from(source_id)
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(format!("{content_hash}.json"))
    }

    pub async fn archive_records(
        &self,
        source_id: &str,
        fetched_at: DateTime<Utc>,
        records: &[RawRecord],
    ) -> anyhow::Result<ArchivedPayload> {
        let bytes = serde_json::to_vec(records).context("serializing raw records")?;
        let content_hash = Self::content_hash(&bytes);
        let relative_path = self.relative_path_for(source_id, fetched_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let mut payload = ArchivedPayload {
            content_hash,
            relative_path,
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated: true,
        };
        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(payload);
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("moving archive into place at {}", absolute_path.display()));
        }
        payload.deduplicated = false;
        Ok(payload)
    }
}
