//! Sync pipeline orchestration: configuration, source registry, dedup, chunked upsert,
//! run reports, etl_state tracking and the cron scheduler.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use permit_adapters::{
    build_fetcher, AdapterError, FeedKind, FetchWindow, FetcherSettings, FieldAliasOverrides, FieldAliases,
    Normalizer,
};
use permit_core::{
    EtlState, PermitRecord, RawRecord, RunStatus, ETL_STATE_CONFLICT_KEY, ETL_STATE_TABLE, PERMITS_TABLE,
    PERMIT_CONFLICT_KEY,
};
use permit_storage::{
    Destination, EqFilter, HttpClientConfig, HttpFetcher, HttpTransport, MemoryDestination, RawArchive,
    RestDestination, SinkError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "permit-sync";

pub const DEFAULT_LOOKBACK_DAYS: u32 = 7;
pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_USER_AGENT: &str = "permit-etl/0.1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(String),
    #[error("invalid value {value:?} for {var}: {message}")]
    InvalidVar {
        var: String,
        value: String,
        message: String,
    },
    #[error("source registry {path}: {message}")]
    Registry { path: String, message: String },
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("source {source_id} feed {feed}: {var} is not set and the feed has no default url")]
    MissingFeedUrl {
        source_id: String,
        feed: String,
        var: String,
    },
}

impl ConfigError {
    /// Errors caused by what the operator typed rather than by the environment.
    pub fn is_usage(&self) -> bool {
        matches!(self, ConfigError::UnknownSource(_))
    }
}

fn env_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "YES")
}

fn non_empty<F>(lookup: &F, var: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_var<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, var) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidVar {
            var: var.to_string(),
            value: raw.clone(),
            message: e.to_string(),
        }),
    }
}

fn positive<T: PartialOrd + Default + ToString>(var: &str, value: T) -> Result<T, ConfigError> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidVar {
            var: var.to_string(),
            value: value.to_string(),
            message: "must be greater than zero".to_string(),
        })
    }
}

/// Process configuration, read once at startup and passed down by reference.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub supabase_url: Option<String>,
    pub service_role_key: Option<String>,
    pub days: u32,
    pub allow_empty: bool,
    pub sources_file: PathBuf,
    pub logs_dir: PathBuf,
    pub permits_table: String,
    pub chunk_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub socrata_app_token: Option<String>,
    pub archive_dir: Option<PathBuf>,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            supabase_url: non_empty(&lookup, "SUPABASE_URL"),
            service_role_key: non_empty(&lookup, "SUPABASE_SERVICE_ROLE_KEY"),
            days: positive("DAYS", parse_var(&lookup, "DAYS", DEFAULT_LOOKBACK_DAYS)?)?,
            allow_empty: non_empty(&lookup, "ETL_ALLOW_EMPTY")
                .map(|v| env_flag(&v))
                .unwrap_or(false),
            sources_file: non_empty(&lookup, "SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            logs_dir: non_empty(&lookup, "LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
            permits_table: non_empty(&lookup, "PERMITS_TABLE").unwrap_or_else(|| PERMITS_TABLE.to_string()),
            chunk_size: positive(
                "UPSERT_CHUNK_SIZE",
                parse_var(&lookup, "UPSERT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            )?,
            http_timeout_secs: positive(
                "PERMIT_HTTP_TIMEOUT_SECS",
                parse_var(&lookup, "PERMIT_HTTP_TIMEOUT_SECS", 30u64)?,
            )?,
            user_agent: non_empty(&lookup, "PERMIT_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            socrata_app_token: non_empty(&lookup, "SOCRATA_APP_TOKEN"),
            archive_dir: non_empty(&lookup, "ARCHIVE_DIR").map(PathBuf::from),
            sync_cron: non_empty(&lookup, "SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }

    /// Destination URL and service-role key; required for anything but a dry run.
    pub fn credentials(&self) -> Result<(&str, &str), ConfigError> {
        let url = self
            .supabase_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("SUPABASE_URL".to_string()))?;
        let key = self
            .service_role_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("SUPABASE_SERVICE_ROLE_KEY".to_string()))?;
        Ok((url, key))
    }

    pub fn http_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookbackError {
    #[error("empty lookback")]
    Empty,
    #[error("`{0}` is not a lookback like 7d, 12h or 30m")]
    Malformed(String),
    #[error("lookback must be greater than zero")]
    Zero,
}

/// `7d`, `12h`, `30m`; a bare number means days.
pub fn parse_lookback(input: &str) -> Result<Duration, LookbackError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(LookbackError::Empty);
    }
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: i64 = digits
        .parse()
        .map_err(|_| LookbackError::Malformed(trimmed.to_string()))?;
    if amount == 0 {
        return Err(LookbackError::Zero);
    }
    let lookback = match unit.to_ascii_lowercase().as_str() {
        "" | "d" => Duration::try_days(amount),
        "h" => Duration::try_hours(amount),
        "m" => Duration::try_minutes(amount),
        _ => None,
    };
    lookback.ok_or_else(|| LookbackError::Malformed(trimmed.to_string()))
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub source_system: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub fields: FieldAliasOverrides,
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable that supplies or overrides `url`.
    #[serde(default)]
    pub url_env: Option<String>,
    #[serde(flatten)]
    pub kind: FeedKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
    All,
    Named(Vec<String>),
}

/// A registry entry with URLs resolved and aliases merged, ready to run.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub source_id: String,
    pub source_system: String,
    pub display_name: String,
    pub lookback_days: Option<u32>,
    pub aliases: FieldAliases,
    pub feeds: Vec<ResolvedFeed>,
}

#[derive(Debug, Clone)]
pub struct ResolvedFeed {
    pub label: String,
    pub kind: FeedKind,
    pub url: String,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let registry: SourceRegistry = serde_yaml::from_str(text).map_err(|e| ConfigError::Registry {
            path: origin.display().to_string(),
            message: e.to_string(),
        })?;
        registry.validate(origin)?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).await.map_err(|e| ConfigError::Registry {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&text, path)
    }

    fn validate(&self, origin: &Path) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Registry {
            path: origin.display().to_string(),
            message,
        };
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(invalid(format!("duplicate source_id `{}`", source.source_id)));
            }
            if source.source_system.trim().is_empty() {
                return Err(invalid(format!("source `{}` has an empty source_system", source.source_id)));
            }
            if source.feeds.is_empty() {
                return Err(invalid(format!("source `{}` has no feeds", source.source_id)));
            }
            if source.lookback_days == Some(0) {
                return Err(invalid(format!("source `{}` has lookback_days 0", source.source_id)));
            }
            for feed in &source.feeds {
                if feed.url.is_none() && feed.url_env.is_none() {
                    return Err(invalid(format!(
                        "source `{}` has a feed with neither url nor url_env",
                        source.source_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    /// `All` means every enabled source; named sources run even when disabled.
    pub fn select(&self, selection: &SourceSelection) -> Result<Vec<&SourceConfig>, ConfigError> {
        match selection {
            SourceSelection::All => Ok(self.sources.iter().filter(|s| s.enabled).collect()),
            SourceSelection::Named(ids) => ids
                .iter()
                .map(|id| self.get(id).ok_or_else(|| ConfigError::UnknownSource(id.clone())))
                .collect(),
        }
    }

    pub fn resolve<F>(&self, selection: &SourceSelection, lookup: F) -> Result<Vec<ResolvedSource>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.select(selection)?
            .into_iter()
            .map(|source| source.resolve(&lookup))
            .collect()
    }
}

impl SourceConfig {
    pub fn resolve<F>(&self, lookup: &F) -> Result<ResolvedSource, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let feeds = self
            .feeds
            .iter()
            .enumerate()
            .map(|(index, feed)| -> Result<ResolvedFeed, ConfigError> {
                let label = feed.name.clone().unwrap_or_else(|| format!("feed-{}", index + 1));
                let from_env = feed.url_env.as_deref().and_then(|var| non_empty(lookup, var));
                let url = from_env.or_else(|| feed.url.clone()).ok_or_else(|| ConfigError::MissingFeedUrl {
                    source_id: self.source_id.clone(),
                    feed: label.clone(),
                    var: feed.url_env.clone().unwrap_or_default(),
                })?;
                Ok(ResolvedFeed {
                    label,
                    kind: feed.kind.clone(),
                    url,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(ResolvedSource {
            source_id: self.source_id.clone(),
            source_system: self.source_system.clone(),
            display_name: self.display_name.clone(),
            lookback_days: self.lookback_days,
            aliases: FieldAliases::default().with_overrides(&self.fields),
            feeds,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub records: Vec<PermitRecord>,
    pub duplicates: usize,
}

/// Concatenates batches in order; later records with an already seen
/// (source_system, permit_id, issue day) are dropped.
pub fn dedupe_permits(batches: Vec<Vec<PermitRecord>>) -> DedupOutcome {
    let mut seen = HashSet::new();
    let mut outcome = DedupOutcome::default();
    for record in batches.into_iter().flatten() {
        if seen.insert(record.dedup_key()) {
            outcome.records.push(record);
        } else {
            outcome.duplicates += 1;
        }
    }
    outcome
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upsert batch {index} into {table} failed after {upserted} rows: {source}")]
    Batch {
        index: usize,
        table: String,
        upserted: usize,
        #[source]
        source: SinkError,
    },
    #[error("{table}: {source}")]
    Sink {
        table: String,
        #[source]
        source: SinkError,
    },
    #[error("could not encode row for {table}: {source}")]
    Encode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed row in {table}: {source}")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncError {
    /// Rows persisted before the failure.
    pub fn upserted(&self) -> usize {
        match self {
            SyncError::Batch { upserted, .. } => *upserted,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub rows: usize,
    pub batches: usize,
    /// Records folded into a later record with the same natural key.
    pub collapsed: usize,
}

/// Keeps the last record per natural key at the position of its first occurrence.
///
/// Dedup keys include the issue day, so one run can still carry a permit twice;
/// a single upsert statement cannot touch the same conflict key twice.
pub fn collapse_by_natural_key(records: &[PermitRecord]) -> (Vec<&PermitRecord>, usize) {
    let mut positions = HashMap::new();
    let mut kept: Vec<&PermitRecord> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(&record.natural_key()) {
            Some(&index) => kept[index] = record,
            None => {
                positions.insert(record.natural_key(), kept.len());
                kept.push(record);
            }
        }
    }
    let collapsed = records.len() - kept.len();
    (kept, collapsed)
}

/// Sequential, fixed-size batch upsert keyed on `source_system,permit_id`.
pub struct ChunkedUpsert<'a> {
    destination: &'a dyn Destination,
    table: &'a str,
    chunk_size: usize,
}

impl<'a> ChunkedUpsert<'a> {
    pub fn new(destination: &'a dyn Destination, table: &'a str, chunk_size: usize) -> Self {
        Self {
            destination,
            table,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn run(&self, records: &[PermitRecord]) -> Result<UpsertSummary, SyncError> {
        let (kept, collapsed) = collapse_by_natural_key(records);
        if collapsed > 0 {
            debug!(table = self.table, collapsed, "collapsed repeated natural keys");
        }
        let rows = kept
            .iter()
            .map(|record| serde_json::to_value(record))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SyncError::Encode {
                table: self.table.to_string(),
                source,
            })?;

        let mut summary = UpsertSummary {
            collapsed,
            ..Default::default()
        };
        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            debug!(table = self.table, batch = index, rows = chunk.len(), "upserting batch");
            self.destination
                .upsert_rows(self.table, PERMIT_CONFLICT_KEY, chunk)
                .await
                .map_err(|source| SyncError::Batch {
                    index,
                    table: self.table.to_string(),
                    upserted: summary.rows,
                    source,
                })?;
            summary.rows += chunk.len();
            summary.batches += 1;
        }
        Ok(summary)
    }
}

/// Row count of `table` for one source system, read back from the destination.
pub async fn verify_source(destination: &dyn Destination, table: &str, source_system: &str) -> Result<u64, SyncError> {
    destination
        .count_rows(table, &[EqFilter::new("source_system", source_system)])
        .await
        .map_err(|source| SyncError::Sink {
            table: table.to_string(),
            source,
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedOutcome {
    pub label: String,
    pub kind: String,
    pub endpoint: String,
    pub fetched: usize,
    pub error: Option<String>,
    pub archive_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub source_system: String,
    pub status: RunStatus,
    pub since: DateTime<Utc>,
    pub fetched: usize,
    pub parsed: usize,
    pub normalizer_dropped: usize,
    pub duplicates: usize,
    pub upserted: usize,
    pub failed: usize,
    pub oldest_issue_date: Option<DateTime<Utc>>,
    pub newest_issue_date: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub error: Option<String>,
    pub feeds: Vec<FeedOutcome>,
}

fn format_day(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl RunReport {
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} [{}] status={} fetched={} parsed={} dropped={} duplicates={} upserted={} failed={} oldest={} newest={} dry_run={} run_id={}",
            self.finished_at.to_rfc3339(),
            self.source_id,
            self.status,
            self.fetched,
            self.parsed,
            self.normalizer_dropped,
            self.duplicates,
            self.upserted,
            self.failed,
            format_day(self.oldest_issue_date),
            format_day(self.newest_issue_date),
            self.dry_run,
            self.run_id,
        );
        if let Some(err) = &self.error {
            line.push_str(&format!(" error={err:?}"));
        }
        line
    }
}

/// Writes `<logs>/<source>.log` (appended) and `<logs>/<source>-last-run.json` (replaced).
#[derive(Debug, Clone)]
pub struct Reporter {
    logs_dir: PathBuf,
}

impl Reporter {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    pub fn log_path(&self, source_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{source_id}.log"))
    }

    pub fn last_run_path(&self, source_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{source_id}-last-run.json"))
    }

    pub async fn write(&self, report: &RunReport) -> Result<()> {
        fs::create_dir_all(&self.logs_dir)
            .await
            .with_context(|| format!("creating {}", self.logs_dir.display()))?;

        let log_path = self.log_path(&report.source_id);
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("opening {}", log_path.display()))?;
        log.write_all(format!("{}\n", report.summary_line()).as_bytes())
            .await
            .with_context(|| format!("appending to {}", log_path.display()))?;
        log.flush().await.with_context(|| format!("flushing {}", log_path.display()))?;

        let json_path = self.last_run_path(&report.source_id);
        let temp_path = self.logs_dir.join(format!(".{}-last-run.{}.tmp", report.source_id, report.run_id));
        let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
        fs::write(&temp_path, json)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        fs::rename(&temp_path, &json_path)
            .await
            .with_context(|| format!("replacing {}", json_path.display()))?;
        Ok(())
    }

    pub async fn read_last_run(&self, source_id: &str) -> Result<Option<RunReport>> {
        let path = self.last_run_path(source_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let report = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(report))
    }
}

/// State row after `report`; `last_success` carries forward across failures.
pub fn next_state(report: &RunReport, previous: Option<&EtlState>) -> EtlState {
    let last_success = if report.status.is_ok() {
        Some(report.finished_at)
    } else {
        previous.and_then(|p| p.last_success)
    };
    EtlState {
        source: report.source_id.clone(),
        last_run: report.finished_at,
        last_success,
        status: report.status,
        records_processed: report.upserted as u64,
        error_message: report.error.clone(),
    }
}

#[derive(Clone)]
pub struct StateTracker {
    destination: Arc<dyn Destination>,
}

impl StateTracker {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self { destination }
    }

    pub async fn previous(&self, source_id: &str) -> Result<Option<EtlState>, SyncError> {
        let rows = self
            .destination
            .select_rows(ETL_STATE_TABLE, &[EqFilter::new("source", source_id)])
            .await
            .map_err(|source| SyncError::Sink {
                table: ETL_STATE_TABLE.to_string(),
                source,
            })?;
        rows.into_iter()
            .next()
            .map(serde_json::from_value::<EtlState>)
            .transpose()
            .map_err(|source| SyncError::Decode {
                table: ETL_STATE_TABLE.to_string(),
                source,
            })
    }

    pub async fn record(&self, report: &RunReport, previous: Option<&EtlState>) -> Result<EtlState, SyncError> {
        let state = next_state(report, previous);
        let row = serde_json::to_value(&state).map_err(|source| SyncError::Encode {
            table: ETL_STATE_TABLE.to_string(),
            source,
        })?;
        self.destination
            .upsert_rows(ETL_STATE_TABLE, ETL_STATE_CONFLICT_KEY, std::slice::from_ref(&row))
            .await
            .map_err(|source| SyncError::Sink {
                table: ETL_STATE_TABLE.to_string(),
                source,
            })?;
        Ok(state)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit lookback; wins over `incremental` and the configured days.
    pub since: Option<Duration>,
    pub allow_empty: bool,
    pub incremental: bool,
}

/// Lower bound of the fetch window.
pub fn resolve_since(
    options: &RunOptions,
    previous: Option<&EtlState>,
    lookback_days: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if let Some(lookback) = options.since {
        return now - lookback;
    }
    if options.incremental {
        if let Some(last_success) = previous.and_then(|p| p.last_success) {
            return last_success;
        }
    }
    now - Duration::days(i64::from(lookback_days))
}

#[derive(Debug, Default)]
struct RunTally {
    fetched: usize,
    parsed: usize,
    normalizer_dropped: usize,
    duplicates: usize,
    upserted: usize,
    failed: usize,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    feeds: Vec<FeedOutcome>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<dyn HttpTransport>,
    destination: Arc<dyn Destination>,
    state: StateTracker,
    reporter: Reporter,
    archive: Option<RawArchive>,
    dry_run: bool,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        http: Arc<dyn HttpTransport>,
        destination: Arc<dyn Destination>,
        dry_run: bool,
    ) -> Self {
        let reporter = Reporter::new(config.logs_dir.clone());
        let archive = config.archive_dir.clone().map(RawArchive::new);
        Self {
            state: StateTracker::new(destination.clone()),
            config,
            http,
            destination,
            reporter,
            archive,
            dry_run,
        }
    }

    /// Live HTTP fetcher plus PostgREST, or an in-memory destination for dry runs.
    pub fn from_config(config: SyncConfig, dry_run: bool) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let destination: Arc<dyn Destination> = if dry_run {
            Arc::new(MemoryDestination::new())
        } else {
            let (url, key) = config.credentials()?;
            Arc::new(RestDestination::new(url, key, config.http_timeout())?)
        };
        Ok(Self::new(config, Arc::new(http), destination, dry_run))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn destination(&self) -> &dyn Destination {
        self.destination.as_ref()
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub async fn run_source(&self, source: &ResolvedSource, options: &RunOptions) -> Result<RunReport> {
        self.run_source_at(source, options, Utc::now()).await
    }

    /// One full fetch → normalize → dedupe → upsert pass. Failures land in the
    /// returned report; `Err` means the report itself could not be written.
    pub async fn run_source_at(
        &self,
        source: &ResolvedSource,
        options: &RunOptions,
        now: DateTime<Utc>,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_source", source = %source.source_id, run_id = %run_id);
        async move {
            let started_at = Utc::now();
            let previous = if self.dry_run {
                None
            } else {
                match self.state.previous(&source.source_id).await {
                    Ok(previous) => previous,
                    Err(err) => {
                        warn!(error = %err, "could not read previous etl_state");
                        None
                    }
                }
            };
            let lookback_days = source.lookback_days.unwrap_or(self.config.days);
            let since = resolve_since(options, previous.as_ref(), lookback_days, now);
            info!(since = %since, dry_run = self.dry_run, "starting run");

            let mut tally = RunTally::default();
            let outcome = self.execute(source, options, FetchWindow { since, now }, &mut tally).await;
            let (status, error) = match outcome {
                Ok(status) => (status, None),
                Err(err) => (RunStatus::Failed, Some(format!("{err:#}"))),
            };

            let report = RunReport {
                run_id,
                source_id: source.source_id.clone(),
                source_system: source.source_system.clone(),
                status,
                since,
                fetched: tally.fetched,
                parsed: tally.parsed,
                normalizer_dropped: tally.normalizer_dropped,
                duplicates: tally.duplicates,
                upserted: tally.upserted,
                failed: tally.failed,
                oldest_issue_date: tally.oldest,
                newest_issue_date: tally.newest,
                started_at,
                finished_at: Utc::now(),
                dry_run: self.dry_run,
                error,
                feeds: tally.feeds,
            };

            match report.status {
                RunStatus::Failed => error!(error = report.error.as_deref().unwrap_or(""), "run failed"),
                RunStatus::Empty => warn!("run produced no permits; recorded as empty"),
                RunStatus::Success => info!(upserted = report.upserted, "run complete"),
            }

            self.reporter.write(&report).await?;
            if !self.dry_run {
                if let Err(err) = self.state.record(&report, previous.as_ref()).await {
                    warn!(error = %err, "could not record etl_state");
                }
            }
            Ok::<RunReport, anyhow::Error>(report)
        }
        .instrument(span)
        .await
    }

    /// Runs sources one after another; a failing source does not stop the rest.
    pub async fn run_many(&self, sources: &[ResolvedSource], options: &RunOptions) -> Result<Vec<RunReport>> {
        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            reports.push(self.run_source(source, options).await?);
        }
        Ok(reports)
    }

    async fn execute(
        &self,
        source: &ResolvedSource,
        options: &RunOptions,
        window: FetchWindow,
        tally: &mut RunTally,
    ) -> Result<RunStatus> {
        let settings = FetcherSettings {
            socrata_app_token: self.config.socrata_app_token.clone(),
        };

        let mut batches: Vec<Vec<RawRecord>> = Vec::new();
        let mut hard_failures: Vec<AdapterError> = Vec::new();
        let mut empty_notice: Option<String> = None;

        for feed in &source.feeds {
            let fetcher = build_fetcher(&feed.kind, &feed.url, &source.aliases, &settings);
            let mut outcome = FeedOutcome {
                label: feed.label.clone(),
                kind: fetcher.kind().to_string(),
                endpoint: fetcher.endpoint().to_string(),
                fetched: 0,
                error: None,
                archive_path: None,
            };

            match fetcher.fetch(self.http.as_ref(), &window).await {
                Ok(records) => {
                    info!(feed = %feed.label, kind = fetcher.kind(), fetched = records.len(), "feed fetched");
                    outcome.fetched = records.len();
                    if let (Some(archive), false) = (&self.archive, records.is_empty()) {
                        match archive.archive_records(&source.source_id, window.now, &records).await {
                            Ok(payload) => outcome.archive_path = Some(payload.absolute_path.display().to_string()),
                            Err(err) => warn!(feed = %feed.label, error = ?err, "raw archive failed"),
                        }
                    }
                    batches.push(records);
                }
                Err(err) if err.is_empty_result() => {
                    warn!(feed = %feed.label, "{err}");
                    outcome.error = Some(err.to_string());
                    empty_notice.get_or_insert_with(|| err.to_string());
                    batches.push(Vec::new());
                }
                Err(err) => {
                    warn!(feed = %feed.label, error = %err, "feed failed");
                    outcome.error = Some(err.to_string());
                    hard_failures.push(err);
                }
            }
            tally.feeds.push(outcome);
        }

        if batches.is_empty() {
            let mut failures = hard_failures.into_iter();
            return Err(match (failures.next(), failures.len()) {
                (Some(only), 0) => anyhow::Error::new(only).context(format!("fetching {}", source.source_id)),
                (Some(first), rest) => anyhow::Error::new(first)
                    .context(format!("all feeds of {} failed ({} more)", source.source_id, rest)),
                (None, _) => anyhow!("source {} has no feeds", source.source_id),
            });
        }

        let normalizer = Normalizer::new(source.source_system.clone(), source.aliases.clone()).with_cutoff(window.since);
        let mut normalized = Vec::with_capacity(batches.len());
        for batch in &batches {
            tally.fetched += batch.len();
            let outcome = normalizer.normalize_all(batch);
            tally.normalizer_dropped += outcome.rejected();
            if outcome.rejected() > 0 {
                debug!(
                    missing_permit_id = outcome.missing_permit_id,
                    missing_issue_date = outcome.missing_issue_date,
                    before_cutoff = outcome.before_cutoff,
                    "normalizer dropped records"
                );
            }
            normalized.push(outcome.records);
        }

        let deduped = dedupe_permits(normalized);
        tally.duplicates = deduped.duplicates;
        tally.parsed = deduped.records.len() + deduped.duplicates;
        tally.oldest = deduped.records.iter().map(|r| r.issue_date).min();
        tally.newest = deduped.records.iter().map(|r| r.issue_date).max();

        if deduped.records.is_empty() {
            if let Some(first) = hard_failures.into_iter().next() {
                return Err(anyhow::Error::new(first)
                    .context(format!("no permits from {} and a feed failed", source.source_id)));
            }
            if options.allow_empty || self.config.allow_empty {
                return Ok(RunStatus::Empty);
            }
            return Err(match empty_notice {
                Some(notice) => anyhow!(notice),
                None => anyhow!(
                    "no permits issued since {} from any feed of {} (set ETL_ALLOW_EMPTY=1 to accept)",
                    window.since.to_rfc3339(),
                    source.source_id
                ),
            });
        }

        let upsert = ChunkedUpsert::new(self.destination.as_ref(), &self.config.permits_table, self.config.chunk_size);
        match upsert.run(&deduped.records).await {
            Ok(summary) => {
                tally.upserted = summary.rows;
                info!(rows = summary.rows, batches = summary.batches, "upsert complete");
                Ok(RunStatus::Success)
            }
            Err(err) => {
                let (kept, _) = collapse_by_natural_key(&deduped.records);
                tally.upserted = err.upserted();
                tally.failed = kept.len().saturating_sub(tally.upserted);
                Err(err.into())
            }
        }
    }
}

/// Cron-driven `run_many` over `sources`; a tick that fires while a run is
/// still going is skipped.
pub async fn build_scheduler(
    pipeline: Arc<SyncPipeline>,
    sources: Arc<Vec<ResolvedSource>>,
    options: RunOptions,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(tokio::sync::Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let sources = sources.clone();
        let options = options.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous scheduled run still in progress, skipping tick");
                return;
            };
            match pipeline.run_many(&sources, &options).await {
                Ok(reports) => {
                    let failed = reports.iter().filter(|r| r.status == RunStatus::Failed).count();
                    info!(sources = reports.len(), failed, "scheduled sync finished");
                }
                Err(err) => error!(error = ?err, "scheduled sync aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use permit_core::Trade;
    use permit_storage::{FetchError, FetchedResponse, Url};
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    type Responder = Box<dyn Fn(&Url) -> Result<Vec<u8>, FetchError> + Send + Sync>;

    struct ScriptedTransport {
        respond: Responder,
    }

    impl ScriptedTransport {
        fn new(respond: impl Fn(&Url) -> Result<Vec<u8>, FetchError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                respond: Box::new(respond),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(&self, url: &Url, _headers: &[(String, String)]) -> Result<FetchedResponse, FetchError> {
            let body = (self.respond)(url)?;
            Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                body,
            })
        }
    }

    /// Accepts the first `ok_batches` upserts into the permits table, then rejects.
    struct FlakyDestination {
        inner: MemoryDestination,
        ok_batches: usize,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Destination for FlakyDestination {
        async fn upsert_rows(&self, table: &str, on_conflict: &str, rows: &[JsonValue]) -> Result<(), SinkError> {
            if table == PERMITS_TABLE && self.seen.fetch_add(1, Ordering::SeqCst) >= self.ok_batches {
                return Err(SinkError::Rejected {
                    table: table.to_string(),
                    status: 503,
                    body: "upstream unavailable".to_string(),
                });
            }
            self.inner.upsert_rows(table, on_conflict, rows).await
        }

        async fn select_rows(&self, table: &str, filters: &[EqFilter]) -> Result<Vec<JsonValue>, SinkError> {
            self.inner.select_rows(table, filters).await
        }

        async fn count_rows(&self, table: &str, filters: &[EqFilter]) -> Result<u64, SinkError> {
            self.inner.count_rows(table, filters).await
        }
    }

    fn query_param(url: &Url, name: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).single().unwrap()
    }

    fn permit(permit_id: &str, issue_date: DateTime<Utc>) -> PermitRecord {
        PermitRecord {
            source_system: "tx-harris".to_string(),
            permit_id: permit_id.to_string(),
            issue_date,
            trade: Trade::General,
            description: None,
            address: None,
            zipcode: None,
            valuation: None,
            contractor: None,
            applicant: None,
            raw: json!({}),
        }
    }

    fn config_with(vars: &[(&str, &str)]) -> SyncConfig {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        SyncConfig::from_lookup(|k| vars.get(k).cloned()).unwrap()
    }

    fn harris_source() -> ResolvedSource {
        ResolvedSource {
            source_id: "harris-county".to_string(),
            source_system: "tx-harris".to_string(),
            display_name: "Harris County Engineering".to_string(),
            lookback_days: None,
            aliases: FieldAliases::default(),
            feeds: vec![ResolvedFeed {
                label: "issued".to_string(),
                kind: FeedKind::Arcgis {
                    date_field: "ISSUEDDATE".to_string(),
                    page_size: 2000,
                },
                url: "https://gis.example.gov/arcgis/rest/services/Permits/MapServer/0".to_string(),
            }],
        }
    }

    fn arcgis_responder(features: JsonValue) -> impl Fn(&Url) -> Result<Vec<u8>, FetchError> + Send + Sync {
        move |url: &Url| {
            if query_param(url, "returnCountOnly").is_some() {
                let count = features.as_array().map(|a| a.len()).unwrap_or(0);
                return Ok(serde_json::to_vec(&json!({ "count": count })).unwrap());
            }
            Ok(serde_json::to_vec(&json!({ "features": features })).unwrap())
        }
    }

    const REGISTRY: &str = r#"
sources:
  - source_id: harris-county
    source_system: tx-harris
    display_name: Harris County Engineering
    feeds:
      - name: issued
        kind: arcgis
        url_env: HC_ISSUED_PERMITS_URL
        date_field: ISSUEDDATE
  - source_id: houston
    source_system: city_of_houston
    display_name: City of Houston
    lookback_days: 14
    fields:
      permit_id: ["Project No"]
    feeds:
      - name: weekly
        kind: xlsx
        url: https://www.houstontx.gov/permits/weekly.xlsx
      - name: sold
        kind: xlsx
        url: https://www.houstontx.gov/permits/sold.xlsx
        date_field: Sold Date
  - source_id: dallas
    source_system: tx-dallas
    display_name: City of Dallas
    enabled: false
    feeds:
      - kind: socrata
        url: https://www.dallasopendata.com/resource/e7gq-4sah
        order_field: issued_date
"#;

    #[test]
    fn config_defaults_and_overrides() {
        let config = config_with(&[]);
        assert_eq!(config.days, 7);
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.permits_table, "permits");
        assert_eq!(config.sources_file, PathBuf::from("sources.yaml"));
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert!(!config.allow_empty);
        assert!(config.archive_dir.is_none());

        let config = config_with(&[("DAYS", "3"), ("ETL_ALLOW_EMPTY", "1"), ("UPSERT_CHUNK_SIZE", "250")]);
        assert_eq!(config.days, 3);
        assert!(config.allow_empty);
        assert_eq!(config.chunk_size, 250);
    }

    #[test]
    fn config_rejects_bad_numbers() {
        let err = SyncConfig::from_lookup(|k| (k == "DAYS").then(|| "seven".to_string())).unwrap_err();
        assert!(err.to_string().contains("DAYS"), "{err}");
        let err = SyncConfig::from_lookup(|k| (k == "UPSERT_CHUNK_SIZE").then(|| "0".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { ref var, .. } if var == "UPSERT_CHUNK_SIZE"));
    }

    #[test]
    fn credentials_name_the_missing_variable() {
        let config = config_with(&[("SUPABASE_URL", "https://abc.supabase.co")]);
        let err = config.credentials().unwrap_err();
        assert_eq!(err.to_string(), "missing required environment variable SUPABASE_SERVICE_ROLE_KEY");

        let config = config_with(&[
            ("SUPABASE_URL", "https://abc.supabase.co"),
            ("SUPABASE_SERVICE_ROLE_KEY", "service-key"),
        ]);
        assert_eq!(config.credentials().unwrap(), ("https://abc.supabase.co", "service-key"));
    }

    #[test]
    fn lookback_units() {
        assert_eq!(parse_lookback("7d").unwrap(), Duration::days(7));
        assert_eq!(parse_lookback("12h").unwrap(), Duration::hours(12));
        assert_eq!(parse_lookback("30m").unwrap(), Duration::minutes(30));
        assert_eq!(parse_lookback("3").unwrap(), Duration::days(3));
        assert_eq!(parse_lookback(""), Err(LookbackError::Empty));
        assert_eq!(parse_lookback("0d"), Err(LookbackError::Zero));
        assert!(matches!(parse_lookback("7w"), Err(LookbackError::Malformed(_))));
        assert!(matches!(parse_lookback("d7"), Err(LookbackError::Malformed(_))));
    }

    #[test]
    fn registry_resolves_urls_from_env() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY, Path::new("sources.yaml")).unwrap();
        let resolved = registry
            .resolve(&SourceSelection::Named(vec!["harris-county".into()]), |k| {
                (k == "HC_ISSUED_PERMITS_URL").then(|| "https://gis.hctx.net/arcgis/rest/services/Permits/0".to_string())
            })
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].feeds[0].url, "https://gis.hctx.net/arcgis/rest/services/Permits/0");

        let err = registry
            .resolve(&SourceSelection::Named(vec!["harris-county".into()]), |_| None)
            .unwrap_err();
        assert!(err.to_string().contains("HC_ISSUED_PERMITS_URL"), "{err}");
        assert!(!err.is_usage());
    }

    #[test]
    fn registry_selection_and_alias_overrides() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY, Path::new("sources.yaml")).unwrap();
        let all = registry.select(&SourceSelection::All).unwrap();
        assert_eq!(
            all.iter().map(|s| s.source_id.as_str()).collect::<Vec<_>>(),
            vec!["harris-county", "houston"]
        );

        let named = registry.select(&SourceSelection::Named(vec!["dallas".into()])).unwrap();
        assert_eq!(named[0].source_system, "tx-dallas");

        let err = registry
            .select(&SourceSelection::Named(vec!["fort-worth".into()]))
            .unwrap_err();
        assert!(err.is_usage());

        let houston = registry.get("houston").unwrap().resolve(&|_: &str| -> Option<String> { None }).unwrap();
        assert_eq!(houston.lookback_days, Some(14));
        assert_eq!(houston.aliases.permit_id[0], "projectno");
        assert_eq!(houston.feeds.len(), 2);
        assert_eq!(houston.feeds[1].label, "sold");
    }

    #[test]
    fn workspace_registry_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let text = std::fs::read_to_string(&path).expect("sources.yaml");
        let registry = SourceRegistry::from_yaml_str(&text, &path).unwrap();
        let harris = registry.get("harris-county").unwrap();
        assert_eq!(harris.source_system, "tx-harris");
        assert_eq!(harris.feeds[0].kind.name(), "arcgis");
        assert_eq!(registry.get("houston").unwrap().feeds.len(), 2);
        assert!(registry.sources.iter().any(|s| !s.enabled));
    }

    #[test]
    fn registry_rejects_feedless_and_duplicate_sources() {
        let text = "sources:\n  - source_id: a\n    source_system: s\n    display_name: A\n    feeds: []\n";
        let err = SourceRegistry::from_yaml_str(text, Path::new("x.yaml")).unwrap_err();
        assert!(err.to_string().contains("no feeds"), "{err}");

        let feed = "    feeds:\n      - kind: ckan\n        url: https://x\n        resource_id: r\n";
        let text = format!(
            "sources:\n  - source_id: a\n    source_system: s\n    display_name: A\n{feed}  - source_id: a\n    source_system: s\n    display_name: A\n{feed}"
        );
        let err = SourceRegistry::from_yaml_str(&text, Path::new("x.yaml")).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn dedupe_keeps_first_per_day() {
        let day = Utc.with_ymd_and_hms(2026, 10, 15, 8, 0, 0).single().unwrap();
        let first = PermitRecord {
            description: Some("first".into()),
            ..permit("P-1", day)
        };
        let same_day = PermitRecord {
            description: Some("second".into()),
            ..permit("P-1", day + Duration::hours(6))
        };
        let next_day = permit("P-1", day + Duration::days(1));
        let other = permit("P-2", day);

        let outcome = dedupe_permits(vec![vec![first, other], vec![same_day, next_day]]);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.records[0].description.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn chunked_upsert_issues_sequential_batches() {
        let day = fixed_now();
        let records = (0..1250).map(|i| permit(&format!("P-{i}"), day)).collect::<Vec<_>>();
        let destination = MemoryDestination::new();
        let summary = ChunkedUpsert::new(&destination, PERMITS_TABLE, 500)
            .run(&records)
            .await
            .unwrap();

        assert_eq!(summary.rows, 1250);
        assert_eq!(summary.batches, 3);
        let calls = destination.calls();
        assert_eq!(calls.iter().map(|c| c.rows).collect::<Vec<_>>(), vec![500, 500, 250]);
        assert!(calls.iter().all(|c| c.on_conflict == "source_system,permit_id"));
    }

    #[tokio::test]
    async fn upserting_twice_leaves_rows_unchanged() {
        let day = fixed_now();
        let records = (0..20)
            .map(|i| PermitRecord {
                valuation: Some(1000.0 * f64::from(i)),
                ..permit(&format!("P-{i}"), day)
            })
            .collect::<Vec<_>>();
        let destination = MemoryDestination::new();
        let upsert = ChunkedUpsert::new(&destination, PERMITS_TABLE, 7);
        upsert.run(&records).await.unwrap();
        let first = destination.rows(PERMITS_TABLE);
        upsert.run(&records).await.unwrap();
        let second = destination.rows(PERMITS_TABLE);

        assert_eq!(first.len(), 20);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn same_permit_on_two_days_is_collapsed_before_upsert() {
        let day = fixed_now();
        let records = vec![
            permit("P-1", day - Duration::days(1)),
            permit("P-2", day),
            permit("P-1", day),
        ];
        let destination = MemoryDestination::new();
        let summary = ChunkedUpsert::new(&destination, PERMITS_TABLE, 500)
            .run(&records)
            .await
            .unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.collapsed, 1);
        let rows = destination.rows(PERMITS_TABLE);
        let p1 = rows.iter().find(|r| r["permit_id"] == "P-1").unwrap();
        assert_eq!(p1["issue_date"], "2026-10-17T12:00:00Z");
    }

    #[tokio::test]
    async fn failing_batch_names_index_and_table() {
        let day = fixed_now();
        let records = (0..1250).map(|i| permit(&format!("P-{i}"), day)).collect::<Vec<_>>();
        let destination = FlakyDestination {
            inner: MemoryDestination::new(),
            ok_batches: 1,
            seen: AtomicUsize::new(0),
        };
        let err = ChunkedUpsert::new(&destination, PERMITS_TABLE, 500)
            .run(&records)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Batch { index: 1, upserted: 500, .. }));
        assert!(err.to_string().contains("batch 1 into permits"), "{err}");
        assert_eq!(destination.inner.rows(PERMITS_TABLE).len(), 500);
    }

    #[test]
    fn since_prefers_explicit_then_incremental_then_days() {
        let now = fixed_now();
        let last_success = now - Duration::hours(30);
        let previous = EtlState {
            source: "harris-county".into(),
            last_run: now - Duration::hours(2),
            last_success: Some(last_success),
            status: RunStatus::Failed,
            records_processed: 0,
            error_message: Some("boom".into()),
        };

        let explicit = RunOptions {
            since: Some(Duration::hours(12)),
            incremental: true,
            ..Default::default()
        };
        assert_eq!(resolve_since(&explicit, Some(&previous), 7, now), now - Duration::hours(12));

        let incremental = RunOptions {
            incremental: true,
            ..Default::default()
        };
        assert_eq!(resolve_since(&incremental, Some(&previous), 7, now), last_success);
        assert_eq!(resolve_since(&incremental, None, 7, now), now - Duration::days(7));
        assert_eq!(
            resolve_since(&RunOptions::default(), Some(&previous), 3, now),
            now - Duration::days(3)
        );
    }

    #[tokio::test]
    async fn zero_count_fails_and_reports_query_url() {
        let logs = tempdir().unwrap();
        let config = config_with(&[("LOGS_DIR", logs.path().to_str().unwrap())]);
        let transport = ScriptedTransport::new(|_| Ok(br#"{"count": 0}"#.to_vec()));
        let destination = Arc::new(MemoryDestination::new());
        let pipeline = SyncPipeline::new(config, transport, destination.clone(), false);

        let report = pipeline
            .run_source(&harris_source(), &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        let error = report.error.clone().unwrap();
        assert!(error.contains("returnCountOnly=true"), "{error}");
        assert!(
            error.contains("https://gis.example.gov/arcgis/rest/services/Permits/MapServer/0/query"),
            "{error}"
        );
        assert!(destination.rows(PERMITS_TABLE).is_empty());

        let log = std::fs::read_to_string(pipeline.reporter().log_path("harris-county")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("status=failed"));
        let last = pipeline.reporter().read_last_run("harris-county").await.unwrap().unwrap();
        assert_eq!(last.run_id, report.run_id);

        let state = destination.rows(ETL_STATE_TABLE);
        assert_eq!(state.len(), 1);
        assert_eq!(state[0]["status"], "failed");
        assert_eq!(state[0]["last_success"], JsonValue::Null);
    }

    #[tokio::test]
    async fn zero_count_is_tolerated_when_allowed() {
        let logs = tempdir().unwrap();
        let config = config_with(&[("LOGS_DIR", logs.path().to_str().unwrap()), ("ETL_ALLOW_EMPTY", "1")]);
        let transport = ScriptedTransport::new(|_| Ok(br#"{"count": 0}"#.to_vec()));
        let destination = Arc::new(MemoryDestination::new());
        let pipeline = SyncPipeline::new(config, transport, destination.clone(), false);

        let report = pipeline
            .run_source(&harris_source(), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Empty);
        assert!(report.error.is_none());
        assert!(report.feeds[0].error.as_deref().unwrap_or("").contains("returnCountOnly"));

        let state = destination.rows(ETL_STATE_TABLE);
        assert_eq!(state[0]["status"], "empty");
        assert!(state[0]["last_success"].is_string());
    }

    #[tokio::test]
    async fn full_run_normalizes_dedupes_and_upserts() {
        let logs = tempdir().unwrap();
        let archive = tempdir().unwrap();
        let config = config_with(&[
            ("LOGS_DIR", logs.path().to_str().unwrap()),
            ("ARCHIVE_DIR", archive.path().to_str().unwrap()),
        ]);
        let now = fixed_now();
        let ms = |d: DateTime<Utc>| d.timestamp_millis();
        let features = json!([
            {"attributes": {"PERMITNUMBER": "HC-1", "ISSUEDDATE": ms(now - Duration::days(1)), "WORK_DESCRIPTION": "Electrical service", "VALUATION": "$75,000"}},
            {"attributes": {"PERMITNUMBER": "HC-2", "ISSUEDDATE": ms(now - Duration::days(2)), "WORK_DESCRIPTION": "New pool"}},
            {"attributes": {"PERMITNUMBER": "HC-1", "ISSUEDDATE": ms(now - Duration::days(1) + Duration::hours(1)), "WORK_DESCRIPTION": "dup"}},
            {"attributes": {"PERMITNUMBER": "HC-3", "ISSUEDDATE": ms(now - Duration::days(10))}},
            {"attributes": {"ISSUEDDATE": ms(now)}}
        ]);
        let transport = ScriptedTransport::new(arcgis_responder(features));
        let destination = Arc::new(MemoryDestination::new());
        let pipeline = SyncPipeline::new(config, transport, destination.clone(), false);

        let report = pipeline
            .run_source_at(&harris_source(), &RunOptions::default(), now)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Success, "{:?}", report.error);
        assert_eq!(report.fetched, 5);
        assert_eq!(report.normalizer_dropped, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.upserted, 2);
        assert_eq!(report.oldest_issue_date, Some(now - Duration::days(2)));
        assert_eq!(report.newest_issue_date, Some(now - Duration::days(1)));
        assert!(report.feeds[0].archive_path.is_some());

        let rows = destination.rows(PERMITS_TABLE);
        assert_eq!(rows.len(), 2);
        let hc1 = rows.iter().find(|r| r["permit_id"] == "HC-1").unwrap();
        assert_eq!(hc1["trade"], "Electrical");
        assert_eq!(hc1["valuation"], 75000.0);
        assert_eq!(hc1["source_system"], "tx-harris");

        let state = destination.rows(ETL_STATE_TABLE);
        assert_eq!(state[0]["records_processed"], 2);
        assert_eq!(state[0]["status"], "success");
    }

    #[tokio::test]
    async fn failed_run_keeps_previous_last_success() {
        let logs = tempdir().unwrap();
        let config = config_with(&[("LOGS_DIR", logs.path().to_str().unwrap())]);
        let now = fixed_now();
        let features = json!([
            {"attributes": {"PERMITNUMBER": "HC-1", "ISSUEDDATE": (now - Duration::days(1)).timestamp_millis()}}
        ]);
        let destination = Arc::new(MemoryDestination::new());
        let ok = SyncPipeline::new(
            config.clone(),
            ScriptedTransport::new(arcgis_responder(features)),
            destination.clone(),
            false,
        );
        let first = ok.run_source_at(&harris_source(), &RunOptions::default(), now).await.unwrap();
        assert_eq!(first.status, RunStatus::Success);

        let broken = SyncPipeline::new(
            config,
            ScriptedTransport::new(|url| {
                Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
            }),
            destination.clone(),
            false,
        );
        let second = broken.run_source(&harris_source(), &RunOptions::default()).await.unwrap();
        assert_eq!(second.status, RunStatus::Failed);

        let tracker = StateTracker::new(destination.clone());
        let state = tracker.previous("harris-county").await.unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.last_success, Some(first.finished_at));
        assert!(state.error_message.unwrap().contains("404"));

        let log = std::fs::read_to_string(ok.reporter().log_path("harris-county")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[tokio::test]
    async fn one_failing_feed_does_not_fail_the_source() {
        let logs = tempdir().unwrap();
        let config = config_with(&[("LOGS_DIR", logs.path().to_str().unwrap())]);
        let now = fixed_now();
        let issued = (now - Duration::days(1)).format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
        let transport = ScriptedTransport::new(move |url| {
            if url.path().contains("broken") {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                });
            }
            Ok(serde_json::to_vec(&json!([{ "permit_number": "A-1", "issue_date": issued }])).unwrap())
        });
        let source = ResolvedSource {
            source_id: "austin".into(),
            source_system: "austin".into(),
            display_name: "Austin".into(),
            lookback_days: None,
            aliases: FieldAliases::default(),
            feeds: vec![
                ResolvedFeed {
                    label: "issued".into(),
                    kind: FeedKind::Socrata {
                        order_field: "issue_date".into(),
                        limit: 100,
                    },
                    url: "https://data.austintexas.gov/resource/3syk-w9eu".into(),
                },
                ResolvedFeed {
                    label: "legacy".into(),
                    kind: FeedKind::Socrata {
                        order_field: "issue_date".into(),
                        limit: 100,
                    },
                    url: "https://data.austintexas.gov/resource/broken".into(),
                },
            ],
        };
        let destination = Arc::new(MemoryDestination::new());
        let pipeline = SyncPipeline::new(config, transport, destination.clone(), true);
        let report = pipeline.run_source_at(&source, &RunOptions::default(), now).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert!(report.dry_run);
        assert_eq!(report.upserted, 1);
        assert!(report.feeds[0].error.is_none());
        assert!(report.feeds[1].error.as_deref().unwrap().contains("500"));
        // dry runs never touch etl_state
        assert!(destination.rows(ETL_STATE_TABLE).is_empty());
    }

    #[tokio::test]
    async fn empty_result_with_a_failed_feed_reports_the_failure() {
        let logs = tempdir().unwrap();
        let config = config_with(&[("LOGS_DIR", logs.path().to_str().unwrap())]);
        let transport = ScriptedTransport::new(|url| {
            if url.path().contains("broken") {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                });
            }
            Ok(b"[]".to_vec())
        });
        let feed = |label: &str, url: &str| ResolvedFeed {
            label: label.into(),
            kind: FeedKind::Socrata {
                order_field: "issue_date".into(),
                limit: 100,
            },
            url: url.into(),
        };
        let source = ResolvedSource {
            source_id: "austin".into(),
            source_system: "austin".into(),
            display_name: "Austin".into(),
            lookback_days: None,
            aliases: FieldAliases::default(),
            feeds: vec![
                feed("issued", "https://data.austintexas.gov/resource/3syk-w9eu"),
                feed("legacy", "https://data.austintexas.gov/resource/broken"),
            ],
        };
        let pipeline = SyncPipeline::new(config, transport, Arc::new(MemoryDestination::new()), true);

        let strict = pipeline.run_source_at(&source, &RunOptions::default(), fixed_now()).await.unwrap();
        assert_eq!(strict.status, RunStatus::Failed);
        assert!(strict.error.as_deref().unwrap().contains("500"), "{:?}", strict.error);

        let tolerant = RunOptions {
            allow_empty: true,
            ..RunOptions::default()
        };
        let report = pipeline.run_source_at(&source, &tolerant, fixed_now()).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn run_many_continues_past_a_failed_source() {
        let logs = tempdir().unwrap();
        let config = config_with(&[("LOGS_DIR", logs.path().to_str().unwrap())]);
        let pipeline = SyncPipeline::new(
            config,
            ScriptedTransport::new(|_| Ok(br#"{"count": 0}"#.to_vec())),
            Arc::new(MemoryDestination::new()),
            true,
        );
        let mut second = harris_source();
        second.source_id = "el-paso".into();
        second.source_system = "tx-el-paso".into();

        let reports = pipeline
            .run_many(&[harris_source(), second], &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status == RunStatus::Failed));
        assert!(logs.path().join("el-paso-last-run.json").exists());
    }

    #[tokio::test]
    async fn verify_counts_rows_for_source_system() {
        let destination = MemoryDestination::new();
        let day = fixed_now();
        let mut records = vec![permit("P-1", day), permit("P-2", day)];
        records.push(PermitRecord {
            source_system: "austin".into(),
            ..permit("A-1", day)
        });
        ChunkedUpsert::new(&destination, PERMITS_TABLE, 500)
            .run(&records)
            .await
            .unwrap();
        assert_eq!(verify_source(&destination, PERMITS_TABLE, "tx-harris").await.unwrap(), 2);
        assert_eq!(verify_source(&destination, PERMITS_TABLE, "austin").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scheduler_accepts_six_field_cron() {
        let logs = tempdir().unwrap();
        let config = config_with(&[("LOGS_DIR", logs.path().to_str().unwrap())]);
        let pipeline = Arc::new(SyncPipeline::new(
            config,
            ScriptedTransport::new(|_| Ok(br#"{"count": 0}"#.to_vec())),
            Arc::new(MemoryDestination::new()),
            true,
        ));
        let sched = build_scheduler(pipeline, Arc::new(vec![harris_source()]), RunOptions::default(), DEFAULT_SYNC_CRON)
            .await;
        assert!(sched.is_ok());
    }
}
