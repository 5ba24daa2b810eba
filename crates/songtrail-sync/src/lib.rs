//! Weekly chart walk: partitions charts across a fixed worker pool, merges per-song source facts
//! and hands each (chart, week) batch to the configured output sink.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use songtrail_core::{
    CallOutcome, ChartDiscovery, ChartEntry, FactValue, FetchStatus, LyricStats, SongKey,
    SourceOutcome, UnifiedSongRecord, UsageCounters, UsageReport, WeekBatch,
};
use songtrail_sources::{
    fixture_song_sources, is_valid_chart_slug, live_song_sources, BillboardChartClient,
    ChartError, ChartSource, FixtureChartSource, SongQuery, SongSource, SourceTokens,
};
use songtrail_storage::{
    BatchFileStore, ElasticConfig, ElasticRecordStore, HttpClientConfig, HttpFetcher,
    InsertOutcome, RecordStore, StoreError, TokenBucketConfig,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "songtrail-sync";

const RECORD_STORE_COLLABORATOR: &str = "RecordStore";
const LYRIC_ANALYST_COLLABORATOR: &str = "LyricAnalyst";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

/// Run configuration as read from the JSON or YAML run file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub charts: Vec<String>,
    pub start_date: NaiveDate,
    #[serde(alias = "stop_date")]
    pub end_date: NaiveDate,
    #[serde(default)]
    pub use_elastic_search: bool,
    /// Zero means unbounded.
    #[serde(default)]
    pub max_entries: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_true")]
    pub flatten_lyrics: bool,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: f64,
    #[serde(default)]
    pub source_mode: SourceMode,
    #[serde(default = "default_fixtures_dir")]
    pub fixtures_dir: PathBuf,
}

fn default_max_threads() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("sample_results")
}

fn default_true() -> bool {
    true
}

fn default_call_timeout_secs() -> f64 {
    30.0
}

fn default_fixtures_dir() -> PathBuf {
    PathBuf::from("fixtures")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading run config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing run config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("run config lists no charts")]
    NoCharts,
    #[error("chart `{0}` is not a valid chart name")]
    InvalidChart(String),
    #[error("chart `{0}` is not served by the chart source")]
    UnknownChart(String),
    #[error("max_threads must be at least 1")]
    ZeroWorkers,
    #[error("call_timeout_secs must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),
    #[error("start_date {start} must be after end_date {stop}")]
    DateOrder { start: NaiveDate, stop: NaiveDate },
    #[error("use_elastic_search is set but no record store was provided")]
    MissingRecordStore,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        );
        let parsed = if is_yaml {
            serde_yaml::from_str(&text).map_err(|err| err.to_string())
        } else {
            serde_json::from_str(&text).map_err(|err| err.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Checks everything that can be decided before any collaborator is contacted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.charts.is_empty() {
            return Err(ConfigError::NoCharts);
        }
        if let Some(chart) = self.charts.iter().find(|c| !is_valid_chart_slug(c)) {
            return Err(ConfigError::InvalidChart(chart.clone()));
        }
        if self.max_threads == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        self.call_timeout()?;
        if self.start_date <= self.end_date {
            return Err(ConfigError::DateOrder {
                start: self.start_date,
                stop: self.end_date,
            });
        }
        Ok(())
    }

    /// Per-call deadline. Rejects zero, negative, NaN and values too large for a `Duration`.
    pub fn call_timeout(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.call_timeout_secs)
            .ok()
            .filter(|deadline| !deadline.is_zero())
            .ok_or(ConfigError::InvalidTimeout(self.call_timeout_secs))
    }
}

/// Deployment settings that stay out of the run file.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub elasticsearch_url: String,
    pub song_index: String,
    pub usage_index: String,
    pub genius_token: Option<String>,
    pub spotify_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Requests per second across all live sources; zero leaves fetching unthrottled.
    pub rate_limit_per_sec: u32,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        let defaults = ElasticConfig::default();
        Self {
            elasticsearch_url: std::env::var("ELASTICSEARCH_URL").unwrap_or(defaults.base_url),
            song_index: std::env::var("SONGTRAIL_SONG_INDEX").unwrap_or(defaults.song_index),
            usage_index: std::env::var("SONGTRAIL_USAGE_INDEX").unwrap_or(defaults.usage_index),
            genius_token: std::env::var("GENIUS_TOKEN").ok().filter(|v| !v.is_empty()),
            spotify_token: std::env::var("SPOTIFY_TOKEN").ok().filter(|v| !v.is_empty()),
            user_agent: std::env::var("SONGTRAIL_USER_AGENT")
                .unwrap_or_else(|_| "songtrail-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("SONGTRAIL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            rate_limit_per_sec: std::env::var("SONGTRAIL_RATE_LIMIT_PER_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: TokenBucketConfig::per_second(self.rate_limit_per_sec),
            ..HttpClientConfig::default()
        }
    }

    pub fn elastic_config(&self) -> ElasticConfig {
        ElasticConfig {
            base_url: self.elasticsearch_url.clone(),
            song_index: self.song_index.clone(),
            usage_index: self.usage_index.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

/// Splits charts round-robin across `workers` partitions. Chart `i` lands in partition `i mod W`.
pub fn partition_charts(charts: &[String], workers: usize) -> Vec<Vec<String>> {
    let workers = workers.max(1);
    let mut partitions = vec![Vec::new(); workers];
    for (index, chart) in charts.iter().enumerate() {
        partitions[index % workers].push(chart.clone());
    }
    partitions
}

/// Shared per-collaborator usage counters, reset at each week boundary.
#[derive(Debug, Clone, Default)]
pub struct UsageLedger {
    counters: Arc<Mutex<UsageCounters>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, collaborator: &str, elapsed: Duration, outcome: CallOutcome) {
        self.counters.lock().await.record(collaborator, elapsed, outcome);
    }

    pub async fn snapshot(&self) -> UsageCounters {
        self.counters.lock().await.clone()
    }

    pub async fn reset(&self) {
        *self.counters.lock().await = UsageCounters::default();
    }

    async fn take(&self) -> UsageCounters {
        std::mem::take(&mut *self.counters.lock().await)
    }
}

/// Runs `call` under `deadline` and records its latency and outcome in the ledger.
/// The outer `Err` means the deadline elapsed.
pub async fn call_with_deadline<T, E, F>(
    ledger: &UsageLedger,
    collaborator: &str,
    deadline: Duration,
    call: F,
) -> Result<Result<T, E>, tokio::time::error::Elapsed>
where
    F: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let outcome = tokio::time::timeout(deadline, call).await;
    let call_outcome = match &outcome {
        Ok(Ok(_)) => CallOutcome::Ok,
        Ok(Err(_)) => CallOutcome::Error,
        Err(_) => CallOutcome::Timeout,
    };
    ledger.record(collaborator, started.elapsed(), call_outcome).await;
    outcome
}

/// Turns the ledger into week-boundary usage reports.
#[derive(Debug)]
pub struct UsageReporter {
    ledger: UsageLedger,
    started: Instant,
}

impl UsageReporter {
    pub fn new(ledger: UsageLedger) -> Self {
        Self {
            ledger,
            started: Instant::now(),
        }
    }

    pub async fn collect(&self) -> UsageCounters {
        self.ledger.snapshot().await
    }

    pub async fn reset(&self) {
        self.ledger.reset().await;
    }

    /// Drains the counters into a report for `week`.
    pub async fn flush(&self, week: NaiveDate, records_processed: usize) -> UsageReport {
        UsageReport {
            week,
            records_processed,
            run_elapsed_secs: self.started.elapsed().as_secs_f64(),
            counters: self.ledger.take().await,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LyricAnalyst;

impl LyricAnalyst {
    pub fn stats(&self, text: &str) -> LyricStats {
        let words: Vec<String> = text
            .split_whitespace()
            .map(|raw| {
                raw.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|word| !word.is_empty())
            .collect();
        if words.is_empty() {
            return LyricStats::default();
        }
        let unique = words.iter().collect::<HashSet<_>>().len();
        let letters: usize = words.iter().map(|w| w.chars().count()).sum();
        LyricStats {
            word_count: words.len(),
            unique_word_count: unique,
            vocabulary_richness: unique as f64 / words.len() as f64,
            average_word_length: letters as f64 / words.len() as f64,
            line_count: text.lines().filter(|line| !line.trim().is_empty()).count(),
        }
    }
}

/// Builds one unified record from a chart entry and the outcome of every song source.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordMerger {
    analyst: LyricAnalyst,
}

impl RecordMerger {
    pub fn merge(&self, entry: &ChartEntry, outcomes: &[SourceOutcome]) -> UnifiedSongRecord {
        let mut facts = BTreeMap::new();
        let mut lyric_stats = BTreeMap::new();
        for outcome in outcomes {
            let source = outcome.source();
            let prefix = source.field_prefix();
            if outcome.facts.is_empty() {
                facts.insert(
                    format!("{prefix}{}", source.primary_field()),
                    FactValue::from(""),
                );
            }
            for (name, value) in &outcome.facts.fields {
                facts.insert(format!("{prefix}{name}"), value.clone());
            }
            facts.insert(
                format!("{prefix}Status"),
                FactValue::from(outcome.status.as_str()),
            );
            if source.carries_lyrics() {
                let text = outcome.facts.lyrics().unwrap_or_default();
                let mut stats = self.analyst.stats(text);
                if let (Some(lines), true) = (outcome.facts.lyric_line_count(), stats.word_count > 0) {
                    stats.line_count = lines;
                }
                lyric_stats.insert(source.short_name().to_string(), stats);
            }
        }

        UnifiedSongRecord {
            artist: entry.artist.clone(),
            featuring: entry.featuring.clone(),
            title: entry.title.clone(),
            discovered: ChartDiscovery {
                chart_name: entry.chart_name.clone(),
                peak_position: entry.peak_rank,
                date: entry.week,
            },
            facts,
            lyric_stats,
        }
    }
}

/// Answers "has this song already been produced?" for the active output mode.
#[derive(Clone)]
pub enum Deduplicator {
    WithinBatch,
    Store {
        store: Arc<dyn RecordStore>,
        ledger: UsageLedger,
        deadline: Duration,
    },
}

impl Deduplicator {
    pub async fn already_seen(&self, key: &SongKey, batch: &WeekBatch) -> Result<bool, StoreError> {
        if batch.contains(key) {
            return Ok(true);
        }
        match self {
            Deduplicator::WithinBatch => Ok(false),
            Deduplicator::Store {
                store,
                ledger,
                deadline,
            } => call_with_deadline(ledger, RECORD_STORE_COLLABORATOR, *deadline, store.exists(key))
                .await
                .unwrap_or(Err(StoreError::Timeout(*deadline))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkReceipt {
    pub written: usize,
    pub skipped: usize,
    pub location: String,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error(transparent)]
    Write(#[from] anyhow::Error),
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn write_batch(&self, batch: &WeekBatch) -> Result<SinkReceipt, SinkError>;

    async fn write_usage(&self, report: &UsageReport) -> Result<(), SinkError>;
}

/// Writes each batch as one JSON document per (chart, week), overwriting earlier runs.
#[derive(Debug, Clone)]
pub struct FileSink {
    store: BatchFileStore,
}

impl FileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: BatchFileStore::new(output_dir),
        }
    }
}

#[async_trait]
impl OutputSink for FileSink {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn write_batch(&self, batch: &WeekBatch) -> Result<SinkReceipt, SinkError> {
        let bytes = serde_json::to_vec_pretty(batch.records())
            .with_context(|| format!("encoding batch {} {}", batch.chart_name, batch.week))?;
        let relative = BatchFileStore::batch_relative_path(&batch.chart_name, batch.week);
        let stored = self.store.write_document(&relative, &bytes).await?;
        debug!(
            path = %stored.absolute_path.display(),
            content_hash = %stored.content_hash,
            bytes = stored.byte_size,
            replaced = stored.replaced,
            "batch document stored"
        );
        Ok(SinkReceipt {
            written: batch.len(),
            skipped: 0,
            location: stored.absolute_path.display().to_string(),
        })
    }

    async fn write_usage(&self, report: &UsageReport) -> Result<(), SinkError> {
        let bytes = serde_json::to_vec_pretty(report).context("encoding usage report")?;
        let relative = BatchFileStore::usage_relative_path(report.records_processed);
        let stored = self.store.write_document(&relative, &bytes).await?;
        debug!(
            path = %stored.absolute_path.display(),
            bytes = stored.byte_size,
            replaced = stored.replaced,
            "usage report stored"
        );
        Ok(())
    }
}

/// Inserts records into the shared record store, re-checking existence right before each write.
#[derive(Clone)]
pub struct IndexSink {
    store: Arc<dyn RecordStore>,
    ledger: UsageLedger,
    deadline: Duration,
}

impl IndexSink {
    pub fn new(store: Arc<dyn RecordStore>, ledger: UsageLedger, deadline: Duration) -> Self {
        Self {
            store,
            ledger,
            deadline,
        }
    }

    async fn timed<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        call_with_deadline(&self.ledger, RECORD_STORE_COLLABORATOR, self.deadline, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.deadline)))
    }
}

#[async_trait]
impl OutputSink for IndexSink {
    fn kind(&self) -> &'static str {
        "index"
    }

    async fn write_batch(&self, batch: &WeekBatch) -> Result<SinkReceipt, SinkError> {
        let mut written = 0;
        let mut skipped = 0;
        for (key, record) in batch.records() {
            if self.timed(self.store.exists(key)).await? {
                skipped += 1;
                continue;
            }
            match self.timed(self.store.insert(key, record)).await? {
                InsertOutcome::Inserted => written += 1,
                InsertOutcome::AlreadyPresent => skipped += 1,
            }
        }
        Ok(SinkReceipt {
            written,
            skipped,
            location: self.store.name().to_string(),
        })
    }

    /// The report was already drained from the ledger, so its own write is not counted.
    async fn write_usage(&self, report: &UsageReport) -> Result<(), SinkError> {
        tokio::time::timeout(self.deadline, self.store.log_usage(report))
            .await
            .unwrap_or(Err(StoreError::Timeout(self.deadline)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    BudgetExhausted,
    PastStopDate,
}

/// Decides whether the walk continues to `next_week`. The budget is checked first.
pub fn next_state(
    next_week: NaiveDate,
    stop_date: NaiveDate,
    max_records: usize,
    records_processed: usize,
) -> RunState {
    if max_records > 0 && records_processed >= max_records {
        RunState::BudgetExhausted
    } else if next_week <= stop_date {
        RunState::PastStopDate
    } else {
        RunState::Running
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("output sink failed: {0}")]
    Sink(#[from] SinkError),
    #[error("worker {0} stopped before finishing its week")]
    WorkerLost(usize),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub final_state: RunState,
    pub weeks_processed: usize,
    pub records_processed: usize,
    pub records_written: usize,
    pub elapsed_secs: f64,
}

pub struct Collaborators {
    pub chart_source: Arc<dyn ChartSource>,
    pub song_sources: Vec<Arc<dyn SongSource>>,
    pub record_store: Option<Arc<dyn RecordStore>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct WorkerReport {
    charts: usize,
    records_written: usize,
}

struct WorkerContext {
    chart_source: Arc<dyn ChartSource>,
    song_sources: Vec<Arc<dyn SongSource>>,
    dedup: Deduplicator,
    sink: Arc<dyn OutputSink>,
    ledger: UsageLedger,
    merger: RecordMerger,
    records_processed: AtomicUsize,
    max_records: usize,
    deadline: Duration,
    flatten_lyrics: bool,
}

impl WorkerContext {
    fn records_processed(&self) -> usize {
        self.records_processed.load(Ordering::SeqCst)
    }

    fn budget_reached(&self) -> bool {
        self.max_records > 0 && self.records_processed() >= self.max_records
    }

    async fn process_charts(&self, charts: &[String], week: NaiveDate) -> Result<WorkerReport, RunError> {
        let mut report = WorkerReport::default();
        for chart in charts {
            if self.budget_reached() {
                break;
            }
            report.charts += 1;
            report.records_written += self.process_chart(chart, week).await?;
        }
        Ok(report)
    }

    async fn process_chart(&self, chart: &str, week: NaiveDate) -> Result<usize, RunError> {
        let Some(entries) = self.fetch_chart(chart, week).await else {
            return Ok(0);
        };

        let mut batch = WeekBatch::new(chart, week);
        for entry in &entries {
            if self.budget_reached() {
                break;
            }
            let key = entry.key();
            let status = if self.dedup.already_seen(&key, &batch).await? {
                "No Update"
            } else {
                let outcomes = self.fetch_song(entry).await;
                let started = Instant::now();
                let record = self.merger.merge(entry, &outcomes);
                self.ledger
                    .record(LYRIC_ANALYST_COLLABORATOR, started.elapsed(), CallOutcome::Ok)
                    .await;
                batch.insert(record);
                "New Entry"
            };
            let total = self.records_processed.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                status,
                chart,
                week = %week,
                artist = %entry.artist,
                title = %entry.title,
                records_processed = total,
                "song processed"
            );
        }

        let receipt = self.sink.write_batch(&batch).await?;
        info!(
            chart,
            week = %week,
            sink = self.sink.kind(),
            written = receipt.written,
            skipped = receipt.skipped,
            location = %receipt.location,
            "batch written"
        );
        Ok(receipt.written)
    }

    /// `None` when the chart could not be read; the chart is then treated as empty for the week.
    async fn fetch_chart(&self, chart: &str, week: NaiveDate) -> Option<Vec<ChartEntry>> {
        let label = self.chart_source.source_id().label();
        let result = call_with_deadline(
            &self.ledger,
            label,
            self.deadline,
            self.chart_source.get_chart(chart, week),
        )
        .await;
        match result {
            Ok(Ok(entries)) => Some(entries),
            Ok(Err(err @ ChartError::NotPublished { .. })) => {
                info!(chart, week = %week, reason = %err, "no chart for week");
                None
            }
            Ok(Err(err)) => {
                warn!(chart, week = %week, error = %err, "chart fetch failed");
                None
            }
            Err(_) => {
                warn!(chart, week = %week, deadline = ?self.deadline, "chart fetch timed out");
                None
            }
        }
    }

    async fn fetch_song(&self, entry: &ChartEntry) -> Vec<SourceOutcome> {
        let query = SongQuery::new(&entry.artist, &entry.title, self.flatten_lyrics);
        let mut outcomes = Vec::with_capacity(self.song_sources.len());
        for source in &self.song_sources {
            let source_id = source.source_id();
            let result = call_with_deadline(
                &self.ledger,
                source_id.label(),
                self.deadline,
                source.get_song_data(&query),
            )
            .await;
            let outcome = match result {
                Ok(Ok(mut facts)) => {
                    facts.source = source_id;
                    SourceOutcome::from_facts(facts)
                }
                Ok(Err(err)) => {
                    warn!(source = %source_id, artist = %entry.artist, title = %entry.title, error = %err, "song source failed");
                    SourceOutcome::failed(source_id, FetchStatus::Unavailable)
                }
                Err(_) => {
                    warn!(source = %source_id, artist = %entry.artist, title = %entry.title, "song source timed out");
                    SourceOutcome::failed(source_id, FetchStatus::TimedOut)
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

struct WeekJob {
    week: NaiveDate,
    reply: oneshot::Sender<Result<WorkerReport, RunError>>,
}

/// Fixed set of long-lived workers, one per chart partition, reused for every week.
struct WorkerPool {
    senders: Vec<mpsc::Sender<WeekJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(ctx: Arc<WorkerContext>, partitions: Vec<Vec<String>>) -> Self {
        let mut senders = Vec::with_capacity(partitions.len());
        let mut handles = Vec::with_capacity(partitions.len());
        for (worker, charts) in partitions.into_iter().enumerate() {
            let (tx, mut rx) = mpsc::channel::<WeekJob>(1);
            let ctx = ctx.clone();
            let handle = tokio::spawn(
                async move {
                    while let Some(job) = rx.recv().await {
                        let result = ctx.process_charts(&charts, job.week).await;
                        let _ = job.reply.send(result);
                    }
                }
                .instrument(info_span!("worker", worker)),
            );
            senders.push(tx);
            handles.push(handle);
        }
        Self { senders, handles }
    }

    /// Hands `week` to every worker and waits for all of them before returning.
    async fn run_week(&self, week: NaiveDate) -> Result<Vec<WorkerReport>, RunError> {
        let mut replies = Vec::with_capacity(self.senders.len());
        for (worker, sender) in self.senders.iter().enumerate() {
            let (reply, rx) = oneshot::channel();
            sender
                .send(WeekJob { week, reply })
                .await
                .map_err(|_| RunError::WorkerLost(worker))?;
            replies.push(rx);
        }

        let mut reports = Vec::with_capacity(replies.len());
        let mut first_error = None;
        for (worker, rx) in replies.into_iter().enumerate() {
            match rx.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(RunError::WorkerLost(worker));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }

    async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Walks weeks backward from the start date, one pool-wide batch of chart work per week.
pub struct WeeklyOrchestrator {
    config: RunConfig,
    ctx: Arc<WorkerContext>,
    reporter: UsageReporter,
}

impl WeeklyOrchestrator {
    pub fn new(config: RunConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(chart) = config
            .charts
            .iter()
            .find(|c| !collaborators.chart_source.supports_chart(c))
        {
            return Err(ConfigError::UnknownChart(chart.clone()));
        }

        let ledger = UsageLedger::new();
        let deadline = config.call_timeout()?;
        let (dedup, sink): (Deduplicator, Arc<dyn OutputSink>) = if config.use_elastic_search {
            let store = collaborators
                .record_store
                .ok_or(ConfigError::MissingRecordStore)?;
            (
                Deduplicator::Store {
                    store: store.clone(),
                    ledger: ledger.clone(),
                    deadline,
                },
                Arc::new(IndexSink::new(store, ledger.clone(), deadline)),
            )
        } else {
            (
                Deduplicator::WithinBatch,
                Arc::new(FileSink::new(config.output_dir.clone())),
            )
        };

        let ctx = Arc::new(WorkerContext {
            chart_source: collaborators.chart_source,
            song_sources: collaborators.song_sources,
            dedup,
            sink,
            ledger: ledger.clone(),
            merger: RecordMerger::default(),
            records_processed: AtomicUsize::new(0),
            max_records: config.max_entries,
            deadline,
            flatten_lyrics: config.flatten_lyrics,
        });
        Ok(Self {
            config,
            ctx,
            reporter: UsageReporter::new(ledger),
        })
    }

    pub fn partitions(&self) -> Vec<Vec<String>> {
        partition_charts(&self.config.charts, self.config.max_threads)
    }

    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let partitions = self.partitions();
        info!(
            %run_id,
            workers = partitions.len(),
            ?partitions,
            start = %self.config.start_date,
            stop = %self.config.end_date,
            max_entries = self.config.max_entries,
            sink = self.ctx.sink.kind(),
            "starting weekly walk"
        );

        let pool = WorkerPool::start(self.ctx.clone(), partitions);
        let walked = self.walk(&pool).await;
        pool.shutdown().await;
        let (final_state, weeks_processed, records_written) = walked?;

        let summary = RunSummary {
            run_id,
            final_state,
            weeks_processed,
            records_processed: self.ctx.records_processed(),
            records_written,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            %run_id,
            final_state = ?summary.final_state,
            weeks = summary.weeks_processed,
            records_processed = summary.records_processed,
            records_written = summary.records_written,
            "weekly walk finished"
        );
        Ok(summary)
    }

    async fn walk(&self, pool: &WorkerPool) -> Result<(RunState, usize, usize), RunError> {
        let mut week = self.config.start_date;
        let mut weeks_processed = 0;
        let mut records_written = 0;
        loop {
            let reports = pool.run_week(week).await?;
            weeks_processed += 1;
            records_written += reports.iter().map(|r| r.records_written).sum::<usize>();

            let processed = self.ctx.records_processed();
            let usage = self.reporter.flush(week, processed).await;
            info!(
                week = %week,
                records_processed = processed,
                calls = usage.counters.total_calls(),
                errors = usage.counters.total_errors(),
                "week complete"
            );
            self.ctx.sink.write_usage(&usage).await?;

            let next_week = self.ctx.chart_source.rewind_one_week(week);
            match next_state(next_week, self.config.end_date, self.config.max_entries, processed) {
                RunState::Running => week = next_week,
                terminal => return Ok((terminal, weeks_processed, records_written)),
            }
        }
    }
}

/// Builds chart and song sources plus the optional record store for `config`.
pub fn build_collaborators(config: &RunConfig, env: &EnvSettings) -> anyhow::Result<Collaborators> {
    let (chart_source, song_sources): (Arc<dyn ChartSource>, Vec<Arc<dyn SongSource>>) =
        match config.source_mode {
            SourceMode::Fixture => (
                Arc::new(FixtureChartSource::new(config.fixtures_dir.clone())),
                fixture_song_sources(&config.fixtures_dir)?,
            ),
            SourceMode::Live => {
                let http = Arc::new(HttpFetcher::new(env.http_client_config())?);
                let tokens = SourceTokens {
                    genius: env.genius_token.clone(),
                    spotify: env.spotify_token.clone(),
                };
                (
                    Arc::new(BillboardChartClient::new(http.clone())),
                    live_song_sources(http, &tokens),
                )
            }
        };

    let record_store: Option<Arc<dyn RecordStore>> = if config.use_elastic_search {
        Some(Arc::new(ElasticRecordStore::new(env.elastic_config())?))
    } else {
        None
    };

    Ok(Collaborators {
        chart_source,
        song_sources,
        record_store,
    })
}

pub async fn run_from_config_path(path: &Path) -> anyhow::Result<RunSummary> {
    let config = RunConfig::load(path)?;
    let env = EnvSettings::from_env();
    let collaborators = build_collaborators(&config, &env)
        .with_context(|| format!("building collaborators for {}", path.display()))?;
    let orchestrator = WeeklyOrchestrator::new(config, collaborators)?;
    Ok(orchestrator.run().await?)
}

pub fn partition_plan_from_config_path(path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
    let config = RunConfig::load(path)?;
    config.validate()?;
    Ok(partition_charts(&config.charts, config.max_threads))
}
