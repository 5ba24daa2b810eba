//! Batch document storage, record index stores and rate-limited HTTP fetching for songtrail.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use songtrail_core::{SongKey, UnifiedSongRecord, UsageReport};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "songtrail-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub replaced: bool,
}

/// Writes one JSON document per chart week under a root directory.
#[derive(Debug, Clone)]
pub struct BatchFileStore {
    root: PathBuf,
}

impl BatchFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn batch_relative_path(chart_name: &str, week: NaiveDate) -> PathBuf {
        let chart = chart_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect::<String>();
        PathBuf::from(format!("{chart}_{}.json", week.format("%Y-%m-%d")))
    }

    pub fn usage_relative_path(records_processed: usize) -> PathBuf {
        PathBuf::from(format!("usage_{records_processed}records.json"))
    }

    /// Replace the document at `relative_path` using a temp file and an atomic rename.
    pub async fn write_document(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredDocument> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .ok_or_else(|| anyhow!("document path {} has no parent", absolute_path.display()))?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating output directory {}", parent.display()))?;

        let replaced = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking document path {}", absolute_path.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp document {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp document {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp document {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp document {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredDocument {
            content_hash: sha256_hex(bytes),
            absolute_path,
            byte_size: bytes.len(),
            replaced,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("record store returned http {status} during {operation}")]
    Status { status: u16, operation: &'static str },
    #[error("encoding record store document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("record store did not answer within {0:?}")]
    Timeout(Duration),
}

/// Index of already-processed songs, shared by every worker of a run.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn exists(&self, key: &SongKey) -> Result<bool, StoreError>;

    /// Create-only insert; an existing document is never updated.
    async fn insert(
        &self,
        key: &SongKey,
        record: &UnifiedSongRecord,
    ) -> Result<InsertOutcome, StoreError>;

    async fn log_usage(&self, report: &UsageReport) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub base_url: String,
    pub song_index: String,
    pub usage_index: String,
    pub timeout: Duration,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            song_index: "song_data".to_string(),
            usage_index: "song_data_usage".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Elasticsearch REST store. Documents are keyed by the SHA-256 of the song key.
#[derive(Debug)]
pub struct ElasticRecordStore {
    client: reqwest::Client,
    config: ElasticConfig,
}

impl ElasticRecordStore {
    pub fn new(config: ElasticConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building elasticsearch client")?;
        Ok(Self { client, config })
    }

    pub fn document_id(key: &SongKey) -> String {
        sha256_hex(key.as_str().as_bytes())
    }

    fn doc_url(&self, endpoint: &str, key: &SongKey) -> String {
        format!(
            "{}/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.song_index,
            endpoint,
            Self::document_id(key)
        )
    }
}

#[async_trait]
impl RecordStore for ElasticRecordStore {
    fn name(&self) -> &'static str {
        "ElasticSearch"
    }

    async fn exists(&self, key: &SongKey) -> Result<bool, StoreError> {
        let resp = self.client.head(self.doc_url("_doc", key)).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::Status {
                status: status.as_u16(),
                operation: "exists",
            }),
        }
    }

    async fn insert(
        &self,
        key: &SongKey,
        record: &UnifiedSongRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let mut body = serde_json::to_value(record)?;
        if let Some(map) = body.as_object_mut() {
            map.insert("Unique_Key".to_string(), key.as_str().into());
        }
        let resp = self
            .client
            .put(self.doc_url("_create", key))
            .json(&body)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(InsertOutcome::Inserted),
            StatusCode::CONFLICT => Ok(InsertOutcome::AlreadyPresent),
            status => Err(StoreError::Status {
                status: status.as_u16(),
                operation: "insert",
            }),
        }
    }

    async fn log_usage(&self, report: &UsageReport) -> Result<(), StoreError> {
        let mut body = serde_json::to_value(report)?;
        if let Some(map) = body.as_object_mut() {
            map.insert("logged_at".to_string(), Utc::now().to_rfc3339().into());
        }
        let url = format!(
            "{}/{}/_doc",
            self.config.base_url.trim_end_matches('/'),
            self.config.usage_index
        );
        let resp = self.client.post(url).json(&body).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Status {
                status: resp.status().as_u16(),
                operation: "log_usage",
            })
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<SongKey, UnifiedSongRecord>>,
    usage: Mutex<Vec<UsageReport>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn get(&self, key: &SongKey) -> Option<UnifiedSongRecord> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn usage_reports(&self) -> Vec<UsageReport> {
        self.usage.lock().await.clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    fn name(&self) -> &'static str {
        "InMemory"
    }

    async fn exists(&self, key: &SongKey) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.contains_key(key))
    }

    async fn insert(
        &self,
        key: &SongKey,
        record: &UnifiedSongRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(key) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        records.insert(key.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn log_usage(&self, report: &UsageReport) -> Result<(), StoreError> {
        self.usage.lock().await.push(report.clone());
        Ok(())
    }
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Request budget shared by every source behind one fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// `rate` requests per second with a burst of the same size. Zero means unlimited.
    pub fn per_second(rate: u32) -> Option<Self> {
        (rate > 0).then(|| Self {
            capacity: rate,
            refill_every: Duration::from_secs(1) / rate,
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    config: TokenBucketConfig,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes a token if one is available, otherwise returns how long until the next refill.
    pub async fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        let refill_every = self.config.refill_every;
        if refill_every.is_zero() {
            return Ok(());
        }
        let elapsed = state.last_refill.elapsed();
        let refills = elapsed.as_nanos() / refill_every.as_nanos();
        if refills > 0 {
            let refills = u32::try_from(refills).unwrap_or(u32::MAX);
            state.tokens = state.tokens.saturating_add(refills).min(self.config.capacity);
            state.last_refill = Instant::now();
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            Ok(())
        } else {
            Err(refill_every.saturating_sub(state.last_refill.elapsed()))
        }
    }

    pub async fn take(&self) {
        while let Err(wait) = self.try_take().await {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetcher concurrency limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch(source_id, url, None).await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        let resp = self.fetch(source_id, url, bearer).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }

    async fn fetch(
        &self,
        source_id: &str,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url, bearer).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying http fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying http fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
