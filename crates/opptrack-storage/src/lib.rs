//! Resilient HTTP fetch utilities + the file-backed persisted record store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use opptrack_core::{ActionLogEntry, Identity, PersistedRecord};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "opptrack-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::FORBIDDEN
    {
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

/// Statuses the catalog uses to push back on paging speed.
pub fn is_throttle_signal(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN
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

/// Inter-request delay shared across one crawl run. Escalates when the site
/// pushes back, decays toward the configured baseline on success.
#[derive(Debug)]
pub struct AdaptiveThrottle {
    base: Duration,
    max: Duration,
    current: Mutex<Duration>,
}

impl AdaptiveThrottle {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: Mutex::new(base),
        }
    }

    pub fn current_delay(&self) -> Duration {
        *self.current.lock().expect("throttle lock not poisoned")
    }

    pub async fn wait(&self) {
        let delay = self.current_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Double the delay (floored at 250ms so a zero baseline still escalates),
    /// capped at the configured maximum.
    pub fn escalate(&self) -> Duration {
        let mut current = self.current.lock().expect("throttle lock not poisoned");
        let floor = self.base.max(Duration::from_millis(250));
        *current = current.max(floor).saturating_mul(2).min(self.max);
        *current
    }

    /// Halve the delay back toward the baseline.
    pub fn decay(&self) -> Duration {
        let mut current = self.current.lock().expect("throttle lock not poisoned");
        *current = (*current / 2).max(self.base);
        *current
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub base_delay: Duration,
    pub max_throttle_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            base_delay: Duration::from_secs(1),
            max_throttle_delay: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
enum FormBody<'a> {
    None,
    UrlEncoded(&'a [(String, String)]),
}

/// HTTP client with bounded retries, exponential backoff, and a shared
/// adaptive inter-request throttle. One instance serves both the listing
/// pagination loop and the detail enrichment workers.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    throttle: AdaptiveThrottle,
    backoff: BackoffPolicy,
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
            throttle: AdaptiveThrottle::new(config.base_delay, config.max_throttle_delay),
            backoff: config.backoff,
        })
    }

    pub fn throttle(&self) -> &AdaptiveThrottle {
        &self.throttle
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.execute(url, FormBody::None).await
    }

    /// Synthesized postback request replaying pagination tokens plus the
    /// target control id/argument pair.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(url, FormBody::UrlEncoded(form)).await
    }

    async fn execute(&self, url: &str, body: FormBody<'_>) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            self.throttle.wait().await;

            let request = match body {
                FormBody::None => self.client.get(url),
                FormBody::UrlEncoded(fields) => self.client.post(url).form(fields),
            };

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        self.throttle.decay();
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if is_throttle_signal(status) {
                        let delay = self.throttle.escalate();
                        warn!(%status, ?delay, "rate limited, escalating inter-request delay");
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
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
                        debug!(error = %err, attempt, "transient request error, retrying");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    active: Vec<PersistedRecord>,
    #[serde(default)]
    archive: Vec<PersistedRecord>,
    #[serde(default)]
    log: Vec<ActionLogEntry>,
}

/// Persisted dataset: an active table and an archive table keyed by
/// Identity, plus the append-only action log.
///
/// Records only ever move active -> archive; the log is never truncated.
#[derive(Debug, Default)]
pub struct RecordStore {
    active: BTreeMap<Identity, PersistedRecord>,
    archive: BTreeMap<Identity, PersistedRecord>,
    log: Vec<ActionLogEntry>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from disk. A missing file yields an empty store; an unparseable
    /// file surfaces as `StoreError::Corrupt` for the caller to decide on.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new());
            }
            Err(err) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        };

        let file: StoreFile =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;

        let mut store = Self::new();
        for record in file.active {
            store.active.insert(record.identity.clone(), record);
        }
        for record in file.archive {
            store.archive.insert(record.identity.clone(), record);
        }
        store.log = file.log;
        Ok(store)
    }

    /// Atomic save: write a temp file alongside the target, then rename.
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let file = StoreFile {
            active: self.active.values().cloned().collect(),
            archive: self.archive.values().cloned().collect(),
            log: self.log.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let mut out = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        out.write_all(&bytes).await.map_err(io_err)?;
        out.flush().await.map_err(io_err)?;
        drop(out);

        match fs::rename(&temp_path, path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(err))
            }
        }
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn archive_len(&self) -> usize {
        self.archive.len()
    }

    pub fn get_active(&self, identity: &Identity) -> Option<&PersistedRecord> {
        self.active.get(identity)
    }

    pub fn get_active_mut(&mut self, identity: &Identity) -> Option<&mut PersistedRecord> {
        self.active.get_mut(identity)
    }

    pub fn get_archived(&self, identity: &Identity) -> Option<&PersistedRecord> {
        self.archive.get(identity)
    }

    pub fn active_records(&self) -> impl Iterator<Item = &PersistedRecord> {
        self.active.values()
    }

    pub fn active_identities(&self) -> Vec<Identity> {
        self.active.keys().cloned().collect()
    }

    /// Insert or replace in the active table. The map key guarantees at most
    /// one active record per Identity.
    pub fn upsert_active(&mut self, record: PersistedRecord) {
        self.active.insert(record.identity.clone(), record);
    }

    /// Move a record from the active table to the archive table. One-way:
    /// nothing ever moves back. Returns false when the identity is not
    /// active.
    pub fn archive_record(&mut self, identity: &Identity) -> bool {
        match self.active.remove(identity) {
            Some(record) => {
                self.archive.insert(identity.clone(), record);
                true
            }
            None => false,
        }
    }

    pub fn append_log(&mut self, entry: ActionLogEntry) {
        self.log.push(entry);
    }

    pub fn log_entries(&self) -> &[ActionLogEntry] {
        &self.log
    }
}
