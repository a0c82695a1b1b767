//! Identity resolution, deduplication, reconciliation, and the run pipeline.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use opptrack_core::{
    ActionLogEntry, BusinessFields, EnrichedRecord, Identity, PersistedRecord, RecordDraft,
    RecordStatus, RunSummary, ValidationFlag,
};
use opptrack_crawl::{CrawlConfig, CrawlOutcome, CrawlTermination, DetailEnricher, ListingCrawler};
use opptrack_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, RecordStore};
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "opptrack-sync";

static EXTRANET_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/extranet/(\d+)").expect("static regex"));
static REQUEST_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[?&]requestid=(\d+)").expect("static regex"));

/// Site-native numeric id, when the detail URL carries one.
pub fn native_id_from_url(url: &str) -> Option<u64> {
    EXTRANET_ID_RE
        .captures(url)
        .or_else(|| REQUEST_ID_RE.captures(url))
        .and_then(|caps| caps[1].parse().ok())
}

fn normalized(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_ascii_lowercase()
}

/// Deterministic identity: the native numeric id when derivable from the
/// detail URL, otherwise a digest over normalized (url, title, agency,
/// publish timestamp). Depends only on the record's own content, never on
/// wall clock or batch ordering.
pub fn assign_identity(business: &BusinessFields) -> Identity {
    if let Some(id) = business.detail_url.as_deref().and_then(native_id_from_url) {
        return Identity::native(id);
    }

    let mut hasher = Sha256::new();
    hasher.update(normalized(business.detail_url.as_deref()).as_bytes());
    hasher.update(b"|");
    hasher.update(business.title.trim().to_ascii_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(normalized(business.agency.as_deref()).as_bytes());
    hasher.update(b"|");
    hasher.update(
        business
            .publish_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default()
            .as_bytes(),
    );
    let hex = hex::encode(hasher.finalize());
    Identity::digest(&hex[..16])
}

/// Attach identity and quality score, closing out the draft.
pub fn finalize_record(draft: RecordDraft) -> EnrichedRecord {
    let identity = assign_identity(&draft.business);
    let quality_score = draft.business.completeness_score();
    EnrichedRecord {
        identity,
        business: draft.business,
        validation_flags: draft.validation_flags,
        quality_score,
        fetched_at: draft.fetched_at,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    NativeId,
    DetailUrl,
    Composite,
    ContentDigest,
}

/// One membership set per key kind, scoped to a single batch.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    seen: HashMap<KeyKind, HashSet<String>>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, kind: KeyKind, key: &str) -> bool {
        self.seen
            .get(&kind)
            .is_some_and(|set| set.contains(key))
    }

    /// Insert a key, returning whether it was already present.
    pub fn register(&mut self, kind: KeyKind, key: String) -> bool {
        !self.seen.entry(kind).or_default().insert(key)
    }
}

fn composite_key(business: &BusinessFields) -> String {
    format!(
        "{}|{}|{}",
        business.title.trim().to_ascii_lowercase(),
        normalized(business.agency.as_deref()),
        business
            .publish_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default()
    )
}

fn content_digest(business: &BusinessFields) -> String {
    let bytes = serde_json::to_vec(business).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

fn membership_keys(record: &EnrichedRecord) -> Vec<(KeyKind, String)> {
    let business = &record.business;
    let mut keys = Vec::with_capacity(4);
    if let Some(id) = business.detail_url.as_deref().and_then(native_id_from_url) {
        keys.push((KeyKind::NativeId, id.to_string()));
    }
    if let Some(url) = business.detail_url.as_deref() {
        keys.push((KeyKind::DetailUrl, url.trim().to_ascii_lowercase()));
    }
    keys.push((KeyKind::Composite, composite_key(business)));
    keys.push((KeyKind::ContentDigest, content_digest(business)));
    keys
}

#[derive(Debug)]
pub struct DedupOutcome {
    pub records: Vec<EnrichedRecord>,
    pub duplicates: usize,
}

/// Drop every record that matches ANY membership set populated earlier in
/// the same batch. Duplicates are dropped, not merged; the key kind that
/// triggered the drop is logged.
pub fn dedup_batch(records: Vec<EnrichedRecord>) -> DedupOutcome {
    let mut index = IdentityIndex::new();
    let mut kept = Vec::with_capacity(records.len());
    let mut duplicates = 0;

    for record in records {
        let keys = membership_keys(&record);
        let hit = keys
            .iter()
            .find(|(kind, key)| index.contains(*kind, key))
            .map(|(kind, _)| *kind);

        match hit {
            Some(kind) => {
                debug!(identity = %record.identity, ?kind, "duplicate dropped");
                duplicates += 1;
            }
            None => {
                for (kind, key) in keys {
                    index.register(kind, key);
                }
                kept.push(record);
            }
        }
    }

    DedupOutcome {
        records: kept,
        duplicates,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileCounts {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub stale_archived: usize,
}

/// Single-writer diff of one deduplicated batch against the active store.
/// Business-field equality alone decides Updated vs Unchanged; every
/// transition appends exactly one log entry.
#[derive(Debug, Clone, Copy)]
pub struct ReconciliationEngine {
    staleness_days: i64,
}

impl ReconciliationEngine {
    pub fn new(staleness_days: i64) -> Self {
        Self { staleness_days }
    }

    pub fn reconcile(
        &self,
        store: &mut RecordStore,
        batch: &[EnrichedRecord],
        run_at: DateTime<Utc>,
    ) -> ReconcileCounts {
        let mut counts = self.apply_batch(store, batch, run_at);
        let seen_this_run: HashSet<Identity> =
            batch.iter().map(|record| record.identity.clone()).collect();
        counts.stale_archived = self.sweep_stale(store, &seen_this_run, run_at);
        counts
    }

    /// Batch transitions only, no staleness sweep. Used when a crawl ended
    /// early: absence from a truncated batch is not evidence of absence
    /// from the site.
    pub fn apply_batch(
        &self,
        store: &mut RecordStore,
        batch: &[EnrichedRecord],
        run_at: DateTime<Utc>,
    ) -> ReconcileCounts {
        let mut counts = ReconcileCounts::default();

        for record in batch {
            let prior = store.get_active(&record.identity).cloned();

            match prior {
                None => {
                    store.upsert_active(PersistedRecord {
                        identity: record.identity.clone(),
                        business: record.business.clone(),
                        first_seen: run_at,
                        last_seen: run_at,
                        status: RecordStatus::New,
                        quality_score: record.quality_score,
                    });
                    store.append_log(ActionLogEntry {
                        identity: record.identity.clone(),
                        status: RecordStatus::New,
                        run_at,
                        changed_fields: Vec::new(),
                    });
                    counts.new += 1;
                }
                Some(prior) => {
                    let changed = record.business.changed_from(&prior.business);
                    if changed.is_empty() {
                        store.upsert_active(PersistedRecord {
                            status: RecordStatus::Unchanged,
                            last_seen: run_at,
                            ..prior
                        });
                        store.append_log(ActionLogEntry {
                            identity: record.identity.clone(),
                            status: RecordStatus::Unchanged,
                            run_at,
                            changed_fields: Vec::new(),
                        });
                        counts.unchanged += 1;
                    } else {
                        debug!(identity = %record.identity, ?changed, "business fields changed");
                        store.upsert_active(PersistedRecord {
                            business: record.business.clone(),
                            last_seen: run_at,
                            status: RecordStatus::Updated,
                            quality_score: record.quality_score,
                            ..prior
                        });
                        store.append_log(ActionLogEntry {
                            identity: record.identity.clone(),
                            status: RecordStatus::Updated,
                            run_at,
                            changed_fields: changed.iter().map(|f| f.to_string()).collect(),
                        });
                        counts.updated += 1;
                    }
                }
            }
        }

        counts
    }

    /// Archive active records absent from this batch and unseen for longer
    /// than the staleness threshold. One-way, exactly once per record.
    fn sweep_stale(
        &self,
        store: &mut RecordStore,
        seen_this_run: &HashSet<Identity>,
        run_at: DateTime<Utc>,
    ) -> usize {
        let threshold = chrono::Duration::days(self.staleness_days);
        let mut archived = 0;

        for identity in store.active_identities() {
            if seen_this_run.contains(&identity) {
                continue;
            }
            let unseen_for = match store.get_active(&identity) {
                Some(record) => run_at - record.last_seen,
                None => continue,
            };
            if unseen_for <= threshold {
                // within threshold: no transition, awaiting the next run
                continue;
            }

            if let Some(record) = store.get_active_mut(&identity) {
                record.status = RecordStatus::Stale;
            }
            store.archive_record(&identity);
            store.append_log(ActionLogEntry {
                identity: identity.clone(),
                status: RecordStatus::Stale,
                run_at,
                changed_fields: Vec::new(),
            });
            info!(%identity, "archived stale record");
            archived += 1;
        }
        archived
    }
}

/// Manual archival: move every active record unseen for more than `days`
/// to the archive table. Returns the number archived.
pub fn archive_older_than(store: &mut RecordStore, days: i64, run_at: DateTime<Utc>) -> usize {
    let cutoff = run_at - chrono::Duration::days(days);
    let mut archived = 0;

    for identity in store.active_identities() {
        let too_old = store
            .get_active(&identity)
            .is_some_and(|record| record.last_seen < cutoff);
        if !too_old {
            continue;
        }
        if let Some(record) = store.get_active_mut(&identity) {
            record.status = RecordStatus::Stale;
        }
        store.archive_record(&identity);
        store.append_log(ActionLogEntry {
            identity,
            status: RecordStatus::Stale,
            run_at,
            changed_fields: Vec::new(),
        });
        archived += 1;
    }
    archived
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub entry_url: String,
    pub max_pages: usize,
    pub base_delay: Duration,
    pub max_throttle_delay: Duration,
    pub http_timeout: Duration,
    pub max_retries: usize,
    pub user_agent: Option<String>,
    pub fetch_details: bool,
    pub detail_workers: usize,
    pub days_ago: Option<i64>,
    pub staleness_days: i64,
    pub store_path: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            entry_url: String::new(),
            max_pages: 50,
            base_delay: Duration::from_secs(1),
            max_throttle_delay: Duration::from_secs(10),
            http_timeout: Duration::from_secs(30),
            max_retries: 3,
            user_agent: None,
            fetch_details: true,
            detail_workers: 4,
            days_ago: None,
            staleness_days: 30,
            store_path: PathBuf::from("opptrack-store.json"),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            entry_url: std::env::var("OPPTRACK_ENTRY_URL").unwrap_or(defaults.entry_url),
            max_pages: env_parse("OPPTRACK_MAX_PAGES", defaults.max_pages),
            base_delay: Duration::from_millis(env_parse(
                "OPPTRACK_BASE_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            max_throttle_delay: Duration::from_millis(env_parse(
                "OPPTRACK_MAX_THROTTLE_MS",
                defaults.max_throttle_delay.as_millis() as u64,
            )),
            http_timeout: Duration::from_secs(env_parse(
                "OPPTRACK_HTTP_TIMEOUT_SECS",
                defaults.http_timeout.as_secs(),
            )),
            max_retries: env_parse("OPPTRACK_MAX_RETRIES", defaults.max_retries),
            user_agent: std::env::var("OPPTRACK_USER_AGENT").ok(),
            fetch_details: !std::env::var("OPPTRACK_SKIP_DETAILS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            detail_workers: env_parse("OPPTRACK_DETAIL_WORKERS", defaults.detail_workers),
            days_ago: std::env::var("OPPTRACK_DAYS_AGO")
                .ok()
                .and_then(|value| value.parse().ok()),
            staleness_days: env_parse("OPPTRACK_STALENESS_DAYS", defaults.staleness_days),
            store_path: env_parse("OPPTRACK_STORE_PATH", defaults.store_path),
        }
    }
}

/// Keep only drafts published on the target day (`run date - days_ago`).
/// Drafts with no parsed publish date cannot match and are dropped.
pub fn filter_by_target_date(
    drafts: Vec<RecordDraft>,
    days_ago: Option<i64>,
    run_at: DateTime<Utc>,
) -> Vec<RecordDraft> {
    let Some(days) = days_ago else {
        return drafts;
    };
    let target = (run_at - chrono::Duration::days(days)).date_naive();
    drafts
        .into_iter()
        .filter(|draft| {
            draft
                .business
                .publish_at
                .is_some_and(|at| at.date_naive() == target)
        })
        .collect()
}

/// A crawl that exhausted its retry budget. Partial results were still
/// reconciled (without the staleness sweep) and saved; the summary carries
/// their counts.
#[derive(Debug, Error)]
#[error("crawl aborted after {} pages, partial results persisted: {source}", summary.pages_crawled)]
pub struct RunError {
    pub summary: RunSummary,
    #[source]
    pub source: FetchError,
}

/// One full run: crawl the catalog, enrich with bounded fan-out, filter,
/// assign identities, dedup, reconcile against the persisted store, save.
pub struct Pipeline {
    config: RunConfig,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> anyhow::Result<RunSummary> {
        let run_at = Utc::now();
        let mut summary = RunSummary::default();

        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: self.config.http_timeout,
            user_agent: self.config.user_agent.clone(),
            base_delay: self.config.base_delay,
            max_throttle_delay: self.config.max_throttle_delay,
            backoff: BackoffPolicy {
                max_retries: self.config.max_retries,
                ..BackoffPolicy::default()
            },
        })?);

        let crawler = ListingCrawler::new(
            fetcher.clone(),
            CrawlConfig {
                entry_url: self.config.entry_url.clone(),
                max_pages: self.config.max_pages,
            },
        );
        let CrawlOutcome {
            rows,
            pages_fetched,
            termination,
        } = crawler.crawl().await?;
        let crawl_failure = match termination {
            CrawlTermination::FetchFailed(err) => {
                warn!(error = %err, rows = rows.len(), "crawl ended early, reconciling partial rows");
                Some(err)
            }
            _ => None,
        };
        summary.pages_crawled = pages_fetched;
        summary.rows_extracted = rows.len();

        let drafts = self.enrich_all(fetcher, &rows, run_at).await;
        summary.enrichment_failed = drafts
            .iter()
            .filter(|d| {
                d.validation_flags
                    .contains(&ValidationFlag::IncompleteEnrichment)
            })
            .count();
        summary.enrichment_ok = drafts.len() - summary.enrichment_failed;

        let drafts = filter_by_target_date(drafts, self.config.days_ago, run_at);
        let records: Vec<EnrichedRecord> = drafts.into_iter().map(finalize_record).collect();

        let deduped = dedup_batch(records);
        summary.duplicates_dropped = deduped.duplicates;

        let mut store = RecordStore::load(&self.config.store_path).await?;
        let engine = ReconciliationEngine::new(self.config.staleness_days);
        // absence from a truncated batch must not feed the staleness sweep
        let counts = if crawl_failure.is_some() {
            engine.apply_batch(&mut store, &deduped.records, run_at)
        } else {
            engine.reconcile(&mut store, &deduped.records, run_at)
        };
        store.save(&self.config.store_path).await?;

        summary.new = counts.new;
        summary.updated = counts.updated;
        summary.unchanged = counts.unchanged;
        summary.stale_archived = counts.stale_archived;

        if let Some(source) = crawl_failure {
            return Err(RunError { summary, source }.into());
        }

        info!(
            pages = summary.pages_crawled,
            rows = summary.rows_extracted,
            new = summary.new,
            updated = summary.updated,
            unchanged = summary.unchanged,
            stale = summary.stale_archived,
            duplicates = summary.duplicates_dropped,
            "run complete"
        );
        Ok(summary)
    }

    /// Detail enrichment fanned out over a bounded worker pool. Listing
    /// order is restored afterwards; pagination itself stays sequential.
    async fn enrich_all(
        &self,
        fetcher: Arc<HttpFetcher>,
        rows: &[opptrack_core::RawListingRow],
        run_at: DateTime<Utc>,
    ) -> Vec<RecordDraft> {
        let enricher = DetailEnricher::new(fetcher, self.config.fetch_details);
        let semaphore = Arc::new(Semaphore::new(self.config.detail_workers.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, row) in rows.iter().cloned().enumerate() {
            let enricher = enricher.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                (idx, enricher.enrich(&row, run_at).await)
            });
        }

        let mut indexed: Vec<(usize, RecordDraft)> = Vec::with_capacity(rows.len());
        let mut completed = 0usize;
        let mut failed = 0usize;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, draft)) => {
                    completed += 1;
                    if draft
                        .validation_flags
                        .contains(&ValidationFlag::IncompleteEnrichment)
                    {
                        failed += 1;
                    }
                    if completed % 10 == 0 {
                        info!(
                            completed,
                            ok = completed - failed,
                            failed,
                            total = rows.len(),
                            "detail enrichment progress"
                        );
                    }
                    indexed.push((idx, draft));
                }
                Err(err) => {
                    warn!(error = %err, "enrichment task failed to join");
                }
            }
        }

        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, draft)| draft).collect()
    }
}

/// Convenience entry point for the CLI: environment-derived config, one run.
pub async fn run_once_from_env() -> anyhow::Result<RunSummary> {
    Pipeline::new(RunConfig::from_env()).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn run_time(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, day, 12, 0, 0).single().unwrap()
    }

    fn draft(title: &str, agency: &str, url: Option<&str>) -> RecordDraft {
        RecordDraft {
            business: BusinessFields {
                title: title.to_string(),
                agency: Some(agency.to_string()),
                detail_url: url.map(str::to_string),
                publish_at: Some(run_time(1)),
                ..Default::default()
            },
            validation_flags: Vec::new(),
            fetched_at: run_time(1),
        }
    }

    fn record(title: &str, agency: &str, url: Option<&str>) -> EnrichedRecord {
        finalize_record(draft(title, agency, url))
    }

    #[test]
    fn native_ids_are_parsed_from_both_url_shapes() {
        assert_eq!(
            native_id_from_url("https://x.gov/page.aspx/en/rfp/request_manage_public/extranet/889901"),
            Some(889901)
        );
        assert_eq!(
            native_id_from_url("https://x.gov/detail?requestId=42&lang=en"),
            Some(42)
        );
        assert_eq!(native_id_from_url("https://x.gov/detail/other"), None);
    }

    #[test]
    fn identity_is_deterministic_and_content_only() {
        let with_id = record("Roof Repair", "DOT", Some("https://x.gov/extranet/889901"));
        assert_eq!(with_id.identity.as_str(), "eid_889901");

        let a = record("Roof Repair", "DOT", Some("https://x.gov/detail/roof"));
        let b = record("Roof Repair", "DOT", Some("https://x.gov/detail/roof"));
        assert_eq!(a.identity, b.identity);
        assert!(a.identity.as_str().starts_with("hash_"));
        // hash_ plus 16 hex characters
        assert_eq!(a.identity.as_str().len(), "hash_".len() + 16);

        // administrative differences must not move the identity
        let mut c = draft("Roof Repair", "DOT", Some("https://x.gov/detail/roof"));
        c.fetched_at = run_time(9);
        c.validation_flags.push(ValidationFlag::InvalidPhone);
        assert_eq!(finalize_record(c).identity, a.identity);
    }

    #[test]
    fn index_reports_previously_registered_keys() {
        let mut index = IdentityIndex::new();
        assert!(!index.register(KeyKind::NativeId, "42".to_string()));
        assert!(index.register(KeyKind::NativeId, "42".to_string()));
        // kinds are independent sets
        assert!(!index.register(KeyKind::DetailUrl, "42".to_string()));
    }

    #[test]
    fn same_native_id_different_url_keeps_exactly_one() {
        let batch = vec![
            record("Roof Repair", "DOT", Some("https://x.gov/extranet/7?v=1")),
            record("Roof Repair (reposted)", "DOT", Some("https://x.gov/extranet/7?v=2")),
        ];
        let outcome = dedup_batch(batch);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.records[0].business.title, "Roof Repair");
    }

    #[test]
    fn same_composite_without_ids_keeps_exactly_one() {
        let mut a = draft("Janitorial Services", "DGS", None);
        a.business.summary = Some("long form".to_string());
        let b = draft("Janitorial Services", "DGS", None);

        let outcome = dedup_batch(vec![finalize_record(a), finalize_record(b)]);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.duplicates, 1);
    }

    #[test]
    fn new_record_is_inserted_with_equal_seen_timestamps() {
        let mut store = RecordStore::new();
        let engine = ReconciliationEngine::new(30);
        let batch = vec![record("Roof Repair", "DOT", Some("https://x.gov/extranet/1"))];

        let counts = engine.reconcile(&mut store, &batch, run_time(2));

        assert_eq!(counts, ReconcileCounts { new: 1, ..Default::default() });
        let persisted = store.get_active(&batch[0].identity).expect("inserted");
        assert_eq!(persisted.status, RecordStatus::New);
        assert_eq!(persisted.first_seen, persisted.last_seen);
        assert_eq!(store.log_entries().len(), 1);
        assert_eq!(store.log_entries()[0].status, RecordStatus::New);
    }

    #[test]
    fn rerunning_an_unchanged_batch_is_idempotent() {
        let mut store = RecordStore::new();
        let engine = ReconciliationEngine::new(30);
        let batch = vec![record("Roof Repair", "DOT", Some("https://x.gov/extranet/1"))];

        engine.reconcile(&mut store, &batch, run_time(2));

        // second pass differs only in administrative fields
        let mut rerun = batch.clone();
        rerun[0].fetched_at = run_time(3);
        rerun[0].quality_score = 99;
        let counts = engine.reconcile(&mut store, &rerun, run_time(3));

        assert_eq!(counts.updated, 0);
        assert_eq!(counts.unchanged, 1);
        let persisted = store.get_active(&batch[0].identity).expect("still active");
        assert_eq!(persisted.status, RecordStatus::Unchanged);
        assert!(persisted.first_seen <= persisted.last_seen);
        assert_eq!(persisted.last_seen, run_time(3));
    }

    #[test]
    fn changed_business_field_yields_updated_with_field_list() {
        let mut store = RecordStore::new();
        let engine = ReconciliationEngine::new(30);
        let batch = vec![record("Roof Repair", "DOT", Some("https://x.gov/extranet/1"))];
        engine.reconcile(&mut store, &batch, run_time(2));

        let mut changed = batch.clone();
        changed[0].business.agency = Some("DGS".to_string());
        let counts = engine.reconcile(&mut store, &changed, run_time(3));

        assert_eq!(counts.updated, 1);
        let persisted = store.get_active(&batch[0].identity).expect("active");
        assert_eq!(persisted.status, RecordStatus::Updated);
        assert_eq!(persisted.business.agency.as_deref(), Some("DGS"));
        assert_eq!(persisted.first_seen, run_time(2));
        assert!(persisted.first_seen <= persisted.last_seen);

        let last = store.log_entries().last().expect("log entry");
        assert_eq!(last.status, RecordStatus::Updated);
        assert_eq!(last.changed_fields, vec!["agency".to_string()]);
    }

    #[test]
    fn absence_beyond_threshold_archives_exactly_once() {
        let mut store = RecordStore::new();
        let engine = ReconciliationEngine::new(30);
        let batch = vec![record("Roof Repair", "DOT", Some("https://x.gov/extranet/1"))];
        engine.reconcile(&mut store, &batch, run_time(1));

        // absent but within threshold: no transition
        let counts = engine.reconcile(&mut store, &[], run_time(5));
        assert_eq!(counts.stale_archived, 0);
        assert_eq!(store.active_len(), 1);
        assert_eq!(store.log_entries().len(), 1);

        // threshold + 1 days later
        let later = run_time(1) + chrono::Duration::days(31);
        let counts = engine.reconcile(&mut store, &[], later);
        assert_eq!(counts.stale_archived, 1);
        assert_eq!(store.active_len(), 0);
        assert_eq!(store.archive_len(), 1);
        let archived = store.get_archived(&batch[0].identity).expect("archived");
        assert_eq!(archived.status, RecordStatus::Stale);

        // a further empty run must not archive again
        let counts = engine.reconcile(&mut store, &[], later + chrono::Duration::days(1));
        assert_eq!(counts.stale_archived, 0);
        assert_eq!(store.archive_len(), 1);
    }

    #[test]
    fn truncated_batch_never_feeds_the_staleness_sweep() {
        let mut store = RecordStore::new();
        let engine = ReconciliationEngine::new(30);
        let batch = vec![record("Roof Repair", "DOT", Some("https://x.gov/extranet/1"))];
        engine.reconcile(&mut store, &batch, run_time(1));

        // well past the threshold, but applied without the sweep
        let counts = engine.apply_batch(&mut store, &[], run_time(1) + chrono::Duration::days(90));

        assert_eq!(counts.stale_archived, 0);
        assert_eq!(store.active_len(), 1);
        assert_eq!(store.archive_len(), 0);
    }

    #[tokio::test]
    async fn failed_crawl_surfaces_error_and_skips_archival() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.json");

        // seed a record old enough that a sweep would archive it
        let mut store = RecordStore::new();
        let engine = ReconciliationEngine::new(30);
        let seeded = record("Roof Repair", "DOT", Some("https://x.gov/extranet/1"));
        engine.reconcile(&mut store, &[seeded.clone()], Utc::now() - chrono::Duration::days(90));
        store.save(&path).await.expect("save");

        let config = RunConfig {
            // discard port, connection refused immediately
            entry_url: "http://127.0.0.1:9/catalog".to_string(),
            base_delay: Duration::ZERO,
            max_retries: 0,
            fetch_details: false,
            staleness_days: 30,
            store_path: path.clone(),
            ..Default::default()
        };

        let err = Pipeline::new(config)
            .run()
            .await
            .expect_err("retry exhaustion must surface");
        let run_err = err.downcast_ref::<RunError>().expect("typed run error");
        assert_eq!(run_err.summary.pages_crawled, 0);
        assert_eq!(run_err.summary.stale_archived, 0);

        let reloaded = RecordStore::load(&path).await.expect("load");
        assert_eq!(reloaded.active_len(), 1);
        assert_eq!(reloaded.archive_len(), 0);
    }

    #[test]
    fn skip_details_env_accepts_numeric_truthy() {
        std::env::set_var("OPPTRACK_SKIP_DETAILS", "1");
        let config = RunConfig::from_env();
        std::env::remove_var("OPPTRACK_SKIP_DETAILS");
        assert!(!config.fetch_details);
    }

    #[test]
    fn manual_archive_moves_only_old_records() {
        let mut store = RecordStore::new();
        let engine = ReconciliationEngine::new(90);
        let old = record("Roof Repair", "DOT", Some("https://x.gov/extranet/1"));
        let fresh = record("Bridge Inspection", "SHA", Some("https://x.gov/extranet/2"));
        engine.reconcile(&mut store, &[old.clone()], run_time(1));
        engine.reconcile(&mut store, &[fresh.clone()], run_time(28));

        let archived = archive_older_than(&mut store, 7, run_time(29));

        assert_eq!(archived, 1);
        assert!(store.get_archived(&old.identity).is_some());
        assert!(store.get_active(&fresh.identity).is_some());
    }

    #[test]
    fn target_date_filter_keeps_only_the_requested_day() {
        let run_at = run_time(10);
        let mut same_day = draft("A", "DOT", None);
        same_day.business.publish_at = Some(run_at - chrono::Duration::days(2));
        let mut other_day = draft("B", "DOT", None);
        other_day.business.publish_at = Some(run_at - chrono::Duration::days(3));
        let mut unparsed = draft("C", "DOT", None);
        unparsed.business.publish_at = None;

        let kept = filter_by_target_date(
            vec![same_day.clone(), other_day, unparsed],
            Some(2),
            run_at,
        );
        assert_eq!(kept, vec![same_day]);

        // no offset configured: everything passes through
        let all = filter_by_target_date(vec![draft("A", "DOT", None)], None, run_at);
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn default_config_has_safe_crawl_limits() {
        let config = RunConfig::default();
        assert_eq!(config.max_pages, 50);
        assert!(config.fetch_details);
        assert_eq!(config.staleness_days, 30);
        assert!(config.detail_workers >= 1);
    }
}
