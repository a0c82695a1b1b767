//! Listing crawler (postback-driven pagination) and detail enricher.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use opptrack_core::{BusinessFields, RawListingRow, RecordDraft, ValidationFlag};
use opptrack_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "opptrack-crawl";

static TR_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("static selector"));
static TH_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("th").expect("static selector"));
static TD_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("static selector"));
static CELL_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("th, td").expect("static selector"));
static A_HREF_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("static selector"));
static DL_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("dl").expect("static selector"));
static DT_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("dt").expect("static selector"));
static DD_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("dd").expect("static selector"));
static TEXT_BLOCK_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div, span, p").expect("static selector"));
static TABLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("table").expect("static selector"));

/// Ordered list of table shapes the catalog has been observed to render.
const RESULT_TABLE_SELECTORS: &[&str] = &[
    "table.iv-grid-view",
    "table.grid",
    "table#results",
    "table",
];

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(text: String) -> Option<String> {
    let collapsed = collapse_whitespace(&text);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

/// Hidden state tokens the site requires to be replayed on every
/// same-page paging request.
const PAGINATION_TOKEN_NAMES: &[&str] = &[
    "__VIEWSTATE",
    "__EVENTVALIDATION",
    "__VIEWSTATEGENERATOR",
    "__EVENTTARGET",
    "__EVENTARGUMENT",
];

/// Opaque token bundle scoped to one crawl; discarded afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaginationState {
    pub tokens: Vec<(String, String)>,
}

impl PaginationState {
    pub fn from_document(doc: &Html) -> Self {
        let mut tokens = Vec::new();
        for name in PAGINATION_TOKEN_NAMES {
            let Ok(selector) = Selector::parse(&format!("input[name=\"{name}\"]")) else {
                continue;
            };
            if let Some(value) = doc
                .select(&selector)
                .next()
                .and_then(|el| el.value().attr("value"))
            {
                tokens.push((name.to_string(), value.to_string()));
            }
        }
        Self { tokens }
    }

    /// Synthesize the navigation form: replayed tokens plus the target
    /// control id and argument discovered from the "next" control.
    pub fn into_form(self, target: &str, argument: &str) -> Vec<(String, String)> {
        let mut form: Vec<(String, String)> = self
            .tokens
            .into_iter()
            .filter(|(name, _)| name != "__EVENTTARGET" && name != "__EVENTARGUMENT")
            .collect();
        form.push(("__EVENTTARGET".to_string(), target.to_string()));
        form.push(("__EVENTARGUMENT".to_string(), argument.to_string()));
        form
    }
}

static POSTBACK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__doPostBack\('([^']*)','([^']*)'\)").expect("static regex"));

const NEXT_LABELS: &[&str] = &["next", ">", ">>", "next page"];

/// Locate the postback (target, argument) pair for the next page: an explicit
/// "next" control first, otherwise the highest numbered pager link.
pub fn find_next_postback(doc: &Html) -> Option<(String, String)> {
    let mut numeric_candidates: Vec<(u32, String, String)> = Vec::new();

    for link in doc.select(&A_HREF_SEL) {
        let href = link.value().attr("href").unwrap_or_default();
        let Some(caps) = POSTBACK_RE.captures(href) else {
            continue;
        };
        let target = caps[1].to_string();
        let argument = caps[2].to_string();
        let label = element_text(link).to_ascii_lowercase();

        if NEXT_LABELS.contains(&label.as_str()) {
            return Some((target, argument));
        }
        if let Ok(page_no) = label.parse::<u32>() {
            numeric_candidates.push((page_no, target, argument));
        }
    }

    numeric_candidates
        .into_iter()
        .max_by_key(|(page_no, _, _)| *page_no)
        .map(|(_, target, argument)| (target, argument))
}

const TITLE_ALIASES: &[&str] = &[
    "title",
    "solicitation title",
    "project title",
    "opportunity",
    "description",
    "project",
    "name",
    "subject",
];
const SOLICITATION_ID_ALIASES: &[&str] = &[
    "solicitation id",
    "solicitation #",
    "solicitation number",
    "reference #",
    "document number",
    "rfp number",
    "bid number",
    "tracking number",
    "id",
];
const CATEGORY_ALIASES: &[&str] = &[
    "category",
    "procurement category",
    "commodity",
    "classification",
];
const METHOD_ALIASES: &[&str] = &[
    "procurement method",
    "method",
    "contract type",
    "procurement type",
    "bid type",
    "solicitation type",
];
const AGENCY_ALIASES: &[&str] = &[
    "agency",
    "issuing agency",
    "department",
    "agency/department",
    "organization",
    "issuing department",
];
const PUBLISH_ALIASES: &[&str] = &[
    "publish date",
    "posting date",
    "posted",
    "issue date",
    "published",
    "date posted",
    "release date",
];
const DUE_ALIASES: &[&str] = &[
    "due date",
    "bid due date",
    "proposal due date",
    "response due date",
    "closing date",
    "deadline",
    "due",
    "closes",
];

/// Header-label to column-index mapping, resilient to column reordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnMap {
    pub title: Option<usize>,
    pub solicitation_id: Option<usize>,
    pub category: Option<usize>,
    pub procurement_method: Option<usize>,
    pub agency: Option<usize>,
    pub publish: Option<usize>,
    pub due: Option<usize>,
}

fn match_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    // exact match first, substring second
    for (idx, header) in headers.iter().enumerate() {
        if aliases.contains(&header.as_str()) {
            return Some(idx);
        }
    }
    headers
        .iter()
        .position(|header| aliases.iter().any(|alias| header.contains(alias)))
}

pub fn build_column_map(headers: &[String]) -> ColumnMap {
    let lowered: Vec<String> = headers.iter().map(|h| h.to_ascii_lowercase()).collect();
    ColumnMap {
        title: match_column(&lowered, TITLE_ALIASES),
        solicitation_id: match_column(&lowered, SOLICITATION_ID_ALIASES),
        category: match_column(&lowered, CATEGORY_ALIASES),
        procurement_method: match_column(&lowered, METHOD_ALIASES),
        agency: match_column(&lowered, AGENCY_ALIASES),
        publish: match_column(&lowered, PUBLISH_ALIASES),
        due: match_column(&lowered, DUE_ALIASES),
    }
}

fn find_result_table(doc: &Html) -> Option<ElementRef<'_>> {
    RESULT_TABLE_SELECTORS.iter().find_map(|raw| {
        let selector = Selector::parse(raw).ok()?;
        doc.select(&selector).next()
    })
}

fn cell_text(cells: &[ElementRef<'_>], idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| cells.get(i)).map(|c| element_text(*c)).and_then(text_or_none)
}

/// Extract raw listing rows from one catalog page. Column positions come
/// from header-label matching, never fixed offsets.
pub fn extract_rows(doc: &Html, base: &Url) -> Vec<RawListingRow> {
    let Some(table) = find_result_table(doc) else {
        warn!("no results table found on page");
        return Vec::new();
    };

    let all_rows: Vec<ElementRef<'_>> = table.select(&TR_SEL).collect();
    let header_pos = all_rows
        .iter()
        .position(|row| row.select(&TH_SEL).next().is_some());

    let headers: Vec<String> = header_pos
        .map(|pos| {
            all_rows[pos]
                .select(&CELL_SEL)
                .map(element_text)
                .collect()
        })
        .unwrap_or_default();
    let columns = build_column_map(&headers);

    let mut rows = Vec::new();
    for (idx, row) in all_rows.iter().enumerate() {
        if Some(idx) == header_pos {
            continue;
        }
        let cells: Vec<ElementRef<'_>> = row.select(&TD_SEL).collect();
        if cells.is_empty() {
            continue;
        }

        let title_idx = columns.title.unwrap_or(0);
        let title_cell = cells.get(title_idx).copied();
        let link = title_cell.and_then(|cell| cell.select(&A_HREF_SEL).next());

        let title = link
            .map(element_text)
            .or_else(|| title_cell.map(element_text))
            .unwrap_or_default();
        let detail_url = link
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| base.join(href).ok())
            .map(|u| u.to_string());

        rows.push(RawListingRow {
            title,
            detail_url,
            solicitation_id: cell_text(&cells, columns.solicitation_id),
            category: cell_text(&cells, columns.category),
            procurement_method: cell_text(&cells, columns.procurement_method),
            agency: cell_text(&cells, columns.agency),
            publish_text: cell_text(&cells, columns.publish),
            due_text: cell_text(&cells, columns.due),
        });
    }
    rows
}

/// Digest over the identifying content of the rows parsed from one page.
/// A repeat of the previous page's fingerprint means the pager is looping.
pub fn page_fingerprint(rows: &[RawListingRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(row.title.as_bytes());
        hasher.update(b"|");
        hasher.update(row.detail_url.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(row.agency.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(row.publish_text.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    NoNextControl,
    FingerprintRepeat,
    PageLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextPageRequest {
    pub form: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageDirective {
    Continue(NextPageRequest),
    Done(DoneReason),
}

/// How a crawl ended. Fetch failures carry partial-result semantics: the
/// rows gathered before the failure are always returned alongside.
#[derive(Debug)]
pub enum CrawlTermination {
    NoNextControl,
    FingerprintRepeat,
    PageLimit,
    FetchFailed(FetchError),
}

impl From<DoneReason> for CrawlTermination {
    fn from(reason: DoneReason) -> Self {
        match reason {
            DoneReason::NoNextControl => CrawlTermination::NoNextControl,
            DoneReason::FingerprintRepeat => CrawlTermination::FingerprintRepeat,
            DoneReason::PageLimit => CrawlTermination::PageLimit,
        }
    }
}

#[derive(Debug)]
pub struct CrawlOutcome {
    pub rows: Vec<RawListingRow>,
    pub pages_fetched: usize,
    pub termination: CrawlTermination,
}

/// Pure pagination state machine: ingest one page of HTML, get back either
/// the synthesized next-page request or a stop reason. The crawler drives it
/// against the network; tests drive it against fixture strings.
#[derive(Debug)]
pub struct CrawlSession {
    base: Url,
    max_pages: usize,
    pages_ingested: usize,
    last_fingerprint: Option<String>,
    rows: Vec<RawListingRow>,
}

impl CrawlSession {
    pub fn new(base: Url, max_pages: usize) -> Self {
        Self {
            base,
            max_pages: max_pages.max(1),
            pages_ingested: 0,
            last_fingerprint: None,
            rows: Vec::new(),
        }
    }

    pub fn pages_ingested(&self) -> usize {
        self.pages_ingested
    }

    pub fn rows(&self) -> &[RawListingRow] {
        &self.rows
    }

    pub fn ingest_page(&mut self, html: &str) -> PageDirective {
        let doc = Html::parse_document(html);
        let page_rows = extract_rows(&doc, &self.base);

        let fingerprint = page_fingerprint(&page_rows);
        if self.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            // the page was still fetched and parsed, so it counts
            self.pages_ingested += 1;
            info!(
                page = self.pages_ingested,
                "page fingerprint repeated, pagination exhausted"
            );
            return PageDirective::Done(DoneReason::FingerprintRepeat);
        }
        self.last_fingerprint = Some(fingerprint);

        self.pages_ingested += 1;
        info!(
            page = self.pages_ingested,
            rows = page_rows.len(),
            "parsed catalog page"
        );
        self.rows.extend(page_rows);

        if self.pages_ingested >= self.max_pages {
            info!(max_pages = self.max_pages, "reached page limit");
            return PageDirective::Done(DoneReason::PageLimit);
        }

        let Some((target, argument)) = find_next_postback(&doc) else {
            return PageDirective::Done(DoneReason::NoNextControl);
        };

        let state = PaginationState::from_document(&doc);
        PageDirective::Continue(NextPageRequest {
            form: state.into_form(&target, &argument),
        })
    }

    fn finish(self, termination: CrawlTermination) -> CrawlOutcome {
        CrawlOutcome {
            rows: self.rows,
            pages_fetched: self.pages_ingested,
            termination,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub entry_url: String,
    pub max_pages: usize,
}

/// Drives the crawl session over the network. Pagination is strictly
/// sequential: each next-page request replays tokens from the previous
/// response.
pub struct ListingCrawler {
    fetcher: Arc<HttpFetcher>,
    config: CrawlConfig,
}

impl ListingCrawler {
    pub fn new(fetcher: Arc<HttpFetcher>, config: CrawlConfig) -> Self {
        Self { fetcher, config }
    }

    pub async fn crawl(&self) -> anyhow::Result<CrawlOutcome> {
        let base = Url::parse(&self.config.entry_url)?;
        let mut session = CrawlSession::new(base, self.config.max_pages);

        let mut response = match self.fetcher.get(&self.config.entry_url).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "entry page fetch failed");
                return Ok(session.finish(CrawlTermination::FetchFailed(err)));
            }
        };

        loop {
            match session.ingest_page(&response.body) {
                PageDirective::Done(reason) => {
                    return Ok(session.finish(reason.into()));
                }
                PageDirective::Continue(request) => {
                    match self
                        .fetcher
                        .post_form(&self.config.entry_url, &request.form)
                        .await
                    {
                        Ok(next) => response = next,
                        Err(err) => {
                            warn!(error = %err, "next page fetch failed, returning partial rows");
                            return Ok(session.finish(CrawlTermination::FetchFailed(err)));
                        }
                    }
                }
            }
        }
    }
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("static regex")
});
static EMAIL_SCAN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex")
});
static PHONE_SCAN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").expect("static regex")
});
static MONEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\$\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s*(million|billion|m|b)?\b")
        .expect("static regex")
});
static MONEY_WORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([0-9][0-9,]*(?:\.[0-9]+)?)\s*(million|billion)?\s*(?:dollars|usd)\b")
        .expect("static regex")
});
static DATE_SCAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{1,2}/\d{1,2}/\d{4}|\d{4}-\d{2}-\d{2}").expect("static regex"));
static LABEL_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:]{1,60}):\s*(.+)$").expect("static regex"));

/// Accepted timestamp renderings, most specific first; the first successful
/// parse wins.
const DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%Y-%m-%d %H:%M:%S",
    "%m-%d-%Y %I:%M:%S %p",
    "%m-%d-%Y %I:%M %p",
    "%d/%m/%Y %H:%M:%S",
];
const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%m-%d-%Y"];

pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let cleaned = collapse_whitespace(text);
    if cleaned.is_empty() {
        return None;
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, fmt) {
            return Some(dt.and_utc());
        }
        debug!(input = %cleaned, format = fmt, "datetime format did not match");
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
        debug!(input = %cleaned, format = fmt, "date format did not match");
    }
    debug!(input = %cleaned, "no accepted date format matched");
    None
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let candidate = raw.trim().to_ascii_lowercase();
    if EMAIL_RE.is_match(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

/// Reduce to digits, then render one canonical format. Ten digits or
/// eleven with a leading 1 are accepted.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        10 => Some(format!(
            "({}) {}-{}",
            &digits[..3],
            &digits[3..6],
            &digits[6..]
        )),
        11 if digits.starts_with('1') => Some(format!(
            "+1 ({}) {}-{}",
            &digits[1..4],
            &digits[4..7],
            &digits[7..]
        )),
        _ => None,
    }
}

fn money_multiplier(word: &str) -> f64 {
    match word.to_ascii_lowercase().as_str() {
        "million" | "m" => 1_000_000.0,
        "billion" | "b" => 1_000_000_000.0,
        _ => 1.0,
    }
}

/// Parse a monetary estimate out of free text, honoring million/billion
/// multipliers.
pub fn parse_money(text: &str) -> Option<f64> {
    let caps = MONEY_RE
        .captures(text)
        .or_else(|| MONEY_WORD_RE.captures(text))?;
    let number: f64 = caps[1].replace(',', "").parse().ok()?;
    let multiplier = caps
        .get(2)
        .map(|m| money_multiplier(m.as_str()))
        .unwrap_or(1.0);
    Some(number * multiplier)
}

/// Per-field merge policy applied across extraction strategies and repeated
/// attempts: a populated value is never replaced by an empty one; a
/// validator-passing candidate beats a failing incumbent; among two passing
/// (or two failing) values the longer wins.
pub fn merge_field(
    existing: Option<&str>,
    candidate: Option<&str>,
    validator: fn(&str) -> bool,
) -> Option<String> {
    let candidate = candidate.map(str::trim).filter(|c| !c.is_empty());
    let existing = existing.map(str::trim).filter(|e| !e.is_empty());

    match (existing, candidate) {
        (None, None) => None,
        (Some(e), None) => Some(e.to_string()),
        (None, Some(c)) => Some(c.to_string()),
        (Some(e), Some(c)) => {
            let chosen = match (validator(e), validator(c)) {
                (true, false) => e,
                (false, true) => c,
                _ => {
                    if c.len() > e.len() {
                        c
                    } else {
                        e
                    }
                }
            };
            Some(chosen.to_string())
        }
    }
}

pub fn any_text(_: &str) -> bool {
    true
}

pub fn is_email_shaped(value: &str) -> bool {
    EMAIL_RE.is_match(&value.trim().to_ascii_lowercase())
}

pub fn is_phone_shaped(value: &str) -> bool {
    normalize_phone(value).is_some()
}

pub fn is_parseable_date(value: &str) -> bool {
    parse_datetime(value).is_some()
}

pub fn is_money_shaped(value: &str) -> bool {
    parse_money(value).is_some()
}

const SUMMARY_LABELS: &[&str] = &[
    "summary",
    "description",
    "project description",
    "scope",
    "overview",
    "details",
];
const OFFICER_LABELS: &[&str] = &[
    "procurement officer",
    "buyer",
    "contact person",
    "procurement contact",
    "issuing officer",
];
const EMAIL_LABELS: &[&str] = &["email", "e-mail"];
const PHONE_LABELS: &[&str] = &["phone", "telephone", "tel"];
const INSTRUCTIONS_LABELS: &[&str] = &[
    "instruction",
    "guideline",
    "submission",
    "special instruction",
    "how to",
];
const GOALS_LABELS: &[&str] = &[
    "goal",
    "participation",
    "mbe",
    "dbe",
    "sbe",
    "wbe",
    "small business",
    "diversity",
];
const DUE_LABELS: &[&str] = &[
    "due date",
    "bid due date",
    "proposal due date",
    "response due date",
    "closing date",
    "closing time",
    "deadline",
];
const SOLICITATION_LABELS: &[&str] = &[
    "solicitation id",
    "solicitation #",
    "solicitation number",
    "rfp #",
    "bid #",
    "reference #",
];
const VALUE_LABELS: &[&str] = &["estimated value", "contract value", "value", "amount"];

const ATTACHMENT_EXTENSIONS: &[&str] = &[".pdf", ".doc", ".docx", ".xls", ".xlsx", ".zip"];
const DUE_KEYWORDS: &[&str] = &["due", "deadline", "close", "submit"];

/// Candidate values harvested from one detail page, before they are merged
/// into the record's business fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailFields {
    pub summary: Option<String>,
    pub buyer_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub submission_instructions: Option<String>,
    pub program_goals: Option<String>,
    pub estimated_value_text: Option<String>,
    pub due_text: Option<String>,
    pub solicitation_id: Option<String>,
    pub attachment_names: Vec<String>,
}

fn label_matches(label: &str, aliases: &[&str]) -> bool {
    aliases.iter().any(|alias| label.contains(alias))
}

fn apply_labeled_value(fields: &mut DetailFields, label: &str, value: &str) {
    let label = label.to_ascii_lowercase();
    let value = Some(value);

    // due checked before summary so "response due date" is not eaten by a
    // broader alias; email/phone get their shape validators
    if label_matches(&label, DUE_LABELS) {
        fields.due_text = merge_field(fields.due_text.as_deref(), value, is_parseable_date);
    } else if label_matches(&label, EMAIL_LABELS) {
        fields.contact_email =
            merge_field(fields.contact_email.as_deref(), value, is_email_shaped);
    } else if label_matches(&label, PHONE_LABELS) {
        fields.contact_phone =
            merge_field(fields.contact_phone.as_deref(), value, is_phone_shaped);
    } else if label_matches(&label, SOLICITATION_LABELS) {
        fields.solicitation_id = merge_field(fields.solicitation_id.as_deref(), value, any_text);
    } else if label_matches(&label, OFFICER_LABELS) {
        fields.buyer_name = merge_field(fields.buyer_name.as_deref(), value, any_text);
    } else if label_matches(&label, INSTRUCTIONS_LABELS) {
        fields.submission_instructions = merge_field(
            fields.submission_instructions.as_deref(),
            value,
            any_text,
        );
    } else if label_matches(&label, GOALS_LABELS) {
        fields.program_goals = merge_field(fields.program_goals.as_deref(), value, any_text);
    } else if label_matches(&label, VALUE_LABELS) {
        fields.estimated_value_text = merge_field(
            fields.estimated_value_text.as_deref(),
            value,
            is_money_shaped,
        );
    } else if label_matches(&label, SUMMARY_LABELS) {
        fields.summary = merge_field(fields.summary.as_deref(), value, any_text);
    }
}

fn extract_from_tables(doc: &Html, fields: &mut DetailFields) {
    for table in doc.select(&TABLE_SEL) {
        for row in table.select(&TR_SEL) {
            let cells: Vec<ElementRef<'_>> = row.select(&CELL_SEL).collect();
            if cells.len() < 2 {
                continue;
            }
            let label = element_text(cells[0]);
            let value = element_text(cells[1]);
            if !label.is_empty() && !value.is_empty() {
                apply_labeled_value(fields, &label, &value);
            }
        }
    }
}

fn extract_from_label_blocks(doc: &Html, fields: &mut DetailFields) {
    for dl in doc.select(&DL_SEL) {
        let terms: Vec<String> = dl.select(&DT_SEL).map(element_text).collect();
        let values: Vec<String> = dl.select(&DD_SEL).map(element_text).collect();
        for (label, value) in terms.iter().zip(values.iter()) {
            if !label.is_empty() && !value.is_empty() {
                apply_labeled_value(fields, label, value);
            }
        }
    }

    for block in doc.select(&TEXT_BLOCK_SEL) {
        let text = element_text(block);
        if let Some(caps) = LABEL_VALUE_RE.captures(&text) {
            let label = collapse_whitespace(&caps[1]);
            let value = collapse_whitespace(&caps[2]);
            if !label.is_empty() && !value.is_empty() {
                apply_labeled_value(fields, &label, &value);
            }
        }
    }
}

fn extract_from_patterns(doc: &Html, fields: &mut DetailFields) {
    let full_text = doc.root_element().text().collect::<String>();

    if fields.contact_email.is_none() {
        if let Some(m) = EMAIL_SCAN_RE.find(&full_text) {
            fields.contact_email = Some(m.as_str().to_string());
        }
    }
    if fields.contact_phone.is_none() {
        if let Some(m) = PHONE_SCAN_RE.find(&full_text) {
            fields.contact_phone = Some(m.as_str().to_string());
        }
    }
    if fields.estimated_value_text.is_none() {
        if let Some(m) = MONEY_RE
            .find(&full_text)
            .or_else(|| MONEY_WORD_RE.find(&full_text))
        {
            fields.estimated_value_text = Some(m.as_str().to_string());
        }
    }
    if fields.due_text.is_none() {
        for m in DATE_SCAN_RE.find_iter(&full_text) {
            let mut window_start = m.start().saturating_sub(50);
            while !full_text.is_char_boundary(window_start) {
                window_start -= 1;
            }
            let window = full_text[window_start..m.start()].to_ascii_lowercase();
            if DUE_KEYWORDS.iter().any(|kw| window.contains(kw)) {
                fields.due_text = Some(m.as_str().to_string());
                break;
            }
        }
    }
}

fn extract_attachments(doc: &Html, base: &Url, fields: &mut DetailFields) {
    for link in doc.select(&A_HREF_SEL) {
        let href = link.value().attr("href").unwrap_or_default();
        let lowered = href.to_ascii_lowercase();
        if !ATTACHMENT_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext)) {
            continue;
        }
        // keep the filename even when the link text is empty
        let name = text_or_none(element_text(link).to_string())
            .or_else(|| {
                base.join(href)
                    .ok()
                    .and_then(|u| u.path_segments()?.last().map(str::to_string))
            })
            .unwrap_or_else(|| href.to_string());
        if !fields.attachment_names.contains(&name) {
            fields.attachment_names.push(name);
        }
    }
}

/// Run the three extraction strategies in order over one detail page:
/// labeled tables, label/value blocks, then whole-page pattern scanning.
pub fn extract_detail_fields(html: &str, base: &Url) -> DetailFields {
    let doc = Html::parse_document(html);
    let mut fields = DetailFields::default();

    extract_from_tables(&doc, &mut fields);
    extract_from_label_blocks(&doc, &mut fields);
    extract_from_patterns(&doc, &mut fields);
    extract_attachments(&doc, base, &mut fields);

    fields
}

/// Merge detail-page candidates into the business fields, recording per-field
/// problems as validation flags rather than failing the record.
pub fn merge_detail_into(
    business: &mut BusinessFields,
    flags: &mut Vec<ValidationFlag>,
    detail: &DetailFields,
) {
    business.summary = merge_field(business.summary.as_deref(), detail.summary.as_deref(), any_text);
    business.buyer_name = merge_field(
        business.buyer_name.as_deref(),
        detail.buyer_name.as_deref(),
        any_text,
    );
    business.submission_instructions = merge_field(
        business.submission_instructions.as_deref(),
        detail.submission_instructions.as_deref(),
        any_text,
    );
    business.program_goals = merge_field(
        business.program_goals.as_deref(),
        detail.program_goals.as_deref(),
        any_text,
    );
    business.solicitation_id = merge_field(
        business.solicitation_id.as_deref(),
        detail.solicitation_id.as_deref(),
        any_text,
    );

    if let Some(raw) = detail.contact_email.as_deref() {
        match normalize_email(raw) {
            Some(email) => {
                business.contact_email = merge_field(
                    business.contact_email.as_deref(),
                    Some(email.as_str()),
                    is_email_shaped,
                );
            }
            None => flags.push(ValidationFlag::InvalidEmail),
        }
    }

    if let Some(raw) = detail.contact_phone.as_deref() {
        match normalize_phone(raw) {
            Some(phone) => {
                business.contact_phone = merge_field(
                    business.contact_phone.as_deref(),
                    Some(phone.as_str()),
                    is_phone_shaped,
                );
            }
            None => flags.push(ValidationFlag::InvalidPhone),
        }
    }

    if business.estimated_value.is_none() {
        business.estimated_value = detail
            .estimated_value_text
            .as_deref()
            .and_then(parse_money);
    }

    if business.due_at.is_none() {
        if let Some(due_text) = detail.due_text.as_deref() {
            match parse_datetime(due_text) {
                Some(due) => business.due_at = Some(due),
                None => flags.push(ValidationFlag::UnparsedDueDate),
            }
        }
    }

    if !detail.attachment_names.is_empty() {
        business.attachment_count = detail.attachment_names.len() as u32;
        business.attachment_names = detail.attachment_names.clone();
    }
}

/// Per-record detail fetch + multi-strategy extraction. Failures downgrade
/// the record to listing-only fields; they never fail the batch.
#[derive(Clone)]
pub struct DetailEnricher {
    fetcher: Arc<HttpFetcher>,
    fetch_details: bool,
}

impl DetailEnricher {
    pub fn new(fetcher: Arc<HttpFetcher>, fetch_details: bool) -> Self {
        Self {
            fetcher,
            fetch_details,
        }
    }

    /// Listing-only draft: normalized row fields, no detail fetch.
    pub fn draft_from_listing(&self, row: &RawListingRow, fetched_at: DateTime<Utc>) -> RecordDraft {
        let mut flags = Vec::new();

        let publish_at = match row.publish_text.as_deref() {
            Some(text) => {
                let parsed = parse_datetime(text);
                if parsed.is_none() {
                    flags.push(ValidationFlag::UnparsedPublishDate);
                }
                parsed
            }
            None => None,
        };
        let due_at = match row.due_text.as_deref() {
            Some(text) => {
                let parsed = parse_datetime(text);
                if parsed.is_none() {
                    flags.push(ValidationFlag::UnparsedDueDate);
                }
                parsed
            }
            None => None,
        };

        let business = BusinessFields {
            title: collapse_whitespace(&row.title),
            agency: row.agency.as_deref().map(collapse_whitespace).and_then(|s| text_or_none(s)),
            category: row.category.as_deref().map(collapse_whitespace).and_then(|s| text_or_none(s)),
            procurement_method: row
                .procurement_method
                .as_deref()
                .map(collapse_whitespace)
                .and_then(|s| text_or_none(s)),
            solicitation_id: row
                .solicitation_id
                .as_deref()
                .map(collapse_whitespace)
                .and_then(|s| text_or_none(s)),
            detail_url: row.detail_url.clone(),
            publish_at,
            due_at,
            ..Default::default()
        };

        RecordDraft {
            business,
            validation_flags: flags,
            fetched_at,
        }
    }

    /// Full enrichment: listing fields plus detail-page extraction. A failed
    /// detail fetch returns the listing-only draft with an incomplete
    /// enrichment flag.
    pub async fn enrich(&self, row: &RawListingRow, fetched_at: DateTime<Utc>) -> RecordDraft {
        let mut draft = self.draft_from_listing(row, fetched_at);

        if !self.fetch_details {
            return draft;
        }

        let Some(detail_url) = row.detail_url.as_deref() else {
            draft.validation_flags.push(ValidationFlag::MissingDetailUrl);
            return draft;
        };

        let Ok(base) = Url::parse(detail_url) else {
            draft.validation_flags.push(ValidationFlag::MissingDetailUrl);
            return draft;
        };

        match self.fetcher.get(detail_url).await {
            Ok(response) => {
                let detail = extract_detail_fields(&response.body, &base);
                merge_detail_into(&mut draft.business, &mut draft.validation_flags, &detail);
            }
            Err(err) => {
                warn!(url = detail_url, error = %err, "detail fetch failed, keeping listing-only fields");
                draft
                    .validation_flags
                    .push(ValidationFlag::IncompleteEnrichment);
            }
        }

        draft
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LISTING_PAGE: &str = r#"
    <html><body>
      <form>
        <input type="hidden" name="__VIEWSTATE" value="vs-token" />
        <input type="hidden" name="__EVENTVALIDATION" value="ev-token" />
        <input type="hidden" name="__VIEWSTATEGENERATOR" value="gen" />
      </form>
      <table class="iv-grid-view">
        <thead>
          <tr><th>Title</th><th>Category</th><th>Procurement Method</th><th>Agency</th><th>Publish Date</th><th>Due Date</th></tr>
        </thead>
        <tbody>
          <tr>
            <td><a href="/page.aspx/en/rfp/request_manage_public/extranet/889901">Roof Repair</a></td>
            <td>Construction</td>
            <td>RFP</td>
            <td>DOT</td>
            <td>10/01/2025 09:00:00 AM</td>
            <td>11/05/2025</td>
          </tr>
          <tr>
            <td><a href="/page.aspx/en/rfp/request_manage_public/extranet/889902">Bridge Inspection</a></td>
            <td>Engineering</td>
            <td>IFB</td>
            <td>SHA</td>
            <td>10/01/2025 10:30:00 AM</td>
            <td>11/12/2025</td>
          </tr>
        </tbody>
      </table>
      <a href="javascript:__doPostBack('grid$pager','Page$2')">Next</a>
    </body></html>
    "#;

    const REORDERED_PAGE: &str = r#"
    <html><body>
      <table>
        <tr><th>Agency</th><th>Publish Date</th><th>Solicitation Title</th></tr>
        <tr>
          <td>DGS</td>
          <td>10/02/2025</td>
          <td><a href="https://example.gov/extranet/42">Janitorial Services</a></td>
        </tr>
      </table>
    </body></html>
    "#;

    const DETAIL_PAGE: &str = r#"
    <html><body>
      <table>
        <tr><th>Summary</th><td>Replace the roof membrane on building A.</td></tr>
        <tr><th>Procurement Officer</th><td>Jane Smith</td></tr>
        <tr><th>Response Due Date</th><td>11/05/2025 02:00:00 PM</td></tr>
        <tr><th>Estimated Value</th><td>$2.5 million</td></tr>
      </table>
      <dl>
        <dt>Small Business Goals</dt><dd>MBE 25%</dd>
      </dl>
      <p>Phone: (410) 555-0123</p>
      <p>Questions to roofing.buyer@dot.state.md.us before the deadline.</p>
      <a href="/docs/rfp-889901-scope.pdf">Scope of Work</a>
      <a href="/docs/rfp-889901-forms.docx">Bid Forms</a>
    </body></html>
    "#;

    fn base() -> Url {
        Url::parse("https://procure.example.gov/page.aspx/en/rfp/request_browse_public").unwrap()
    }

    #[test]
    fn rows_are_extracted_with_absolute_urls() {
        let doc = Html::parse_document(LISTING_PAGE);
        let rows = extract_rows(&doc, &base());

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].title, "Roof Repair");
        assert_eq!(
            rows[0].detail_url.as_deref(),
            Some("https://procure.example.gov/page.aspx/en/rfp/request_manage_public/extranet/889901")
        );
        assert_eq!(rows[0].agency.as_deref(), Some("DOT"));
        assert_eq!(rows[0].publish_text.as_deref(), Some("10/01/2025 09:00:00 AM"));
        assert_eq!(rows[1].procurement_method.as_deref(), Some("IFB"));
    }

    #[test]
    fn extraction_is_deterministic_for_the_same_page() {
        let doc = Html::parse_document(LISTING_PAGE);
        let first = extract_rows(&doc, &base());
        let second = extract_rows(&doc, &base());
        assert_eq!(first, second);
        assert_eq!(page_fingerprint(&first), page_fingerprint(&second));
    }

    #[test]
    fn column_reordering_does_not_corrupt_fields() {
        let doc = Html::parse_document(REORDERED_PAGE);
        let rows = extract_rows(&doc, &base());

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Janitorial Services");
        assert_eq!(rows[0].agency.as_deref(), Some("DGS"));
        assert_eq!(rows[0].publish_text.as_deref(), Some("10/02/2025"));
    }

    #[test]
    fn pagination_tokens_and_next_control_are_discovered() {
        let doc = Html::parse_document(LISTING_PAGE);

        let state = PaginationState::from_document(&doc);
        assert!(state
            .tokens
            .contains(&("__VIEWSTATE".to_string(), "vs-token".to_string())));

        let (target, argument) = find_next_postback(&doc).expect("next control");
        assert_eq!(target, "grid$pager");
        assert_eq!(argument, "Page$2");

        let form = state.into_form(&target, &argument);
        assert!(form.contains(&("__EVENTTARGET".to_string(), "grid$pager".to_string())));
        assert!(form.contains(&("__EVENTARGUMENT".to_string(), "Page$2".to_string())));
    }

    #[test]
    fn numeric_pager_labels_are_a_fallback_next_control() {
        let html = r#"
        <html><body>
          <a href="javascript:__doPostBack('pager','Page$2')">2</a>
          <a href="javascript:__doPostBack('pager','Page$3')">3</a>
        </body></html>
        "#;
        let doc = Html::parse_document(html);
        let (target, argument) = find_next_postback(&doc).expect("fallback control");
        assert_eq!(target, "pager");
        assert_eq!(argument, "Page$3");
    }

    #[test]
    fn repeated_fingerprint_halts_pagination_at_page_two() {
        let mut session = CrawlSession::new(base(), 50);

        match session.ingest_page(LISTING_PAGE) {
            PageDirective::Continue(_) => {}
            other => panic!("expected continue, got {other:?}"),
        }
        // a misbehaving next link serves the same page again
        assert_eq!(
            session.ingest_page(LISTING_PAGE),
            PageDirective::Done(DoneReason::FingerprintRepeat)
        );
        // both fetches count, but the repeated rows are discarded
        assert_eq!(session.pages_ingested(), 2);
        assert_eq!(session.rows().len(), 2);
    }

    #[test]
    fn page_limit_stops_the_session() {
        let mut session = CrawlSession::new(base(), 1);
        assert_eq!(
            session.ingest_page(LISTING_PAGE),
            PageDirective::Done(DoneReason::PageLimit)
        );
    }

    #[test]
    fn missing_next_control_ends_the_session() {
        let mut session = CrawlSession::new(base(), 50);
        assert_eq!(
            session.ingest_page(REORDERED_PAGE),
            PageDirective::Done(DoneReason::NoNextControl)
        );
        assert_eq!(session.rows().len(), 1);
    }

    #[test]
    fn merge_policy_prefers_populated_validated_longer() {
        // never overwrite populated with empty
        assert_eq!(
            merge_field(Some("kept"), None, any_text).as_deref(),
            Some("kept")
        );
        assert_eq!(
            merge_field(Some("kept"), Some("  "), any_text).as_deref(),
            Some("kept")
        );
        // validator-passing candidate beats failing incumbent
        assert_eq!(
            merge_field(Some("not-an-email"), Some("a@b.gov"), is_email_shaped).as_deref(),
            Some("a@b.gov")
        );
        // incumbent that validates survives a failing candidate
        assert_eq!(
            merge_field(Some("a@b.gov"), Some("junk"), is_email_shaped).as_deref(),
            Some("a@b.gov")
        );
        // both pass: longer wins
        assert_eq!(
            merge_field(Some("short"), Some("much longer value"), any_text).as_deref(),
            Some("much longer value")
        );
        assert_eq!(merge_field(None, Some("new"), any_text).as_deref(), Some("new"));
    }

    #[test]
    fn email_and_phone_normalize_to_canonical_forms() {
        assert_eq!(
            normalize_email("  Buyer@DOT.State.MD.US "),
            Some("buyer@dot.state.md.us".to_string())
        );
        assert_eq!(normalize_email("not an email"), None);

        assert_eq!(
            normalize_phone("410.555.0123"),
            Some("(410) 555-0123".to_string())
        );
        assert_eq!(
            normalize_phone("+1 (410) 555-0123"),
            Some("+1 (410) 555-0123".to_string())
        );
        assert_eq!(normalize_phone("555-0123"), None);
    }

    #[test]
    fn money_parsing_honors_multipliers() {
        assert_eq!(parse_money("$1,500,000.00"), Some(1_500_000.0));
        assert_eq!(parse_money("estimated at $2.5 million"), Some(2_500_000.0));
        assert_eq!(parse_money("$1B program"), Some(1_000_000_000.0));
        assert_eq!(parse_money("3 million dollars"), Some(3_000_000.0));
        assert_eq!(parse_money("no numbers here"), None);
    }

    #[test]
    fn dates_parse_against_the_accepted_format_list() {
        let expected = Utc.with_ymd_and_hms(2025, 11, 5, 14, 0, 0).single().unwrap();
        assert_eq!(parse_datetime("11/05/2025 02:00:00 PM"), Some(expected));

        let midnight = Utc.with_ymd_and_hms(2025, 11, 5, 0, 0, 0).single().unwrap();
        assert_eq!(parse_datetime("11/05/2025"), Some(midnight));
        assert_eq!(parse_datetime("2025-11-05"), Some(midnight));
        assert_eq!(parse_datetime("sometime soon"), None);
    }

    #[test]
    fn detail_extraction_merges_all_three_strategies() {
        let fields = extract_detail_fields(DETAIL_PAGE, &base());

        // strategy 1: labeled table rows
        assert_eq!(
            fields.summary.as_deref(),
            Some("Replace the roof membrane on building A.")
        );
        assert_eq!(fields.buyer_name.as_deref(), Some("Jane Smith"));
        assert_eq!(fields.due_text.as_deref(), Some("11/05/2025 02:00:00 PM"));
        assert_eq!(fields.estimated_value_text.as_deref(), Some("$2.5 million"));
        // strategy 1: definition lists
        assert_eq!(fields.program_goals.as_deref(), Some("MBE 25%"));
        // strategy 2: "Label: Value" text blocks
        assert_eq!(fields.contact_phone.as_deref(), Some("(410) 555-0123"));
        // strategy 3: whole-page pattern scan
        assert_eq!(
            fields.contact_email.as_deref(),
            Some("roofing.buyer@dot.state.md.us")
        );
        // attachments
        assert_eq!(
            fields.attachment_names,
            vec!["Scope of Work".to_string(), "Bid Forms".to_string()]
        );
    }

    #[test]
    fn detail_merge_normalizes_and_flags() {
        let detail = extract_detail_fields(DETAIL_PAGE, &base());
        let mut business = BusinessFields {
            title: "Roof Repair".to_string(),
            ..Default::default()
        };
        let mut flags = Vec::new();

        merge_detail_into(&mut business, &mut flags, &detail);

        assert_eq!(
            business.contact_email.as_deref(),
            Some("roofing.buyer@dot.state.md.us")
        );
        assert_eq!(business.contact_phone.as_deref(), Some("(410) 555-0123"));
        assert_eq!(business.estimated_value, Some(2_500_000.0));
        assert_eq!(
            business.due_at,
            Utc.with_ymd_and_hms(2025, 11, 5, 14, 0, 0).single()
        );
        assert_eq!(business.attachment_count, 2);
        assert!(flags.is_empty());
    }

    #[tokio::test]
    async fn failed_detail_fetch_downgrades_to_listing_fields() {
        use opptrack_storage::{BackoffPolicy, HttpClientConfig};
        use std::time::Duration;

        let config = HttpClientConfig {
            base_delay: Duration::ZERO,
            timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            ..Default::default()
        };
        let fetcher = Arc::new(HttpFetcher::new(config).expect("fetcher"));
        let enricher = DetailEnricher::new(fetcher, true);

        let row = RawListingRow {
            title: "Roof Repair".to_string(),
            // discard port, connection refused immediately
            detail_url: Some("http://127.0.0.1:9/extranet/1".to_string()),
            agency: Some("DOT".to_string()),
            ..Default::default()
        };

        let draft = enricher.enrich(&row, Utc::now()).await;
        assert_eq!(draft.business.title, "Roof Repair");
        assert_eq!(draft.business.agency.as_deref(), Some("DOT"));
        assert!(draft.business.summary.is_none());
        assert!(draft
            .validation_flags
            .contains(&ValidationFlag::IncompleteEnrichment));
    }

    #[tokio::test]
    async fn listing_only_draft_flags_unparseable_dates() {
        let fetcher = Arc::new(
            HttpFetcher::new(opptrack_storage::HttpClientConfig::default()).expect("fetcher"),
        );
        let enricher = DetailEnricher::new(fetcher, false);

        let row = RawListingRow {
            title: "  Roof   Repair ".to_string(),
            detail_url: Some("https://example.gov/extranet/1".to_string()),
            agency: Some("DOT".to_string()),
            publish_text: Some("not a date".to_string()),
            ..Default::default()
        };

        let draft = enricher.enrich(&row, Utc::now()).await;
        assert_eq!(draft.business.title, "Roof Repair");
        assert!(draft
            .validation_flags
            .contains(&ValidationFlag::UnparsedPublishDate));
        // detail fetching disabled: no enrichment flags expected
        assert!(!draft
            .validation_flags
            .contains(&ValidationFlag::IncompleteEnrichment));
    }
}
