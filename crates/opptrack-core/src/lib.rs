//! Core domain model for the procurement opportunity tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "opptrack-core";

/// Positional fields captured from one catalog listing row. Raw strings only;
/// normalization happens during enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawListingRow {
    pub title: String,
    pub detail_url: Option<String>,
    pub solicitation_id: Option<String>,
    pub category: Option<String>,
    pub procurement_method: Option<String>,
    pub agency: Option<String>,
    pub publish_text: Option<String>,
    pub due_text: Option<String>,
}

/// Stable key naming one logical opportunity across runs.
///
/// `eid_<n>` when a site-native numeric id is derivable from the detail URL,
/// `hash_<hex>` otherwise. Construction lives in the identity resolver; this
/// type only guarantees the string is opaque and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn native(id: u64) -> Self {
        Self(format!("eid_{id}"))
    }

    pub fn digest(hex: &str) -> Self {
        Self(format!("hash_{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The human-meaningful attributes of an opportunity. Equality over this
/// struct is the sole basis for Updated vs Unchanged; administrative fields
/// (timestamps, status, quality score, flags) live outside it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BusinessFields {
    pub title: String,
    pub agency: Option<String>,
    pub category: Option<String>,
    pub procurement_method: Option<String>,
    pub solicitation_id: Option<String>,
    pub detail_url: Option<String>,
    pub publish_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub buyer_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub submission_instructions: Option<String>,
    pub program_goals: Option<String>,
    pub estimated_value: Option<f64>,
    pub attachment_count: u32,
    pub attachment_names: Vec<String>,
}

macro_rules! diff_field {
    ($changed:ident, $a:expr, $b:expr, $name:ident) => {
        if $a.$name != $b.$name {
            $changed.push(stringify!($name));
        }
    };
}

impl BusinessFields {
    /// Names of the business fields that differ from `prior`.
    pub fn changed_from(&self, prior: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        diff_field!(changed, self, prior, title);
        diff_field!(changed, self, prior, agency);
        diff_field!(changed, self, prior, category);
        diff_field!(changed, self, prior, procurement_method);
        diff_field!(changed, self, prior, solicitation_id);
        diff_field!(changed, self, prior, detail_url);
        diff_field!(changed, self, prior, publish_at);
        diff_field!(changed, self, prior, due_at);
        diff_field!(changed, self, prior, summary);
        diff_field!(changed, self, prior, buyer_name);
        diff_field!(changed, self, prior, contact_email);
        diff_field!(changed, self, prior, contact_phone);
        diff_field!(changed, self, prior, submission_instructions);
        diff_field!(changed, self, prior, program_goals);
        diff_field!(changed, self, prior, estimated_value);
        diff_field!(changed, self, prior, attachment_count);
        diff_field!(changed, self, prior, attachment_names);
        changed
    }

    /// Share of populated fields, 0..=100.
    pub fn completeness_score(&self) -> u8 {
        let present = [
            !self.title.is_empty(),
            self.agency.is_some(),
            self.category.is_some(),
            self.procurement_method.is_some(),
            self.solicitation_id.is_some(),
            self.detail_url.is_some(),
            self.publish_at.is_some(),
            self.due_at.is_some(),
            self.summary.is_some(),
            self.buyer_name.is_some(),
            self.contact_email.is_some(),
            self.contact_phone.is_some(),
            self.submission_instructions.is_some(),
            self.program_goals.is_some(),
            self.estimated_value.is_some(),
            self.attachment_count > 0,
        ];
        let populated = present.iter().filter(|p| **p).count();
        ((populated * 100) / present.len()) as u8
    }
}

/// Per-field extraction problems recorded on a record instead of failing the
/// batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFlag {
    UnparsedPublishDate,
    UnparsedDueDate,
    InvalidEmail,
    InvalidPhone,
    MissingDetailUrl,
    IncompleteEnrichment,
}

/// Handoff contract from the crawler/enricher into identity resolution:
/// normalized business fields plus extraction problems, no identity yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub business: BusinessFields,
    pub validation_flags: Vec<ValidationFlag>,
    pub fetched_at: DateTime<Utc>,
}

/// One fully extracted, identity-bearing listing. Immutable after identity
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub identity: Identity,
    pub business: BusinessFields,
    pub validation_flags: Vec<ValidationFlag>,
    pub quality_score: u8,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    New,
    Updated,
    Unchanged,
    Stale,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordStatus::New => "New",
            RecordStatus::Updated => "Updated",
            RecordStatus::Unchanged => "Unchanged",
            RecordStatus::Stale => "Stale",
        };
        f.write_str(s)
    }
}

/// Durable representation keyed by Identity. Lives in the active table or
/// the archive table, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub identity: Identity,
    pub business: BusinessFields,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: RecordStatus,
    pub quality_score: u8,
}

/// Append-only reconciliation log row. Never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub identity: Identity,
    pub status: RecordStatus,
    pub run_at: DateTime<Utc>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

/// Per-run counts handed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub pages_crawled: usize,
    pub rows_extracted: usize,
    pub enrichment_ok: usize,
    pub enrichment_failed: usize,
    pub duplicates_dropped: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub stale_archived: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_fields() -> BusinessFields {
        BusinessFields {
            title: "Roof Repair".to_string(),
            agency: Some("DOT".to_string()),
            category: Some("Construction".to_string()),
            publish_at: Some(Utc.with_ymd_and_hms(2025, 10, 1, 9, 0, 0).single().unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn changed_from_reports_differing_field_names() {
        let prior = sample_fields();
        let mut next = sample_fields();
        next.agency = Some("DGS".to_string());
        next.due_at = Some(Utc.with_ymd_and_hms(2025, 11, 5, 14, 0, 0).single().unwrap());

        assert_eq!(next.changed_from(&prior), vec!["agency", "due_at"]);
        assert!(prior.changed_from(&prior.clone()).is_empty());
    }

    #[test]
    fn completeness_counts_populated_fields_only() {
        let empty = BusinessFields::default();
        assert_eq!(empty.completeness_score(), 0);

        let some = sample_fields();
        assert!(some.completeness_score() > 0);
        assert!(some.completeness_score() < 100);
    }

    #[test]
    fn identity_formats_are_stable() {
        assert_eq!(Identity::native(12345).as_str(), "eid_12345");
        assert_eq!(Identity::digest("abcd").as_str(), "hash_abcd");
    }
}
