//! Core domain model for the job order sync pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-core";

/// Remote primary key of a job order; the join key for idempotent sync.
pub type ExternalId = i64;
/// Identifier assigned by the local store on insert.
pub type LocalId = i64;
pub type TermId = i64;

/// Ordered key/value metadata attached to one listing.
pub type MetadataMap = BTreeMap<String, String>;

/// Number of numbered custom fields carried by a remote job order.
pub const CUSTOM_FIELD_COUNT: usize = 9;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub api_key: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            api_key: api_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Remote-managed session handle. Lives for one sync run and is never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub token: String,
    pub established_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("token", &"<redacted>")
            .field("established_at", &self.established_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    JobOrder,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::JobOrder => "JobOrder",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub where_clause: String,
}

impl QueryFilter {
    pub fn new(where_clause: impl Into<String>) -> Self {
        Self {
            where_clause: where_clause.into(),
        }
    }

    pub fn open() -> Self {
        Self::new("isOpen=1")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAddress {
    pub address1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
}

/// Typed snapshot of one remote job order, fetched once per sync pass.
///
/// Scalar fields hold the remote value in textual form; dates are left raw so
/// that coercion failures surface during mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteJobRecord {
    pub external_id: ExternalId,
    pub title: String,
    pub description: String,
    pub public_description: Option<String>,
    pub is_open: bool,
    pub date_added: String,
    pub start_date: Option<String>,
    pub date_end: Option<String>,
    pub duration_weeks: Option<String>,
    pub employment_type: Option<String>,
    pub custom_fields: [Option<String>; CUSTOM_FIELD_COUNT],
    pub address: Option<RemoteAddress>,
    pub salary: Option<String>,
    pub salary_unit: Option<String>,
    pub tax_rate: Option<String>,
    pub tax_status: Option<String>,
    pub years_required: Option<String>,
    pub certification_list: Option<String>,
    pub skill_list: Option<String>,
    pub travel_requirements: Option<String>,
    pub benefits: Option<String>,
    pub education_degree: Option<String>,
    pub hours_of_operation: Option<String>,
    pub external_category_id: Option<String>,
    pub will_relocate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Publish,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Publish => "publish",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "publish" => Some(ListingStatus::Publish),
            _ => None,
        }
    }
}

/// Listing content produced by the mapper, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub external_id: ExternalId,
    pub title: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
    pub status: ListingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalJobListing {
    pub local_id: LocalId,
    pub external_id: ExternalId,
    pub title: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
    pub status: ListingStatus,
    /// Fingerprint of the last fully applied sync of this listing.
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaxonomyNamespace {
    Region,
    EmploymentType,
}

impl TaxonomyNamespace {
    pub const ALL: [TaxonomyNamespace; 2] =
        [TaxonomyNamespace::Region, TaxonomyNamespace::EmploymentType];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomyNamespace::Region => "job_listing_region",
            TaxonomyNamespace::EmploymentType => "job_listing_type",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == value)
    }
}

impl fmt::Display for TaxonomyNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    FetchError,
    MappingError,
    ResolutionError,
    StoreError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::FetchError => "FetchError",
            FailureKind::MappingError => "MappingError",
            FailureKind::ResolutionError => "ResolutionError",
            FailureKind::StoreError => "StoreError",
        }
    }
}

/// One isolated failure; the rest of the run continued past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub external_id: ExternalId,
    pub kind: FailureKind,
    pub reason: String,
}

impl RecordFailure {
    pub fn new(external_id: ExternalId, kind: FailureKind, message: impl fmt::Display) -> Self {
        Self {
            external_id,
            kind,
            reason: format!("{}: {}", kind.as_str(), message),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub listed: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithFailures,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub counts: SyncCounts,
    pub failures: Vec<RecordFailure>,
}

impl SyncReport {
    /// True only when every listed identifier was applied and the run was not cut short.
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn summary_line(&self) -> String {
        format!(
            "run_id={} status={:?} listed={} fetched={} inserted={} updated={} unchanged={} failed={}",
            self.run_id,
            self.status,
            self.counts.listed,
            self.counts.fetched,
            self.counts.inserted,
            self.counts.updated,
            self.counts.unchanged,
            self.counts.failed
        )
    }
}
