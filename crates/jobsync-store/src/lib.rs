//! Local job-listing store contracts and their in-memory and Postgres implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use jobsync_core::{
    ExternalId, ListingDraft, LocalId, LocalJobListing, MetadataMap, TaxonomyNamespace, TermId,
};
use thiserror::Error;
use tracing::warn;

mod memory;
mod postgres;

pub use memory::{MemoryJobStore, MemorySnapshot};
pub use postgres::PgJobStore;

pub const CRATE_NAME: &str = "jobsync-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("listing {0} not found")]
    ListingNotFound(LocalId),
    #[error("term {0} not found")]
    TermNotFound(TermId),
    #[error("a listing with external id {0} already exists")]
    DuplicateExternalId(ExternalId),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Job listings keyed by external identifier, plus their metadata.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Every listing carrying `external_id`, ascending by local id. More than one is a
    /// consistency violation but is returned as-is.
    async fn find_by_external_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Vec<LocalJobListing>, StoreError>;

    /// The listing for `external_id`; on duplicates the lowest local id wins.
    async fn get_by_external_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Option<LocalJobListing>, StoreError> {
        let matches = self.find_by_external_id(external_id).await?;
        if matches.len() > 1 {
            warn!(
                external_id,
                matches = matches.len(),
                "multiple listings share one external id; using the lowest local id"
            );
        }
        Ok(matches.into_iter().min_by_key(|listing| listing.local_id))
    }

    /// Insert a new listing; the stored fingerprint starts empty.
    async fn insert(&self, draft: &ListingDraft) -> Result<LocalId, StoreError>;

    /// Overwrite listing content in place and clear its fingerprint.
    async fn update(&self, local_id: LocalId, draft: &ListingDraft) -> Result<(), StoreError>;

    /// Insert-or-overwrite one metadata key.
    async fn set_metadata(&self, local_id: LocalId, key: &str, value: &str)
        -> Result<(), StoreError>;

    async fn metadata(&self, local_id: LocalId) -> Result<MetadataMap, StoreError>;

    async fn set_fingerprint(&self, local_id: LocalId, fingerprint: &str)
        -> Result<(), StoreError>;
}

/// Controlled-vocabulary terms, unique on (namespace, name), and listing associations.
#[async_trait]
pub trait TaxonomyStore: Send + Sync {
    async fn find_term(
        &self,
        name: &str,
        namespace: TaxonomyNamespace,
    ) -> Result<Option<TermId>, StoreError>;

    /// Create the term unless it already exists. Does not return the id.
    async fn create_term(&self, name: &str, namespace: TaxonomyNamespace) -> Result<(), StoreError>;

    /// Point the listing at `term_id` in `namespace`, replacing any prior term there.
    async fn set_term_association(
        &self,
        local_id: LocalId,
        namespace: TaxonomyNamespace,
        term_id: TermId,
    ) -> Result<(), StoreError>;

    async fn clear_term_association(
        &self,
        local_id: LocalId,
        namespace: TaxonomyNamespace,
    ) -> Result<(), StoreError>;

    async fn term_associations(
        &self,
        local_id: LocalId,
    ) -> Result<BTreeMap<TaxonomyNamespace, TermId>, StoreError>;
}

pub trait JobStore: ListingStore + TaxonomyStore {}

impl<T: ListingStore + TaxonomyStore> JobStore for T {}
