use std::collections::BTreeMap;

use async_trait::async_trait;
use jobsync_core::{
    ExternalId, ListingDraft, LocalId, LocalJobListing, MetadataMap, TaxonomyNamespace, TermId,
};
use tokio::sync::Mutex;

use crate::{ListingStore, StoreError, TaxonomyStore};

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemorySnapshot>,
}

/// Full observable content of a [`MemoryJobStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub listings: BTreeMap<LocalId, LocalJobListing>,
    pub metadata: BTreeMap<LocalId, MetadataMap>,
    pub terms: BTreeMap<(TaxonomyNamespace, String), TermId>,
    pub associations: BTreeMap<LocalId, BTreeMap<TaxonomyNamespace, TermId>>,
    next_listing_id: LocalId,
    next_term_id: TermId,
}

impl MemorySnapshot {
    fn allocate_listing_id(&mut self) -> LocalId {
        self.next_listing_id += 1;
        self.next_listing_id
    }

    fn require_listing(&self, local_id: LocalId) -> Result<(), StoreError> {
        if self.listings.contains_key(&local_id) {
            Ok(())
        } else {
            Err(StoreError::ListingNotFound(local_id))
        }
    }

    pub fn listings_for(&self, external_id: ExternalId) -> Vec<&LocalJobListing> {
        self.listings
            .values()
            .filter(|listing| listing.external_id == external_id)
            .collect()
    }

    pub fn term_id(&self, namespace: TaxonomyNamespace, name: &str) -> Option<TermId> {
        self.terms.get(&(namespace, name.to_string())).copied()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemorySnapshot {
        self.state.lock().await.clone()
    }

    /// Store a listing without the external-id uniqueness check.
    pub async fn seed_listing(&self, draft: &ListingDraft) -> LocalId {
        let mut state = self.state.lock().await;
        let local_id = state.allocate_listing_id();
        state.listings.insert(local_id, listing_from(local_id, draft));
        local_id
    }
}

fn listing_from(local_id: LocalId, draft: &ListingDraft) -> LocalJobListing {
    LocalJobListing {
        local_id,
        external_id: draft.external_id,
        title: draft.title.clone(),
        body: draft.body.clone(),
        published_at: draft.published_at,
        status: draft.status,
        fingerprint: None,
    }
}

#[async_trait]
impl ListingStore for MemoryJobStore {
    async fn find_by_external_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Vec<LocalJobListing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .listings_for(external_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn insert(&self, draft: &ListingDraft) -> Result<LocalId, StoreError> {
        let mut state = self.state.lock().await;
        if !state.listings_for(draft.external_id).is_empty() {
            return Err(StoreError::DuplicateExternalId(draft.external_id));
        }
        let local_id = state.allocate_listing_id();
        state.listings.insert(local_id, listing_from(local_id, draft));
        Ok(local_id)
    }

    async fn update(&self, local_id: LocalId, draft: &ListingDraft) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let listing = state
            .listings
            .get_mut(&local_id)
            .ok_or(StoreError::ListingNotFound(local_id))?;
        *listing = listing_from(local_id, draft);
        Ok(())
    }

    async fn set_metadata(
        &self,
        local_id: LocalId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.require_listing(local_id)?;
        state
            .metadata
            .entry(local_id)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn metadata(&self, local_id: LocalId) -> Result<MetadataMap, StoreError> {
        let state = self.state.lock().await;
        state.require_listing(local_id)?;
        Ok(state.metadata.get(&local_id).cloned().unwrap_or_default())
    }

    async fn set_fingerprint(
        &self,
        local_id: LocalId,
        fingerprint: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let listing = state
            .listings
            .get_mut(&local_id)
            .ok_or(StoreError::ListingNotFound(local_id))?;
        listing.fingerprint = Some(fingerprint.to_string());
        Ok(())
    }
}

#[async_trait]
impl TaxonomyStore for MemoryJobStore {
    async fn find_term(
        &self,
        name: &str,
        namespace: TaxonomyNamespace,
    ) -> Result<Option<TermId>, StoreError> {
        Ok(self.state.lock().await.term_id(namespace, name))
    }

    async fn create_term(&self, name: &str, namespace: TaxonomyNamespace) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = (namespace, name.to_string());
        if !state.terms.contains_key(&key) {
            state.next_term_id += 1;
            let term_id = state.next_term_id;
            state.terms.insert(key, term_id);
        }
        Ok(())
    }

    async fn set_term_association(
        &self,
        local_id: LocalId,
        namespace: TaxonomyNamespace,
        term_id: TermId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.require_listing(local_id)?;
        if !state.terms.values().any(|id| *id == term_id) {
            return Err(StoreError::TermNotFound(term_id));
        }
        state
            .associations
            .entry(local_id)
            .or_default()
            .insert(namespace, term_id);
        Ok(())
    }

    async fn clear_term_association(
        &self,
        local_id: LocalId,
        namespace: TaxonomyNamespace,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.require_listing(local_id)?;
        if let Some(assoc) = state.associations.get_mut(&local_id) {
            assoc.remove(&namespace);
            if assoc.is_empty() {
                state.associations.remove(&local_id);
            }
        }
        Ok(())
    }

    async fn term_associations(
        &self,
        local_id: LocalId,
    ) -> Result<BTreeMap<TaxonomyNamespace, TermId>, StoreError> {
        let state = self.state.lock().await;
        state.require_listing(local_id)?;
        Ok(state.associations.get(&local_id).cloned().unwrap_or_default())
    }
}
