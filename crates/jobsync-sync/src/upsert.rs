use std::collections::BTreeMap;

use jobsync_core::{LocalId, LocalJobListing, TaxonomyNamespace, TermId};
use jobsync_mapper::MappedListing;
use jobsync_store::{JobStore, StoreError};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Term id per namespace; `None` means the listing carries no term there.
pub type ResolvedTerms = BTreeMap<TaxonomyNamespace, Option<TermId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(LocalId),
    Updated(LocalId),
    Unchanged(LocalId),
}

impl UpsertOutcome {
    pub fn local_id(&self) -> LocalId {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => *id,
        }
    }
}

/// SHA-256 over everything the upsert would write for this listing.
pub fn content_fingerprint(mapped: &MappedListing, terms: &ResolvedTerms) -> String {
    let draft = &mapped.draft;
    let mut hasher = Sha256::new();
    feed(&mut hasher, &draft.external_id.to_string());
    feed(&mut hasher, &draft.title);
    feed(&mut hasher, &draft.body);
    feed(&mut hasher, &draft.published_at.timestamp().to_string());
    feed(&mut hasher, draft.status.as_str());
    for (key, value) in &mapped.metadata {
        feed(&mut hasher, key);
        feed(&mut hasher, value);
    }
    for (namespace, term) in terms {
        feed(&mut hasher, namespace.as_str());
        feed(&mut hasher, &term.map(|id| id.to_string()).unwrap_or_default());
    }
    hex::encode(hasher.finalize())
}

fn feed(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

/// Write one mapped listing so that exactly one local listing exists for its external id.
///
/// Content, metadata and associations are written before the fingerprint, so a run that
/// stops midway leaves a listing whose fingerprint is missing and gets rewritten next time.
/// A matching fingerprint only skips the write when the stored rows still agree with the
/// mapped listing.
pub async fn upsert_listing<S>(
    store: &S,
    mapped: &MappedListing,
    terms: &ResolvedTerms,
) -> Result<UpsertOutcome, StoreError>
where
    S: JobStore + ?Sized,
{
    let external_id = mapped.external_id();
    let fingerprint = content_fingerprint(mapped, terms);

    let outcome = match store.get_by_external_id(external_id).await? {
        Some(existing)
            if existing.fingerprint.as_deref() == Some(fingerprint.as_str())
                && stored_matches(store, &existing, mapped, terms).await? =>
        {
            debug!(external_id, local_id = existing.local_id, "listing unchanged");
            return Ok(UpsertOutcome::Unchanged(existing.local_id));
        }
        Some(existing) => {
            store.update(existing.local_id, &mapped.draft).await?;
            UpsertOutcome::Updated(existing.local_id)
        }
        None => match store.insert(&mapped.draft).await {
            Ok(local_id) => UpsertOutcome::Inserted(local_id),
            Err(StoreError::DuplicateExternalId(_)) => {
                // Another writer inserted between lookup and insert.
                let existing = store
                    .get_by_external_id(external_id)
                    .await?
                    .ok_or(StoreError::DuplicateExternalId(external_id))?;
                debug!(external_id, local_id = existing.local_id, "insert lost a race; updating");
                store.update(existing.local_id, &mapped.draft).await?;
                UpsertOutcome::Updated(existing.local_id)
            }
            Err(err) => return Err(err),
        },
    };
    let local_id = outcome.local_id();

    for (key, value) in &mapped.metadata {
        store.set_metadata(local_id, key, value).await?;
    }

    for (namespace, term) in terms {
        match term {
            Some(term_id) => store.set_term_association(local_id, *namespace, *term_id).await?,
            None => store.clear_term_association(local_id, *namespace).await?,
        }
    }

    store.set_fingerprint(local_id, &fingerprint).await?;
    debug!(external_id, local_id, outcome = ?outcome, "listing written");
    Ok(outcome)
}

/// Whether the stored listing, its metadata and its associations already hold `mapped`.
async fn stored_matches<S>(
    store: &S,
    existing: &LocalJobListing,
    mapped: &MappedListing,
    terms: &ResolvedTerms,
) -> Result<bool, StoreError>
where
    S: JobStore + ?Sized,
{
    let draft = &mapped.draft;
    if existing.title != draft.title
        || existing.body != draft.body
        || existing.published_at.timestamp() != draft.published_at.timestamp()
        || existing.status != draft.status
    {
        return Ok(false);
    }

    let metadata = store.metadata(existing.local_id).await?;
    let metadata_matches = mapped
        .metadata
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value));
    if !metadata_matches {
        return Ok(false);
    }

    let associations = store.term_associations(existing.local_id).await?;
    Ok(terms
        .iter()
        .all(|(namespace, term)| associations.get(namespace) == term.as_ref()))
}
