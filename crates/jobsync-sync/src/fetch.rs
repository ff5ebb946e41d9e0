use std::collections::{HashMap, HashSet};

use futures::stream::{self, Stream, StreamExt};
use jobsync_core::{Credentials, EntityKind, ExternalId, QueryFilter, RemoteSession};
use jobsync_mapper::peek_external_id;
use jobsync_remote::{AuthError, FetchError, QueryError, RemoteApi, MAX_FIND_MULTIPLE};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

pub async fn authenticate(
    remote: &dyn RemoteApi,
    credentials: &Credentials,
) -> Result<RemoteSession, AuthError> {
    let session = remote.start_session(credentials).await?;
    info!(
        username = %credentials.username,
        expires_at = ?session.expires_at,
        "remote session established"
    );
    Ok(session)
}

/// Identifiers of every record matching `filter`, first occurrence wins.
pub async fn list_identifiers(
    remote: &dyn RemoteApi,
    session: &RemoteSession,
    entity: EntityKind,
    filter: &QueryFilter,
) -> Result<Vec<ExternalId>, QueryError> {
    let raw = remote.query_ids(session, entity, filter, true).await?;
    let total = raw.len();
    let ids = dedupe_preserving_order(raw);
    info!(
        entity = %entity,
        filter = %filter.where_clause,
        listed = ids.len(),
        duplicates = total - ids.len(),
        "identifiers listed"
    );
    Ok(ids)
}

fn dedupe_preserving_order(ids: Vec<ExternalId>) -> Vec<ExternalId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// Outcome of one `find-multiple` call.
#[derive(Debug)]
pub struct FetchedChunk {
    pub index: usize,
    pub requested: Vec<ExternalId>,
    pub outcome: Result<Vec<JsonValue>, FetchError>,
}

/// Payloads of a successful chunk keyed back to the identifiers that asked for them.
#[derive(Debug, Default)]
pub struct RekeyedChunk {
    pub records: Vec<(ExternalId, JsonValue)>,
    pub missing: Vec<ExternalId>,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchFetcher {
    chunk_size: usize,
    concurrency: usize,
}

impl BatchFetcher {
    pub fn new(chunk_size: usize, concurrency: usize) -> Self {
        Self {
            chunk_size: chunk_size.clamp(1, MAX_FIND_MULTIPLE),
            concurrency: concurrency.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self, total: usize) -> usize {
        total.div_ceil(self.chunk_size)
    }

    /// Lazily issue one `find-multiple` per chunk, at most `concurrency` in flight,
    /// yielding outcomes in chunk order. Dropping the stream abandons the remaining chunks.
    pub fn fetch<'a>(
        &self,
        remote: &'a dyn RemoteApi,
        session: &'a RemoteSession,
        entity: EntityKind,
        ids: &'a [ExternalId],
    ) -> impl Stream<Item = FetchedChunk> + Send + 'a {
        let chunk_size = self.chunk_size;
        let concurrency = self.concurrency;
        stream::iter(ids.chunks(chunk_size).enumerate())
            .map(move |(index, chunk)| async move {
                debug!(chunk = index, size = chunk.len(), "fetching chunk");
                let outcome = remote.find_multiple(session, entity, chunk).await;
                FetchedChunk {
                    index,
                    requested: chunk.to_vec(),
                    outcome,
                }
            })
            .buffered(concurrency)
    }
}

/// Match payloads to requested identifiers by `jobOrderID`, never by position.
/// Payloads for identifiers that were not requested are dropped.
pub fn rekey(requested: &[ExternalId], payloads: Vec<JsonValue>) -> RekeyedChunk {
    let wanted: HashSet<ExternalId> = requested.iter().copied().collect();
    let mut by_id: HashMap<ExternalId, JsonValue> = HashMap::with_capacity(payloads.len());
    for payload in payloads {
        match peek_external_id(&payload) {
            Some(id) if wanted.contains(&id) => {
                by_id.entry(id).or_insert(payload);
            }
            other => debug!(external_id = ?other, "ignoring unrequested payload"),
        }
    }

    let mut rekeyed = RekeyedChunk::default();
    for id in requested {
        match by_id.remove(id) {
            Some(payload) => rekeyed.records.push((*id, payload)),
            None => rekeyed.missing.push(*id),
        }
    }
    rekeyed
}
