use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use jobsync_core::{
    Credentials, EntityKind, ExternalId, FailureKind, ListingDraft, LocalId, LocalJobListing,
    MetadataMap, QueryFilter, RemoteSession, RunStatus, TaxonomyNamespace, TermId,
};
use jobsync_remote::{AuthError, FetchError, QueryError, RemoteApi, RemoteError};
use jobsync_store::{ListingStore, MemoryJobStore, StoreError, TaxonomyStore};
use jobsync_sync::{latest_report, FetchFailurePolicy, RunOptions, SyncError, SyncPipeline};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

fn job_order(id: ExternalId, state: &str, employment_type: &str) -> JsonValue {
    json!({
        "jobOrderID": id,
        "title": format!("Job {id}"),
        "description": format!("<p>Description for {id}</p>"),
        "isOpen": true,
        "dateAdded": "2026-02-01T09:00:00Z",
        "startDate": "2026-03-01",
        "employmentType": employment_type,
        "salary": 50000 + id,
        "address": { "address1": "1 Main St", "city": "Springfield", "state": state }
    })
}

#[derive(Default)]
struct FakeRemote {
    records: Mutex<BTreeMap<ExternalId, JsonValue>>,
    open_ids: Mutex<Vec<ExternalId>>,
    find_calls: Mutex<Vec<Vec<ExternalId>>>,
    failing_ids: Mutex<BTreeSet<ExternalId>>,
    withheld_ids: Mutex<BTreeSet<ExternalId>>,
    reject_auth: bool,
    fail_query: bool,
    cancel_on_find_call: Option<(usize, CancellationToken)>,
}

impl FakeRemote {
    fn with_records(records: Vec<JsonValue>) -> Self {
        let remote = Self::default();
        for record in records {
            remote.put(record);
        }
        remote
    }

    fn put(&self, record: JsonValue) {
        let id = record["jobOrderID"].as_i64().unwrap();
        self.records.lock().unwrap().insert(id, record);
        let mut open = self.open_ids.lock().unwrap();
        if !open.contains(&id) {
            open.push(id);
        }
    }

    fn close(&self, id: ExternalId) {
        self.open_ids.lock().unwrap().retain(|open| *open != id);
    }

    fn find_calls(&self) -> Vec<Vec<ExternalId>> {
        self.find_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn start_session(&self, credentials: &Credentials) -> Result<RemoteSession, AuthError> {
        if self.reject_auth {
            return Err(AuthError::Rejected(format!("bad key for {}", credentials.username)));
        }
        Ok(RemoteSession {
            token: "session-token".to_string(),
            established_at: Utc::now(),
            expires_at: None,
        })
    }

    async fn query_ids(
        &self,
        _session: &RemoteSession,
        entity: EntityKind,
        filter: &QueryFilter,
        distinct: bool,
    ) -> Result<Vec<ExternalId>, QueryError> {
        assert_eq!(entity, EntityKind::JobOrder);
        assert_eq!(filter, &QueryFilter::open());
        assert!(distinct);
        if self.fail_query {
            return Err(QueryError(RemoteError::Fault("query timed out".to_string())));
        }
        Ok(self.open_ids.lock().unwrap().clone())
    }

    async fn find_multiple(
        &self,
        _session: &RemoteSession,
        _entity: EntityKind,
        ids: &[ExternalId],
    ) -> Result<Vec<JsonValue>, FetchError> {
        let call_no = {
            let mut calls = self.find_calls.lock().unwrap();
            calls.push(ids.to_vec());
            calls.len()
        };
        if let Some((at, token)) = &self.cancel_on_find_call {
            if *at == call_no {
                token.cancel();
            }
        }
        if ids.iter().any(|id| self.failing_ids.lock().unwrap().contains(id)) {
            return Err(FetchError::Remote(RemoteError::HttpStatus {
                status: 503,
                url: "http://erp.test/find-multiple".to_string(),
                message: "maintenance".to_string(),
            }));
        }
        let records = self.records.lock().unwrap();
        let withheld = self.withheld_ids.lock().unwrap();
        // Remote order is not request order.
        Ok(ids
            .iter()
            .rev()
            .filter(|id| !withheld.contains(id))
            .filter_map(|id| records.get(id).cloned())
            .collect())
    }
}

fn pipeline(remote: Arc<FakeRemote>, store: Arc<MemoryJobStore>, options: RunOptions) -> SyncPipeline {
    SyncPipeline::new(
        remote,
        store,
        Credentials::new("recruiter", "secret", "api-key"),
        options,
    )
    .unwrap()
}

fn default_pipeline(remote: &Arc<FakeRemote>, store: &Arc<MemoryJobStore>) -> SyncPipeline {
    pipeline(Arc::clone(remote), Arc::clone(store), RunOptions::default())
}

async fn listing_for(store: &MemoryJobStore, external_id: ExternalId) -> Option<LocalJobListing> {
    store.get_by_external_id(external_id).await.unwrap()
}

#[tokio::test]
async fn second_run_with_unchanged_remote_is_a_no_op() {
    let remote = Arc::new(FakeRemote::with_records(vec![
        job_order(101, "California", "Contract"),
        job_order(102, "Oregon", "Permanent"),
        job_order(103, "California", "Contract"),
    ]));
    let store = Arc::new(MemoryJobStore::new());
    let pipeline = default_pipeline(&remote, &store);

    let first = pipeline.run_sync().await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.counts.inserted, 3);
    let after_first = store.snapshot().await;

    let second = pipeline.run_sync().await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.counts.unchanged, 3);
    assert_eq!(second.counts.inserted + second.counts.updated, 0);
    assert_eq!(store.snapshot().await, after_first);

    assert_eq!(after_first.listings.len(), 3);
    assert_eq!(after_first.terms.len(), 4);
}

#[tokio::test]
async fn forty_five_ids_are_fetched_in_three_chunks() {
    let records = (1..=45).map(|id| job_order(id, "Texas", "Contract")).collect();
    let remote = Arc::new(FakeRemote::with_records(records));
    let store = Arc::new(MemoryJobStore::new());

    let report = default_pipeline(&remote, &store).run_sync().await.unwrap();
    assert_eq!(report.counts.listed, 45);
    assert_eq!(report.counts.fetched, 45);
    assert_eq!(report.counts.inserted, 45);

    let calls = remote.find_calls();
    assert_eq!(calls.iter().map(Vec::len).collect::<Vec<_>>(), vec![20, 20, 5]);
    let fetched: BTreeSet<_> = calls.into_iter().flatten().collect();
    assert_eq!(fetched, (1..=45).collect::<BTreeSet<_>>());
}

#[tokio::test]
async fn concurrent_fetch_keeps_every_record() {
    let records = (1..=7).map(|id| job_order(id, "Utah", "Temp")).collect();
    let remote = Arc::new(FakeRemote::with_records(records));
    let store = Arc::new(MemoryJobStore::new());
    let options = RunOptions {
        chunk_size: 2,
        fetch_concurrency: 3,
        ..RunOptions::default()
    };

    let report = pipeline(Arc::clone(&remote), Arc::clone(&store), options)
        .run_sync()
        .await
        .unwrap();
    assert_eq!(report.counts.inserted, 7);
    assert_eq!(remote.find_calls().len(), 4);
}

#[tokio::test]
async fn unparsable_start_date_fails_only_that_record() {
    let mut bad = job_order(102, "Nevada", "Contract");
    bad["startDate"] = json!("soon");
    let remote = Arc::new(FakeRemote::with_records(vec![
        job_order(101, "California", "Contract"),
        bad,
        job_order(103, "California", "Permanent"),
    ]));
    let store = Arc::new(MemoryJobStore::new());

    let report = default_pipeline(&remote, &store).run_sync().await.unwrap();
    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert!(!report.is_clean());
    assert_eq!(report.counts.inserted, 2);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].external_id, 102);
    assert_eq!(report.failures[0].kind, FailureKind::MappingError);
    assert_eq!(
        report.failures[0].reason,
        "MappingError: field `startDate` has unparsable date `soon`"
    );

    assert!(listing_for(&store, 102).await.is_none());
    let snapshot = store.snapshot().await;
    let california = snapshot
        .term_id(TaxonomyNamespace::Region, "California")
        .unwrap();
    for id in [101, 103] {
        let listing = listing_for(&store, id).await.unwrap();
        let terms = store.term_associations(listing.local_id).await.unwrap();
        assert_eq!(terms[&TaxonomyNamespace::Region], california);
        assert!(terms.contains_key(&TaxonomyNamespace::EmploymentType));
        let metadata = store.metadata(listing.local_id).await.unwrap();
        assert_eq!(metadata["_job_address_state"], "California");
        assert_eq!(metadata["_job_jobOrderID"], id.to_string());
    }
    assert!(snapshot.term_id(TaxonomyNamespace::Region, "Nevada").is_none());
}

#[tokio::test]
async fn listing_dropped_from_open_set_is_left_untouched() {
    let remote = Arc::new(FakeRemote::with_records(vec![
        job_order(101, "Ohio", "Contract"),
        job_order(102, "Ohio", "Contract"),
    ]));
    let store = Arc::new(MemoryJobStore::new());
    let pipeline = default_pipeline(&remote, &store);
    pipeline.run_sync().await.unwrap();
    let before = listing_for(&store, 101).await.unwrap();

    let mut edited = job_order(101, "Ohio", "Contract");
    edited["title"] = json!("Renamed while closed");
    remote.put(edited);
    remote.close(101);

    let report = pipeline.run_sync().await.unwrap();
    assert_eq!(report.counts.listed, 1);
    assert_eq!(report.counts.unchanged, 1);
    assert_eq!(listing_for(&store, 101).await.unwrap(), before);
}

#[tokio::test]
async fn changed_remote_record_updates_in_place() {
    let remote = Arc::new(FakeRemote::with_records(vec![job_order(7, "Maine", "Contract")]));
    let store = Arc::new(MemoryJobStore::new());
    let pipeline = default_pipeline(&remote, &store);
    pipeline.run_sync().await.unwrap();
    let local_id = listing_for(&store, 7).await.unwrap().local_id;

    remote.put(job_order(7, "Vermont", "  "));
    let report = pipeline.run_sync().await.unwrap();
    assert_eq!(report.counts.updated, 1);

    let listing = listing_for(&store, 7).await.unwrap();
    assert_eq!(listing.local_id, local_id);
    let terms = store.term_associations(local_id).await.unwrap();
    let vermont = store
        .find_term("Vermont", TaxonomyNamespace::Region)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(terms.get(&TaxonomyNamespace::Region), Some(&vermont));
    assert!(!terms.contains_key(&TaxonomyNamespace::EmploymentType));
}

#[tokio::test]
async fn isolate_policy_marks_failed_chunk_and_continues() {
    let records = (1..=5).map(|id| job_order(id, "Iowa", "Contract")).collect();
    let remote = Arc::new(FakeRemote::with_records(records));
    remote.failing_ids.lock().unwrap().insert(3);
    let store = Arc::new(MemoryJobStore::new());
    let options = RunOptions {
        chunk_size: 2,
        fetch_failure_policy: FetchFailurePolicy::Isolate,
        ..RunOptions::default()
    };

    let report = pipeline(Arc::clone(&remote), Arc::clone(&store), options)
        .run_sync()
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert_eq!(report.counts.inserted, 3);
    assert_eq!(report.counts.fetched, 3);
    let failed: Vec<_> = report.failures.iter().map(|f| (f.external_id, f.kind)).collect();
    assert_eq!(
        failed,
        vec![(3, FailureKind::FetchError), (4, FailureKind::FetchError)]
    );
    assert!(report.failures[0].reason.starts_with("FetchError: "));
    assert!(listing_for(&store, 5).await.is_some());
}

#[tokio::test]
async fn abort_policy_stops_at_first_failed_chunk() {
    let records = (1..=5).map(|id| job_order(id, "Iowa", "Contract")).collect();
    let remote = Arc::new(FakeRemote::with_records(records));
    remote.failing_ids.lock().unwrap().insert(3);
    let store = Arc::new(MemoryJobStore::new());
    let options = RunOptions {
        chunk_size: 2,
        fetch_failure_policy: FetchFailurePolicy::Abort,
        ..RunOptions::default()
    };

    let err = pipeline(Arc::clone(&remote), Arc::clone(&store), options)
        .run_sync()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Fetch(_)));
    assert_eq!(store.snapshot().await.listings.len(), 2);
    assert_eq!(remote.find_calls().len(), 2);
}

#[tokio::test]
async fn record_missing_from_response_is_a_fetch_failure() {
    let remote = Arc::new(FakeRemote::with_records(vec![
        job_order(1, "Idaho", "Contract"),
        job_order(2, "Idaho", "Contract"),
    ]));
    remote.withheld_ids.lock().unwrap().insert(2);
    let store = Arc::new(MemoryJobStore::new());

    let report = default_pipeline(&remote, &store).run_sync().await.unwrap();
    assert_eq!(report.counts.fetched, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].external_id, 2);
    assert_eq!(
        report.failures[0].reason,
        "FetchError: record missing or undecodable in find-multiple response"
    );
}

#[tokio::test]
async fn duplicate_local_listings_resolve_to_lowest_local_id() {
    let store = Arc::new(MemoryJobStore::new());
    let seeded = |title: &str| ListingDraft {
        external_id: 7,
        title: title.to_string(),
        body: String::new(),
        published_at: Utc::now(),
        status: jobsync_core::ListingStatus::Publish,
    };
    let lowest = store.seed_listing(&seeded("first copy")).await;
    let other = store.seed_listing(&seeded("second copy")).await;

    let remote = Arc::new(FakeRemote::with_records(vec![job_order(7, "Kansas", "Contract")]));
    let report = default_pipeline(&remote, &store).run_sync().await.unwrap();
    assert_eq!(report.counts.updated, 1);

    let snapshot = store.snapshot().await;
    assert_eq!(snapshot.listings[&lowest].title, "Job 7");
    assert_eq!(snapshot.listings[&other].title, "second copy");
}

#[tokio::test]
async fn closed_record_in_payload_is_still_synced() {
    let mut closed = job_order(55, "Alaska", "Contract");
    closed["isOpen"] = json!(false);
    let remote = Arc::new(FakeRemote::with_records(vec![closed]));
    let store = Arc::new(MemoryJobStore::new());

    let report = default_pipeline(&remote, &store).run_sync().await.unwrap();
    assert_eq!(report.counts.inserted, 1);
    assert!(report.is_clean());
}

#[tokio::test]
async fn cancellation_stops_between_records() {
    let token = CancellationToken::new();
    let records = (1..=4).map(|id| job_order(id, "Maine", "Contract")).collect::<Vec<_>>();
    let mut remote = FakeRemote::with_records(records);
    remote.cancel_on_find_call = Some((2, token.clone()));
    let remote = Arc::new(remote);
    let store = Arc::new(MemoryJobStore::new());
    let options = RunOptions {
        chunk_size: 2,
        ..RunOptions::default()
    };

    let report = pipeline(Arc::clone(&remote), Arc::clone(&store), options)
        .with_cancellation(token)
        .run_sync()
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(!report.is_clean());
    assert_eq!(report.counts.inserted, 2);
    assert!(listing_for(&store, 3).await.is_none());
    assert!(listing_for(&store, 4).await.is_none());
}

#[tokio::test]
async fn rejected_credentials_are_fatal() {
    let remote = Arc::new(FakeRemote {
        reject_auth: true,
        ..FakeRemote::default()
    });
    let store = Arc::new(MemoryJobStore::new());
    let err = default_pipeline(&remote, &store).run_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(AuthError::Rejected(_))));
    assert!(remote.find_calls().is_empty());
}

#[tokio::test]
async fn failed_identifier_query_is_fatal() {
    let remote = Arc::new(FakeRemote {
        fail_query: true,
        ..FakeRemote::default()
    });
    remote.put(job_order(1, "Ohio", "Contract"));
    let store = Arc::new(MemoryJobStore::new());
    let err = default_pipeline(&remote, &store).run_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Query(_)));
    assert!(store.snapshot().await.listings.is_empty());
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let remote = Arc::new(FakeRemote::default());
    let store = Arc::new(MemoryJobStore::new());
    let result = SyncPipeline::new(
        remote,
        store,
        Credentials::new("u", "p", "k"),
        RunOptions {
            chunk_size: 25,
            ..RunOptions::default()
        },
    );
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[tokio::test]
async fn report_is_written_under_reports_root() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(FakeRemote::with_records(vec![job_order(1, "Ohio", "Contract")]));
    let store = Arc::new(MemoryJobStore::new());
    let report = default_pipeline(&remote, &store)
        .with_reports_root(dir.path())
        .run_sync()
        .await
        .unwrap();

    assert_eq!(latest_report(dir.path()).unwrap(), Some(report));
}

/// Memory store whose `find_term` fails a set number of times before behaving.
struct FlakyTermStore {
    inner: MemoryJobStore,
    failures_left: AtomicUsize,
}

impl FlakyTermStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ListingStore for FlakyTermStore {
    async fn find_by_external_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Vec<LocalJobListing>, StoreError> {
        self.inner.find_by_external_id(external_id).await
    }

    async fn insert(&self, draft: &ListingDraft) -> Result<LocalId, StoreError> {
        self.inner.insert(draft).await
    }

    async fn update(&self, local_id: LocalId, draft: &ListingDraft) -> Result<(), StoreError> {
        self.inner.update(local_id, draft).await
    }

    async fn set_metadata(&self, local_id: LocalId, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set_metadata(local_id, key, value).await
    }

    async fn metadata(&self, local_id: LocalId) -> Result<MetadataMap, StoreError> {
        self.inner.metadata(local_id).await
    }

    async fn set_fingerprint(&self, local_id: LocalId, fingerprint: &str) -> Result<(), StoreError> {
        self.inner.set_fingerprint(local_id, fingerprint).await
    }
}

#[async_trait]
impl TaxonomyStore for FlakyTermStore {
    async fn find_term(
        &self,
        name: &str,
        namespace: TaxonomyNamespace,
    ) -> Result<Option<TermId>, StoreError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Corrupt("connection reset".to_string()));
        }
        self.inner.find_term(name, namespace).await
    }

    async fn create_term(&self, name: &str, namespace: TaxonomyNamespace) -> Result<(), StoreError> {
        self.inner.create_term(name, namespace).await
    }

    async fn set_term_association(
        &self,
        local_id: LocalId,
        namespace: TaxonomyNamespace,
        term_id: TermId,
    ) -> Result<(), StoreError> {
        self.inner.set_term_association(local_id, namespace, term_id).await
    }

    async fn clear_term_association(
        &self,
        local_id: LocalId,
        namespace: TaxonomyNamespace,
    ) -> Result<(), StoreError> {
        self.inner.clear_term_association(local_id, namespace).await
    }

    async fn term_associations(
        &self,
        local_id: LocalId,
    ) -> Result<BTreeMap<TaxonomyNamespace, TermId>, StoreError> {
        self.inner.term_associations(local_id).await
    }
}

#[tokio::test]
async fn transient_term_failure_is_retried_once() {
    let remote = Arc::new(FakeRemote::with_records(vec![job_order(1, "Ohio", "  ")]));
    let store = Arc::new(FlakyTermStore::new(1));
    let pipeline = SyncPipeline::new(
        remote,
        Arc::clone(&store) as Arc<dyn jobsync_store::JobStore>,
        Credentials::new("u", "p", "k"),
        RunOptions::default(),
    )
    .unwrap();

    let report = pipeline.run_sync().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.counts.inserted, 1);
}

#[tokio::test]
async fn persistent_term_failure_becomes_resolution_error() {
    let mut no_region = job_order(2, "", "  ");
    no_region.as_object_mut().unwrap().remove("address");
    let remote = Arc::new(FakeRemote::with_records(vec![
        job_order(1, "Ohio", "  "),
        no_region,
    ]));
    let store = Arc::new(FlakyTermStore::new(2));
    let pipeline = SyncPipeline::new(
        remote,
        Arc::clone(&store) as Arc<dyn jobsync_store::JobStore>,
        Credentials::new("u", "p", "k"),
        RunOptions::default(),
    )
    .unwrap();

    let report = pipeline.run_sync().await.unwrap();
    assert_eq!(report.status, RunStatus::CompletedWithFailures);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].external_id, 1);
    assert_eq!(report.failures[0].kind, FailureKind::ResolutionError);
    assert_eq!(report.counts.inserted, 1);
    assert!(store.inner.get_by_external_id(2).await.unwrap().is_some());
}
