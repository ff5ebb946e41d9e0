//! Job order sync pipeline: session, listing, chunked fetch, mapping, taxonomy, upsert.

use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use jobsync_core::{
    Credentials, EntityKind, ExternalId, FailureKind, QueryFilter, RecordFailure, RunStatus,
    SyncCounts, SyncReport, TaxonomyNamespace,
};
use jobsync_mapper::{decode_job_order, map_record};
use jobsync_remote::{AuthError, FetchError, HttpRemoteClient, QueryError, RemoteApi};
use jobsync_store::{JobStore, PgJobStore};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod fetch;
mod report;
mod resolver;
mod upsert;

pub use config::{ConfigError, FetchFailurePolicy, SyncConfig, CONFIG_FILE_NAME};
pub use fetch::{authenticate, list_identifiers, rekey, BatchFetcher, FetchedChunk, RekeyedChunk};
pub use report::{latest_report, render_summary_markdown, write_report};
pub use resolver::{ResolutionError, TaxonomyResolver};
pub use upsert::{content_fingerprint, upsert_listing, ResolvedTerms, UpsertOutcome};

pub const CRATE_NAME: &str = "jobsync-sync";

const MISSING_FROM_RESPONSE: &str = "record missing or undecodable in find-multiple response";

/// Errors that end a run before a report can be produced.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("run aborted on failed chunk: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Knobs that shape a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub chunk_size: usize,
    pub fetch_concurrency: usize,
    pub fetch_failure_policy: FetchFailurePolicy,
    pub run_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            chunk_size: jobsync_remote::MAX_FIND_MULTIPLE,
            fetch_concurrency: 1,
            fetch_failure_policy: FetchFailurePolicy::Isolate,
            run_timeout: None,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        SyncConfig {
            chunk_size: self.chunk_size,
            fetch_concurrency: self.fetch_concurrency,
            ..SyncConfig::default()
        }
        .validate()
    }
}

impl From<&SyncConfig> for RunOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            fetch_concurrency: config.fetch_concurrency,
            fetch_failure_policy: config.fetch_failure_policy,
            run_timeout: config.run_timeout(),
        }
    }
}

#[derive(Debug, Default)]
struct RunTally {
    counts: SyncCounts,
    failures: Vec<RecordFailure>,
}

impl RunTally {
    fn fail(&mut self, failure: RecordFailure) {
        warn!(
            external_id = failure.external_id,
            kind = failure.kind.as_str(),
            reason = %failure.reason,
            "record failed"
        );
        self.counts.failed += 1;
        self.failures.push(failure);
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted(_) => self.counts.inserted += 1,
            UpsertOutcome::Updated(_) => self.counts.updated += 1,
            UpsertOutcome::Unchanged(_) => self.counts.unchanged += 1,
        }
    }
}

pub struct SyncPipeline {
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn JobStore>,
    credentials: Credentials,
    options: RunOptions,
    filter: QueryFilter,
    reports_root: Option<PathBuf>,
    schedule: Option<String>,
    cancel: CancellationToken,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        store: Arc<dyn JobStore>,
        credentials: Credentials,
        options: RunOptions,
    ) -> Result<Self, SyncError> {
        options.validate()?;
        Ok(Self {
            remote,
            store,
            credentials,
            options,
            filter: QueryFilter::open(),
            reports_root: None,
            schedule: None,
            cancel: CancellationToken::new(),
            run_lock: Mutex::new(()),
        })
    }

    /// Pipeline over an explicit store, with remote client, reports and schedule from `config`.
    pub fn with_store(config: &SyncConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        let remote = HttpRemoteClient::new(config.remote_client_config())?;
        let mut pipeline = Self::new(
            Arc::new(remote),
            store,
            config.credentials.clone(),
            RunOptions::from(config),
        )?
        .with_reports_root(config.reports_root());
        if config.scheduler_enabled {
            pipeline.schedule = Some(config.sync_cron.clone());
        }
        Ok(pipeline)
    }

    /// Pipeline over the Postgres store named by `config.database_url`.
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let store = PgJobStore::connect(&config.database_url, 5).await?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_reports_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.reports_root = Some(root.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn reports_root(&self) -> Option<&PathBuf> {
        self.reports_root.as_ref()
    }

    /// Run one full pass. Concurrent callers wait for the run in progress to finish.
    pub async fn run_sync(&self) -> Result<SyncReport, SyncError> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        let report = self.run_inner(run_id).instrument(span).await?;

        if let Some(root) = &self.reports_root {
            match write_report(root, &report).await {
                Ok(dir) => info!(run_id = %report.run_id, dir = %dir.display(), "sync report written"),
                Err(err) => warn!(run_id = %report.run_id, error = %err, "could not write sync report"),
            }
        }
        Ok(report)
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let deadline = self.options.run_timeout.map(|timeout| Instant::now() + timeout);
        let entity = EntityKind::JobOrder;

        let session = authenticate(self.remote.as_ref(), &self.credentials).await?;
        let ids = list_identifiers(self.remote.as_ref(), &session, entity, &self.filter).await?;

        let mut tally = RunTally::default();
        tally.counts.listed = ids.len();

        let fetcher = BatchFetcher::new(self.options.chunk_size, self.options.fetch_concurrency);
        info!(
            chunks = fetcher.chunk_count(ids.len()),
            chunk_size = fetcher.chunk_size(),
            "fetching job orders"
        );
        let mut chunks = pin!(fetcher.fetch(self.remote.as_ref(), &session, entity, &ids));
        let mut resolver = TaxonomyResolver::new();
        let mut cancelled = false;

        'chunks: loop {
            if self.should_stop(deadline) {
                cancelled = true;
                break;
            }
            let Some(chunk) = chunks.next().await else {
                break;
            };

            let payloads = match chunk.outcome {
                Ok(payloads) => payloads,
                Err(err) => match self.options.fetch_failure_policy {
                    FetchFailurePolicy::Abort => {
                        error!(chunk = chunk.index, error = %err, "chunk fetch failed; aborting run");
                        return Err(SyncError::Fetch(err));
                    }
                    FetchFailurePolicy::Isolate => {
                        warn!(chunk = chunk.index, error = %err, "chunk fetch failed; isolating its records");
                        for id in chunk.requested {
                            tally.fail(RecordFailure::new(id, FailureKind::FetchError, &err));
                        }
                        continue;
                    }
                },
            };

            let rekeyed = rekey(&chunk.requested, payloads);
            tally.counts.fetched += rekeyed.records.len();
            for id in rekeyed.missing {
                tally.fail(RecordFailure::new(id, FailureKind::FetchError, MISSING_FROM_RESPONSE));
            }

            for (external_id, payload) in rekeyed.records {
                if self.should_stop(deadline) {
                    cancelled = true;
                    break 'chunks;
                }
                match self.apply_record(&mut resolver, external_id, &payload).await {
                    Ok(outcome) => tally.record(outcome),
                    Err(failure) => tally.fail(failure),
                }
            }
        }

        let status = if cancelled {
            warn!("sync run cancelled; remaining identifiers left unsynced");
            RunStatus::Cancelled
        } else if tally.failures.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithFailures
        };

        let report = SyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            counts: tally.counts,
            failures: tally.failures,
        };
        info!(summary = %report.summary_line(), "sync run finished");
        Ok(report)
    }

    fn should_stop(&self, deadline: Option<Instant>) -> bool {
        self.cancel.is_cancelled() || deadline.is_some_and(|at| Instant::now() >= at)
    }

    async fn apply_record(
        &self,
        resolver: &mut TaxonomyResolver,
        external_id: ExternalId,
        payload: &JsonValue,
    ) -> Result<UpsertOutcome, RecordFailure> {
        let mapped = decode_job_order(payload)
            .and_then(|record| {
                if !record.is_open {
                    warn!(external_id, "remote reports job order as closed; syncing anyway");
                }
                map_record(&record)
            })
            .map_err(|err| RecordFailure::new(external_id, FailureKind::MappingError, err))?;

        let mut terms = ResolvedTerms::new();
        for namespace in TaxonomyNamespace::ALL {
            let term = match mapped.classification(namespace) {
                Some(name) => Some(
                    resolver
                        .resolve(self.store.as_ref(), namespace, name)
                        .await
                        .map_err(|err| {
                            RecordFailure::new(external_id, FailureKind::ResolutionError, err)
                        })?,
                ),
                None => None,
            };
            terms.insert(namespace, term);
        }

        upsert_listing(self.store.as_ref(), &mapped, &terms)
            .await
            .map_err(|err| RecordFailure::new(external_id, FailureKind::StoreError, err))
    }

    /// Scheduler that runs this pipeline on its cron expression, when scheduling is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        let Some(cron) = self.schedule.clone() else {
            return Ok(None);
        };

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_sync().await {
                    Ok(report) => info!(summary = %report.summary_line(), "scheduled sync finished"),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// One run against the Postgres store configured through the environment.
pub async fn run_sync_once_from_env() -> Result<SyncReport> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::connect(&config).await?;
    Ok(pipeline.run_sync().await?)
}
