use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsync_core::{
    ExternalId, ListingDraft, ListingStatus, LocalId, LocalJobListing, MetadataMap,
    TaxonomyNamespace, TermId,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::{ListingStore, StoreError, TaxonomyStore};

/// Postgres-backed store over the `job_listings` family of tables.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct ListingRow {
    id: i64,
    external_id: i64,
    title: String,
    body: String,
    published_at: DateTime<Utc>,
    status: String,
    fingerprint: Option<String>,
}

impl TryFrom<ListingRow> for LocalJobListing {
    type Error = StoreError;

    fn try_from(row: ListingRow) -> Result<Self, Self::Error> {
        let status = ListingStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("listing {} has unknown status `{}`", row.id, row.status))
        })?;
        Ok(Self {
            local_id: row.id,
            external_id: row.external_id,
            title: row.title,
            body: row.body,
            published_at: row.published_at,
            status,
            fingerprint: row.fingerprint,
        })
    }
}

impl PgJobStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to job listing database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying job listing migrations")?;
        info!("job listing migrations applied");
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PgJobStore {
    async fn find_by_external_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Vec<LocalJobListing>, StoreError> {
        let rows = sqlx::query_as::<_, ListingRow>(
            "SELECT id, external_id, title, body, published_at, status, fingerprint
             FROM job_listings WHERE external_id = $1 ORDER BY id ASC",
        )
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LocalJobListing::try_from).collect()
    }

    async fn insert(&self, draft: &ListingDraft) -> Result<LocalId, StoreError> {
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO job_listings (external_id, title, body, published_at, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(draft.external_id)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(draft.published_at)
        .bind(draft.status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let (local_id,) = inserted.ok_or(StoreError::DuplicateExternalId(draft.external_id))?;
        debug!(external_id = draft.external_id, local_id, "listing inserted");
        Ok(local_id)
    }

    async fn update(&self, local_id: LocalId, draft: &ListingDraft) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_listings
            SET title = $2, body = $3, published_at = $4, status = $5,
                fingerprint = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(local_id)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(draft.published_at)
        .bind(draft.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ListingNotFound(local_id));
        }
        Ok(())
    }

    async fn set_metadata(
        &self,
        local_id: LocalId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_listing_meta (listing_id, meta_key, meta_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (listing_id, meta_key) DO UPDATE SET meta_value = EXCLUDED.meta_value
            "#,
        )
        .bind(local_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|err| missing_listing(err, local_id))?;
        Ok(())
    }

    async fn metadata(&self, local_id: LocalId) -> Result<MetadataMap, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT meta_key, meta_value FROM job_listing_meta WHERE listing_id = $1",
        )
        .bind(local_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn set_fingerprint(
        &self,
        local_id: LocalId,
        fingerprint: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE job_listings SET fingerprint = $2 WHERE id = $1")
            .bind(local_id)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ListingNotFound(local_id));
        }
        Ok(())
    }
}

#[async_trait]
impl TaxonomyStore for PgJobStore {
    async fn find_term(
        &self,
        name: &str,
        namespace: TaxonomyNamespace,
    ) -> Result<Option<TermId>, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM taxonomy_terms WHERE namespace = $1 AND name = $2")
                .bind(namespace.as_str())
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn create_term(&self, name: &str, namespace: TaxonomyNamespace) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO taxonomy_terms (namespace, name) VALUES ($1, $2)
             ON CONFLICT (namespace, name) DO NOTHING",
        )
        .bind(namespace.as_str())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_term_association(
        &self,
        local_id: LocalId,
        namespace: TaxonomyNamespace,
        term_id: TermId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_terms (listing_id, namespace, term_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (listing_id, namespace) DO UPDATE SET term_id = EXCLUDED.term_id
            "#,
        )
        .bind(local_id)
        .bind(namespace.as_str())
        .bind(term_id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if violated_constraint(&err) == Some("listing_terms_term_id_fkey") {
                StoreError::TermNotFound(term_id)
            } else {
                missing_listing(err, local_id)
            }
        })?;
        Ok(())
    }

    async fn clear_term_association(
        &self,
        local_id: LocalId,
        namespace: TaxonomyNamespace,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM listing_terms WHERE listing_id = $1 AND namespace = $2")
            .bind(local_id)
            .bind(namespace.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn term_associations(
        &self,
        local_id: LocalId,
    ) -> Result<BTreeMap<TaxonomyNamespace, TermId>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT namespace, term_id FROM listing_terms WHERE listing_id = $1")
                .bind(local_id)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(namespace, term_id)| {
                TaxonomyNamespace::parse(&namespace)
                    .map(|ns| (ns, term_id))
                    .ok_or_else(|| {
                        StoreError::Corrupt(format!(
                            "listing {local_id} associated with unknown namespace `{namespace}`"
                        ))
                    })
            })
            .collect()
    }
}

fn violated_constraint(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) => db.constraint(),
        _ => None,
    }
}

/// Foreign-key violations on listing-scoped tables mean the listing row is gone.
fn missing_listing(err: sqlx::Error, local_id: LocalId) -> StoreError {
    let is_fk_violation = matches!(&err, sqlx::Error::Database(db) if db.is_foreign_key_violation());
    if is_fk_violation {
        StoreError::ListingNotFound(local_id)
    } else {
        StoreError::Database(err)
    }
}
