use std::collections::HashMap;

use jobsync_core::{TaxonomyNamespace, TermId};
use jobsync_store::{StoreError, TaxonomyStore};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("store failed resolving {namespace} term `{name}`: {source}")]
    Store {
        namespace: TaxonomyNamespace,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("{namespace} term `{name}` was created but cannot be found")]
    Vanished {
        namespace: TaxonomyNamespace,
        name: String,
    },
}

/// Get-or-create for taxonomy terms, memoized for the life of one run.
#[derive(Debug, Default)]
pub struct TaxonomyResolver {
    cache: HashMap<(TaxonomyNamespace, String), TermId>,
}

impl TaxonomyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Look the term up by exact name, creating it when absent. A failed attempt is
    /// retried once before the error is surfaced.
    pub async fn resolve<S>(
        &mut self,
        store: &S,
        namespace: TaxonomyNamespace,
        name: &str,
    ) -> Result<TermId, ResolutionError>
    where
        S: TaxonomyStore + ?Sized,
    {
        let key = (namespace, name.to_string());
        if let Some(id) = self.cache.get(&key) {
            return Ok(*id);
        }

        let term_id = match lookup_or_create(store, namespace, name).await {
            Ok(id) => id,
            Err(err) => {
                warn!(%namespace, name, error = %err, "term resolution failed; retrying once");
                lookup_or_create(store, namespace, name).await?
            }
        };
        self.cache.insert(key, term_id);
        Ok(term_id)
    }
}

async fn lookup_or_create<S>(
    store: &S,
    namespace: TaxonomyNamespace,
    name: &str,
) -> Result<TermId, ResolutionError>
where
    S: TaxonomyStore + ?Sized,
{
    let store_err = |source| ResolutionError::Store {
        namespace,
        name: name.to_string(),
        source,
    };

    if let Some(id) = store.find_term(name, namespace).await.map_err(store_err)? {
        return Ok(id);
    }

    store.create_term(name, namespace).await.map_err(store_err)?;
    debug!(%namespace, name, "taxonomy term created");

    store
        .find_term(name, namespace)
        .await
        .map_err(store_err)?
        .ok_or_else(|| ResolutionError::Vanished {
            namespace,
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsync_store::MemoryJobStore;

    #[tokio::test]
    async fn same_name_resolves_to_one_row() {
        let store = MemoryJobStore::new();
        let mut resolver = TaxonomyResolver::new();
        let first = resolver
            .resolve(&store, TaxonomyNamespace::Region, "California")
            .await
            .unwrap();

        let mut fresh = TaxonomyResolver::new();
        let second = fresh
            .resolve(&store, TaxonomyNamespace::Region, "California")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.snapshot().await.terms.len(), 1);
    }

    #[tokio::test]
    async fn namespaces_are_independent() {
        let store = MemoryJobStore::new();
        let mut resolver = TaxonomyResolver::new();
        let region = resolver
            .resolve(&store, TaxonomyNamespace::Region, "Contract")
            .await
            .unwrap();
        let kind = resolver
            .resolve(&store, TaxonomyNamespace::EmploymentType, "Contract")
            .await
            .unwrap();
        assert_ne!(region, kind);
        assert_eq!(resolver.cached(), 2);
    }

    #[tokio::test]
    async fn existing_term_is_found_without_create() {
        let store = MemoryJobStore::new();
        store
            .create_term("Temp", TaxonomyNamespace::EmploymentType)
            .await
            .unwrap();
        let existing = store
            .find_term("Temp", TaxonomyNamespace::EmploymentType)
            .await
            .unwrap();

        let mut resolver = TaxonomyResolver::new();
        let resolved = resolver
            .resolve(&store, TaxonomyNamespace::EmploymentType, "Temp")
            .await
            .unwrap();
        assert_eq!(Some(resolved), existing);
        assert_eq!(store.snapshot().await.terms.len(), 1);
    }
}
