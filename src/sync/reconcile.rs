use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogError, CatalogStore};
use crate::semantic::{IndexError, VectorIndex};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub active: usize,
    pub indexed: usize,
    pub deleted: Vec<String>,
    /// SKUs whose delete failed; they are picked up by the next run
    pub failed: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("vector index: {0}")]
    Index(#[from] IndexError),
}

/// Delete vectors whose SKU is no longer active in the catalog.
///
/// The active set is read before the index is enumerated: a product that
/// becomes active and gets embedded in between is then never swept.
pub fn reconcile(
    catalog: &dyn CatalogStore,
    index: &dyn VectorIndex,
) -> Result<ReconcileReport, ReconcileError> {
    let active = catalog.active_skus()?;
    let keys = index.all_keys()?;

    let mut orphans: Vec<String> = keys.difference(&active).cloned().collect();
    orphans.sort();

    let mut report = ReconcileReport {
        active: active.len(),
        indexed: keys.len(),
        ..Default::default()
    };

    for sku in orphans {
        match index.delete(&sku) {
            Ok(()) => report.deleted.push(sku),
            Err(err) => {
                log::warn!("failed to delete vector for {sku}: {err}");
                report.failed.push(sku);
            }
        }
    }

    if let Err(err) = index.flush() {
        log::warn!("failed to flush vector index after reconcile: {err}");
    }

    log::info!(
        "reconcile: {} active, {} indexed, {} deleted, {} failed",
        report.active,
        report.indexed,
        report.deleted.len(),
        report.failed.len()
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, ProductUpsert, SearchFilters};
    use crate::semantic::{MemoryVectorIndex, ProductPayload, ScoredSku};
    use std::collections::HashSet;

    fn upsert(catalog: &MemoryCatalog, sku: &str, active: bool) {
        catalog
            .upsert_products(vec![ProductUpsert {
                sku: sku.into(),
                name: sku.into(),
                price: 1.0,
                is_active: active,
                ..Default::default()
            }])
            .unwrap();
    }

    fn payload(sku: &str) -> ProductPayload {
        ProductPayload {
            sku: sku.into(),
            name: sku.into(),
            price: 1.0,
            category_ids: vec![],
        }
    }

    #[test]
    fn test_deletes_only_inactive_and_missing() {
        let catalog = MemoryCatalog::new();
        upsert(&catalog, "A", true);
        upsert(&catalog, "B", true);
        upsert(&catalog, "C", false);

        let index = MemoryVectorIndex::new(2);
        for sku in ["A", "B", "C", "D"] {
            index.upsert(vec![1.0, 0.0], payload(sku)).unwrap();
        }

        let report = reconcile(&catalog, &index).unwrap();
        assert_eq!(report.deleted, vec!["C", "D"]);
        assert!(report.failed.is_empty());
        assert_eq!(
            index.all_keys().unwrap(),
            HashSet::from(["A".to_string(), "B".to_string()])
        );

        let again = reconcile(&catalog, &index).unwrap();
        assert!(again.deleted.is_empty());
    }

    struct FlakyIndex {
        inner: MemoryVectorIndex,
        refuse: &'static str,
    }

    impl VectorIndex for FlakyIndex {
        fn ensure_collection(&self) -> Result<(), IndexError> {
            Ok(())
        }
        fn upsert(&self, embedding: Vec<f32>, payload: ProductPayload) -> Result<(), IndexError> {
            self.inner.upsert(embedding, payload)
        }
        fn search(
            &self,
            query: &[f32],
            limit: usize,
            filters: &SearchFilters,
        ) -> Result<Vec<ScoredSku>, IndexError> {
            self.inner.search(query, limit, filters)
        }
        fn delete(&self, sku: &str) -> Result<(), IndexError> {
            if sku == self.refuse {
                return Err(IndexError::Unavailable("refused".into()));
            }
            self.inner.delete(sku)
        }
        fn all_keys(&self) -> Result<HashSet<String>, IndexError> {
            self.inner.all_keys()
        }
    }

    #[test]
    fn test_single_failure_does_not_stop_sweep() {
        let catalog = MemoryCatalog::new();
        upsert(&catalog, "A", true);

        let index = FlakyIndex {
            inner: MemoryVectorIndex::new(2),
            refuse: "X",
        };
        for sku in ["A", "X", "Y"] {
            index.upsert(vec![0.0, 1.0], payload(sku)).unwrap();
        }

        let report = reconcile(&catalog, &index).unwrap();
        assert_eq!(report.deleted, vec!["Y"]);
        assert_eq!(report.failed, vec!["X"]);
    }
}
