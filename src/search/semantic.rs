use std::collections::HashMap;
use std::sync::Arc;

use super::{Cancellation, SearchPath, SearchResult, SearchStrategy};
use crate::catalog::{CatalogStore, SearchFilters};
use crate::errors::AppError;
use crate::semantic::{Embedder, VectorIndex};

/// Vector similarity search hydrated from the primary store.
pub struct SemanticStrategy {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    catalog: Arc<dyn CatalogStore>,
}

impl SemanticStrategy {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            embedder,
            index,
            catalog,
        }
    }
}

/// Map cosine similarity from [-1, 1] onto [0, 1].
fn normalize_score(cosine: f32) -> f32 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

impl SearchStrategy for SemanticStrategy {
    fn path(&self) -> SearchPath {
        SearchPath::Semantic
    }

    /// Returns at most `window` hits in index order. Hits whose product is
    /// gone, inactive, or no longer passes `filters` are dropped.
    fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        window: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<SearchResult>, AppError> {
        let query_vector = self.embedder.embed(query)?;
        cancel.check()?;

        let hits = self.index.search(&query_vector, window, filters)?;
        cancel.check()?;

        if hits.is_empty() {
            return Ok(vec![]);
        }

        let skus: Vec<String> = hits.iter().map(|h| h.sku.clone()).collect();
        let mut products: HashMap<String, _> = self
            .catalog
            .fetch_by_skus(&skus)?
            .into_iter()
            .map(|p| (p.sku.clone(), p))
            .collect();
        cancel.check()?;

        let results: Vec<SearchResult> = hits
            .into_iter()
            .filter_map(|hit| {
                let product = products.remove(&hit.sku)?;
                if !filters.matches(&product) {
                    return None;
                }
                Some(SearchResult {
                    product,
                    score: normalize_score(hit.score),
                    highlights: vec![],
                })
            })
            .collect();

        let stale = skus.len() - results.len();
        if stale > 0 {
            log::debug!("dropped {stale} stale vector hits for query {query:?}");
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_score() {
        assert_eq!(normalize_score(1.0), 1.0);
        assert_eq!(normalize_score(-1.0), 0.0);
        assert_eq!(normalize_score(0.0), 0.5);
    }
}
