//! Hybrid product search.
//!
//! Queries go to the semantic strategy first. Any failure on that path, or
//! running past the configured budget, silently switches to the keyword
//! strategy. Only when both fail does the caller see an error.

mod keyword;
mod semantic;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc, Arc,
};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogStore, Category, Product, SearchFilters};
use crate::errors::AppError;

pub use keyword::KeywordStrategy;
pub use semantic::SemanticStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchPath {
    Semantic,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub product: Product,
    /// Relevance in [0, 1]; only comparable within one path
    pub score: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    /// Which strategy produced the results; absent for empty queries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<SearchPath>,
}

/// Cooperative cancellation flag shared with a running strategy.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Err once cancelled, so strategies can bail out between stages with `?`.
    pub fn check(&self) -> Result<(), AppError> {
        if self.is_cancelled() {
            return Err(AppError::VectorIndexTimeout("search cancelled".to_string()));
        }
        Ok(())
    }
}

pub trait SearchStrategy: Send + Sync {
    fn path(&self) -> SearchPath;

    /// Ordered hits for `query`. `window` is the number of leading hits the
    /// caller needs; strategies may return more.
    fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        window: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<SearchResult>, AppError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facets {
    pub price_range: PriceRange,
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionKind {
    Product,
    Category,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: SuggestionKind,
}

/// Semantic workers allowed to run at once, including ones abandoned after
/// a timeout. Past this the keyword path answers directly.
const MAX_SEMANTIC_WORKERS: usize = 32;

/// Counts a running semantic worker until dropped.
struct WorkerSlot(Arc<AtomicUsize>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct HybridSearchEngine {
    semantic: Option<Arc<dyn SearchStrategy>>,
    keyword: Arc<dyn SearchStrategy>,
    catalog: Arc<dyn CatalogStore>,
    semantic_timeout: Duration,
    max_page_size: usize,
    semantic_workers: Arc<AtomicUsize>,
    max_semantic_workers: usize,
}

impl HybridSearchEngine {
    /// `semantic: None` runs keyword-only.
    pub fn new(
        semantic: Option<Arc<dyn SearchStrategy>>,
        keyword: Arc<dyn SearchStrategy>,
        catalog: Arc<dyn CatalogStore>,
        semantic_timeout: Duration,
        max_page_size: usize,
    ) -> Self {
        Self {
            semantic,
            keyword,
            catalog,
            semantic_timeout,
            max_page_size: max_page_size.max(1),
            semantic_workers: Arc::new(AtomicUsize::new(0)),
            max_semantic_workers: MAX_SEMANTIC_WORKERS,
        }
    }

    /// One page of results. `page` is 1-based; both `page` and `page_size`
    /// are clamped into range.
    pub fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        page: usize,
        page_size: usize,
    ) -> Result<SearchPage, AppError> {
        filters.validate()?;

        let page = page.max(1);
        let page_size = page_size.clamp(1, self.max_page_size);

        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchPage {
                results: vec![],
                total: 0,
                page,
                page_size,
                path: None,
            });
        }

        let offset = (page - 1).saturating_mul(page_size);
        let window = offset.saturating_add(page_size);

        let (hits, path) = match &self.semantic {
            Some(strategy) => match self.run_semantic(strategy.clone(), query, filters, window) {
                Ok(hits) => (hits, strategy.path()),
                Err(err) => {
                    log::warn!("semantic search failed, falling back to keyword: {err}");
                    (self.run_keyword(query, filters, window)?, self.keyword.path())
                }
            },
            None => (self.run_keyword(query, filters, window)?, self.keyword.path()),
        };

        let total = hits.len();
        let results = hits.into_iter().skip(offset).take(page_size).collect();

        Ok(SearchPage {
            results,
            total,
            page,
            page_size,
            path: Some(path),
        })
    }

    /// Run the semantic strategy on its own thread, bounded by the timeout.
    fn run_semantic(
        &self,
        strategy: Arc<dyn SearchStrategy>,
        query: &str,
        filters: &SearchFilters,
        window: usize,
    ) -> Result<Vec<SearchResult>, AppError> {
        let running = self.semantic_workers.fetch_add(1, Ordering::SeqCst);
        let slot = WorkerSlot(self.semantic_workers.clone());
        if running >= self.max_semantic_workers {
            return Err(AppError::VectorIndexUnavailable(format!(
                "{running} semantic searches still running"
            )));
        }

        let (tx, rx) = mpsc::channel();
        let cancel = Cancellation::new();

        std::thread::spawn({
            let query = query.to_string();
            let filters = filters.clone();
            let cancel = cancel.clone();
            move || {
                let _slot = slot;
                let _ = tx.send(strategy.search(&query, &filters, window, &cancel));
            }
        });

        match rx.recv_timeout(self.semantic_timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                cancel.cancel();
                log::warn!(
                    "semantic search timed out, {} workers still running",
                    self.semantic_workers.load(Ordering::SeqCst)
                );
                Err(AppError::VectorIndexTimeout(format!(
                    "semantic path exceeded {}ms",
                    self.semantic_timeout.as_millis()
                )))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(AppError::VectorIndexUnavailable(
                "semantic search worker exited".to_string(),
            )),
        }
    }

    fn run_keyword(
        &self,
        query: &str,
        filters: &SearchFilters,
        window: usize,
    ) -> Result<Vec<SearchResult>, AppError> {
        self.keyword
            .search(query, filters, window, &Cancellation::new())
            .map_err(|err| {
                log::error!("keyword search failed: {err}");
                AppError::SearchUnavailable
            })
    }

    /// Price range of active products (optionally within one category) and
    /// the categories to offer next to it: the category's siblings, or all.
    pub fn filter_facets(&self, category_id: Option<u64>) -> Result<Facets, AppError> {
        let filters = SearchFilters {
            category_ids: category_id.into_iter().collect(),
            ..Default::default()
        };
        let products = self.catalog.list_active(&filters)?;

        let price_range = products
            .iter()
            .map(|p| p.price)
            .fold(None, |range: Option<PriceRange>, price| {
                Some(match range {
                    Some(r) => PriceRange {
                        min: r.min.min(price),
                        max: r.max.max(price),
                    },
                    None => PriceRange {
                        min: price,
                        max: price,
                    },
                })
            })
            .unwrap_or(PriceRange { min: 0.0, max: 0.0 });

        let categories = self.catalog.categories()?;
        let parent_id = category_id.and_then(|id| {
            categories
                .iter()
                .find(|c| c.id == id)
                .and_then(|c| c.parent_id)
        });
        let categories = match parent_id {
            Some(parent_id) => categories
                .into_iter()
                .filter(|c| c.parent_id == Some(parent_id))
                .collect(),
            None => categories,
        };

        Ok(Facets {
            price_range,
            categories,
        })
    }

    /// Product names, then category names, starting with `prefix` (case-insensitive).
    pub fn suggestions(&self, prefix: &str, limit: usize) -> Result<Vec<Suggestion>, AppError> {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let mut products = self.catalog.list_active(&SearchFilters::default())?;
        products.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.sku.cmp(&b.sku)));

        let mut suggestions: Vec<Suggestion> = Vec::new();
        for name in products.into_iter().map(|p| p.name) {
            if suggestions.len() >= limit {
                break;
            }
            if name.to_lowercase().starts_with(&prefix) && !suggestions.iter().any(|s| s.text == name) {
                suggestions.push(Suggestion {
                    text: name,
                    kind: SuggestionKind::Product,
                });
            }
        }

        suggestions.extend(
            self.catalog
                .categories()?
                .into_iter()
                .filter(|c| c.name.to_lowercase().starts_with(&prefix))
                .map(|c| Suggestion {
                    text: c.name,
                    kind: SuggestionKind::Category,
                }),
        );
        suggestions.truncate(limit);

        Ok(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, ProductUpsert};

    /// Semantic stand-in that blocks until the test releases it.
    struct BlockedStrategy(std::sync::Mutex<mpsc::Receiver<()>>);

    impl SearchStrategy for BlockedStrategy {
        fn path(&self) -> SearchPath {
            SearchPath::Semantic
        }
        fn search(
            &self,
            _: &str,
            _: &SearchFilters,
            _: usize,
            _: &Cancellation,
        ) -> Result<Vec<SearchResult>, AppError> {
            let rx = self.0.lock().map_err(|_| AppError::SearchUnavailable)?;
            let _ = rx.recv();
            Ok(vec![])
        }
    }

    #[test]
    fn test_abandoned_workers_are_bounded() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog
            .upsert_products(vec![ProductUpsert {
                sku: "MUG-1".into(),
                name: "Coffee mug".into(),
                price: 10.0,
                is_active: true,
                ..Default::default()
            }])
            .unwrap();

        let (release, blocked) = mpsc::channel();
        let mut engine = HybridSearchEngine::new(
            Some(Arc::new(BlockedStrategy(std::sync::Mutex::new(blocked)))),
            Arc::new(KeywordStrategy::new(catalog.clone())),
            catalog,
            Duration::from_millis(50),
            100,
        );
        engine.max_semantic_workers = 1;

        let page = engine.search("mug", &SearchFilters::default(), 1, 10).unwrap();
        assert_eq!(page.path, Some(SearchPath::Keyword));
        assert_eq!(engine.semantic_workers.load(Ordering::SeqCst), 1);

        // the timed out worker still holds the only slot
        let page = engine.search("mug", &SearchFilters::default(), 1, 10).unwrap();
        assert_eq!(page.path, Some(SearchPath::Keyword));
        assert_eq!(page.results[0].product.sku, "MUG-1");
        assert_eq!(engine.semantic_workers.load(Ordering::SeqCst), 1);

        release.send(()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.semantic_workers.load(Ordering::SeqCst) > 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
