use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::feed::parse_feed;
use super::reconcile::{reconcile, ReconcileError, ReconcileReport};
use crate::catalog::{CatalogStore, Product};
use crate::errors::AppError;
use crate::semantic::{content_hash, product_text, Embedder, ProductPayload, VectorIndex};
use crate::task_runner::{JobSink, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Parsing,
    Upserting,
    QueuingEmbeddings,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingStage {
    Idle,
    Fetching,
    Embedding,
    Upserting,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingOutcome {
    /// A new vector was written
    Updated,
    /// The stored vector already reflects the current product
    Unchanged,
    /// Missing or inactive product, nothing to embed
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub state: SyncState,
    pub categories_upserted: usize,
    pub products_upserted: usize,
    pub embedding_jobs: usize,
    /// Category slugs referenced by products but unknown to the catalog
    pub unresolved_categories: Vec<String>,
    pub skus: Vec<String>,
}

/// Tracks one run through its states, logging every transition.
struct Tracked<S: std::fmt::Debug + Copy> {
    label: String,
    state: S,
}

impl<S: std::fmt::Debug + Copy> Tracked<S> {
    fn new(label: String, state: S) -> Self {
        Self { label, state }
    }

    fn advance(&mut self, next: S) {
        log::debug!("{}: {:?} -> {:?}", self.label, self.state, next);
        self.state = next;
    }
}

pub struct SyncPipeline {
    catalog: Arc<dyn CatalogStore>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    embeddings_enabled: bool,
}

impl SyncPipeline {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            catalog,
            embedder,
            index,
            embeddings_enabled: true,
        }
    }

    /// Catalog-only mode: imports queue no embedding jobs and embedding
    /// jobs are skipped.
    pub fn without_embeddings(mut self) -> Self {
        self.embeddings_enabled = false;
        self
    }

    pub fn import_file(&self, path: &Path, sink: &dyn JobSink) -> Result<SyncReport, AppError> {
        let bytes = std::fs::read(path).map_err(|err| {
            AppError::Validation(format!("cannot read feed {}: {err}", path.display()))
        })?;
        self.import(&bytes, sink)
    }

    /// Apply a feed to the catalog and queue one embedding job per product.
    ///
    /// Nothing is written when the feed fails validation. Embedding jobs are
    /// only queued after the catalog write has committed.
    pub fn import(&self, bytes: &[u8], sink: &dyn JobSink) -> Result<SyncReport, AppError> {
        let mut run = Tracked::new("sync".to_string(), SyncState::Idle);

        run.advance(SyncState::Parsing);
        let feed = match parse_feed(bytes) {
            Ok(feed) => feed,
            Err(err) => {
                run.advance(SyncState::Failed);
                log::warn!("feed rejected: {err}");
                return Err(err.into());
            }
        };

        run.advance(SyncState::Upserting);
        let categories_upserted = self
            .catalog
            .upsert_categories(&feed.categories)
            .inspect_err(|_| run.advance(SyncState::Failed))?;

        let mut unresolved_categories: Vec<String> = Vec::new();
        let mut products = Vec::with_capacity(feed.products.len());
        for mut item in feed.products {
            let resolved = self.catalog.resolve_category_slugs(&item.category_slugs)?;
            for slug in resolved.unresolved {
                log::warn!("product {}: unknown category '{slug}'", item.product.sku);
                if !unresolved_categories.contains(&slug) {
                    unresolved_categories.push(slug);
                }
            }
            item.product.category_ids = resolved.ids;
            products.push(item.product);
        }

        let skus: Vec<String> = products.iter().map(|p| p.sku.clone()).collect();
        let products_upserted = self
            .catalog
            .upsert_products(products)
            .inspect_err(|_| run.advance(SyncState::Failed))?;

        run.advance(SyncState::QueuingEmbeddings);
        let mut embedding_jobs = 0;
        for sku in skus.iter().filter(|_| self.embeddings_enabled) {
            sink.enqueue(Task::UpdateEmbedding {
                sku: Some(sku.clone()),
                force: false,
            })?;
            embedding_jobs += 1;
        }

        run.advance(SyncState::Done);
        log::info!(
            "sync done: {categories_upserted} categories, {products_upserted} products, {embedding_jobs} embedding jobs"
        );
        unresolved_categories.sort();

        Ok(SyncReport {
            state: run.state,
            categories_upserted,
            products_upserted,
            embedding_jobs,
            unresolved_categories,
            skus,
        })
    }

    /// Queue a forced embedding job for every active product.
    pub fn queue_all_embeddings(&self, sink: &dyn JobSink) -> Result<usize, AppError> {
        if !self.embeddings_enabled {
            return Ok(0);
        }
        let mut skus: Vec<String> = self.catalog.active_skus()?.into_iter().collect();
        skus.sort();

        for sku in &skus {
            sink.enqueue(Task::UpdateEmbedding {
                sku: Some(sku.clone()),
                force: true,
            })?;
        }
        log::info!("queued {} embedding jobs", skus.len());

        Ok(skus.len())
    }

    /// Bring the vector for one product up to date.
    pub fn update_embedding(&self, sku: &str, force: bool) -> Result<EmbeddingOutcome, AppError> {
        let mut unit = Tracked::new(format!("embedding {sku}"), EmbeddingStage::Idle);

        let result = self.run_embedding(sku, force, &mut unit);
        match &result {
            Ok(outcome) => {
                unit.advance(EmbeddingStage::Done);
                log::debug!("embedding {sku}: {outcome:?}");
            }
            Err(err) => {
                unit.advance(EmbeddingStage::Failed);
                log::warn!("embedding {sku} failed: {err}");
            }
        }
        result
    }

    fn run_embedding(
        &self,
        sku: &str,
        force: bool,
        unit: &mut Tracked<EmbeddingStage>,
    ) -> Result<EmbeddingOutcome, AppError> {
        if !self.embeddings_enabled {
            return Ok(EmbeddingOutcome::Skipped);
        }

        unit.advance(EmbeddingStage::Fetching);
        let product = match self.catalog.get(sku)? {
            Some(product) if product.is_active => product,
            _ => return Ok(EmbeddingOutcome::Skipped),
        };

        let category_names = self.category_names(&product)?;
        let text = product_text(&product, &category_names);
        let hash = fingerprint(&text, &product);
        if !force && product.embedding_hash == Some(hash) {
            return Ok(EmbeddingOutcome::Unchanged);
        }

        unit.advance(EmbeddingStage::Embedding);
        let embedding = self.embedder.embed(&text)?;

        unit.advance(EmbeddingStage::Upserting);
        self.index
            .upsert(embedding, ProductPayload::from(&product))?;
        self.catalog.mark_embedded(sku, hash, Utc::now())?;

        Ok(EmbeddingOutcome::Updated)
    }

    fn category_names(&self, product: &Product) -> Result<Vec<String>, AppError> {
        if product.category_ids.is_empty() {
            return Ok(vec![]);
        }
        let by_id: HashMap<u64, String> = self
            .catalog
            .categories()?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();

        Ok(product
            .category_ids
            .iter()
            .filter_map(|id| by_id.get(id).cloned())
            .collect())
    }

    pub fn reconcile(&self) -> Result<ReconcileReport, AppError> {
        reconcile(self.catalog.as_ref(), self.index.as_ref()).map_err(|err| match err {
            ReconcileError::Catalog(err) => err.into(),
            ReconcileError::Index(err) => err.into(),
        })
    }

    /// Persist vector writes buffered by the index.
    pub fn flush_index(&self) -> Result<(), AppError> {
        self.index.flush()?;
        Ok(())
    }
}

/// Hash of the embedded text plus the payload fields the index filters on,
/// so a price or category change refreshes the stored payload too.
fn fingerprint(text: &str, product: &Product) -> u64 {
    content_hash(&format!(
        "{text}\u{1f}{}\u{1f}{}\u{1f}{:?}",
        product.name, product.price, product.category_ids
    ))
}
