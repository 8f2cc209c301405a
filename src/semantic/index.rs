//! Vector index abstraction and the in-process implementation.
//!
//! Vectors are keyed by product SKU. Each carries a denormalized payload so the
//! index can apply price/category filters without touching the catalog.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalog::{Product, SearchFilters};
use crate::errors::AppError;
use crate::semantic::storage::{VectorStorage, VectorStorageError};

/// Denormalized product fields stored next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    pub sku: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub category_ids: Vec<u64>,
}

impl From<&Product> for ProductPayload {
    fn from(product: &Product) -> Self {
        Self {
            sku: product.sku.clone(),
            name: product.name.clone(),
            price: product.price,
            category_ids: product.category_ids.clone(),
        }
    }
}

impl ProductPayload {
    fn matches(&self, filters: &SearchFilters) -> bool {
        filters.matches_price(self.price) && filters.matches_categories(&self.category_ids)
    }
}

/// An entry in the vector index.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub payload: ProductPayload,
    pub embedding: Vec<f32>,
}

/// Search hit: SKU plus raw cosine similarity in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSku {
    pub sku: String,
    pub score: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("vector store timed out: {0}")]
    Timeout(String),

    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Timeout(_) => AppError::VectorIndexTimeout(err.to_string()),
            _ => AppError::VectorIndexUnavailable(err.to_string()),
        }
    }
}

pub trait VectorIndex: Send + Sync {
    /// Create the backing collection if it does not exist. Safe to call concurrently.
    fn ensure_collection(&self) -> Result<(), IndexError>;

    /// Insert or replace the vector for `payload.sku`.
    fn upsert(&self, embedding: Vec<f32>, payload: ProductPayload) -> Result<(), IndexError>;

    /// Up to `limit` hits passing `filters`, best first, ties by SKU.
    fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredSku>, IndexError>;

    /// Remove the vector for `sku`. Removing an absent SKU is not an error.
    fn delete(&self, sku: &str) -> Result<(), IndexError>;

    /// Every SKU that currently has a vector.
    fn all_keys(&self) -> Result<HashSet<String>, IndexError>;

    /// Persist pending writes. Backends that write through are no-ops.
    fn flush(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Deterministic point id for a SKU, shaped like a UUID.
pub fn point_id(sku: &str) -> String {
    let digest = Sha256::digest(sku.as_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Sort by score descending, then SKU ascending.
pub fn sort_scored(results: &mut [ScoredSku]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.sku.cmp(&b.sku))
    });
}

/// Compute L2 norm of a vector.
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity with a precomputed query norm.
fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    dot_product / (query_norm * target_norm)
}

/// In-memory cosine index, optionally persisted to `vectors.bin`.
///
/// Writes only mark the index dirty; `flush` writes the file.
pub struct MemoryVectorIndex {
    entries: RwLock<HashMap<String, VectorEntry>>,
    dimensions: usize,
    storage: Option<(VectorStorage, [u8; 32])>,
    dirty: AtomicBool,
}

impl MemoryVectorIndex {
    /// Create a new empty, non-persistent index.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dimensions,
            storage: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Open a persistent index. An incompatible or corrupt file is discarded
    /// and the index starts empty; reconciliation and re-embedding refill it.
    pub fn open(
        storage: VectorStorage,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, IndexError> {
        let entries = if storage.exists() {
            match storage.load(&model_id, dimensions) {
                Ok(entries) => entries,
                Err(err @ VectorStorageError::Io(_)) => return Err(err.into()),
                Err(err) => {
                    log::warn!(
                        "discarding {}: {err}; vectors will be rebuilt",
                        storage.path().display()
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        log::debug!("vector index opened with {} entries", entries.len());

        Ok(Self {
            entries: RwLock::new(entries),
            dimensions,
            storage: Some((storage, model_id)),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_vector(&self, v: &[f32]) -> Result<(), IndexError> {
        if v.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: v.len(),
            });
        }
        if l2_norm(v) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }
        Ok(())
    }

    fn mark_dirty(&self) {
        if self.storage.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    fn poisoned() -> IndexError {
        IndexError::Unavailable("vector index lock poisoned".to_string())
    }
}

impl VectorIndex for MemoryVectorIndex {
    fn ensure_collection(&self) -> Result<(), IndexError> {
        Ok(())
    }

    fn upsert(&self, embedding: Vec<f32>, payload: ProductPayload) -> Result<(), IndexError> {
        self.check_vector(&embedding)?;

        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(payload.sku.clone(), VectorEntry { payload, embedding });
        self.mark_dirty();

        Ok(())
    }

    fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredSku>, IndexError> {
        self.check_vector(query)?;
        let query_norm = l2_norm(query);

        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let mut results: Vec<ScoredSku> = entries
            .values()
            .filter(|entry| entry.payload.matches(filters))
            .map(|entry| ScoredSku {
                sku: entry.payload.sku.clone(),
                score: cosine_similarity(query, &entry.embedding, query_norm),
            })
            .collect();

        sort_scored(&mut results);
        results.truncate(limit);

        Ok(results)
    }

    fn delete(&self, sku: &str) -> Result<(), IndexError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        if entries.remove(sku).is_some() {
            self.mark_dirty();
        }

        Ok(())
    }

    fn all_keys(&self) -> Result<HashSet<String>, IndexError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.keys().cloned().collect())
    }

    fn flush(&self) -> Result<(), IndexError> {
        let Some((storage, model_id)) = &self.storage else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // readers keep searching while the snapshot is written
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        if let Err(err) = storage.save(&entries, model_id, self.dimensions) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err.into());
        }

        log::debug!("vector index flushed with {} entries", entries.len());
        Ok(())
    }
}
