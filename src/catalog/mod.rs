//! Primary product store.
//!
//! The catalog is the source of truth for products and categories. Search
//! hydrates vector hits from it, the keyword fallback queries it directly,
//! and reconciliation compares the vector index against its active set.

mod memory;

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

pub use memory::MemoryCatalog;

/// Scalar attribute value. Nested objects and arrays are rejected at import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Number(f64),
    String(String),
}

pub type Attributes = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub specifications: Attributes,
    #[serde(default)]
    pub category_ids: Vec<u64>,
    pub is_active: bool,
    #[serde(default)]
    pub is_featured: bool,
    pub updated_at: DateTime<Utc>,

    /// Fingerprint of the text the current vector was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_hash: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_updated_at: Option<DateTime<Utc>>,
}

/// Product fields as delivered by a feed. Bookkeeping fields are owned by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductUpsert {
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub price: f64,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub attributes: Attributes,
    pub specifications: Attributes,
    pub category_ids: Vec<u64>,
    pub is_active: bool,
    pub is_featured: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: u64,
    pub name: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    #[serde(default)]
    pub display_order: i32,
}

/// Category keyed by slug; `parent` is the parent's slug.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryUpsert {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub parent: Option<String>,
    pub display_order: i32,
}

/// Filter vocabulary shared by the vector index and the keyword path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Match any of these categories; empty means no category constraint
    #[serde(default)]
    pub category_ids: Vec<u64>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.category_ids.is_empty() && self.min_price.is_none() && self.max_price.is_none()
    }

    pub fn matches_price(&self, price: f64) -> bool {
        self.min_price.map_or(true, |min| price >= min)
            && self.max_price.map_or(true, |max| price <= max)
    }

    pub fn matches_categories(&self, category_ids: &[u64]) -> bool {
        self.category_ids.is_empty()
            || category_ids.iter().any(|id| self.category_ids.contains(id))
    }

    pub fn matches(&self, product: &Product) -> bool {
        self.matches_price(product.price) && self.matches_categories(&product.category_ids)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        for bound in [self.min_price, self.max_price].into_iter().flatten() {
            if !bound.is_finite() || bound < 0.0 {
                return Err(AppError::Validation(format!(
                    "price bound must be a non-negative number, got {bound}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(AppError::Validation(format!(
                    "min_price {min} is greater than max_price {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Result of resolving feed category slugs against the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedSlugs {
    pub ids: Vec<u64>,
    pub unresolved: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("duplicate category slug '{0}'")]
    DuplicateSlug(String),

    #[error("category '{0}' would become its own ancestor")]
    CategoryCycle(String),

    #[error("unknown parent category '{0}'")]
    UnknownParent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog snapshot is malformed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("catalog lock poisoned")]
    Poisoned,
}

impl From<CatalogError> for AppError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::DuplicateSlug(_)
            | CatalogError::CategoryCycle(_)
            | CatalogError::UnknownParent(_) => AppError::Validation(err.to_string()),
            CatalogError::Io(err) => AppError::IO(err),
            other => AppError::Other(other.into()),
        }
    }
}

pub trait CatalogStore: Send + Sync {
    /// Active products for the given SKUs, in no particular order. Missing
    /// and inactive SKUs are omitted.
    fn fetch_by_skus(&self, skus: &[String]) -> Result<Vec<Product>, CatalogError>;

    /// Any product, active or not.
    fn get(&self, sku: &str) -> Result<Option<Product>, CatalogError>;

    /// Active products matching at least one term (case-insensitive) in name,
    /// description, short description or SKU, restricted by `filters`.
    fn keyword_candidates(
        &self,
        terms: &[String],
        filters: &SearchFilters,
    ) -> Result<Vec<Product>, CatalogError>;

    fn list_active(&self, filters: &SearchFilters) -> Result<Vec<Product>, CatalogError>;

    fn active_skus(&self) -> Result<HashSet<String>, CatalogError>;

    fn resolve_category_slugs(&self, slugs: &[String]) -> Result<ResolvedSlugs, CatalogError>;

    fn categories(&self) -> Result<Vec<Category>, CatalogError>;

    /// Upsert categories by slug. All or nothing.
    fn upsert_categories(&self, categories: &[CategoryUpsert]) -> Result<usize, CatalogError>;

    /// Upsert products by SKU. All or nothing.
    fn upsert_products(&self, products: Vec<ProductUpsert>) -> Result<usize, CatalogError>;

    /// Record that the vector for `sku` now reflects text with hash `hash`.
    fn mark_embedded(&self, sku: &str, hash: u64, at: DateTime<Utc>) -> Result<(), CatalogError>;
}
