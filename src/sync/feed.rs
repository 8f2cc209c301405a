//! Catalog feed parsing.
//!
//! A feed is a JSON object with a `products` array and an optional nested
//! `categories` tree. The whole document is validated before anything is
//! written, so a bad record aborts the run with nothing applied.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_json::Value;

use crate::catalog::{AttrValue, Attributes, CategoryUpsert, ProductUpsert};
use crate::errors::AppError;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("product #{index}: missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("product {sku}: price must be a non-negative number, got {price}")]
    InvalidPrice { sku: String, price: f64 },

    #[error("duplicate sku '{0}'")]
    DuplicateSku(String),

    #[error("duplicate category slug '{0}'")]
    DuplicateSlug(String),

    #[error("category #{index}: slug and name must not be empty")]
    InvalidCategory { index: usize },

    #[error("product {sku}: attribute '{key}' must be a string, number or boolean")]
    NestedAttribute { sku: String, key: String },
}

impl From<FeedError> for AppError {
    fn from(err: FeedError) -> Self {
        AppError::Validation(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFeed {
    products: Vec<RawProduct>,
    #[serde(default)]
    categories: Vec<RawCategory>,
}

#[derive(Debug, Deserialize)]
struct RawProduct {
    sku: Option<String>,
    name: Option<String>,
    price: Option<f64>,
    description: Option<String>,
    short_description: Option<String>,
    image_url: Option<String>,
    thumbnail_url: Option<String>,
    attributes: Option<BTreeMap<String, Value>>,
    specifications: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    categories: Vec<String>,
    is_active: Option<bool>,
    #[serde(default)]
    is_featured: bool,
}

#[derive(Debug, Deserialize)]
struct RawCategory {
    slug: String,
    name: String,
    description: Option<String>,
    display_order: Option<i32>,
    #[serde(default)]
    children: Vec<RawCategory>,
}

/// A validated product plus the category slugs it referenced.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedProduct {
    pub product: ProductUpsert,
    pub category_slugs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    /// Parents precede their children
    pub categories: Vec<CategoryUpsert>,
    pub products: Vec<FeedProduct>,
}

pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, FeedError> {
    let raw: RawFeed = serde_json::from_slice(bytes)?;

    let mut categories = Vec::new();
    flatten_categories(raw.categories, None, &mut categories)?;

    let mut slugs = HashSet::new();
    for (index, category) in categories.iter().enumerate() {
        if category.slug.trim().is_empty() || category.name.trim().is_empty() {
            return Err(FeedError::InvalidCategory { index });
        }
        if !slugs.insert(category.slug.clone()) {
            return Err(FeedError::DuplicateSlug(category.slug.clone()));
        }
    }

    let mut skus = HashSet::new();
    let mut products = Vec::with_capacity(raw.products.len());
    for (index, record) in raw.products.into_iter().enumerate() {
        let product = validate_product(index, record)?;
        if !skus.insert(product.product.sku.clone()) {
            return Err(FeedError::DuplicateSku(product.product.sku));
        }
        products.push(product);
    }

    Ok(ParsedFeed {
        categories,
        products,
    })
}

fn flatten_categories(
    nodes: Vec<RawCategory>,
    parent: Option<&str>,
    out: &mut Vec<CategoryUpsert>,
) -> Result<(), FeedError> {
    for (position, node) in nodes.into_iter().enumerate() {
        let slug = node.slug.trim().to_string();
        out.push(CategoryUpsert {
            slug: slug.clone(),
            name: node.name.trim().to_string(),
            description: node.description,
            parent: parent.map(str::to_string),
            display_order: node.display_order.unwrap_or(position as i32),
        });
        flatten_categories(node.children, Some(&slug), out)?;
    }
    Ok(())
}

fn required(value: Option<String>, index: usize, field: &'static str) -> Result<String, FeedError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(FeedError::MissingField { index, field })
}

fn validate_product(index: usize, record: RawProduct) -> Result<FeedProduct, FeedError> {
    let sku = required(record.sku, index, "sku")?;
    let name = required(record.name, index, "name")?;
    let price = record
        .price
        .ok_or(FeedError::MissingField { index, field: "price" })?;
    if !price.is_finite() || price < 0.0 {
        return Err(FeedError::InvalidPrice { sku, price });
    }

    let attributes = scalar_attributes(&sku, record.attributes)?;
    let specifications = scalar_attributes(&sku, record.specifications)?;

    let mut category_slugs: Vec<String> = Vec::new();
    for slug in record.categories.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !category_slugs.iter().any(|s| s == slug) {
            category_slugs.push(slug.to_string());
        }
    }

    Ok(FeedProduct {
        product: ProductUpsert {
            sku,
            name,
            description: record.description,
            short_description: record.short_description,
            price,
            image_url: record.image_url,
            thumbnail_url: record.thumbnail_url,
            attributes,
            specifications,
            category_ids: vec![],
            is_active: record.is_active.unwrap_or(true),
            is_featured: record.is_featured,
        },
        category_slugs,
    })
}

fn scalar_attributes(
    sku: &str,
    raw: Option<BTreeMap<String, Value>>,
) -> Result<Attributes, FeedError> {
    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Bool(b) => AttrValue::Bool(b),
                Value::String(s) => AttrValue::String(s),
                Value::Number(n) => match n.as_f64() {
                    Some(n) => AttrValue::Number(n),
                    None => {
                        return Err(FeedError::NestedAttribute {
                            sku: sku.to_string(),
                            key,
                        })
                    }
                },
                Value::Null | Value::Array(_) | Value::Object(_) => {
                    return Err(FeedError::NestedAttribute {
                        sku: sku.to_string(),
                        key,
                    })
                }
            };
            Ok((key, value))
        })
        .collect()
}
