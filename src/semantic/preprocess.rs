//! Embedding input composition.
//!
//! Product text is built from, in order:
//! 1. the name
//! 2. the description, or the short description when there is none
//! 3. `Categories: a, b` when the product belongs to any category
//!
//! Parts are joined with ". ". Only the description is bounded; the name and
//! the category suffix are always kept whole.

use sha2::{Digest, Sha256};

use crate::catalog::Product;

/// Maximum description length for embedding input (characters, not tokens)
const MAX_DESCRIPTION_LENGTH: usize = 1024;

/// Ellipsis suffix when the description is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Compose the text a product is embedded from.
pub fn product_text(product: &Product, category_names: &[String]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(3);

    let name = product.name.trim();
    if !name.is_empty() {
        parts.push(name.to_string());
    }

    let description = product
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .or_else(|| {
            product
                .short_description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
        });
    if let Some(description) = description {
        parts.push(truncate_description(description));
    }

    let categories: Vec<&str> = category_names
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    if !categories.is_empty() {
        parts.push(format!("Categories: {}", categories.join(", ")));
    }

    parts.join(". ")
}

/// Truncate to MAX_DESCRIPTION_LENGTH characters, adding ellipsis if truncated.
fn truncate_description(content: &str) -> String {
    if content.chars().count() <= MAX_DESCRIPTION_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_DESCRIPTION_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

/// Stable fingerprint of embedding input, persisted to skip unchanged products.
pub fn content_hash(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
