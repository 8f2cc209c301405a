//! Keyword fallback: term matching against the primary store.
//!
//! Length normalization: description matches are weighted inversely to
//! description length so long copy does not win on surface area alone.

use std::sync::Arc;

use super::{Cancellation, SearchPath, SearchResult, SearchStrategy};
use crate::catalog::{CatalogStore, Product, SearchFilters};
use crate::errors::AppError;

/// Characters of context kept on each side of a highlighted term
const SNIPPET_CONTEXT: usize = 40;
/// Maximum highlight snippets per result
const MAX_SNIPPETS: usize = 3;

pub struct KeywordStrategy {
    catalog: Arc<dyn CatalogStore>,
}

impl KeywordStrategy {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }
}

impl SearchStrategy for KeywordStrategy {
    fn path(&self) -> SearchPath {
        SearchPath::Keyword
    }

    fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        _window: usize,
        _cancel: &Cancellation,
    ) -> Result<Vec<SearchResult>, AppError> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(vec![]);
        }

        let candidates = self.catalog.keyword_candidates(&terms, filters)?;
        let ranked = score_lexical(&terms, candidates);

        Ok(ranked
            .into_iter()
            .enumerate()
            .map(|(rank, scored)| {
                let highlights = highlight(&scored.product, &terms);
                SearchResult {
                    product: scored.product,
                    score: 1.0 / (1.0 + rank as f32),
                    highlights,
                }
            })
            .collect())
    }
}

/// A candidate with its lexical match counts.
#[derive(Debug, Clone)]
pub struct LexicalResult {
    pub product: Product,
    /// Number of query terms matched
    pub matched_terms: usize,
    /// Weighted score across all fields (length-normalized)
    pub total_hits: f32,
}

/// Terms for matching. Falls back to the whole query when every token is a
/// stop word or too short, so "tv" style queries still match something.
pub fn query_terms(query: &str) -> Vec<String> {
    let terms = tokenize(query);
    if !terms.is_empty() {
        return terms;
    }

    let whole = query.trim().to_lowercase();
    if whole.is_empty() {
        vec![]
    } else {
        vec![whole]
    }
}

/// Tokenize query into lowercase terms.
/// Filters out very short terms (1 char) and common stop words.
fn tokenize(query: &str) -> Vec<String> {
    const STOP_WORDS: &[&str] = &[
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "being",
        "in", "on", "at", "to", "for", "of", "with", "by", "from", "as",
        "and", "or", "but", "not", "no", "so", "if", "then",
    ];

    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Rank candidates: matched_terms DESC, total_hits DESC, SKU ASC.
/// Candidates without any match are dropped.
pub fn score_lexical(terms: &[String], candidates: Vec<Product>) -> Vec<LexicalResult> {
    let mut results: Vec<LexicalResult> = candidates
        .into_iter()
        .filter_map(|product| {
            let (matched_terms, total_hits) = count_matches(terms, &product);
            (matched_terms > 0).then_some(LexicalResult {
                product,
                matched_terms,
                total_hits,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.matched_terms
            .cmp(&a.matched_terms)
            .then_with(|| {
                b.total_hits
                    .partial_cmp(&a.total_hits)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.product.sku.cmp(&b.product.sku))
    });

    results
}

/// Baseline description length for normalization (characters).
/// Descriptions at or below this length get full weight.
const DESC_LENGTH_BASELINE: f32 = 100.0;

/// Logarithmic decay of description weight:
///
/// - 100 chars or less: 1.0 (full weight)
/// - 270 chars: ~0.5
/// - 730 chars: ~0.33
fn description_length_weight(len: usize) -> f32 {
    if len <= DESC_LENGTH_BASELINE as usize {
        return 1.0;
    }
    1.0 / (1.0 + (len as f32 / DESC_LENGTH_BASELINE).ln())
}

/// Returns (unique_terms_matched, weighted occurrences).
fn count_matches(terms: &[String], product: &Product) -> (usize, f32) {
    let name = product.name.to_lowercase();
    let sku = product.sku.to_lowercase();
    let short = product.short_description.as_deref().unwrap_or("").to_lowercase();
    let description = product.description.as_deref().unwrap_or("");
    let desc_weight = description_length_weight(description.chars().count());
    let description = description.to_lowercase();

    let mut matched_terms = 0;
    let mut total_hits: f32 = 0.0;

    for term in terms {
        let mut term_hits: f32 = 0.0;

        if sku == *term {
            term_hits += 3.0;
        } else if sku.contains(term.as_str()) {
            term_hits += 1.0;
        }

        if name.contains(term.as_str()) {
            term_hits += 2.0;
        }

        if short.contains(term.as_str()) {
            term_hits += 1.0;
        }

        if description.contains(term.as_str()) {
            term_hits += desc_weight;
        }

        if term_hits > 0.0 {
            matched_terms += 1;
            total_hits += term_hits;
        }
    }

    (matched_terms, total_hits)
}

/// Snippets around term occurrences in the name and descriptions, with the
/// matched text wrapped in `<mark>`.
pub fn highlight(product: &Product, terms: &[String]) -> Vec<String> {
    let fields = [
        Some(product.name.as_str()),
        product.short_description.as_deref(),
        product.description.as_deref(),
    ];

    fields
        .into_iter()
        .flatten()
        .filter_map(|field| snippet(field, terms))
        .take(MAX_SNIPPETS)
        .collect()
}

fn snippet(text: &str, terms: &[String]) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let lower: Vec<char> = chars.iter().map(|c| c.to_lowercase().next().unwrap_or(*c)).collect();

    // (start, end) char ranges of every term occurrence
    let mut matches: Vec<(usize, usize)> = Vec::new();
    for term in terms {
        let term: Vec<char> = term.chars().collect();
        if term.is_empty() || term.len() > lower.len() {
            continue;
        }
        let mut i = 0;
        while i + term.len() <= lower.len() {
            if lower[i..i + term.len()] == term[..] {
                matches.push((i, i + term.len()));
                i += term.len();
            } else {
                i += 1;
            }
        }
    }
    if matches.is_empty() {
        return None;
    }

    matches.sort();
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (start, end) in matches {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let window_start = merged[0].0.saturating_sub(SNIPPET_CONTEXT);
    let window_end = (merged[0].1 + SNIPPET_CONTEXT).min(chars.len());

    let mut out = String::new();
    if window_start > 0 {
        out.push_str("...");
    }
    let mut cursor = window_start;
    for (start, end) in merged.into_iter().filter(|(s, e)| *s >= window_start && *e <= window_end) {
        out.extend(&chars[cursor..start]);
        out.push_str("<mark>");
        out.extend(&chars[start..end]);
        out.push_str("</mark>");
        cursor = end;
    }
    out.extend(&chars[cursor..window_end]);
    if window_end < chars.len() {
        out.push_str("...");
    }

    Some(out)
}
