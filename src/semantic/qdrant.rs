//! Qdrant REST backend for the vector index.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use url::Url;

use crate::catalog::SearchFilters;
use crate::config::VectorStoreConfig;
use crate::semantic::index::{point_id, sort_scored, IndexError, ProductPayload, ScoredSku, VectorIndex};

/// Blocking client for one Qdrant collection.
pub struct QdrantIndex {
    client: Client,
    base: Url,
    collection: String,
    dimensions: usize,
    scroll_page_size: usize,
}

#[derive(Debug, Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<SkuPayload>,
}

#[derive(Debug, Deserialize)]
struct SkuPayload {
    sku: String,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<ScrollPoint>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ScrollPoint {
    #[serde(default)]
    payload: Option<SkuPayload>,
}

impl QdrantIndex {
    pub fn new(config: &VectorStoreConfig, dimensions: usize) -> Result<Self, IndexError> {
        let mut base = Url::parse(&config.url)
            .map_err(|e| IndexError::Unavailable(format!("invalid url {}: {e}", config.url)))?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            headers.insert(
                "api-key",
                HeaderValue::from_str(api_key.trim())
                    .map_err(|e| IndexError::Unavailable(format!("invalid api key: {e}")))?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .build()
            .map_err(|e| IndexError::Unavailable(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base,
            collection: config.collection.clone(),
            dimensions,
            scroll_page_size: config.scroll_page_size.max(1),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, IndexError> {
        self.base
            .join(&format!("collections/{}{path}", self.collection))
            .map_err(|e| IndexError::Unavailable(format!("invalid endpoint: {e}")))
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, IndexError> {
        request.send().map_err(|err| {
            if err.is_timeout() {
                IndexError::Timeout(err.to_string())
            } else {
                IndexError::Unavailable(err.to_string())
            }
        })
    }

    fn read<T: DeserializeOwned>(response: Response) -> Result<T, IndexError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(IndexError::Unavailable(format!("qdrant returned {status}: {body}")));
        }

        response
            .json::<QdrantResponse<T>>()
            .map(|r| r.result)
            .map_err(|e| {
                if e.is_timeout() {
                    IndexError::Timeout(e.to_string())
                } else {
                    IndexError::Unavailable(format!("malformed qdrant response: {e}"))
                }
            })
    }
}

/// Qdrant filter for the search vocabulary; `None` when nothing constrains results.
fn build_filter(filters: &SearchFilters) -> Option<Value> {
    let mut must = Vec::new();

    if filters.min_price.is_some() || filters.max_price.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(min) = filters.min_price {
            range.insert("gte".into(), json!(min));
        }
        if let Some(max) = filters.max_price {
            range.insert("lte".into(), json!(max));
        }
        must.push(json!({ "key": "price", "range": range }));
    }

    if !filters.category_ids.is_empty() {
        must.push(json!({ "key": "category_ids", "match": { "any": filters.category_ids } }));
    }

    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

impl VectorIndex for QdrantIndex {
    fn ensure_collection(&self) -> Result<(), IndexError> {
        let url = self.endpoint("")?;
        let response = self.send(self.client.get(url.clone()))?;
        if response.status().is_success() {
            return Ok(());
        }

        let body = json!({ "vectors": { "size": self.dimensions, "distance": "Cosine" } });
        let response = self.send(self.client.put(url).json(&body))?;

        // another process may have created it in between
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::read::<Value>(response)?;

        log::info!("created qdrant collection {}", self.collection);
        Ok(())
    }

    fn upsert(&self, embedding: Vec<f32>, payload: ProductPayload) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        let mut url = self.endpoint("/points")?;
        url.set_query(Some("wait=true"));
        let body = json!({
            "points": [{
                "id": point_id(&payload.sku),
                "vector": embedding,
                "payload": payload,
            }]
        });

        let response = self.send(self.client.put(url).json(&body))?;
        Self::read::<Value>(response)?;
        Ok(())
    }

    fn search(
        &self,
        query: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredSku>, IndexError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let url = self.endpoint("/points/search")?;
        let mut body = json!({
            "vector": query,
            "limit": limit,
            "with_payload": ["sku"],
        });
        if let Some(filter) = build_filter(filters) {
            body["filter"] = filter;
        }

        let response = self.send(self.client.post(url).json(&body))?;
        let points: Vec<ScoredPoint> = Self::read(response)?;

        let mut results: Vec<ScoredSku> = points
            .into_iter()
            .filter_map(|p| {
                p.payload.map(|payload| ScoredSku {
                    sku: payload.sku,
                    score: p.score,
                })
            })
            .collect();
        sort_scored(&mut results);

        Ok(results)
    }

    fn delete(&self, sku: &str) -> Result<(), IndexError> {
        let mut url = self.endpoint("/points/delete")?;
        url.set_query(Some("wait=true"));
        let body = json!({ "points": [point_id(sku)] });

        let response = self.send(self.client.post(url).json(&body))?;
        Self::read::<Value>(response)?;
        Ok(())
    }

    fn all_keys(&self) -> Result<HashSet<String>, IndexError> {
        let url = self.endpoint("/points/scroll")?;
        let mut keys = HashSet::new();
        let mut offset: Option<Value> = None;

        loop {
            let mut body = json!({
                "limit": self.scroll_page_size,
                "with_payload": ["sku"],
                "with_vector": false,
            });
            if let Some(offset) = offset.take() {
                body["offset"] = offset;
            }

            let response = self.send(self.client.post(url.clone()).json(&body))?;
            let page: ScrollResult = Self::read(response)?;

            keys.extend(page.points.into_iter().filter_map(|p| p.payload.map(|p| p.sku)));

            match page.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> VectorStoreConfig {
        VectorStoreConfig {
            url: url.to_string(),
            timeout_ms: 500,
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_shapes() {
        assert_eq!(build_filter(&SearchFilters::default()), None);

        let filter = build_filter(&SearchFilters {
            category_ids: vec![4, 5],
            min_price: Some(10.0),
            max_price: None,
        })
        .unwrap();

        assert_eq!(
            filter,
            json!({
                "must": [
                    { "key": "price", "range": { "gte": 10.0 } },
                    { "key": "category_ids", "match": { "any": [4, 5] } }
                ]
            })
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let index = QdrantIndex::new(&config("http://qdrant.local:6333/proxy"), 384).unwrap();
        assert_eq!(
            index.endpoint("/points/search").unwrap().as_str(),
            "http://qdrant.local:6333/proxy/collections/products/points/search"
        );
    }

    #[test]
    fn test_unreachable_server_is_unavailable() {
        // nothing listens on port 1
        let index = QdrantIndex::new(&config("http://127.0.0.1:1"), 3).unwrap();
        let err = index
            .search(&[1.0, 0.0, 0.0], 5, &SearchFilters::default())
            .unwrap_err();
        assert!(matches!(err, IndexError::Unavailable(_) | IndexError::Timeout(_)));
    }

    #[test]
    fn test_upsert_checks_dimensions_locally() {
        let index = QdrantIndex::new(&config("http://127.0.0.1:1"), 3).unwrap();
        let payload = ProductPayload {
            sku: "A".into(),
            name: "a".into(),
            price: 1.0,
            category_ids: vec![],
        };
        assert!(matches!(
            index.upsert(vec![1.0], payload),
            Err(IndexError::DimensionMismatch { .. })
        ));
    }
}
