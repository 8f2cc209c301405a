//! Text embedding generators.
//!
//! - `EmbeddingModel`: fastembed ONNX model, downloaded into `models/` on first start
//! - `HashingEmbedder`: deterministic feature hashing, no model files needed
//! - `UnavailableEmbedder`: stands in when the configured model failed to load

use fastembed::{InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::AppError;

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Name that selects the feature-hashing embedder
pub const HASHING_MODEL: &str = "hashing";

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Model unavailable: {0}")]
    Unavailable(String),
}

impl From<EmbeddingError> for AppError {
    fn from(err: EmbeddingError) -> Self {
        AppError::EmbeddingUnavailable(err.to_string())
    }
}

/// Maps text to a fixed-size vector. The same text always yields the same vector.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Output order matches input order; each vector equals `embed` of that text.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    /// SHA256 of the model name, stored alongside persisted vectors.
    fn model_id_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.name().as_bytes());
        hasher.finalize().into()
    }
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Load (downloading if needed) the named model.
    ///
    /// Models are cached in the `models/` subdirectory of `cache_dir`. The
    /// download runs on a helper thread so a stalled mirror cannot hang startup
    /// past `download_timeout`.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(false);

            let result = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))
                .and_then(|mut model| {
                    let dimensions = Self::probe_dimensions(&mut model)?;
                    Ok((model, dimensions))
                });
            let _ = tx.send(result);
        });

        let (model, dimensions) = rx
            .recv_timeout(timeout)
            .map_err(|_| EmbeddingError::DownloadTimeout(timeout.as_secs()))??;

        log::info!("embedding model {model_name} loaded ({dimensions} dims)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2)
            }
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q)
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15)
            }
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15)
            }
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15Q)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5 (add -q suffix for quantized), {}",
                name, HASHING_MODEL
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl Embedder for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        // batch size 1 keeps padding identical to single-text calls
        let embeddings = model
            .embed(texts.to_vec(), Some(1))
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "model returned {} embeddings for {} inputs",
                embeddings.len(),
                texts.len()
            )));
        }

        Ok(embeddings)
    }
}

/// Signed feature hashing over lowercase word unigrams and bigrams, L2-normalized.
///
/// Texts sharing vocabulary land close together, which is enough for offline
/// runs and tests. Empty input maps to a fixed unit vector.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut idx = [0u8; 8];
        idx.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(idx) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }
}

impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        HASHING_MODEL
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        let mut vector = vec![0f32; self.dimensions];
        for word in &words {
            let (bucket, sign) = self.bucket(word);
            vector[bucket] += sign;
        }
        for pair in words.windows(2) {
            let (bucket, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[bucket] += 0.5 * sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            vector[0] = 1.0;
            return Ok(vector);
        }

        Ok(vector.into_iter().map(|x| x / norm).collect())
    }
}

/// Installed when the configured model could not be loaded at startup.
pub struct UnavailableEmbedder {
    model_name: String,
    dimensions: usize,
    reason: String,
}

impl UnavailableEmbedder {
    pub fn new(model_name: &str, dimensions: usize, reason: String) -> Self {
        Self {
            model_name: model_name.to_string(),
            dimensions,
            reason,
        }
    }
}

impl Embedder for UnavailableEmbedder {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Unavailable(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_model_creation() {
        let temp_dir = std::env::temp_dir().join("kiosk-embed-test");
        let model = EmbeddingModel::new("all-MiniLM-L6-v2", temp_dir.clone(), None).unwrap();
        assert_eq!(model.name(), "all-MiniLM-L6-v2");
        assert_eq!(model.dimensions(), 384);

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_batch_matches_single() {
        let temp_dir = std::env::temp_dir().join("kiosk-embed-test-batch");
        let model = EmbeddingModel::new("all-MiniLM-L6-v2", temp_dir.clone(), None).unwrap();

        let texts = vec![
            "Wireless mouse".to_string(),
            "Ergonomic office chair with lumbar support".to_string(),
        ];
        let batch = model.embed_batch(&texts).unwrap();
        for (text, vector) in texts.iter().zip(batch) {
            assert_eq!(model.embed(text).unwrap(), vector);
        }

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = std::env::temp_dir().join("kiosk-embed-invalid");
        let result = EmbeddingModel::new("nonexistent-model", temp_dir, None);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Stainless steel kettle").unwrap();
        let b = embedder.embed("Stainless steel kettle").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_batch_matches_single() {
        let embedder = HashingEmbedder::new(32);
        let texts = vec!["red mug".to_string(), "".to_string(), "blue mug".to_string()];
        let batch = embedder.embed_batch(&texts).unwrap();
        assert_eq!(batch.len(), 3);
        for (text, vector) in texts.iter().zip(batch) {
            assert_eq!(embedder.embed(text).unwrap(), vector);
        }
    }

    #[test]
    fn test_unavailable_embedder_fails() {
        let embedder = UnavailableEmbedder::new("all-MiniLM-L6-v2", 384, "offline".into());
        assert!(matches!(
            embedder.embed("anything"),
            Err(EmbeddingError::Unavailable(_))
        ));
        let err: AppError = embedder.embed("x").unwrap_err().into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_model_id_hash_differs_by_name() {
        let hashing = HashingEmbedder::new(8);
        let other = UnavailableEmbedder::new("bge-small-en-v1.5", 8, String::new());
        assert_ne!(hashing.model_id_hash(), other.model_id_hash());
        assert_eq!(hashing.model_id_hash(), HashingEmbedder::new(16).model_id_hash());
    }
}
