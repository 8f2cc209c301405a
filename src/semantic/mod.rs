//! Embedding generation and vector storage for product search.
//!
//! # Architecture
//!
//! - `embeddings`: text to vector (fastembed model, hashing fallback)
//! - `preprocess`: product text composition and change fingerprints
//! - `index`: the `VectorIndex` seam and the in-process cosine index
//! - `storage`: binary `vectors.bin` persistence for the in-process index
//! - `qdrant`: Qdrant REST implementation of `VectorIndex`

pub mod embeddings;
mod index;
mod preprocess;
mod qdrant;
mod storage;

pub use embeddings::{
    Embedder, EmbeddingError, EmbeddingModel, HashingEmbedder, UnavailableEmbedder, HASHING_MODEL,
};
pub use index::{
    point_id, IndexError, MemoryVectorIndex, ProductPayload, ScoredSku, VectorIndex,
};
pub use preprocess::{content_hash, product_text};
pub use qdrant::QdrantIndex;
pub use storage::{VectorStorage, VectorStorageError};
