//! Catalog sync: feed import, per-product embedding and vector reconciliation.

mod feed;
mod pipeline;
mod reconcile;

pub use feed::{parse_feed, FeedError, FeedProduct, ParsedFeed};
pub use pipeline::{EmbeddingOutcome, EmbeddingStage, SyncPipeline, SyncReport, SyncState};
pub use reconcile::{reconcile, ReconcileError, ReconcileReport};
