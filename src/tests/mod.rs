mod share;
mod sync;

use crate::app::App;
use crate::config::Config;
use crate::eid::Eid;
use crate::errors::AppError;
use crate::semantic::HASHING_MODEL;
use crate::task_runner::{JobSink, Task};

pub const TEST_DIMENSIONS: usize = 512;

pub const CATALOG_FEED: &[u8] = br#"{
    "categories": [
        {"slug": "kitchen", "name": "Kitchen", "children": [
            {"slug": "mugs", "name": "Mugs"},
            {"slug": "kettles", "name": "Kettles"}
        ]},
        {"slug": "office", "name": "Office"}
    ],
    "products": [
        {"sku": "MUG-1", "name": "Ceramic coffee mug", "price": 10.0,
         "description": "Large ceramic mug for coffee and tea", "categories": ["mugs"]},
        {"sku": "MUG-2", "name": "Travel coffee mug", "price": 18.0,
         "description": "Insulated steel mug that keeps coffee hot", "categories": ["mugs"]},
        {"sku": "KET-1", "name": "Electric kettle", "price": 35.0,
         "description": "Fast boiling stainless steel kettle", "categories": ["kettles"]},
        {"sku": "DESK-1", "name": "Standing desk", "price": 320.0,
         "description": "Height adjustable office desk", "categories": ["office"]},
        {"sku": "LAMP-1", "name": "Desk lamp", "price": 25.0,
         "short_description": "LED reading lamp", "categories": ["office"]}
    ]
}"#;

/// An App rooted in its own temp directory, using the hashing embedder so
/// nothing is downloaded.
pub fn create_app() -> (App, tempfile::TempDir) {
    create_app_with(|_| {})
}

pub fn create_app_with(f: impl FnOnce(&mut Config)) -> (App, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let mut config =
        Config::load_with(tmp.path().to_str().unwrap()).expect("failed to load config");
    config.semantic_search.model = HASHING_MODEL.to_string();
    config.semantic_search.dimensions = TEST_DIMENSIONS;
    config.task_queue_retry_base_ms = 10;
    f(&mut config);

    let app = App::open(config).expect("failed to open app");
    (app, tmp)
}

/// Drops every job; used when a test drives the pipeline by hand.
pub struct NullSink;

impl JobSink for NullSink {
    fn enqueue(&self, _task: Task) -> Result<Eid, AppError> {
        Ok(Eid::new())
    }
}

/// Import `feed` and embed every product without going through the queue.
pub fn seed(app: &App, feed: &[u8]) {
    let report = app.pipeline.import(feed, &NullSink).expect("import failed");
    for sku in report.skus {
        app.pipeline
            .update_embedding(&sku, false)
            .expect("embedding failed");
    }
}
