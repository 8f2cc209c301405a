use std::collections::HashSet;
use std::time::Duration;

use super::{create_app, seed, CATALOG_FEED};
use crate::catalog::{CatalogStore, SearchFilters};
use crate::errors::AppError;
use crate::semantic::{
    Embedder, HashingEmbedder, MemoryVectorIndex, ProductPayload, VectorIndex, VectorStorage,
};
use crate::task_runner::Status;

fn write_feed(dir: &tempfile::TempDir, name: &str, feed: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, feed).unwrap();
    path
}

#[test]
fn test_import_through_queue_indexes_every_active_product() {
    let (app, tmp) = create_app();
    app.run_queue().unwrap();

    let handle = app
        .trigger_sync(&write_feed(&tmp, "feed.json", CATALOG_FEED))
        .unwrap();
    assert_eq!(handle.status, Status::Pending);
    assert!(app.queue.wait_idle(Duration::from_secs(30)));

    assert_eq!(app.job_status(&handle.id).unwrap().status, Status::Done);
    assert_eq!(app.catalog.active_skus().unwrap().len(), 5);
    assert_eq!(app.index.all_keys().unwrap().len(), 5);

    let mug = app.catalog.get("MUG-1").unwrap().unwrap();
    assert!(mug.embedding_hash.is_some());
    assert!(mug.embedding_updated_at.is_some());

    // the drained queue wrote the vectors without waiting for shutdown
    let persisted = MemoryVectorIndex::open(
        VectorStorage::new(tmp.path().join("vectors.bin")),
        app.embedder.model_id_hash(),
        super::TEST_DIMENSIONS,
    )
    .unwrap();
    assert_eq!(persisted.all_keys().unwrap().len(), 5);

    app.shutdown();
}

#[test]
fn test_trigger_sync_rejects_missing_file() {
    let (app, _tmp) = create_app();
    assert!(matches!(
        app.trigger_sync(std::path::Path::new("/definitely/not/here.json")),
        Err(AppError::Validation(_))
    ));
    assert!(app.task_queue().queue.is_empty());
}

#[test]
fn test_malformed_feed_fails_job_and_writes_nothing() {
    let (app, tmp) = create_app();
    app.run_queue().unwrap();

    let feed = br#"{"products": [
        {"sku": "OK-1", "name": "Fine", "price": 1},
        {"sku": "BAD-1", "name": "Negative", "price": -5}
    ]}"#;
    let handle = app.trigger_sync(&write_feed(&tmp, "bad.json", feed)).unwrap();
    assert!(app.queue.wait_idle(Duration::from_secs(30)));

    let dump = app.job_status(&handle.id).unwrap();
    assert!(matches!(dump.status, Status::Error(_)));
    // validation errors are not retried
    assert_eq!(dump.attempt, 0);
    assert!(app.catalog.get("OK-1").unwrap().is_none());

    app.shutdown();
}

#[test]
fn test_reconcile_removes_orphans_only() {
    let (app, _tmp) = create_app();
    app.pipeline
        .import(
            br#"{"products": [
                {"sku": "A", "name": "Oak table", "price": 100},
                {"sku": "B", "name": "Oak chair", "price": 40}
            ]}"#,
            &super::NullSink,
        )
        .unwrap();

    let embedder = HashingEmbedder::new(super::TEST_DIMENSIONS);
    for sku in ["A", "B", "C"] {
        app.index
            .upsert(
                embedder.embed(sku).unwrap(),
                ProductPayload {
                    sku: sku.into(),
                    name: sku.into(),
                    price: 1.0,
                    category_ids: vec![],
                },
            )
            .unwrap();
    }

    let report = app.pipeline.reconcile().unwrap();
    assert_eq!(report.deleted, vec!["C"]);
    assert_eq!(
        app.index.all_keys().unwrap(),
        HashSet::from(["A".to_string(), "B".to_string()])
    );
}

#[test]
fn test_deactivated_product_leaves_index_after_reconcile() {
    let (app, tmp) = create_app();
    seed(&app, CATALOG_FEED);
    app.run_queue().unwrap();

    let update = br#"{"products": [
        {"sku": "LAMP-1", "name": "Desk lamp", "price": 25, "is_active": false}
    ]}"#;
    let handle = app.trigger_sync(&write_feed(&tmp, "update.json", update)).unwrap();
    assert!(app.queue.wait_idle(Duration::from_secs(30)));
    assert_eq!(app.job_status(&handle.id).unwrap().status, Status::Done);

    // the vector stays until reconciliation
    assert!(app.index.all_keys().unwrap().contains("LAMP-1"));

    let handle = app.trigger_reconciliation().unwrap();
    assert!(app.queue.wait_idle(Duration::from_secs(30)));
    assert_eq!(app.job_status(&handle.id).unwrap().status, Status::Done);
    assert!(!app.index.all_keys().unwrap().contains("LAMP-1"));

    let page = app
        .search("desk lamp", &SearchFilters::default(), None, None)
        .unwrap();
    assert!(page.results.iter().all(|r| r.product.sku != "LAMP-1"));

    app.shutdown();
}

#[test]
fn test_embedding_update_for_all_products() {
    let (app, _tmp) = create_app();
    app.pipeline.import(CATALOG_FEED, &super::NullSink).unwrap();
    assert!(app.index.all_keys().unwrap().is_empty());

    app.run_queue().unwrap();
    app.trigger_embedding_update(None).unwrap();
    assert!(app.queue.wait_idle(Duration::from_secs(30)));
    assert_eq!(app.index.all_keys().unwrap().len(), 5);

    assert!(matches!(
        app.trigger_embedding_update(Some("NOPE".into())),
        Err(AppError::NotFound(_))
    ));

    app.shutdown();
}

#[test]
fn test_vectors_survive_restart() {
    let tmp = {
        let (app, tmp) = create_app();
        seed(&app, CATALOG_FEED);
        app.shutdown();
        tmp
    };

    let mut config = crate::config::Config::load_with(tmp.path().to_str().unwrap()).unwrap();
    config.semantic_search.model = crate::semantic::HASHING_MODEL.to_string();
    config.semantic_search.dimensions = super::TEST_DIMENSIONS;
    let app = crate::app::App::open(config).unwrap();

    assert_eq!(app.index.all_keys().unwrap().len(), 5);
    assert_eq!(app.catalog.active_skus().unwrap().len(), 5);
}
