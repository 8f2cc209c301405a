use chrono::Duration;

use super::{create_app, create_app_with};
use crate::catalog::{CatalogStore, ProductUpsert};
use crate::errors::AppError;
use crate::lists::ListCreate;

fn product(sku: &str, price: f64) -> ProductUpsert {
    ProductUpsert {
        sku: sku.into(),
        name: format!("Product {sku}"),
        price,
        is_active: true,
        ..Default::default()
    }
}

#[test]
fn test_share_then_sync_copies_with_current_prices() {
    let (app, _tmp) = create_app();
    app.catalog
        .upsert_products(vec![product("MUG-1", 10.0), product("PLATE-1", 3.0)])
        .unwrap();

    let list = app
        .lists
        .create("alice", ListCreate { name: "Picnic".into(), description: None })
        .unwrap();
    app.lists.add_item(&list.id, "alice", "MUG-1", 2, None).unwrap();
    app.lists
        .add_item(&list.id, "alice", "PLATE-1", 4, Some("paper".into()))
        .unwrap();

    let code = app.generate_share_code(&list.id, "alice").unwrap();
    assert_eq!(code.code.len(), 8);

    app.catalog.upsert_products(vec![product("MUG-1", 12.0)]).unwrap();

    let copy = app.sync_from_code(&code.code, "bob").unwrap();
    assert_ne!(copy.id, list.id);
    assert_eq!(copy.session_id, "bob");

    let items: Vec<(&str, u32, f64)> = copy
        .items
        .iter()
        .map(|i| (i.sku.as_str(), i.quantity, i.price_at_add))
        .collect();
    assert_eq!(items, vec![("MUG-1", 2, 12.0), ("PLATE-1", 4, 3.0)]);
    assert_eq!(copy.items[1].notes.as_deref(), Some("paper"));

    // the source list and its code are untouched
    let source = app.lists.get(&list.id).unwrap();
    assert_eq!(source.session_id, "alice");
    assert_eq!(source.items[0].price_at_add, 10.0);
    assert_eq!(app.generate_share_code(&list.id, "alice").unwrap(), code);

    assert_eq!(app.lists.by_session("bob").unwrap().len(), 1);
}

#[test]
fn test_expired_code_never_clones() {
    let (app, _tmp) = create_app_with(|config| config.share.ttl_secs = 60);
    app.catalog.upsert_products(vec![product("MUG-1", 10.0)]).unwrap();

    let list = app
        .lists
        .create("alice", ListCreate { name: "Mugs".into(), description: None })
        .unwrap();
    app.lists.add_item(&list.id, "alice", "MUG-1", 1, None).unwrap();
    let code = app.generate_share_code(&list.id, "alice").unwrap();
    assert_eq!(code.expires_at - code.created_at, Duration::seconds(60));

    let err = app
        .share
        .sync_at(&code.code, "bob", code.expires_at + Duration::seconds(1))
        .unwrap_err();
    assert!(matches!(err, AppError::ShareCodeExpired { .. }));
    assert!(app.lists.by_session("bob").unwrap().is_empty());
}

#[test]
fn test_unknown_code_and_foreign_owner() {
    let (app, _tmp) = create_app();
    let list = app
        .lists
        .create("alice", ListCreate { name: "Mine".into(), description: None })
        .unwrap();

    assert!(matches!(
        app.sync_from_code("NOPE2345", "bob"),
        Err(AppError::ShareCodeNotFound(_))
    ));
    assert!(matches!(
        app.generate_share_code(&list.id, "mallory"),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn test_inactive_products_are_still_copied() {
    let (app, _tmp) = create_app();
    app.catalog
        .upsert_products(vec![product("MUG-1", 10.0), product("OLD-1", 5.0)])
        .unwrap();
    let list = app
        .lists
        .create("alice", ListCreate { name: "Mixed".into(), description: None })
        .unwrap();
    app.lists.add_item(&list.id, "alice", "MUG-1", 1, None).unwrap();
    app.lists.add_item(&list.id, "alice", "OLD-1", 1, None).unwrap();

    let mut retired = product("OLD-1", 6.0);
    retired.is_active = false;
    app.catalog.upsert_products(vec![retired]).unwrap();

    let code = app.generate_share_code(&list.id, "alice").unwrap();
    let copy = app.sync_from_code(&code.code, "bob").unwrap();
    assert_eq!(copy.items.len(), 2);
    assert_eq!(copy.items[1].price_at_add, 6.0);
}
