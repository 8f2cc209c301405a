use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    CatalogError, CatalogStore, Category, CategoryUpsert, Product, ProductUpsert, ResolvedSlugs,
    SearchFilters,
};
use crate::storage::StorageManager;

const CATALOG_FILE: &str = "catalog.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogState {
    #[serde(default)]
    products: BTreeMap<String, Product>,
    #[serde(default)]
    categories: BTreeMap<u64, Category>,
    #[serde(default)]
    next_category_id: u64,
}

impl CatalogState {
    fn category_by_slug(&self, slug: &str) -> Option<&Category> {
        self.categories.values().find(|c| c.slug == slug)
    }

    fn check_acyclic(&self) -> Result<(), CatalogError> {
        for category in self.categories.values() {
            let mut seen = HashSet::from([category.id]);
            let mut cursor = category.parent_id;
            while let Some(parent_id) = cursor {
                if !seen.insert(parent_id) {
                    return Err(CatalogError::CategoryCycle(category.slug.clone()));
                }
                cursor = self.categories.get(&parent_id).and_then(|p| p.parent_id);
            }
        }
        Ok(())
    }
}

/// Catalog held in memory and snapshotted to `catalog.json` after every write.
///
/// Writes are applied to a copy of the state, persisted, and only then swapped
/// in, so a failed write leaves both memory and disk untouched.
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
    storage: Option<Arc<dyn StorageManager>>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    /// Catalog without persistence.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            storage: None,
        }
    }

    pub fn load(storage: Arc<dyn StorageManager>) -> Result<Self, CatalogError> {
        let state = if storage.exists(CATALOG_FILE) {
            serde_json::from_slice(&storage.read(CATALOG_FILE)?)?
        } else {
            CatalogState::default()
        };

        log::debug!(
            "catalog loaded: {} products, {} categories",
            state.products.len(),
            state.categories.len()
        );

        Ok(Self {
            state: RwLock::new(state),
            storage: Some(storage),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, CatalogState>, CatalogError> {
        self.state.read().map_err(|_| CatalogError::Poisoned)
    }

    /// Apply `f` to a copy of the state and commit it if `f` and the snapshot succeed.
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut CatalogState) -> Result<T, CatalogError>,
    ) -> Result<T, CatalogError> {
        let mut guard = self.state.write().map_err(|_| CatalogError::Poisoned)?;
        let mut next = guard.clone();
        let out = f(&mut next)?;

        if let Some(storage) = &self.storage {
            storage.write(CATALOG_FILE, &serde_json::to_vec(&next)?)?;
        }

        *guard = next;
        Ok(out)
    }
}

fn contains_term(product: &Product, term: &str) -> bool {
    let fields = [
        Some(product.name.as_str()),
        product.description.as_deref(),
        product.short_description.as_deref(),
        Some(product.sku.as_str()),
    ];

    fields
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(term))
}

impl CatalogStore for MemoryCatalog {
    fn fetch_by_skus(&self, skus: &[String]) -> Result<Vec<Product>, CatalogError> {
        let state = self.read()?;
        Ok(skus
            .iter()
            .filter_map(|sku| state.products.get(sku))
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    fn get(&self, sku: &str) -> Result<Option<Product>, CatalogError> {
        Ok(self.read()?.products.get(sku).cloned())
    }

    fn keyword_candidates(
        &self,
        terms: &[String],
        filters: &SearchFilters,
    ) -> Result<Vec<Product>, CatalogError> {
        let terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let state = self.read()?;

        Ok(state
            .products
            .values()
            .filter(|p| p.is_active && filters.matches(p))
            .filter(|p| terms.iter().any(|term| contains_term(p, term)))
            .cloned()
            .collect())
    }

    fn list_active(&self, filters: &SearchFilters) -> Result<Vec<Product>, CatalogError> {
        let state = self.read()?;
        Ok(state
            .products
            .values()
            .filter(|p| p.is_active && filters.matches(p))
            .cloned()
            .collect())
    }

    fn active_skus(&self) -> Result<HashSet<String>, CatalogError> {
        let state = self.read()?;
        Ok(state
            .products
            .values()
            .filter(|p| p.is_active)
            .map(|p| p.sku.clone())
            .collect())
    }

    fn resolve_category_slugs(&self, slugs: &[String]) -> Result<ResolvedSlugs, CatalogError> {
        let state = self.read()?;
        let mut resolved = ResolvedSlugs::default();

        for slug in slugs {
            match state.category_by_slug(slug) {
                Some(category) if !resolved.ids.contains(&category.id) => {
                    resolved.ids.push(category.id)
                }
                Some(_) => {}
                None => resolved.unresolved.push(slug.clone()),
            }
        }

        Ok(resolved)
    }

    fn categories(&self) -> Result<Vec<Category>, CatalogError> {
        let state = self.read()?;
        let mut categories: Vec<Category> = state.categories.values().cloned().collect();
        categories.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(categories)
    }

    fn upsert_categories(&self, categories: &[CategoryUpsert]) -> Result<usize, CatalogError> {
        let mut seen = HashSet::new();
        for category in categories {
            if !seen.insert(category.slug.as_str()) {
                return Err(CatalogError::DuplicateSlug(category.slug.clone()));
            }
        }

        self.transact(|state| {
            let mut ids: HashMap<&str, u64> = HashMap::new();

            for upsert in categories {
                let id = match state.category_by_slug(&upsert.slug) {
                    Some(existing) => existing.id,
                    None => {
                        state.next_category_id += 1;
                        state.next_category_id
                    }
                };

                let parent_id = state.categories.get(&id).and_then(|c| c.parent_id);
                state.categories.insert(
                    id,
                    Category {
                        id,
                        name: upsert.name.clone(),
                        slug: upsert.slug.clone(),
                        description: upsert.description.clone(),
                        parent_id,
                        display_order: upsert.display_order,
                    },
                );
                ids.insert(&upsert.slug, id);
            }

            // parents may refer to categories defined later in the batch
            for upsert in categories {
                let parent_id = match &upsert.parent {
                    Some(parent) => Some(
                        state
                            .category_by_slug(parent)
                            .map(|p| p.id)
                            .ok_or_else(|| CatalogError::UnknownParent(parent.clone()))?,
                    ),
                    None => None,
                };
                if let Some(category) = state.categories.get_mut(&ids[upsert.slug.as_str()]) {
                    category.parent_id = parent_id;
                }
            }

            state.check_acyclic()?;
            Ok(categories.len())
        })
    }

    fn upsert_products(&self, products: Vec<ProductUpsert>) -> Result<usize, CatalogError> {
        let now = Utc::now();
        let count = products.len();

        self.transact(move |state| {
            for upsert in products {
                // a vector may have been reconciled away while the product was inactive
                let previous = state.products.get(&upsert.sku).filter(|p| p.is_active);
                let product = Product {
                    embedding_hash: previous.and_then(|p| p.embedding_hash),
                    embedding_updated_at: previous.and_then(|p| p.embedding_updated_at),
                    sku: upsert.sku,
                    name: upsert.name,
                    description: upsert.description,
                    short_description: upsert.short_description,
                    price: upsert.price,
                    image_url: upsert.image_url,
                    thumbnail_url: upsert.thumbnail_url,
                    attributes: upsert.attributes,
                    specifications: upsert.specifications,
                    category_ids: upsert.category_ids,
                    is_active: upsert.is_active,
                    is_featured: upsert.is_featured,
                    updated_at: now,
                };
                state.products.insert(product.sku.clone(), product);
            }
            Ok(count)
        })
    }

    fn mark_embedded(&self, sku: &str, hash: u64, at: DateTime<Utc>) -> Result<(), CatalogError> {
        self.transact(|state| {
            if let Some(product) = state.products.get_mut(sku) {
                product.embedding_hash = Some(hash);
                product.embedding_updated_at = Some(at);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    fn product(sku: &str, name: &str, price: f64) -> ProductUpsert {
        ProductUpsert {
            sku: sku.to_string(),
            name: name.to_string(),
            price,
            is_active: true,
            ..Default::default()
        }
    }

    fn category(slug: &str, parent: Option<&str>) -> CategoryUpsert {
        CategoryUpsert {
            slug: slug.to_string(),
            name: slug.to_uppercase(),
            parent: parent.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_and_fetch() {
        let catalog = MemoryCatalog::new();
        let mut inactive = product("SKU-3", "Old lamp", 5.0);
        inactive.is_active = false;

        catalog
            .upsert_products(vec![
                product("SKU-1", "Desk lamp", 20.0),
                product("SKU-2", "Floor lamp", 40.0),
                inactive,
            ])
            .unwrap();

        let fetched = catalog
            .fetch_by_skus(&["SKU-2".into(), "SKU-3".into(), "MISSING".into()])
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].sku, "SKU-2");

        assert!(catalog.get("SKU-3").unwrap().is_some());
        assert_eq!(
            catalog.active_skus().unwrap(),
            HashSet::from(["SKU-1".to_string(), "SKU-2".to_string()])
        );
    }

    #[test]
    fn test_upsert_preserves_embedding_bookkeeping() {
        let catalog = MemoryCatalog::new();
        catalog.upsert_products(vec![product("SKU-1", "Lamp", 1.0)]).unwrap();
        catalog.mark_embedded("SKU-1", 42, Utc::now()).unwrap();

        catalog.upsert_products(vec![product("SKU-1", "Lamp v2", 2.0)]).unwrap();
        let p = catalog.get("SKU-1").unwrap().unwrap();
        assert_eq!(p.name, "Lamp v2");
        assert_eq!(p.embedding_hash, Some(42));

        let mut hidden = product("SKU-1", "Lamp v2", 2.0);
        hidden.is_active = false;
        catalog.upsert_products(vec![hidden]).unwrap();
        catalog.upsert_products(vec![product("SKU-1", "Lamp v2", 2.0)]).unwrap();
        assert_eq!(catalog.get("SKU-1").unwrap().unwrap().embedding_hash, None);
    }

    #[test]
    fn test_keyword_candidates_respect_filters() {
        let catalog = MemoryCatalog::new();
        let mut cheap = product("SKU-1", "Red Mug", 5.0);
        cheap.category_ids = vec![1];
        let mut pricey = product("SKU-2", "Red Kettle", 50.0);
        pricey.description = Some("a red mug warmer".into());
        pricey.category_ids = vec![2];
        catalog.upsert_products(vec![cheap, pricey]).unwrap();

        let all = catalog
            .keyword_candidates(&["MUG".into()], &SearchFilters::default())
            .unwrap();
        assert_eq!(all.len(), 2);

        let filtered = catalog
            .keyword_candidates(
                &["mug".into()],
                &SearchFilters {
                    max_price: Some(10.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].sku, "SKU-1");

        let by_category = catalog
            .keyword_candidates(
                &["red".into()],
                &SearchFilters {
                    category_ids: vec![2, 7],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_category.len(), 1);
        assert_eq!(by_category[0].sku, "SKU-2");
    }

    #[test]
    fn test_category_tree_and_slug_resolution() {
        let catalog = MemoryCatalog::new();
        // child listed before parent
        catalog
            .upsert_categories(&[category("laptops", Some("electronics")), category("electronics", None)])
            .unwrap();

        let categories = catalog.categories().unwrap();
        let electronics = categories.iter().find(|c| c.slug == "electronics").unwrap();
        let laptops = categories.iter().find(|c| c.slug == "laptops").unwrap();
        assert_eq!(laptops.parent_id, Some(electronics.id));

        let resolved = catalog
            .resolve_category_slugs(&["laptops".into(), "ghost".into(), "laptops".into()])
            .unwrap();
        assert_eq!(resolved.ids, vec![laptops.id]);
        assert_eq!(resolved.unresolved, vec!["ghost".to_string()]);

        // re-upsert keeps ids stable
        catalog.upsert_categories(&[category("laptops", Some("electronics"))]).unwrap();
        let again = catalog.resolve_category_slugs(&["laptops".into()]).unwrap();
        assert_eq!(again.ids, vec![laptops.id]);
    }

    #[test]
    fn test_category_cycle_is_rejected_atomically() {
        let catalog = MemoryCatalog::new();
        catalog
            .upsert_categories(&[category("a", None), category("b", Some("a"))])
            .unwrap();

        let err = catalog.upsert_categories(&[category("a", Some("b"))]).unwrap_err();
        assert!(matches!(err, CatalogError::CategoryCycle(_)));

        let a = catalog
            .categories()
            .unwrap()
            .into_iter()
            .find(|c| c.slug == "a")
            .unwrap();
        assert_eq!(a.parent_id, None);
    }

    #[test]
    fn test_duplicate_and_unknown_slugs_rejected() {
        let catalog = MemoryCatalog::new();
        let err = catalog
            .upsert_categories(&[category("a", None), category("a", None)])
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateSlug(_)));

        let err = catalog.upsert_categories(&[category("a", Some("nope"))]).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownParent(_)));
        assert!(catalog.categories().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> =
            Arc::new(BackendLocal::new(tmp.path().to_str().unwrap()).unwrap());

        let catalog = MemoryCatalog::load(storage.clone()).unwrap();
        catalog.upsert_categories(&[category("kitchen", None)]).unwrap();
        catalog.upsert_products(vec![product("SKU-1", "Mug", 3.5)]).unwrap();
        drop(catalog);

        let reloaded = MemoryCatalog::load(storage).unwrap();
        assert_eq!(reloaded.get("SKU-1").unwrap().unwrap().price, 3.5);
        assert_eq!(reloaded.categories().unwrap().len(), 1);
    }
}
