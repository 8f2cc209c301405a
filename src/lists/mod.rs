//! Shopping lists owned by a browser session, and their share codes.

mod share;

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{catalog::CatalogStore, eid::Eid, errors::AppError, storage::StorageManager};

pub use share::{ListShareProtocol, SHARE_CODE_ALPHABET};

const LISTS_FILE: &str = "lists.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub sku: String,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub price_at_add: f64,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserList {
    pub id: Eid,
    pub session_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub items: Vec<ListItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareCode {
    pub code: String,
    pub list_id: Eid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ShareCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub trait ListStore: Send + Sync {
    fn get(&self, id: &Eid) -> anyhow::Result<Option<UserList>>;
    fn save(&self, list: UserList) -> anyhow::Result<()>;
    /// Apply `f` to the stored list under the store's write lock. Nothing is
    /// written when `f` fails. `Ok(None)` when there is no such list.
    fn update(
        &self,
        id: &Eid,
        f: &mut dyn FnMut(&mut UserList) -> Result<(), AppError>,
    ) -> Result<Option<UserList>, AppError>;
    fn delete(&self, id: &Eid) -> anyhow::Result<bool>;
    fn by_session(&self, session_id: &str) -> anyhow::Result<Vec<UserList>>;
    fn share_code(&self, code: &str) -> anyhow::Result<Option<ShareCode>>;
    /// The newest code of `list_id` still valid at `now`.
    fn share_code_for_list(&self, list_id: &Eid, now: DateTime<Utc>) -> anyhow::Result<Option<ShareCode>>;
    /// Store `code` unless the code string is taken. Returns whether it was stored.
    fn insert_share_code(&self, code: ShareCode) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ListState {
    #[serde(default)]
    lists: BTreeMap<Eid, UserList>,
    #[serde(default)]
    share_codes: BTreeMap<String, ShareCode>,
}

/// Lists and share codes in memory, snapshotted to `lists.json` on every write.
pub struct MemoryListStore {
    state: RwLock<ListState>,
    storage: Option<Arc<dyn StorageManager>>,
}

impl Default for MemoryListStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryListStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ListState::default()),
            storage: None,
        }
    }

    pub fn load(storage: Arc<dyn StorageManager>) -> anyhow::Result<Self> {
        let state = if storage.exists(LISTS_FILE) {
            serde_json::from_slice(&storage.read(LISTS_FILE)?)?
        } else {
            ListState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            storage: Some(storage),
        })
    }

    fn read(&self) -> anyhow::Result<std::sync::RwLockReadGuard<'_, ListState>> {
        self.state.read().map_err(|_| anyhow!("list store lock poisoned"))
    }

    /// Run `f` on a copy of the state and swap it in once persisted.
    fn transact<T, E>(&self, f: impl FnOnce(&mut ListState) -> Result<T, E>) -> Result<T, E>
    where
        E: From<anyhow::Error>,
    {
        let mut guard = self
            .state
            .write()
            .map_err(|_| anyhow!("list store lock poisoned"))?;
        let mut next = guard.clone();
        let out = f(&mut next)?;

        if let Some(storage) = &self.storage {
            let data = serde_json::to_vec(&next).map_err(anyhow::Error::from)?;
            storage
                .write(LISTS_FILE, &data)
                .map_err(anyhow::Error::from)?;
        }

        *guard = next;
        Ok(out)
    }
}

impl ListStore for MemoryListStore {
    fn get(&self, id: &Eid) -> anyhow::Result<Option<UserList>> {
        Ok(self.read()?.lists.get(id).cloned())
    }

    fn save(&self, list: UserList) -> anyhow::Result<()> {
        self.transact(|state| {
            state.lists.insert(list.id.clone(), list);
            Ok(())
        })
    }

    fn update(
        &self,
        id: &Eid,
        f: &mut dyn FnMut(&mut UserList) -> Result<(), AppError>,
    ) -> Result<Option<UserList>, AppError> {
        if self.read()?.lists.get(id).is_none() {
            return Ok(None);
        }
        self.transact(|state| {
            let Some(list) = state.lists.get_mut(id) else {
                return Ok(None);
            };
            f(list)?;
            Ok(Some(list.clone()))
        })
    }

    fn delete(&self, id: &Eid) -> anyhow::Result<bool> {
        self.transact(|state| {
            state.share_codes.retain(|_, code| code.list_id != *id);
            Ok(state.lists.remove(id).is_some())
        })
    }

    fn by_session(&self, session_id: &str) -> anyhow::Result<Vec<UserList>> {
        Ok(self
            .read()?
            .lists
            .values()
            .filter(|l| l.session_id == session_id)
            .cloned()
            .collect())
    }

    fn share_code(&self, code: &str) -> anyhow::Result<Option<ShareCode>> {
        Ok(self.read()?.share_codes.get(code).cloned())
    }

    fn share_code_for_list(&self, list_id: &Eid, now: DateTime<Utc>) -> anyhow::Result<Option<ShareCode>> {
        Ok(self
            .read()?
            .share_codes
            .values()
            .filter(|c| c.list_id == *list_id && !c.is_expired_at(now))
            .max_by_key(|c| c.expires_at)
            .cloned())
    }

    fn insert_share_code(&self, code: ShareCode) -> anyhow::Result<bool> {
        if self.read()?.share_codes.contains_key(&code.code) {
            return Ok(false);
        }
        self.transact(|state| {
            if state.share_codes.contains_key(&code.code) {
                return Ok(false);
            }
            state.share_codes.insert(code.code.clone(), code);
            Ok(true)
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListUpdate {
    #[serde(default)]
    pub name: Option<String>,
    /// An empty string clears the description
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemUpdate {
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// List operations. Every mutation checks the caller's session; a list owned
/// by someone else is reported as not found.
pub struct ListService {
    store: Arc<dyn ListStore>,
    catalog: Arc<dyn CatalogStore>,
}

impl ListService {
    pub fn new(store: Arc<dyn ListStore>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self { store, catalog }
    }

    pub fn create(&self, session_id: &str, create: ListCreate) -> Result<UserList, AppError> {
        let name = create.name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("list name must not be empty".to_string()));
        }
        require_session(session_id)?;

        let now = Utc::now();
        let list = UserList {
            id: Eid::new(),
            session_id: session_id.to_string(),
            name: name.to_string(),
            description: create.description,
            items: vec![],
            created_at: now,
            updated_at: now,
        };
        self.store.save(list.clone())?;
        log::debug!("created list {} for session {session_id}", list.id);
        Ok(list)
    }

    pub fn get(&self, id: &Eid) -> Result<UserList, AppError> {
        self.store
            .get(id)?
            .ok_or_else(|| AppError::NotFound(format!("list {id}")))
    }

    fn get_owned(&self, id: &Eid, session_id: &str) -> Result<UserList, AppError> {
        let list = self.get(id)?;
        if list.session_id != session_id {
            return Err(AppError::NotFound(format!("list {id}")));
        }
        Ok(list)
    }

    /// Read-modify-write of an owned list in one store transaction.
    fn update_owned(
        &self,
        id: &Eid,
        session_id: &str,
        mut f: impl FnMut(&mut UserList) -> Result<(), AppError>,
    ) -> Result<UserList, AppError> {
        self.store
            .update(id, &mut |list: &mut UserList| -> Result<(), AppError> {
                if list.session_id != session_id {
                    return Err(AppError::NotFound(format!("list {id}")));
                }
                f(list)?;
                list.updated_at = Utc::now();
                Ok(())
            })?
            .ok_or_else(|| AppError::NotFound(format!("list {id}")))
    }

    /// Rename a list or change its description.
    pub fn update_list(
        &self,
        list_id: &Eid,
        session_id: &str,
        update: ListUpdate,
    ) -> Result<UserList, AppError> {
        let name = match update.name.as_deref().map(str::trim) {
            Some("") => {
                return Err(AppError::Validation("list name must not be empty".to_string()));
            }
            name => name.map(str::to_string),
        };

        self.update_owned(list_id, session_id, |list| {
            if let Some(name) = &name {
                list.name = name.clone();
            }
            if let Some(description) = &update.description {
                list.description = (!description.is_empty()).then(|| description.clone());
            }
            Ok(())
        })
    }

    pub fn by_session(&self, session_id: &str) -> Result<Vec<UserList>, AppError> {
        let mut lists = self.store.by_session(session_id)?;
        lists.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(lists)
    }

    /// Add `quantity` of `sku`. Adding a SKU already on the list increases its
    /// quantity and keeps the original price.
    pub fn add_item(
        &self,
        list_id: &Eid,
        session_id: &str,
        sku: &str,
        quantity: u32,
        notes: Option<String>,
    ) -> Result<UserList, AppError> {
        if quantity == 0 {
            return Err(AppError::Validation("quantity must be at least 1".to_string()));
        }
        let product = self
            .catalog
            .get(sku)?
            .ok_or_else(|| AppError::NotFound(format!("product {sku}")))?;

        self.update_owned(list_id, session_id, |list| {
            match list.items.iter_mut().find(|item| item.sku == sku) {
                Some(item) => {
                    item.quantity = item.quantity.saturating_add(quantity);
                    if notes.is_some() {
                        item.notes = notes.clone();
                    }
                }
                None => list.items.push(ListItem {
                    sku: product.sku.clone(),
                    quantity,
                    notes: notes.clone(),
                    price_at_add: product.price,
                    added_at: Utc::now(),
                }),
            }
            Ok(())
        })
    }

    pub fn update_item(
        &self,
        list_id: &Eid,
        session_id: &str,
        sku: &str,
        update: ItemUpdate,
    ) -> Result<UserList, AppError> {
        if update.quantity == Some(0) {
            return Err(AppError::Validation("quantity must be at least 1".to_string()));
        }
        self.update_owned(list_id, session_id, |list| {
            let item = list
                .items
                .iter_mut()
                .find(|item| item.sku == sku)
                .ok_or_else(|| AppError::NotFound(format!("item {sku} in list {list_id}")))?;

            if let Some(quantity) = update.quantity {
                item.quantity = quantity;
            }
            if let Some(notes) = &update.notes {
                item.notes = (!notes.is_empty()).then(|| notes.clone());
            }
            Ok(())
        })
    }

    pub fn remove_item(&self, list_id: &Eid, session_id: &str, sku: &str) -> Result<UserList, AppError> {
        self.update_owned(list_id, session_id, |list| {
            let before = list.items.len();
            list.items.retain(|item| item.sku != sku);
            if list.items.len() == before {
                return Err(AppError::NotFound(format!("item {sku} in list {list_id}")));
            }
            Ok(())
        })
    }

    pub fn delete(&self, list_id: &Eid, session_id: &str) -> Result<(), AppError> {
        self.get_owned(list_id, session_id)?;
        self.store.delete(list_id)?;
        Ok(())
    }
}

fn require_session(session_id: &str) -> Result<(), AppError> {
    if session_id.trim().is_empty() {
        return Err(AppError::Validation("session id must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, ProductUpsert};
    use crate::storage::BackendLocal;

    fn catalog() -> Arc<MemoryCatalog> {
        let catalog = MemoryCatalog::new();
        catalog
            .upsert_products(vec![
                ProductUpsert {
                    sku: "MUG-1".into(),
                    name: "Mug".into(),
                    price: 10.0,
                    is_active: true,
                    ..Default::default()
                },
                ProductUpsert {
                    sku: "PLATE-1".into(),
                    name: "Plate".into(),
                    price: 4.5,
                    is_active: true,
                    ..Default::default()
                },
            ])
            .unwrap();
        Arc::new(catalog)
    }

    fn service() -> ListService {
        ListService::new(Arc::new(MemoryListStore::new()), catalog())
    }

    fn create(service: &ListService, session: &str) -> UserList {
        service
            .create(
                session,
                ListCreate {
                    name: "Kitchen".into(),
                    description: None,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_add_merges_quantity_and_keeps_first_price() {
        let service = service();
        let list = create(&service, "s1");

        service.add_item(&list.id, "s1", "MUG-1", 1, None).unwrap();
        let list = service
            .add_item(&list.id, "s1", "MUG-1", 2, Some("blue".into()))
            .unwrap();

        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].quantity, 3);
        assert_eq!(list.items[0].price_at_add, 10.0);
        assert_eq!(list.items[0].notes.as_deref(), Some("blue"));
    }

    #[test]
    fn test_foreign_session_sees_not_found() {
        let service = service();
        let list = create(&service, "owner");

        let err = service.add_item(&list.id, "intruder", "MUG-1", 1, None).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = service.delete(&list.id, "intruder").unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(service.get(&list.id).is_ok());
    }

    #[test]
    fn test_update_and_remove_items() {
        let service = service();
        let list = create(&service, "s1");
        service.add_item(&list.id, "s1", "MUG-1", 1, None).unwrap();
        service.add_item(&list.id, "s1", "PLATE-1", 6, None).unwrap();

        let list = service
            .update_item(
                &list.id,
                "s1",
                "PLATE-1",
                ItemUpdate {
                    quantity: Some(4),
                    notes: Some("white".into()),
                },
            )
            .unwrap();
        assert_eq!(list.items[1].quantity, 4);

        let list = service.remove_item(&list.id, "s1", "MUG-1").unwrap();
        assert_eq!(list.items.len(), 1);
        assert!(matches!(
            service.remove_item(&list.id, "s1", "MUG-1"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let catalog = MemoryCatalog::new();
        catalog
            .upsert_products(
                (0..8)
                    .map(|i| ProductUpsert {
                        sku: format!("ITEM-{i}"),
                        name: format!("Item {i}"),
                        price: 1.0,
                        is_active: true,
                        ..Default::default()
                    })
                    .collect(),
            )
            .unwrap();
        let service = ListService::new(Arc::new(MemoryListStore::new()), Arc::new(catalog));
        let list = create(&service, "s1");

        std::thread::scope(|scope| {
            for i in 0..8 {
                let service = &service;
                let id = &list.id;
                scope.spawn(move || {
                    for _ in 0..5 {
                        service.add_item(id, "s1", &format!("ITEM-{i}"), 1, None).unwrap();
                    }
                });
            }
        });

        let list = service.get(&list.id).unwrap();
        assert_eq!(list.items.len(), 8);
        assert!(list.items.iter().all(|item| item.quantity == 5));
    }

    #[test]
    fn test_update_list_name_and_description() {
        let service = service();
        let list = create(&service, "s1");

        let list = service
            .update_list(
                &list.id,
                "s1",
                ListUpdate {
                    name: Some(" Pantry ".into()),
                    description: Some("dry goods".into()),
                },
            )
            .unwrap();
        assert_eq!(list.name, "Pantry");
        assert_eq!(list.description.as_deref(), Some("dry goods"));

        let list = service
            .update_list(
                &list.id,
                "s1",
                ListUpdate {
                    name: None,
                    description: Some(String::new()),
                },
            )
            .unwrap();
        assert_eq!(list.name, "Pantry");
        assert_eq!(list.description, None);

        let empty_name = ListUpdate {
            name: Some("  ".into()),
            description: None,
        };
        assert!(matches!(
            service.update_list(&list.id, "s1", empty_name),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            service.update_list(&list.id, "s2", ListUpdate::default()),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_failed_mutation_writes_nothing() {
        let service = service();
        let list = create(&service, "s1");
        service.add_item(&list.id, "s1", "MUG-1", 1, None).unwrap();
        let before = service.get(&list.id).unwrap();

        assert!(service.remove_item(&list.id, "s1", "PLATE-1").is_err());
        assert_eq!(service.get(&list.id).unwrap(), before);
    }

    #[test]
    fn test_rejects_bad_input() {
        let service = service();
        let list = create(&service, "s1");
        assert!(matches!(
            service.add_item(&list.id, "s1", "MUG-1", 0, None),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            service.add_item(&list.id, "s1", "NOPE", 1, None),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.create("s1", ListCreate::default()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_lists_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> =
            Arc::new(BackendLocal::new(dir.path().to_str().unwrap()).unwrap());

        let id = {
            let service = ListService::new(Arc::new(MemoryListStore::load(storage.clone()).unwrap()), catalog());
            let list = create(&service, "s1");
            service.add_item(&list.id, "s1", "MUG-1", 2, None).unwrap();
            list.id
        };

        let service = ListService::new(Arc::new(MemoryListStore::load(storage).unwrap()), catalog());
        let list = service.get(&id).unwrap();
        assert_eq!(list.items[0].quantity, 2);
        assert_eq!(service.by_session("s1").unwrap().len(), 1);
    }
}
