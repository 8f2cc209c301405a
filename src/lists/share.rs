use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use super::{ListItem, ListStore, ShareCode, UserList};
use crate::{catalog::CatalogStore, eid::Eid, errors::AppError};

/// Uppercase letters and digits without the easily confused 0/O and 1/I.
pub const SHARE_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const MAX_MINT_ATTEMPTS: usize = 16;

/// Short-lived codes that let another session copy a list.
///
/// A code can be redeemed any number of times until it expires. Redeeming
/// reads the source list as it is now and re-prices every item from the
/// current catalog.
pub struct ListShareProtocol {
    lists: Arc<dyn ListStore>,
    catalog: Arc<dyn CatalogStore>,
    ttl: Duration,
    code_length: usize,
}

impl ListShareProtocol {
    pub fn new(
        lists: Arc<dyn ListStore>,
        catalog: Arc<dyn CatalogStore>,
        ttl_secs: i64,
        code_length: usize,
    ) -> Self {
        Self {
            lists,
            catalog,
            ttl: Duration::seconds(ttl_secs),
            code_length,
        }
    }

    pub fn generate(&self, list_id: &Eid) -> Result<ShareCode, AppError> {
        self.generate_at(list_id, Utc::now())
    }

    pub fn generate_at(&self, list_id: &Eid, now: DateTime<Utc>) -> Result<ShareCode, AppError> {
        if self.lists.get(list_id)?.is_none() {
            return Err(AppError::NotFound(format!("list {list_id}")));
        }

        if let Some(existing) = self.lists.share_code_for_list(list_id, now)? {
            return Ok(existing);
        }

        for _ in 0..MAX_MINT_ATTEMPTS {
            let code = ShareCode {
                code: mint_code(self.code_length),
                list_id: list_id.clone(),
                created_at: now,
                expires_at: now + self.ttl,
            };
            if self.lists.insert_share_code(code.clone())? {
                log::info!("share code {} issued for list {list_id}", code.code);
                return Ok(code);
            }
            log::debug!("share code collision, minting another");
        }

        Err(anyhow::anyhow!("could not mint a unique share code").into())
    }

    pub fn sync(&self, code: &str, target_session: &str) -> Result<UserList, AppError> {
        self.sync_at(code, target_session, Utc::now())
    }

    /// Copy the shared list into `target_session`.
    pub fn sync_at(
        &self,
        code: &str,
        target_session: &str,
        now: DateTime<Utc>,
    ) -> Result<UserList, AppError> {
        if target_session.trim().is_empty() {
            return Err(AppError::Validation("session id must not be empty".to_string()));
        }

        let code = code.trim().to_uppercase();
        let share = self
            .lists
            .share_code(&code)?
            .ok_or_else(|| AppError::ShareCodeNotFound(code.clone()))?;

        if share.is_expired_at(now) {
            return Err(AppError::ShareCodeExpired {
                code,
                expired_at: share.expires_at,
            });
        }

        let source = self
            .lists
            .get(&share.list_id)?
            .ok_or_else(|| AppError::ShareCodeNotFound(code.clone()))?;

        let mut items = Vec::with_capacity(source.items.len());
        for item in &source.items {
            match self.catalog.get(&item.sku)? {
                Some(product) => items.push(ListItem {
                    sku: item.sku.clone(),
                    quantity: item.quantity,
                    notes: item.notes.clone(),
                    price_at_add: product.price,
                    added_at: now,
                }),
                None => log::warn!(
                    "share {code}: dropping {} from list {}, product no longer exists",
                    item.sku,
                    source.id
                ),
            }
        }

        let copy = UserList {
            id: Eid::new(),
            session_id: target_session.to_string(),
            name: source.name,
            description: source.description,
            items,
            created_at: now,
            updated_at: now,
        };
        self.lists.save(copy.clone())?;

        log::info!("share {code}: list {} copied to {}", source.id, copy.id);
        Ok(copy)
    }
}

fn mint_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| SHARE_CODE_ALPHABET[rng.random_range(0..SHARE_CODE_ALPHABET.len())] as char)
        .collect()
}
