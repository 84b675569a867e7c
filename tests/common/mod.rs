use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use l2allstars_backend::error::AppError;
use l2allstars_backend::game_store::{CharacterRow, GameStore};
use l2allstars_backend::metrics::MetricsSink;

/// In-memory stand-in for the legacy MySQL store, with the same
/// insert-or-increment stack semantics as the real adapter.
#[derive(Default)]
pub struct MemoryGameStore {
    characters: Vec<CharacterRow>,
    accounts: HashMap<String, String>,
    pub items: Mutex<Vec<ItemRow>>,
    pub teleports: Mutex<Vec<(String, i32, i32, i32)>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemRow {
    pub object_id: i64,
    pub owner: String,
    pub item_id: u32,
    pub count: u64,
}

impl MemoryGameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_character(mut self, name: &str, account: &str, online: bool) -> Self {
        self.characters.push(CharacterRow {
            char_id: self.characters.len() as i64 + 1,
            name: name.to_string(),
            account_name: account.to_string(),
            online,
        });
        self
    }

    pub fn with_account_email(mut self, email: &str, login: &str) -> Self {
        self.accounts.insert(email.to_string(), login.to_string());
        self
    }

    pub fn stacks_of(&self, character: &str, item_id: u32) -> Vec<ItemRow> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.owner == character && row.item_id == item_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl GameStore for MemoryGameStore {
    async fn find_character(&self, name: &str) -> Result<Option<CharacterRow>, AppError> {
        Ok(self.characters.iter().find(|c| c.name == name).cloned())
    }

    async fn account_login_for_email(&self, email: &str) -> Result<Option<String>, AppError> {
        Ok(self.accounts.get(email).cloned())
    }

    async fn credit_item(&self, character: &str, item_id: u32, count: u64) -> Result<(), AppError> {
        if !self.characters.iter().any(|c| c.name == character) {
            return Err(AppError::NotFound(format!(
                "character {character} not found"
            )));
        }
        let mut items = self.items.lock().unwrap();
        if let Some(row) = items
            .iter_mut()
            .find(|row| row.owner == character && row.item_id == item_id)
        {
            row.count += count;
        } else {
            let object_id = items.iter().map(|r| r.object_id).max().unwrap_or(0) + 1;
            items.push(ItemRow {
                object_id,
                owner: character.to_string(),
                item_id,
                count,
            });
        }
        Ok(())
    }

    async fn teleport(&self, character: &str, x: i32, y: i32, z: i32) -> Result<(), AppError> {
        self.teleports
            .lock()
            .unwrap()
            .push((character.to_string(), x, y, z));
        Ok(())
    }
}

/// Wraps a [`MemoryGameStore`] and fails the first credit of one item, for
/// exercising provider retries after a partial delivery.
pub struct FailingOnceStore {
    inner: std::sync::Arc<MemoryGameStore>,
    fail_item: u32,
    tripped: Mutex<bool>,
}

impl FailingOnceStore {
    pub fn new(inner: std::sync::Arc<MemoryGameStore>, fail_item: u32) -> Self {
        Self {
            inner,
            fail_item,
            tripped: Mutex::new(false),
        }
    }
}

#[async_trait]
impl GameStore for FailingOnceStore {
    async fn find_character(&self, name: &str) -> Result<Option<CharacterRow>, AppError> {
        self.inner.find_character(name).await
    }

    async fn account_login_for_email(&self, email: &str) -> Result<Option<String>, AppError> {
        self.inner.account_login_for_email(email).await
    }

    async fn credit_item(&self, character: &str, item_id: u32, count: u64) -> Result<(), AppError> {
        if item_id == self.fail_item {
            let mut tripped = self.tripped.lock().unwrap();
            if !*tripped {
                *tripped = true;
                return Err(AppError::Upstream("game database timed out".to_string()));
            }
        }
        self.inner.credit_item(character, item_id, count).await
    }

    async fn teleport(&self, character: &str, x: i32, y: i32, z: i32) -> Result<(), AppError> {
        self.inner.teleport(character, x, y, z).await
    }
}

/// Records every metric call so tests can assert counter increments.
#[derive(Default)]
pub struct RecordingMetrics {
    pub donations: Mutex<Vec<u64>>,
    pub pack_sales: Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl MetricsSink for RecordingMetrics {
    async fn record_donation(&self, amount_cents: u64) {
        self.donations.lock().unwrap().push(amount_cents);
    }

    async fn record_pack_sale(&self, pack_id: &str, amount_cents: u64) {
        self.pack_sales
            .lock()
            .unwrap()
            .push((pack_id.to_string(), amount_cents));
    }
}
