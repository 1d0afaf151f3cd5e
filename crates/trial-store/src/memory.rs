//! An in-memory store with the same observable semantics as the DynamoDB
//! client, backing tests and local development.

use crate::schema::{Attr, Item, PrimaryKey};
use crate::{Store, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<(String, String), Item>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn check_accessible(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_item(&self, key: &PrimaryKey) -> Result<Option<Item>, StoreError> {
        let items = self.items.lock().unwrap();
        Ok(items.get(&(key.id.clone(), key.trial.clone())).cloned())
    }

    async fn put_item(&self, item: Item) -> Result<(), StoreError> {
        let key = primary_key_of(&item)?;
        let mut items = self.items.lock().unwrap();
        if items.contains_key(&key) {
            tracing::warn!(id = %key.0, trial = %key.1, "the item already exists");
            return Ok(());
        }
        items.insert(key, item);
        Ok(())
    }

    async fn query_range(
        &self,
        partition: &str,
        lo: &str,
        hi: &str,
        projection: &[&str],
    ) -> Result<Vec<Item>, StoreError> {
        let items = self.items.lock().unwrap();
        let range = (
            Bound::Included((partition.to_string(), lo.to_string())),
            Bound::Included((partition.to_string(), hi.to_string())),
        );
        Ok(items
            .range(range)
            .map(|(_, item)| project(item, projection))
            .collect())
    }
}

fn primary_key_of(item: &Item) -> Result<(String, String), StoreError> {
    let id = item
        .get("ID")
        .and_then(Attr::as_s)
        .ok_or_else(|| StoreError::Decode("record is missing its ID attribute".to_string()))?;
    let trial = item
        .get("Trial")
        .and_then(Attr::as_s)
        .ok_or_else(|| StoreError::Decode("record is missing its Trial attribute".to_string()))?;
    Ok((id.to_string(), trial.to_string()))
}

fn project(item: &Item, projection: &[&str]) -> Item {
    if projection.is_empty() {
        return item.clone();
    }
    item.iter()
        .filter(|(name, _)| projection.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
