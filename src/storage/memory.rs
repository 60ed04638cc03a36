//! In-memory `TableStore`.
//!
//! Used when no storage connection string is configured (local/dev runs) and
//! by the test suites. Row-key ordering matches the table service's natural
//! ascending order so the reversed-key scheme behaves identically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;

use crate::storage::tables::{Entity, StorageError, TableStore};

#[derive(Default)]
pub struct MemoryStore {
    tables: DashMap<String, BTreeMap<String, Entity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn upsert(&self, table: &str, entity: Entity) -> Result<(), StorageError> {
        let mut rows = self.tables.entry(table.to_string()).or_default();
        // merge semantics: incoming fields win, absent fields survive
        if let Some(existing) = rows.get_mut(&entity.row_key) {
            for (k, v) in entity.fields {
                existing.fields.insert(k, v);
            }
            return Ok(());
        }
        rows.insert(entity.row_key.clone(), entity);
        Ok(())
    }

    async fn get(&self, table: &str, pk: &str, rk: &str) -> Result<Option<Entity>, StorageError> {
        Ok(self
            .tables
            .get(table)
            .and_then(|rows| rows.get(rk).cloned())
            .filter(|e| e.partition_key == pk))
    }

    async fn query(
        &self,
        table: &str,
        pk: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StorageError> {
        let rows = match self.tables.get(table) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        Ok(rows
            .values()
            .filter(|e| e.partition_key == pk)
            .filter(|e| match since {
                Some(cutoff) => e.timestamp().map(|t| t >= cutoff).unwrap_or(true),
                None => true,
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tables::reversed_row_key;
    use serde_json::json;

    fn entity(rk: &str, price: f64) -> Entity {
        Entity::new("SPY", rk)
            .with("timestamp", json!(Utc::now().to_rfc3339()))
            .with("spy_price", json!(price))
    }

    #[actix_rt::test]
    async fn upsert_is_idempotent_per_key() {
        let store = MemoryStore::new();
        store.upsert("volumehistory", entity("42", 500.0)).await.unwrap();
        store.upsert("volumehistory", entity("42", 501.0)).await.unwrap();
        assert_eq!(store.row_count("volumehistory"), 1);

        let row = store.get("volumehistory", "SPY", "42").await.unwrap().unwrap();
        assert_eq!(row.f64_field("spy_price"), Some(501.0));
    }

    #[actix_rt::test]
    async fn merge_keeps_absent_fields() {
        let store = MemoryStore::new();
        store
            .upsert("marketstate", Entity::new("SPY", "STATE").with("prev_close", json!(498.5)))
            .await
            .unwrap();
        store
            .upsert("marketstate", Entity::new("SPY", "STATE").with("atm_center", json!(500)))
            .await
            .unwrap();
        let row = store.get("marketstate", "SPY", "STATE").await.unwrap().unwrap();
        assert_eq!(row.f64_field("prev_close"), Some(498.5));
        assert_eq!(row.i64_field("atm_center"), Some(500));
    }

    #[actix_rt::test]
    async fn reversed_keys_come_back_newest_first() {
        let store = MemoryStore::new();
        for ts_ms in [1_760_000_000_000_i64, 1_760_000_001_000, 1_760_000_002_000] {
            store
                .upsert("flowhistory", entity(&reversed_row_key(ts_ms), ts_ms as f64))
                .await
                .unwrap();
        }
        let rows = store.query("flowhistory", "SPY", None).await.unwrap();
        let prices: Vec<f64> = rows.iter().filter_map(|e| e.f64_field("spy_price")).collect();
        assert_eq!(prices, vec![1_760_000_002_000.0, 1_760_000_001_000.0, 1_760_000_000_000.0]);
    }
}
