//! # Warehouse Store
//!
//! Append-only analytical store. Rows are never updated in place; the
//! current state of an entity is the most recent row recorded for it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreResult;

/// One warehouse row.
pub type Row = Map<String, Value>;

#[async_trait]
pub trait WarehouseStore: Send + Sync {
    /// Appends `rows` to `table` in one batch. Returns how many were written.
    async fn insert_rows(&self, table: &str, rows: Vec<Row>) -> StoreResult<usize>;

    /// Most recently appended row whose `column` equals `value`.
    async fn latest_row(&self, table: &str, column: &str, value: &str)
        -> StoreResult<Option<Row>>;
}

/// In-memory warehouse keeping every appended row.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<String, Vec<Row>>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, Vec::len)
    }
}

#[async_trait]
impl WarehouseStore for MemoryWarehouse {
    async fn insert_rows(&self, table: &str, rows: Vec<Row>) -> StoreResult<usize> {
        let count = rows.len();
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
        debug!(table = %table, rows = count, "Rows appended");
        Ok(count)
    }

    async fn latest_row(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> StoreResult<Option<Row>> {
        let tables = self.tables.lock().await;
        Ok(tables.get(table).and_then(|rows| {
            rows.iter()
                .rev()
                .find(|row| row.get(column).and_then(Value::as_str) == Some(value))
                .cloned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, n: i64) -> Row {
        json!({ "entity_id": id, "n": n }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_latest_row_wins() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .insert_rows("knowledge", vec![row("k1", 1), row("k2", 1), row("k1", 2)])
            .await
            .unwrap();

        let latest = warehouse
            .latest_row("knowledge", "entity_id", "k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.get("n"), Some(&json!(2)));
        assert_eq!(warehouse.row_count("knowledge").await, 3);
        assert!(warehouse
            .latest_row("knowledge", "entity_id", "k9")
            .await
            .unwrap()
            .is_none());
    }
}
