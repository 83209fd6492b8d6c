//! In-process table for embedded deployments and tests.

use super::{counter_value, Append, Column, DataClient, Delete, Get, Increment, Put, RowResult};
use crate::utils::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

type Cells = BTreeMap<Column, Vec<u8>>;

/// Rows held in memory. Clones share the same rows; durability is ignored.
#[derive(Debug, Clone, Default)]
pub struct MemTable {
    rows: Arc<Mutex<BTreeMap<Vec<u8>, Cells>>>,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Vec<u8>, Cells>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn result_of(row: &[u8], cells: Cells) -> RowResult {
    RowResult {
        row: row.to_vec(),
        cells,
    }
}

#[async_trait]
impl DataClient for MemTable {
    async fn get(&self, get: Get) -> Result<RowResult> {
        let rows = self.lock();
        let cells = match rows.get(&get.row) {
            Some(cells) => cells
                .iter()
                .filter(|((family, _), _)| get.family.as_ref().map_or(true, |f| f == family))
                .map(|(c, v)| (c.clone(), v.clone()))
                .collect(),
            None => Cells::new(),
        };
        Ok(result_of(&get.row, cells))
    }

    async fn put(&self, put: Put) -> Result<()> {
        trace!(durability = ?put.durability, cells = put.cells.len(), "put");
        let mut rows = self.lock();
        let row = rows.entry(put.row).or_default();
        for (column, value) in put.cells {
            row.insert(column, value);
        }
        Ok(())
    }

    async fn delete(&self, delete: Delete) -> Result<()> {
        let mut rows = self.lock();
        let Some(cells) = rows.get_mut(&delete.row) else {
            return Ok(());
        };
        if !delete.columns.is_empty() {
            for column in &delete.columns {
                cells.remove(column);
            }
        } else if let Some(family) = &delete.family {
            cells.retain(|(f, _), _| f != family);
        } else {
            cells.clear();
        }
        if cells.is_empty() {
            rows.remove(&delete.row);
        }
        Ok(())
    }

    async fn append(&self, append: Append) -> Result<RowResult> {
        trace!(durability = ?append.durability, cells = append.cells.len(), "append");
        let mut rows = self.lock();
        let row = rows.entry(append.row.clone()).or_default();
        let mut updated = Cells::new();
        for (column, suffix) in append.cells {
            let value = row.entry(column.clone()).or_default();
            value.extend_from_slice(&suffix);
            updated.insert(column, value.clone());
        }
        Ok(result_of(&append.row, updated))
    }

    async fn increment(&self, increment: Increment) -> Result<RowResult> {
        trace!(durability = ?increment.durability, "increment");
        let mut rows = self.lock();

        // Validate every counter before touching any of them
        let current = rows.get(&increment.row);
        let mut next = Vec::with_capacity(increment.columns.len());
        for (column, amount) in &increment.columns {
            let base = match current.and_then(|cells| cells.get(column)) {
                Some(bytes) => counter_value(bytes)?,
                None => 0,
            };
            next.push((column.clone(), base.wrapping_add(*amount)));
        }

        let row = rows.entry(increment.row.clone()).or_default();
        let mut updated = Cells::new();
        for (column, value) in next {
            let bytes = value.to_be_bytes().to_vec();
            row.insert(column.clone(), bytes.clone());
            updated.insert(column, bytes);
        }
        Ok(result_of(&increment.row, updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Durability;

    #[tokio::test]
    async fn test_put_get_delete() -> anyhow::Result<()> {
        let table = MemTable::new();
        table
            .put(Put::new("r1").add_column("a", "q1", "v1").add_column("b", "q2", "v2"))
            .await?;

        let row = table.get(Get::new("r1")).await?;
        assert_eq!(row.value(b"a", b"q1"), Some(&b"v1"[..]));
        assert_eq!(row.cells.len(), 2);

        let only_b = table.get(Get::new("r1").family("b")).await?;
        assert_eq!(only_b.cells.len(), 1);

        table.delete(Delete::new("r1").family("a")).await?;
        assert!(table.exists(Get::new("r1")).await?);
        table.delete(Delete::new("r1")).await?;
        assert!(!table.exists(Get::new("r1")).await?);
        assert_eq!(table.row_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_listed_columns() -> anyhow::Result<()> {
        let table = MemTable::new();
        table
            .put(Put::new("r1").add_column("f", "q1", "v1").add_column("f", "q2", "v2"))
            .await?;

        table.delete(Delete::new("r1").add_column("f", "q1")).await?;
        let row = table.get(Get::new("r1")).await?;
        assert_eq!(row.value(b"f", b"q1"), None);
        assert_eq!(row.value(b"f", b"q2"), Some(&b"v2"[..]));

        table.delete(Delete::new("r1").add_column("f", "q2")).await?;
        assert_eq!(table.row_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_append_concatenates() -> anyhow::Result<()> {
        let table = MemTable::new();
        table.append(Append::new("r1").add_column("f", "q", "ab")).await?;
        let result = table.append(Append::new("r1").add_column("f", "q", "cd")).await?;
        assert_eq!(result.value(b"f", b"q"), Some(&b"abcd"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn test_increment_column_value() -> anyhow::Result<()> {
        let table = MemTable::new();
        assert_eq!(table.increment_column_value(b"r1", b"f", b"n", 5).await?, 5);
        assert_eq!(
            table
                .increment_column_value_with_durability(b"r1", b"f", b"n", -2, Durability::SkipWal)
                .await?,
            3
        );

        let row = table.get(Get::new("r1")).await?;
        assert_eq!(counter_value(row.value(b"f", b"n").unwrap())?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_increment_rejects_non_counter() -> anyhow::Result<()> {
        let table = MemTable::new();
        table.put(Put::new("r1").add_column("f", "n", "text")).await?;
        assert!(table.increment_column_value(b"r1", b"f", b"n", 1).await.is_err());

        let row = table.get(Get::new("r1")).await?;
        assert_eq!(row.value(b"f", b"n"), Some(&b"text"[..]));
        Ok(())
    }
}
