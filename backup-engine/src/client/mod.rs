//! Row-oriented data-access client for a single table.
//!
//! Each operation resolves to one result per call. Implementations are not
//! required to tolerate concurrent callers; share an instance behind a lock.

pub mod memtable;

pub use memtable::MemTable;

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Write durability requested for a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Durability {
    /// Whatever the table is configured with.
    UseDefault,
    SkipWal,
    AsyncWal,
    #[default]
    SyncWal,
    FsyncWal,
}

/// `(family, qualifier)` of a cell.
pub type Column = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Get {
    pub row: Vec<u8>,
    /// Restrict the result to one family.
    pub family: Option<Vec<u8>>,
}

impl Get {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            family: None,
        }
    }

    pub fn family(mut self, family: impl Into<Vec<u8>>) -> Self {
        self.family = Some(family.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Put {
    pub row: Vec<u8>,
    pub cells: Vec<(Column, Vec<u8>)>,
    pub durability: Durability,
}

impl Put {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            cells: Vec::new(),
            durability: Durability::UseDefault,
        }
    }

    pub fn add_column(
        mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.cells
            .push(((family.into(), qualifier.into()), value.into()));
        self
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}

/// Deletes a whole row, one family of it, or the listed columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub row: Vec<u8>,
    pub family: Option<Vec<u8>>,
    /// When non-empty, only these cells are removed.
    pub columns: Vec<Column>,
}

impl Delete {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            family: None,
            columns: Vec::new(),
        }
    }

    pub fn family(mut self, family: impl Into<Vec<u8>>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn add_column(mut self, family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        self.columns.push((family.into(), qualifier.into()));
        self
    }
}

/// Appends bytes to existing cell values (absent cells start empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Append {
    pub row: Vec<u8>,
    pub cells: Vec<(Column, Vec<u8>)>,
    pub durability: Durability,
}

impl Append {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            cells: Vec::new(),
            durability: Durability::UseDefault,
        }
    }

    pub fn add_column(
        mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.cells
            .push(((family.into(), qualifier.into()), value.into()));
        self
    }
}

/// Adds to 64-bit big-endian counters (absent cells start at zero).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    pub row: Vec<u8>,
    pub columns: Vec<(Column, i64)>,
    pub durability: Durability,
}

impl Increment {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            columns: Vec::new(),
            durability: Durability::UseDefault,
        }
    }

    pub fn add_column(
        mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        amount: i64,
    ) -> Self {
        self.columns.push(((family.into(), qualifier.into()), amount));
        self
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}

/// Cells of one row, ordered by column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowResult {
    pub row: Vec<u8>,
    pub cells: BTreeMap<Column, Vec<u8>>,
}

impl RowResult {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn value(&self, family: &[u8], qualifier: &[u8]) -> Option<&[u8]> {
        self.cells
            .get(&(family.to_vec(), qualifier.to_vec()))
            .map(Vec::as_slice)
    }

    /// `(qualifier, value)` pairs of one family.
    pub fn family_cells<'a>(&'a self, family: &'a [u8]) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.cells
            .iter()
            .filter(move |((f, _), _)| f.as_slice() == family)
            .map(|((_, q), v)| (q.as_slice(), v.as_slice()))
    }
}

/// Decode a counter cell.
pub fn counter_value(bytes: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        BackupError::Validation(format!("cell of {} bytes is not a counter", bytes.len()))
    })?;
    Ok(i64::from_be_bytes(raw))
}

#[async_trait]
pub trait DataClient: Send + Sync {
    async fn get(&self, get: Get) -> Result<RowResult>;

    async fn put(&self, put: Put) -> Result<()>;

    async fn delete(&self, delete: Delete) -> Result<()>;

    /// Returns the cells as they are after the append.
    async fn append(&self, append: Append) -> Result<RowResult>;

    /// Returns the counters as they are after the increment.
    async fn increment(&self, increment: Increment) -> Result<RowResult>;

    async fn exists(&self, get: Get) -> Result<bool> {
        Ok(!self.get(get).await?.is_empty())
    }

    /// Add `amount` to one counter with `SyncWal` durability and return its new value.
    async fn increment_column_value(
        &self,
        row: &[u8],
        family: &[u8],
        qualifier: &[u8],
        amount: i64,
    ) -> Result<i64> {
        self.increment_column_value_with_durability(row, family, qualifier, amount, Durability::SyncWal)
            .await
    }

    async fn increment_column_value_with_durability(
        &self,
        row: &[u8],
        family: &[u8],
        qualifier: &[u8],
        amount: i64,
        durability: Durability,
    ) -> Result<i64> {
        let increment = Increment::new(row)
            .add_column(family, qualifier, amount)
            .durability(durability);
        let result = self.increment(increment).await?;
        let value = result.value(family, qualifier).ok_or_else(|| {
            BackupError::Metadata("increment returned no value for the column".to_string())
        })?;
        counter_value(value)
    }
}
