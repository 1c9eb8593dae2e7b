//! Index descriptors and the per-database catalog.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use storage::BufferPoolManager;
use tracing::debug;
use txn::LockManager;

use crate::error::{EngineError, EngineResult};
use crate::index::NullOrdering;
use crate::row::TableSchema;
use crate::table::Table;

/// Flavor of an index. The kind decides what a leaf entry carries and which
/// constraints the descriptor must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Leaf entries hold the full row; at most one per table.
    Clustered,
    /// Plain secondary index over one column.
    NonClustered,
    /// Secondary index that rejects duplicate keys.
    Unique,
    /// Secondary index over two or more columns.
    Composite,
    /// Secondary index that stores extra column values in its leaves.
    Covering,
}

/// Durable description of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub table: String,
    pub kind: IndexKind,
    pub key_columns: Vec<String>,
    pub included_columns: Vec<String>,
    pub unique: bool,
    pub nulls: NullOrdering,
}

impl IndexDescriptor {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        kind: IndexKind,
        key_columns: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            kind,
            key_columns,
            included_columns: Vec::new(),
            unique: matches!(kind, IndexKind::Unique | IndexKind::Clustered),
            nulls: NullOrdering::Last,
        }
    }

    pub fn with_included(mut self, included: Vec<String>) -> Self {
        self.included_columns = included;
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn with_nulls(mut self, nulls: NullOrdering) -> Self {
        self.nulls = nulls;
        self
    }

    pub fn is_clustered(&self) -> bool {
        matches!(self.kind, IndexKind::Clustered)
    }

    pub fn is_covering(&self) -> bool {
        matches!(self.kind, IndexKind::Covering)
    }

    pub(crate) fn validate(&self) -> EngineResult<()> {
        if self.name.is_empty() {
            return Err(EngineError::InvalidDescriptor("index name is empty".into()));
        }
        if self.key_columns.is_empty() {
            return Err(EngineError::InvalidDescriptor(format!(
                "index {} has no key columns",
                self.name
            )));
        }
        if matches!(self.kind, IndexKind::Composite) && self.key_columns.len() < 2 {
            return Err(EngineError::InvalidDescriptor(format!(
                "composite index {} needs at least two key columns",
                self.name
            )));
        }
        if matches!(self.kind, IndexKind::Covering) && self.included_columns.is_empty() {
            return Err(EngineError::InvalidDescriptor(format!(
                "covering index {} has no included columns",
                self.name
            )));
        }
        if !matches!(self.kind, IndexKind::Covering) && !self.included_columns.is_empty() {
            return Err(EngineError::InvalidDescriptor(format!(
                "index {} is not covering but lists included columns",
                self.name
            )));
        }
        if matches!(self.kind, IndexKind::Unique) && !self.unique {
            return Err(EngineError::InvalidDescriptor(format!(
                "unique index {} has the unique flag cleared",
                self.name
            )));
        }
        for column in &self.key_columns {
            if self.included_columns.contains(column) {
                return Err(EngineError::InvalidDescriptor(format!(
                    "column {column} of index {} is both key and included",
                    self.name
                )));
            }
        }
        let mut seen = Vec::new();
        for column in self.key_columns.iter().chain(&self.included_columns) {
            if seen.contains(&column) {
                return Err(EngineError::InvalidDescriptor(format!(
                    "column {column} appears twice in index {}",
                    self.name
                )));
            }
            seen.push(column);
        }
        Ok(())
    }
}

/// Registry of tables and their indexes.
pub struct IndexCatalog {
    buffer_pool: BufferPoolManager,
    locks: Arc<LockManager>,
    tables: HashMap<String, Table>,
}

impl IndexCatalog {
    pub fn new(buffer_pool: BufferPoolManager, locks: Arc<LockManager>) -> Self {
        Self {
            buffer_pool,
            locks,
            tables: HashMap::new(),
        }
    }

    pub fn create_table(
        &mut self,
        name: impl Into<String>,
        schema: TableSchema,
    ) -> EngineResult<()> {
        let name = name.into();
        if self.tables.contains_key(&name) {
            return Err(EngineError::TableExists(name));
        }
        let table = Table::create(
            self.buffer_pool.clone(),
            Arc::clone(&self.locks),
            name.clone(),
            schema,
        )?;
        debug!(table = %name, "created table");
        self.tables.insert(name, table);
        Ok(())
    }

    pub fn table(&self, name: &str) -> EngineResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| EngineError::TableNotFound(name.into()))
    }

    pub fn table_mut(&mut self, name: &str) -> EngineResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| EngineError::TableNotFound(name.into()))
    }

    /// Validates a descriptor, builds the index and backfills it from the
    /// table's existing rows.
    pub fn create_index(&mut self, descriptor: IndexDescriptor) -> EngineResult<()> {
        descriptor.validate()?;
        let table = self
            .tables
            .get_mut(&descriptor.table)
            .ok_or_else(|| EngineError::TableNotFound(descriptor.table.clone()))?;
        table.create_index(descriptor)
    }

    /// Unregisters an index and returns its descriptor.
    pub fn drop_index(&mut self, table: &str, name: &str) -> EngineResult<IndexDescriptor> {
        let table = self
            .tables
            .get_mut(table)
            .ok_or_else(|| EngineError::TableNotFound(table.into()))?;
        table.drop_index(name)
    }

    /// Descriptors of a table's indexes in creation order.
    pub fn list_indexes(&self, table: &str) -> EngineResult<Vec<&IndexDescriptor>> {
        Ok(self
            .table(table)?
            .indexes()
            .iter()
            .map(|index| &index.descriptor)
            .collect())
    }
}
