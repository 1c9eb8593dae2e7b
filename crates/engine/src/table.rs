//! Table-level coordination: every row mutation goes through here so the
//! heap and all indexes stay consistent.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use storage::BufferPoolManager;
use tracing::{debug, warn};
use txn::{LockKey, LockManager, OwnerId};

use crate::catalog::{IndexDescriptor, IndexKind};
use crate::error::{EngineError, EngineResult};
use crate::heap::{Rid, RowHeap};
use crate::index::{
    BTree, BTreeOptions, Index, IndexEntry, IndexKey, IndexPayload, IndexRange, KeyType,
    PayloadLayout,
};
use crate::row::{Row, TableSchema};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

fn next_owner() -> OwnerId {
    OwnerId(NEXT_OWNER.fetch_add(1, AtomicOrdering::Relaxed))
}

/// An index attached to a table, with its key and included columns already
/// resolved against the table schema.
pub struct LiveIndex {
    pub descriptor: IndexDescriptor,
    pub key_indices: Vec<usize>,
    pub key_types: Vec<KeyType>,
    pub included_indices: Vec<usize>,
    pub btree: BTree,
}

impl LiveIndex {
    pub fn key_for(&self, row: &Row) -> EngineResult<IndexKey> {
        let values: Vec<_> = self.key_indices.iter().map(|&i| row[i].clone()).collect();
        IndexKey::from_values(&values, &self.key_types)
    }

    pub fn payload_for(&self, row: &Row, rid: Rid) -> IndexPayload {
        match self.descriptor.kind {
            IndexKind::Clustered => IndexPayload::Row {
                rid,
                values: row.clone(),
            },
            IndexKind::Covering => IndexPayload::Covering {
                rid,
                included: self
                    .included_indices
                    .iter()
                    .map(|&i| row[i].clone())
                    .collect(),
            },
            _ => IndexPayload::Rid(rid),
        }
    }

    fn is_unique(&self) -> bool {
        self.btree.is_unique()
    }
}

/// One table: heap, schema and attached indexes.
pub struct Table {
    name: String,
    schema: TableSchema,
    heap: RowHeap,
    indexes: Vec<LiveIndex>,
    buffer_pool: BufferPoolManager,
    locks: Arc<LockManager>,
}

impl Table {
    pub fn create(
        buffer_pool: BufferPoolManager,
        locks: Arc<LockManager>,
        name: impl Into<String>,
        schema: TableSchema,
    ) -> EngineResult<Self> {
        let heap = RowHeap::create(buffer_pool.clone(), schema.column_types())?;
        Ok(Self {
            name: name.into(),
            schema,
            heap,
            indexes: Vec::new(),
            buffer_pool,
            locks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn heap(&self) -> &RowHeap {
        &self.heap
    }

    pub fn indexes(&self) -> &[LiveIndex] {
        &self.indexes
    }

    pub fn find_index(&self, name: &str) -> EngineResult<&LiveIndex> {
        self.indexes
            .iter()
            .find(|index| index.descriptor.name == name)
            .ok_or_else(|| EngineError::NotFound(name.into()))
    }

    pub fn clustered_index(&self) -> Option<&LiveIndex> {
        self.indexes
            .iter()
            .find(|index| index.descriptor.is_clustered())
    }

    // --- index lifecycle ---------------------------------------------------

    /// Builds the index and backfills it from every live row. The caller
    /// (the catalog) has already validated the descriptor shape.
    pub(crate) fn create_index(&mut self, descriptor: IndexDescriptor) -> EngineResult<()> {
        if self
            .indexes
            .iter()
            .any(|index| index.descriptor.name == descriptor.name)
        {
            return Err(EngineError::AlreadyExists(descriptor.name));
        }
        if descriptor.is_clustered() {
            if let Some(existing) = self.clustered_index() {
                return Err(EngineError::ClusteredConflict {
                    table: self.name.clone(),
                    existing: existing.descriptor.name.clone(),
                });
            }
        }

        let key_indices = self.resolve_columns(&descriptor.key_columns)?;
        let key_types = key_indices
            .iter()
            .map(|&i| KeyType::for_data_type(self.schema.columns[i].data_type))
            .collect::<EngineResult<Vec<_>>>()?;
        let included_indices = self.resolve_columns(&descriptor.included_columns)?;

        let payload = match descriptor.kind {
            IndexKind::Clustered => PayloadLayout::Row(self.schema.column_types()),
            IndexKind::Covering => PayloadLayout::Covering(
                included_indices
                    .iter()
                    .map(|&i| self.schema.columns[i].data_type)
                    .collect(),
            ),
            _ => PayloadLayout::Rid,
        };
        let btree = BTree::create(
            self.buffer_pool.clone(),
            descriptor.name.clone(),
            key_types.clone(),
            payload,
            BTreeOptions {
                unique: descriptor.unique,
                nulls: descriptor.nulls,
                ..BTreeOptions::default()
            },
        )?;

        let index = LiveIndex {
            descriptor,
            key_indices,
            key_types,
            included_indices,
            btree,
        };
        let mut backfilled = 0usize;
        for (rid, row) in self.heap.scan()? {
            let key = index.key_for(&row)?;
            index.btree.insert(key, index.payload_for(&row, rid))?;
            backfilled += 1;
        }
        debug!(
            table = %self.name,
            index = %index.descriptor.name,
            rows = backfilled,
            "index created"
        );
        self.indexes.push(index);
        Ok(())
    }

    pub(crate) fn drop_index(&mut self, name: &str) -> EngineResult<IndexDescriptor> {
        let pos = self
            .indexes
            .iter()
            .position(|index| index.descriptor.name == name)
            .ok_or_else(|| EngineError::NotFound(name.into()))?;
        let index = self.indexes.remove(pos);
        // The tree's pages stay in the file: the disk manager never reuses
        // page ids, so reclaiming them needs a disk-level free list first.
        debug!(table = %self.name, index = %name, "index dropped");
        Ok(index.descriptor)
    }

    fn resolve_columns(&self, names: &[String]) -> EngineResult<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.schema.column_index(name).ok_or_else(|| {
                    EngineError::Schema(format!(
                        "table {} has no column {name}",
                        self.name
                    ))
                })
            })
            .collect()
    }

    // --- row mutations -----------------------------------------------------

    /// Inserts a row into the heap and every index. Unique violations are
    /// detected before any mutation; a failure while propagating to indexes
    /// rolls back the entries and the heap row already written.
    pub fn insert_row(&self, row: Row) -> EngineResult<Rid> {
        self.schema.check_row(&row)?;
        let keys = self.keys_for(&row)?;

        let owner = next_owner();
        let result = self.insert_locked(owner, &row, &keys);
        self.locks.unlock_all(owner);
        result
    }

    fn insert_locked(&self, owner: OwnerId, row: &Row, keys: &[IndexKey]) -> EngineResult<Rid> {
        self.lock_for_maintenance(owner)?;
        self.check_unique(keys, None)?;
        let rid = self.heap.insert(row)?;
        self.locks.lock_exclusive(owner, LockKey::Page(rid.page_id))?;
        for (applied, (index, key)) in self.indexes.iter().zip(keys).enumerate() {
            if let Err(err) = index
                .btree
                .insert(key.clone(), index.payload_for(row, rid))
            {
                self.rollback_insert(rid, &keys[..applied]);
                return Err(err);
            }
        }
        debug!(table = %self.name, rid = ?rid, indexes = self.indexes.len(), "row inserted");
        Ok(rid)
    }

    fn rollback_insert(&self, rid: Rid, applied_keys: &[IndexKey]) {
        for (index, key) in self.indexes.iter().zip(applied_keys) {
            if let Err(err) = index.btree.delete(key, rid) {
                warn!(
                    table = %self.name,
                    index = %index.descriptor.name,
                    error = %err,
                    "rollback failed to remove index entry"
                );
            }
        }
        if let Err(err) = self.heap.delete(rid) {
            warn!(table = %self.name, error = %err, "rollback failed to remove heap row");
        }
    }

    /// Removes a row and all of its index entries. Returns false when the
    /// RID does not address a live row.
    pub fn delete_row(&self, rid: Rid) -> EngineResult<bool> {
        let owner = next_owner();
        let result = self.delete_locked(owner, rid);
        self.locks.unlock_all(owner);
        result
    }

    fn delete_locked(&self, owner: OwnerId, rid: Rid) -> EngineResult<bool> {
        self.lock_for_maintenance(owner)?;
        self.locks.lock_exclusive(owner, LockKey::Page(rid.page_id))?;
        let Some(row) = self.heap.get(rid)? else {
            return Ok(false);
        };
        self.heap.delete(rid)?;
        for index in &self.indexes {
            let key = index.key_for(&row)?;
            index.btree.delete(&key, rid)?;
        }
        debug!(table = %self.name, rid = ?rid, "row deleted");
        Ok(true)
    }

    /// Replaces the row at `rid`. Indexes whose key changed get the old
    /// entry removed and a new one inserted; indexes whose key is unchanged
    /// but whose payload is stale (the row moved, or stored values changed)
    /// get the payload rewritten in place. Returns the row's RID after the
    /// update, which differs from `rid` when the row had to relocate.
    pub fn update_row(&self, rid: Rid, new_row: Row) -> EngineResult<Rid> {
        self.schema.check_row(&new_row)?;
        let owner = next_owner();
        let result = self.update_locked(owner, rid, &new_row);
        self.locks.unlock_all(owner);
        result
    }

    fn update_locked(&self, owner: OwnerId, rid: Rid, new_row: &Row) -> EngineResult<Rid> {
        self.lock_for_maintenance(owner)?;
        self.locks.lock_exclusive(owner, LockKey::Page(rid.page_id))?;
        let old_row = self
            .heap
            .get(rid)?
            .ok_or(EngineError::RowNotFound(rid))?;
        let old_keys = self.keys_for(&old_row)?;
        let new_keys = self.keys_for(new_row)?;
        self.check_unique_changed(&old_keys, &new_keys, rid)?;
        // Every rewritten entry must fit its tree before anything mutates;
        // entry size does not depend on the RID.
        for (index, new_key) in self.indexes.iter().zip(&new_keys) {
            index.btree.check_entry(new_key, &index.payload_for(new_row, rid))?;
        }

        let new_rid = self.heap.update(rid, new_row)?;
        if new_rid.page_id != rid.page_id {
            self.locks
                .lock_exclusive(owner, LockKey::Page(new_rid.page_id))?;
        }

        for ((index, old_key), new_key) in self.indexes.iter().zip(&old_keys).zip(&new_keys) {
            if old_key != new_key {
                index.btree.delete(old_key, rid)?;
                index
                    .btree
                    .insert(new_key.clone(), index.payload_for(new_row, new_rid))?;
                continue;
            }
            let old_payload = index.payload_for(&old_row, rid);
            let new_payload = index.payload_for(new_row, new_rid);
            if old_payload != new_payload {
                index.btree.update_payload(old_key, rid, new_payload)?;
            }
        }
        debug!(table = %self.name, old = ?rid, new = ?new_rid, "row updated");
        Ok(new_rid)
    }

    /// Every live row under shared page locks.
    pub fn scan_rows(&self) -> EngineResult<Vec<(Rid, Row)>> {
        let owner = next_owner();
        let result = self.scan_locked(owner);
        self.locks.unlock_all(owner);
        result
    }

    fn scan_locked(&self, owner: OwnerId) -> EngineResult<Vec<(Rid, Row)>> {
        for page_id in self.heap.page_ids()? {
            self.locks.lock_shared(owner, LockKey::Page(page_id))?;
        }
        self.heap.scan()
    }

    /// Fetches one row under a shared page lock.
    pub fn get_row(&self, rid: Rid) -> EngineResult<Option<Row>> {
        let owner = next_owner();
        let result = (|| {
            self.locks.lock_shared(owner, LockKey::Page(rid.page_id))?;
            self.heap.get(rid)
        })();
        self.locks.unlock_all(owner);
        result
    }

    /// Drains an index range under a shared lock on the index, so readers
    /// never observe a mutation mid-flight.
    pub fn read_index_range(
        &self,
        index: &LiveIndex,
        range: IndexRange,
    ) -> EngineResult<Vec<IndexEntry>> {
        let owner = next_owner();
        let result = (|| {
            self.locks
                .lock_shared(owner, LockKey::Page(index.btree.header_page_id()))?;
            index.btree.range_scan(range)?.collect_entries()
        })();
        self.locks.unlock_all(owner);
        result
    }

    // --- helpers -----------------------------------------------------------

    /// Serializes the whole mutation: exclusive locks on every index header
    /// page (the entry point of each tree) and on the heap's first page (the
    /// entry point of the page chain), all held until `unlock_all`. Always
    /// taken in this order so writers cannot deadlock each other.
    fn lock_for_maintenance(&self, owner: OwnerId) -> EngineResult<()> {
        for index in &self.indexes {
            self.locks
                .lock_exclusive(owner, LockKey::Page(index.btree.header_page_id()))?;
        }
        self.locks
            .lock_exclusive(owner, LockKey::Page(self.heap.first_page_id()))?;
        Ok(())
    }

    fn keys_for(&self, row: &Row) -> EngineResult<Vec<IndexKey>> {
        self.indexes.iter().map(|index| index.key_for(row)).collect()
    }

    /// Rejects the mutation when a unique index already holds one of `keys`
    /// under a different RID. `own_rid` is None for inserts.
    fn check_unique(&self, keys: &[IndexKey], own_rid: Option<Rid>) -> EngineResult<()> {
        for (index, key) in self.indexes.iter().zip(keys) {
            if !index.is_unique() || key.has_null() {
                continue;
            }
            let clash = index
                .btree
                .lookup(key)?
                .iter()
                .any(|payload| Some(payload.rid()) != own_rid);
            if clash {
                return Err(EngineError::DuplicateKey {
                    index: index.descriptor.name.clone(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_unique_changed(
        &self,
        old_keys: &[IndexKey],
        new_keys: &[IndexKey],
        rid: Rid,
    ) -> EngineResult<()> {
        for ((index, old_key), new_key) in self.indexes.iter().zip(old_keys).zip(new_keys) {
            if !index.is_unique() || new_key.has_null() || old_key == new_key {
                continue;
            }
            let clash = index
                .btree
                .lookup(new_key)?
                .iter()
                .any(|payload| payload.rid() != rid);
            if clash {
                return Err(EngineError::DuplicateKey {
                    index: index.descriptor.name.clone(),
                    key: new_key.to_string(),
                });
            }
        }
        Ok(())
    }
}
