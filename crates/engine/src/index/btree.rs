//! Page-based B+Tree.
//!
//! The tree is made of a header page (persisted metadata), internal pages
//! and leaf pages. Keys are encoded at a fixed stride derived from the key
//! column types; leaf payloads are variable length, so leaves split on a
//! byte budget rather than an entry count. Leaves are chained through a
//! next-leaf pointer for range scans.
//!
//! Page layout (all nodes):
//!   0       page type (1 header, 2 internal, 3 leaf)
//!   2..4    entry count (u16)
//!   8..16   parent page id (u64, 0 = none)
//!   16..24  leaf: next leaf page id / internal: leftmost child page id
//!   24..    entries
//!
//! Internal entries are `key | child page id` at a fixed stride. Leaf
//! entries are `key | payload length (u16) | payload bytes`.

use std::cmp::Ordering;

use storage::{BufferPoolManager, PageId, PAGE_SIZE};
use tracing::trace;

use crate::error::{EngineError, EngineResult};
use crate::heap::{allocate_page, fetch, Rid};
use crate::index::{
    Index, IndexEntry, IndexKey, IndexPayload, IndexRange, KeyComponent, KeyType, NullOrdering,
    PayloadLayout,
};
use crate::row::DataType;

const PAGE_TYPE_HEADER: u8 = 1;
const PAGE_TYPE_INTERNAL: u8 = 2;
const PAGE_TYPE_LEAF: u8 = 3;

const NODE_HEADER_SIZE: usize = 24;
const LEAF_CAPACITY: usize = PAGE_SIZE - NODE_HEADER_SIZE;
const NO_PAGE: u64 = 0;

/// Tuning knobs fixed at index creation time.
#[derive(Debug, Clone, Copy)]
pub struct BTreeOptions {
    pub unique: bool,
    pub nulls: NullOrdering,
    /// Maximum byte length of a text key component; longer values are
    /// rejected with `InvalidKeyType`.
    pub text_key_size: usize,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            unique: false,
            nulls: NullOrdering::Last,
            text_key_size: 64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeHeader {
    page_type: u8,
    count: u16,
    parent: u64,
    /// Next leaf for leaves, leftmost child for internal nodes.
    special: u64,
}

impl NodeHeader {
    fn read(data: &[u8]) -> Self {
        Self {
            page_type: data[0],
            count: u16::from_le_bytes(data[2..4].try_into().unwrap_or_default()),
            parent: u64::from_le_bytes(data[8..16].try_into().unwrap_or_default()),
            special: u64::from_le_bytes(data[16..24].try_into().unwrap_or_default()),
        }
    }

    fn write(&self, data: &mut [u8]) {
        data[0] = self.page_type;
        data[2..4].copy_from_slice(&self.count.to_le_bytes());
        data[8..16].copy_from_slice(&self.parent.to_le_bytes());
        data[16..24].copy_from_slice(&self.special.to_le_bytes());
    }
}

/// Leaf entry with its payload still encoded. Structural operations only
/// need the key and, for delete/update, the RID at a fixed payload offset.
#[derive(Debug, Clone)]
struct LeafEntry {
    key: IndexKey,
    payload: Vec<u8>,
}

impl LeafEntry {
    fn rid(&self) -> Rid {
        super::decode_rid(&self.payload[1..13])
    }
}

/// A persistent B+Tree index.
#[derive(Clone)]
pub struct BTree {
    buffer_pool: BufferPoolManager,
    name: String,
    header_page_id: PageId,
    key_types: Vec<KeyType>,
    payload: PayloadLayout,
    options: BTreeOptions,
    key_stride: usize,
}

impl BTree {
    /// Creates a new tree: header page plus an empty root leaf.
    pub fn create(
        buffer_pool: BufferPoolManager,
        name: impl Into<String>,
        key_types: Vec<KeyType>,
        payload: PayloadLayout,
        options: BTreeOptions,
    ) -> EngineResult<Self> {
        let name = name.into();
        if key_types.is_empty() || key_types.len() > u8::MAX as usize {
            return Err(EngineError::InvalidDescriptor(format!(
                "index {name} has {} key columns",
                key_types.len()
            )));
        }
        let key_stride = key_stride(&key_types, options.text_key_size);
        if (PAGE_SIZE - NODE_HEADER_SIZE) / (key_stride + 8) < 3 {
            return Err(EngineError::InvalidDescriptor(format!(
                "index {name} key is too wide for a page"
            )));
        }

        let header_page_id = allocate_page(&buffer_pool)?;
        let root_page_id = allocate_page(&buffer_pool)?;
        let tree = Self {
            buffer_pool,
            name,
            header_page_id,
            key_types,
            payload,
            options,
            key_stride,
        };
        tree.write_leaf(
            root_page_id,
            NodeHeader {
                page_type: PAGE_TYPE_LEAF,
                count: 0,
                parent: NO_PAGE,
                special: NO_PAGE,
            },
            &[],
        )?;
        tree.write_header(root_page_id)?;
        Ok(tree)
    }

    /// Reopens a tree from its header page.
    pub fn open(
        buffer_pool: BufferPoolManager,
        name: impl Into<String>,
        header_page_id: PageId,
    ) -> EngineResult<Self> {
        let guard = fetch(&buffer_pool, header_page_id)?;
        let data = guard.data().to_vec();
        drop(guard);
        buffer_pool.unpin_page(header_page_id, false)?;

        if data[0] != PAGE_TYPE_HEADER {
            return Err(EngineError::Corrupt(format!(
                "page {header_page_id} is not an index header"
            )));
        }
        let unique = data[16] != 0;
        let nulls = match data[17] {
            1 => NullOrdering::First,
            2 => NullOrdering::Last,
            other => {
                return Err(EngineError::Corrupt(format!(
                    "unknown null ordering tag {other}"
                )))
            }
        };
        let text_key_size =
            u16::from_le_bytes(data[18..20].try_into().unwrap_or_default()) as usize;
        let key_count = data[20] as usize;
        let payload_kind = data[21];
        let payload_columns = data[22] as usize;

        let mut pos = 24;
        let mut key_types = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            key_types.push(KeyType::from_byte(data[pos])?);
            pos += 1;
        }
        let mut column_types = Vec::with_capacity(payload_columns);
        for _ in 0..payload_columns {
            column_types.push(DataType::from_byte(data[pos])?);
            pos += 1;
        }
        let payload = match payload_kind {
            1 => PayloadLayout::Rid,
            2 => PayloadLayout::Covering(column_types),
            3 => PayloadLayout::Row(column_types),
            other => {
                return Err(EngineError::Corrupt(format!(
                    "unknown payload kind tag {other}"
                )))
            }
        };
        let key_stride = key_stride(&key_types, text_key_size);
        Ok(Self {
            buffer_pool,
            name: name.into(),
            header_page_id,
            key_types,
            payload,
            options: BTreeOptions {
                unique,
                nulls,
                text_key_size,
            },
            key_stride,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    pub fn key_types(&self) -> &[KeyType] {
        &self.key_types
    }

    pub fn payload_layout(&self) -> &PayloadLayout {
        &self.payload
    }

    pub fn is_unique(&self) -> bool {
        self.options.unique
    }

    pub fn null_ordering(&self) -> NullOrdering {
        self.options.nulls
    }

    /// Number of levels from root to leaf.
    pub fn height(&self) -> EngineResult<usize> {
        let mut page_id = self.root_page_id()?;
        let mut levels = 1;
        loop {
            let (header, _raw) = self.read_raw(page_id)?;
            if header.page_type == PAGE_TYPE_LEAF {
                return Ok(levels);
            }
            page_id = header.special;
            levels += 1;
        }
    }

    fn write_header(&self, root_page_id: PageId) -> EngineResult<()> {
        let mut guard = fetch(&self.buffer_pool, self.header_page_id)?;
        let data = guard.data_mut();
        data[0] = PAGE_TYPE_HEADER;
        data[8..16].copy_from_slice(&root_page_id.to_le_bytes());
        data[16] = self.options.unique as u8;
        data[17] = match self.options.nulls {
            NullOrdering::First => 1,
            NullOrdering::Last => 2,
        };
        data[18..20].copy_from_slice(&(self.options.text_key_size as u16).to_le_bytes());
        data[20] = self.key_types.len() as u8;
        data[21] = self.payload.kind_byte();
        data[22] = self.payload.column_types().len() as u8;
        let mut pos = 24;
        for key_type in &self.key_types {
            data[pos] = key_type.to_byte();
            pos += 1;
        }
        for column_type in self.payload.column_types() {
            data[pos] = column_type.to_byte();
            pos += 1;
        }
        drop(guard);
        self.buffer_pool.unpin_page(self.header_page_id, true)?;
        Ok(())
    }

    fn root_page_id(&self) -> EngineResult<PageId> {
        let guard = fetch(&self.buffer_pool, self.header_page_id)?;
        let root = u64::from_le_bytes(guard.data()[8..16].try_into().unwrap_or_default());
        drop(guard);
        self.buffer_pool.unpin_page(self.header_page_id, false)?;
        Ok(root)
    }

    fn set_root_page_id(&self, root: PageId) -> EngineResult<()> {
        let mut guard = fetch(&self.buffer_pool, self.header_page_id)?;
        guard.data_mut()[8..16].copy_from_slice(&root.to_le_bytes());
        drop(guard);
        self.buffer_pool.unpin_page(self.header_page_id, true)?;
        Ok(())
    }

    fn read_raw(&self, page_id: PageId) -> EngineResult<(NodeHeader, Vec<u8>)> {
        let guard = fetch(&self.buffer_pool, page_id)?;
        let data = guard.data().to_vec();
        drop(guard);
        self.buffer_pool.unpin_page(page_id, false)?;
        Ok((NodeHeader::read(&data), data))
    }

    fn set_parent(&self, page_id: PageId, parent: PageId) -> EngineResult<()> {
        let mut guard = fetch(&self.buffer_pool, page_id)?;
        guard.data_mut()[8..16].copy_from_slice(&parent.to_le_bytes());
        drop(guard);
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }

    // --- key codec ---------------------------------------------------------

    fn encode_key(&self, key: &IndexKey) -> EngineResult<Vec<u8>> {
        if key.len() != self.key_types.len() {
            return Err(EngineError::InvalidKeyType(format!(
                "index {} takes {} key columns, got {}",
                self.name,
                self.key_types.len(),
                key.len()
            )));
        }
        let mut buf = Vec::with_capacity(self.key_stride);
        for (component, key_type) in key.components.iter().zip(&self.key_types) {
            match (component, key_type) {
                (KeyComponent::Null, _) => {
                    buf.push(0);
                    buf.resize(buf.len() + component_size(*key_type, self.options.text_key_size) - 1, 0);
                }
                (KeyComponent::Integer(v), KeyType::Integer) => {
                    buf.push(1);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                (KeyComponent::Text(v), KeyType::Text) => {
                    if v.len() > self.options.text_key_size {
                        return Err(EngineError::InvalidKeyType(format!(
                            "text key of {} bytes exceeds the {}-byte limit of index {}",
                            v.len(),
                            self.options.text_key_size,
                            self.name
                        )));
                    }
                    buf.push(2);
                    buf.extend_from_slice(&(v.len() as u16).to_le_bytes());
                    buf.extend_from_slice(v.as_bytes());
                    buf.resize(buf.len() + self.options.text_key_size - v.len(), 0);
                }
                (component, key_type) => {
                    return Err(EngineError::InvalidKeyType(format!(
                        "component {:?} does not fit {key_type:?} column of index {}",
                        component, self.name
                    )))
                }
            }
        }
        Ok(buf)
    }

    fn decode_key(&self, data: &[u8]) -> EngineResult<IndexKey> {
        let mut components = Vec::with_capacity(self.key_types.len());
        let mut pos = 0usize;
        for key_type in &self.key_types {
            let size = component_size(*key_type, self.options.text_key_size);
            let slice = data
                .get(pos..pos + size)
                .ok_or_else(|| EngineError::Corrupt("truncated index key".into()))?;
            pos += size;
            let component = match (slice[0], key_type) {
                (0, _) => KeyComponent::Null,
                (1, KeyType::Integer) => KeyComponent::Integer(i64::from_le_bytes(
                    slice[1..9].try_into().unwrap_or_default(),
                )),
                (2, KeyType::Text) => {
                    let len =
                        u16::from_le_bytes(slice[1..3].try_into().unwrap_or_default()) as usize;
                    let bytes = slice
                        .get(3..3 + len)
                        .ok_or_else(|| EngineError::Corrupt("truncated text key".into()))?;
                    KeyComponent::Text(String::from_utf8(bytes.to_vec()).map_err(|_| {
                        EngineError::Corrupt("index text key is not utf-8".into())
                    })?)
                }
                (tag, _) => {
                    return Err(EngineError::Corrupt(format!(
                        "unknown key component tag {tag}"
                    )))
                }
            };
            components.push(component);
        }
        Ok(IndexKey::new(components))
    }

    // --- node io -----------------------------------------------------------

    fn read_leaf(&self, page_id: PageId) -> EngineResult<(NodeHeader, Vec<LeafEntry>)> {
        let (header, data) = self.read_raw(page_id)?;
        if header.page_type != PAGE_TYPE_LEAF {
            return Err(EngineError::Corrupt(format!(
                "page {page_id} is not a leaf"
            )));
        }
        let mut entries = Vec::with_capacity(header.count as usize);
        let mut pos = NODE_HEADER_SIZE;
        for _ in 0..header.count {
            let key = self.decode_key(&data[pos..])?;
            pos += self.key_stride;
            let len = u16::from_le_bytes(
                data.get(pos..pos + 2)
                    .ok_or_else(|| EngineError::Corrupt("truncated leaf entry".into()))?
                    .try_into()
                    .unwrap_or_default(),
            ) as usize;
            pos += 2;
            let payload = data
                .get(pos..pos + len)
                .ok_or_else(|| EngineError::Corrupt("truncated leaf payload".into()))?
                .to_vec();
            pos += len;
            entries.push(LeafEntry { key, payload });
        }
        Ok((header, entries))
    }

    fn leaf_bytes(&self, entries: &[LeafEntry]) -> usize {
        entries
            .iter()
            .map(|entry| self.key_stride + 2 + entry.payload.len())
            .sum()
    }

    fn write_leaf(
        &self,
        page_id: PageId,
        mut header: NodeHeader,
        entries: &[LeafEntry],
    ) -> EngineResult<()> {
        if self.leaf_bytes(entries) > LEAF_CAPACITY {
            return Err(EngineError::Corrupt(format!(
                "leaf {page_id} overflows its page"
            )));
        }
        header.page_type = PAGE_TYPE_LEAF;
        header.count = entries.len() as u16;
        let mut guard = fetch(&self.buffer_pool, page_id)?;
        let data = guard.data_mut();
        header.write(data);
        let mut pos = NODE_HEADER_SIZE;
        for entry in entries {
            let key_bytes = self.encode_key(&entry.key)?;
            data[pos..pos + self.key_stride].copy_from_slice(&key_bytes);
            pos += self.key_stride;
            data[pos..pos + 2].copy_from_slice(&(entry.payload.len() as u16).to_le_bytes());
            pos += 2;
            data[pos..pos + entry.payload.len()].copy_from_slice(&entry.payload);
            pos += entry.payload.len();
        }
        drop(guard);
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }

    fn read_internal(
        &self,
        page_id: PageId,
    ) -> EngineResult<(NodeHeader, Vec<(IndexKey, PageId)>)> {
        let (header, data) = self.read_raw(page_id)?;
        if header.page_type != PAGE_TYPE_INTERNAL {
            return Err(EngineError::Corrupt(format!(
                "page {page_id} is not an internal node"
            )));
        }
        let stride = self.key_stride + 8;
        let mut entries = Vec::with_capacity(header.count as usize);
        for i in 0..header.count as usize {
            let pos = NODE_HEADER_SIZE + i * stride;
            let key = self.decode_key(&data[pos..])?;
            let child = u64::from_le_bytes(
                data.get(pos + self.key_stride..pos + stride)
                    .ok_or_else(|| EngineError::Corrupt("truncated internal entry".into()))?
                    .try_into()
                    .unwrap_or_default(),
            );
            entries.push((key, child));
        }
        Ok((header, entries))
    }

    fn write_internal(
        &self,
        page_id: PageId,
        mut header: NodeHeader,
        entries: &[(IndexKey, PageId)],
    ) -> EngineResult<()> {
        header.page_type = PAGE_TYPE_INTERNAL;
        header.count = entries.len() as u16;
        let mut guard = fetch(&self.buffer_pool, page_id)?;
        let data = guard.data_mut();
        header.write(data);
        let stride = self.key_stride + 8;
        for (i, (key, child)) in entries.iter().enumerate() {
            let pos = NODE_HEADER_SIZE + i * stride;
            let key_bytes = self.encode_key(key)?;
            data[pos..pos + self.key_stride].copy_from_slice(&key_bytes);
            data[pos + self.key_stride..pos + stride].copy_from_slice(&child.to_le_bytes());
        }
        drop(guard);
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }

    fn max_internal_entries(&self) -> usize {
        (PAGE_SIZE - NODE_HEADER_SIZE) / (self.key_stride + 8)
    }

    // --- descent -----------------------------------------------------------

    /// Walks from the root to the leaf that may hold `bound`. With no bound
    /// the leftmost leaf is returned. `past_equal` steers right of equal
    /// separators and is used when inserting, so duplicates land after
    /// existing equals.
    fn find_leaf(&self, bound: Option<&IndexKey>, past_equal: bool) -> EngineResult<PageId> {
        let mut page_id = self.root_page_id()?;
        loop {
            let (header, _data) = self.read_raw(page_id)?;
            if header.page_type == PAGE_TYPE_LEAF {
                return Ok(page_id);
            }
            let (header, entries) = self.read_internal(page_id)?;
            page_id = match bound {
                None => header.special,
                Some(bound) => {
                    let mut idx = 0usize;
                    for (separator, _child) in &entries {
                        match separator.cmp_bound(bound, self.options.nulls) {
                            Ordering::Less => idx += 1,
                            Ordering::Equal if past_equal => idx += 1,
                            _ => break,
                        }
                    }
                    if idx == 0 {
                        header.special
                    } else {
                        entries[idx - 1].1
                    }
                }
            };
        }
    }

    // --- insertion ---------------------------------------------------------

    /// Validates that `key` and `payload` encode into a storable entry
    /// without touching any page, so callers can reject an oversize
    /// mutation before applying any part of it.
    pub fn check_entry(&self, key: &IndexKey, payload: &IndexPayload) -> EngineResult<()> {
        self.encode_key(key)?;
        let encoded = self.payload.encode(payload)?;
        self.check_entry_size(encoded.len())
    }

    fn check_entry_size(&self, payload_len: usize) -> EngineResult<()> {
        // The quarter-page cap keeps both halves of any byte-balanced split
        // within one page.
        if self.key_stride + 2 + payload_len > LEAF_CAPACITY / 4 {
            return Err(EngineError::EntryTooLarge);
        }
        Ok(())
    }

    fn insert_encoded(&self, key: IndexKey, payload: Vec<u8>) -> EngineResult<()> {
        self.check_entry_size(payload.len())?;
        let leaf_id = self.find_leaf(Some(&key), true)?;
        let (header, mut entries) = self.read_leaf(leaf_id)?;
        let pos = entries
            .iter()
            .position(|entry| entry.key.cmp_with(&key, self.options.nulls) == Ordering::Greater)
            .unwrap_or(entries.len());
        entries.insert(pos, LeafEntry { key, payload });
        if self.leaf_bytes(&entries) <= LEAF_CAPACITY {
            return self.write_leaf(leaf_id, header, &entries);
        }
        self.split_leaf(leaf_id, header, entries)
    }

    fn split_leaf(
        &self,
        leaf_id: PageId,
        header: NodeHeader,
        entries: Vec<LeafEntry>,
    ) -> EngineResult<()> {
        // Split on bytes, not entry count: payloads vary in size.
        let total = self.leaf_bytes(&entries);
        let mut acc = 0usize;
        let mut mid = entries.len() - 1;
        for (i, entry) in entries.iter().enumerate() {
            let size = self.key_stride + 2 + entry.payload.len();
            if i > 0 && acc + size > total / 2 {
                mid = i;
                break;
            }
            acc += size;
        }
        let right_entries = entries[mid..].to_vec();
        let left_entries = entries[..mid].to_vec();
        let separator = right_entries[0].key.clone();

        let right_id = allocate_page(&self.buffer_pool)?;
        self.write_leaf(
            right_id,
            NodeHeader {
                page_type: PAGE_TYPE_LEAF,
                count: 0,
                parent: header.parent,
                special: header.special,
            },
            &right_entries,
        )?;
        self.write_leaf(
            leaf_id,
            NodeHeader {
                page_type: PAGE_TYPE_LEAF,
                count: 0,
                parent: header.parent,
                special: right_id,
            },
            &left_entries,
        )?;
        trace!(index = %self.name, left = leaf_id, right = right_id, "leaf split");
        self.insert_into_parent(leaf_id, separator, right_id, header.parent)
    }

    fn insert_into_parent(
        &self,
        left_id: PageId,
        separator: IndexKey,
        right_id: PageId,
        parent: u64,
    ) -> EngineResult<()> {
        if parent == NO_PAGE {
            let root_id = allocate_page(&self.buffer_pool)?;
            self.write_internal(
                root_id,
                NodeHeader {
                    page_type: PAGE_TYPE_INTERNAL,
                    count: 0,
                    parent: NO_PAGE,
                    special: left_id,
                },
                &[(separator, right_id)],
            )?;
            self.set_parent(left_id, root_id)?;
            self.set_parent(right_id, root_id)?;
            self.set_root_page_id(root_id)?;
            trace!(index = %self.name, root = root_id, "new root");
            return Ok(());
        }

        let (header, mut entries) = self.read_internal(parent)?;
        let pos = entries
            .iter()
            .position(|(key, _)| key.cmp_with(&separator, self.options.nulls) == Ordering::Greater)
            .unwrap_or(entries.len());
        entries.insert(pos, (separator, right_id));
        self.set_parent(right_id, parent)?;
        if entries.len() <= self.max_internal_entries() {
            return self.write_internal(parent, header, &entries);
        }
        self.split_internal(parent, header, entries)
    }

    fn split_internal(
        &self,
        node_id: PageId,
        header: NodeHeader,
        entries: Vec<(IndexKey, PageId)>,
    ) -> EngineResult<()> {
        let mid = entries.len() / 2;
        let (push_key, right_leftmost) = entries[mid].clone();
        let right_entries = entries[mid + 1..].to_vec();
        let left_entries = entries[..mid].to_vec();

        let right_id = allocate_page(&self.buffer_pool)?;
        self.write_internal(
            right_id,
            NodeHeader {
                page_type: PAGE_TYPE_INTERNAL,
                count: 0,
                parent: header.parent,
                special: right_leftmost,
            },
            &right_entries,
        )?;
        self.write_internal(
            node_id,
            NodeHeader {
                page_type: PAGE_TYPE_INTERNAL,
                count: 0,
                parent: header.parent,
                special: header.special,
            },
            &left_entries,
        )?;
        self.set_parent(right_leftmost, right_id)?;
        for (_key, child) in &right_entries {
            self.set_parent(*child, right_id)?;
        }
        trace!(index = %self.name, left = node_id, right = right_id, "internal split");
        self.insert_into_parent(node_id, push_key, right_id, header.parent)
    }

    // --- deletion / rewrite ------------------------------------------------

    /// Locates the leaf and slot of the entry with exactly this key and RID,
    /// walking the sibling chain across duplicate runs.
    fn find_entry(&self, key: &IndexKey, rid: Rid) -> EngineResult<Option<(PageId, usize)>> {
        let mut page_id = self.find_leaf(Some(key), false)?;
        loop {
            let (header, entries) = self.read_leaf(page_id)?;
            for (pos, entry) in entries.iter().enumerate() {
                match entry.key.cmp_with(key, self.options.nulls) {
                    Ordering::Less => continue,
                    Ordering::Equal => {
                        if entry.rid() == rid {
                            return Ok(Some((page_id, pos)));
                        }
                    }
                    Ordering::Greater => return Ok(None),
                }
            }
            if header.special == NO_PAGE {
                return Ok(None);
            }
            page_id = header.special;
        }
    }
}

impl Index for BTree {
    fn insert(&self, key: IndexKey, payload: IndexPayload) -> EngineResult<()> {
        // Unique enforcement skips keys with NULL components, matching SQL
        // unique-constraint semantics.
        if self.options.unique && !key.has_null() && !self.lookup(&key)?.is_empty() {
            return Err(EngineError::DuplicateKey {
                index: self.name.clone(),
                key: key.to_string(),
            });
        }
        let payload = self.payload.encode(&payload)?;
        self.encode_key(&key)?;
        self.insert_encoded(key, payload)
    }

    fn delete(&self, key: &IndexKey, rid: Rid) -> EngineResult<bool> {
        let Some((page_id, pos)) = self.find_entry(key, rid)? else {
            return Ok(false);
        };
        let (header, mut entries) = self.read_leaf(page_id)?;
        entries.remove(pos);
        self.write_leaf(page_id, header, &entries)?;
        Ok(true)
    }

    fn update_payload(
        &self,
        key: &IndexKey,
        rid: Rid,
        payload: IndexPayload,
    ) -> EngineResult<bool> {
        let encoded = self.payload.encode(&payload)?;
        // Enforce the split cap before touching the leaf: once the old
        // payload is gone a rejected reinsert would lose the entry.
        self.check_entry_size(encoded.len())?;
        let Some((page_id, pos)) = self.find_entry(key, rid)? else {
            return Ok(false);
        };
        let (header, mut entries) = self.read_leaf(page_id)?;
        entries[pos].payload = encoded;
        if self.leaf_bytes(&entries) <= LEAF_CAPACITY {
            self.write_leaf(page_id, header, &entries)?;
            return Ok(true);
        }
        // The grown payload no longer fits: take the entry out and reinsert.
        let entry = entries.remove(pos);
        self.write_leaf(page_id, header, &entries)?;
        self.insert_encoded(entry.key, entry.payload)?;
        Ok(true)
    }

    fn lookup(&self, key: &IndexKey) -> EngineResult<Vec<IndexPayload>> {
        let mut cursor = self.range_scan(IndexRange::equality(key.clone()))?;
        let mut payloads = Vec::new();
        while let Some(entry) = cursor.next()? {
            payloads.push(entry.payload);
        }
        Ok(payloads)
    }

    fn range_scan(&self, range: IndexRange) -> EngineResult<RangeCursor> {
        Ok(RangeCursor::new(self.clone(), range))
    }
}

fn component_size(key_type: KeyType, text_key_size: usize) -> usize {
    match key_type {
        KeyType::Integer => 9,
        KeyType::Text => 3 + text_key_size,
    }
}

fn key_stride(key_types: &[KeyType], text_key_size: usize) -> usize {
    key_types
        .iter()
        .map(|key_type| component_size(*key_type, text_key_size))
        .sum()
}

enum CursorState {
    Unstarted,
    InLeaf {
        entries: Vec<IndexEntry>,
        pos: usize,
        next: u64,
    },
    Done,
}

/// Lazy cursor over a key range. Buffers one leaf at a time and follows the
/// sibling chain; `rewind` restarts the scan from the lower bound.
pub struct RangeCursor {
    tree: BTree,
    range: IndexRange,
    state: CursorState,
}

impl RangeCursor {
    fn new(tree: BTree, range: IndexRange) -> Self {
        Self {
            tree,
            range,
            state: CursorState::Unstarted,
        }
    }

    pub fn rewind(&mut self) {
        self.state = CursorState::Unstarted;
    }

    pub fn next(&mut self) -> EngineResult<Option<IndexEntry>> {
        loop {
            match &mut self.state {
                CursorState::Done => return Ok(None),
                CursorState::Unstarted => {
                    let lower = self.range.lower.as_ref().map(|(key, _)| key);
                    let leaf_id = self.tree.find_leaf(lower, false)?;
                    self.state = self.load_leaf(leaf_id)?;
                }
                CursorState::InLeaf { entries, pos, next } => {
                    if *pos >= entries.len() {
                        if *next == NO_PAGE {
                            self.state = CursorState::Done;
                            return Ok(None);
                        }
                        let next = *next;
                        self.state = self.load_leaf(next)?;
                        continue;
                    }
                    let entry = entries[*pos].clone();
                    *pos += 1;
                    if let Some((lower, inclusive)) = &self.range.lower {
                        match entry.key.cmp_bound(lower, self.tree.options.nulls) {
                            Ordering::Less => continue,
                            Ordering::Equal if !inclusive => continue,
                            _ => {}
                        }
                    }
                    if let Some((upper, inclusive)) = &self.range.upper {
                        match entry.key.cmp_bound(upper, self.tree.options.nulls) {
                            Ordering::Greater => {
                                self.state = CursorState::Done;
                                return Ok(None);
                            }
                            Ordering::Equal if !inclusive => {
                                self.state = CursorState::Done;
                                return Ok(None);
                            }
                            _ => {}
                        }
                    }
                    return Ok(Some(entry));
                }
            }
        }
    }

    /// Drains the remaining entries. Convenience for callers that want the
    /// whole range at once.
    pub fn collect_entries(&mut self) -> EngineResult<Vec<IndexEntry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next()? {
            out.push(entry);
        }
        Ok(out)
    }

    fn load_leaf(&self, page_id: PageId) -> EngineResult<CursorState> {
        let (header, raw_entries) = self.tree.read_leaf(page_id)?;
        let mut entries = Vec::with_capacity(raw_entries.len());
        for entry in raw_entries {
            entries.push(IndexEntry {
                payload: self.tree.payload.decode(&entry.payload)?,
                key: entry.key,
            });
        }
        Ok(CursorState::InLeaf {
            entries,
            pos: 0,
            next: header.special,
        })
    }
}
