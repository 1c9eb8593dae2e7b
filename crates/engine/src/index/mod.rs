//! Index key model and the common index interface.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::heap::Rid;
use crate::row::{decode_values, encode_values, DataType, Value};

mod btree;

pub use btree::{BTree, BTreeOptions, RangeCursor};

/// Where NULL key components sort relative to non-null values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullOrdering {
    First,
    Last,
}

/// Declared type of one key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Integer,
    Text,
}

impl KeyType {
    pub fn for_data_type(data_type: DataType) -> EngineResult<Self> {
        match data_type {
            DataType::Integer | DataType::BigInt | DataType::Timestamp => Ok(KeyType::Integer),
            DataType::Text => Ok(KeyType::Text),
            DataType::Boolean => Err(EngineError::InvalidKeyType(
                "boolean columns cannot be indexed".into(),
            )),
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            KeyType::Integer => 1,
            KeyType::Text => 2,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> EngineResult<Self> {
        match byte {
            1 => Ok(KeyType::Integer),
            2 => Ok(KeyType::Text),
            other => Err(EngineError::Corrupt(format!("unknown key type tag {other}"))),
        }
    }
}

/// One component of a (possibly composite) index key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyComponent {
    Null,
    Integer(i64),
    Text(String),
}

impl KeyComponent {
    pub fn from_value(value: &Value, key_type: KeyType) -> EngineResult<Self> {
        match (value, key_type) {
            (Value::Null, _) => Ok(KeyComponent::Null),
            (Value::Integer(v), KeyType::Integer) => Ok(KeyComponent::Integer(*v)),
            (Value::Timestamp(v), KeyType::Integer) => Ok(KeyComponent::Integer(*v)),
            (Value::Text(v), KeyType::Text) => Ok(KeyComponent::Text(v.clone())),
            (value, key_type) => Err(EngineError::InvalidKeyType(format!(
                "value {value} is not usable as a {key_type:?} key"
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            KeyComponent::Null => Value::Null,
            KeyComponent::Integer(v) => Value::Integer(*v),
            KeyComponent::Text(v) => Value::Text(v.clone()),
        }
    }

    fn cmp_with(&self, other: &Self, nulls: NullOrdering) -> Ordering {
        match (self, other) {
            (KeyComponent::Null, KeyComponent::Null) => Ordering::Equal,
            (KeyComponent::Null, _) => match nulls {
                NullOrdering::First => Ordering::Less,
                NullOrdering::Last => Ordering::Greater,
            },
            (_, KeyComponent::Null) => match nulls {
                NullOrdering::First => Ordering::Greater,
                NullOrdering::Last => Ordering::Less,
            },
            (KeyComponent::Integer(l), KeyComponent::Integer(r)) => l.cmp(r),
            (KeyComponent::Text(l), KeyComponent::Text(r)) => l.cmp(r),
            // Mixed types only appear on corrupt input; keep the order total.
            (KeyComponent::Integer(_), KeyComponent::Text(_)) => Ordering::Less,
            (KeyComponent::Text(_), KeyComponent::Integer(_)) => Ordering::Greater,
        }
    }
}

/// Composite index key. Bounds used in ranges may carry fewer components
/// than the index declares; comparison then only looks at the bound prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey {
    pub components: Vec<KeyComponent>,
}

impl IndexKey {
    pub fn new(components: Vec<KeyComponent>) -> Self {
        Self { components }
    }

    pub fn from_values(values: &[Value], types: &[KeyType]) -> EngineResult<Self> {
        if values.len() != types.len() {
            return Err(EngineError::InvalidKeyType(format!(
                "{} key values against {} key columns",
                values.len(),
                types.len()
            )));
        }
        let components = values
            .iter()
            .zip(types)
            .map(|(value, key_type)| KeyComponent::from_value(value, *key_type))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self { components })
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn has_null(&self) -> bool {
        self.components
            .iter()
            .any(|component| matches!(component, KeyComponent::Null))
    }

    /// Full comparison of two same-arity keys.
    pub fn cmp_with(&self, other: &Self, nulls: NullOrdering) -> Ordering {
        for (left, right) in self.components.iter().zip(&other.components) {
            match left.cmp_with(right, nulls) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.components.len().cmp(&other.components.len())
    }

    /// Compares an entry key against a bound, looking only at the bound's
    /// components. A shorter bound therefore matches every extension of its
    /// prefix as Equal.
    pub fn cmp_bound(&self, bound: &Self, nulls: NullOrdering) -> Ordering {
        for (left, right) in self.components.iter().zip(&bound.components) {
            match left.cmp_with(right, nulls) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        if self.components.len() < bound.components.len() {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }
}

impl std::fmt::Display for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", component.to_value())?;
        }
        write!(f, ")")
    }
}

/// Half-open or closed scan range over index keys. `None` bounds are
/// unbounded; the bool marks the bound inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRange {
    pub lower: Option<(IndexKey, bool)>,
    pub upper: Option<(IndexKey, bool)>,
}

impl IndexRange {
    pub fn full() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    /// Matches exactly `key`, including every extension when `key` is a
    /// prefix of the index's key columns.
    pub fn equality(key: IndexKey) -> Self {
        Self {
            lower: Some((key.clone(), true)),
            upper: Some((key, true)),
        }
    }
}

/// What a leaf entry carries next to its key. Every variant keeps the RID so
/// delete and update can address one entry among duplicates.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexPayload {
    /// Plain secondary index: heap address only.
    Rid(Rid),
    /// Covering index: heap address plus the included column values.
    Covering { rid: Rid, included: Vec<Value> },
    /// Clustered index: the full row lives in the leaf.
    Row { rid: Rid, values: Vec<Value> },
}

impl IndexPayload {
    pub fn rid(&self) -> Rid {
        match self {
            IndexPayload::Rid(rid) => *rid,
            IndexPayload::Covering { rid, .. } => *rid,
            IndexPayload::Row { rid, .. } => *rid,
        }
    }
}

/// Shape of the payloads an index stores, with the column types needed to
/// decode the value portion.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadLayout {
    Rid,
    Covering(Vec<DataType>),
    Row(Vec<DataType>),
}

impl PayloadLayout {
    pub(crate) fn encode(&self, payload: &IndexPayload) -> EngineResult<Vec<u8>> {
        let mut buf = Vec::new();
        match (self, payload) {
            (PayloadLayout::Rid, IndexPayload::Rid(rid)) => {
                buf.push(1);
                encode_rid(&mut buf, *rid);
            }
            (PayloadLayout::Covering(types), IndexPayload::Covering { rid, included }) => {
                buf.push(2);
                encode_rid(&mut buf, *rid);
                buf.extend_from_slice(&encode_values(included, types)?);
            }
            (PayloadLayout::Row(types), IndexPayload::Row { rid, values }) => {
                buf.push(3);
                encode_rid(&mut buf, *rid);
                buf.extend_from_slice(&encode_values(values, types)?);
            }
            (layout, payload) => {
                return Err(EngineError::Corrupt(format!(
                    "payload {payload:?} does not match layout {layout:?}"
                )))
            }
        }
        Ok(buf)
    }

    pub(crate) fn decode(&self, data: &[u8]) -> EngineResult<IndexPayload> {
        let tag = *data
            .first()
            .ok_or_else(|| EngineError::Corrupt("empty index payload".into()))?;
        let rid = decode_rid(data.get(1..13).ok_or_else(|| {
            EngineError::Corrupt("index payload too short for a RID".into())
        })?);
        let rest = &data[13..];
        match (self, tag) {
            (PayloadLayout::Rid, 1) => Ok(IndexPayload::Rid(rid)),
            (PayloadLayout::Covering(types), 2) => Ok(IndexPayload::Covering {
                rid,
                included: decode_values(rest, types)?,
            }),
            (PayloadLayout::Row(types), 3) => Ok(IndexPayload::Row {
                rid,
                values: decode_values(rest, types)?,
            }),
            (layout, tag) => Err(EngineError::Corrupt(format!(
                "payload tag {tag} does not match layout {layout:?}"
            ))),
        }
    }

    pub(crate) fn kind_byte(&self) -> u8 {
        match self {
            PayloadLayout::Rid => 1,
            PayloadLayout::Covering(_) => 2,
            PayloadLayout::Row(_) => 3,
        }
    }

    pub(crate) fn column_types(&self) -> &[DataType] {
        match self {
            PayloadLayout::Rid => &[],
            PayloadLayout::Covering(types) => types,
            PayloadLayout::Row(types) => types,
        }
    }
}

fn encode_rid(buf: &mut Vec<u8>, rid: Rid) {
    buf.extend_from_slice(&rid.page_id.to_le_bytes());
    buf.extend_from_slice(&(rid.slot as u32).to_le_bytes());
}

fn decode_rid(data: &[u8]) -> Rid {
    Rid {
        page_id: u64::from_le_bytes(data[0..8].try_into().unwrap_or_default()),
        slot: u32::from_le_bytes(data[8..12].try_into().unwrap_or_default()) as u16,
    }
}

/// One leaf entry: key plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub key: IndexKey,
    pub payload: IndexPayload,
}

/// Common interface every index structure implements.
pub trait Index {
    /// Inserts an entry, enforcing uniqueness when the index is unique.
    fn insert(&self, key: IndexKey, payload: IndexPayload) -> EngineResult<()>;

    /// Removes the entry with this exact key and RID. Returns false when no
    /// such entry exists.
    fn delete(&self, key: &IndexKey, rid: Rid) -> EngineResult<bool>;

    /// Rewrites the payload of the entry addressed by key and RID without
    /// moving the entry.
    fn update_payload(&self, key: &IndexKey, rid: Rid, payload: IndexPayload)
        -> EngineResult<bool>;

    /// All payloads whose key equals `key` (prefix semantics for short keys).
    fn lookup(&self, key: &IndexKey) -> EngineResult<Vec<IndexPayload>>;

    /// Lazy cursor over a key range in ascending key order.
    fn range_scan(&self, range: IndexRange) -> EngineResult<RangeCursor>;
}
