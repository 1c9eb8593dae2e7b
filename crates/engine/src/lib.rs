pub mod access;
pub mod catalog;
pub mod error;
pub mod heap;
pub mod index;
pub mod row;
pub mod table;

pub use access::{AccessPath, AccessPathSelector, ColumnPredicate, PredicateOp};
pub use catalog::{IndexCatalog, IndexDescriptor, IndexKind};
pub use error::{EngineError, EngineResult};
pub use heap::{Rid, RowHeap};
pub use index::{
    BTree, BTreeOptions, Index, IndexEntry, IndexKey, IndexPayload, IndexRange, KeyComponent,
    KeyType, NullOrdering, PayloadLayout, RangeCursor,
};
pub use row::{ColumnDef, DataType, Row, TableSchema, Value};
pub use table::{LiveIndex, Table};
