use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use engine::{ColumnDef, DataType, IndexCatalog, Row, TableSchema, Value};
use storage::{BufferPoolManager, DiskManager};
use txn::{DeadlockPolicy, LockManager};

pub fn catalog(dir: &TempDir) -> IndexCatalog {
    let path = dir.path().join("tables.db");
    let disk_manager = DiskManager::open(path.to_str().unwrap()).unwrap();
    let buffer_pool = BufferPoolManager::new(disk_manager, 128);
    let locks = Arc::new(LockManager::new(DeadlockPolicy::Timeout(
        Duration::from_secs(1),
    )));
    IndexCatalog::new(buffer_pool, locks)
}

pub fn users_schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnDef::new("id", DataType::Integer),
        ColumnDef::new("last_name", DataType::Text),
        ColumnDef::new("email", DataType::Text),
        ColumnDef::new("active", DataType::Boolean),
    ])
}

pub fn user(id: i64, last_name: &str, email: &str, active: bool) -> Row {
    vec![
        Value::Integer(id),
        Value::Text(last_name.into()),
        Value::Text(email.into()),
        Value::Boolean(active),
    ]
}
