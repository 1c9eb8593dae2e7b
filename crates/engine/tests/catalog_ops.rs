mod common;

use tempfile::TempDir;

use common::{catalog, user, users_schema};
use engine::{
    EngineError, Index, IndexDescriptor, IndexKey, IndexKind, KeyComponent,
};

#[test]
fn create_and_list_in_creation_order() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    for (name, kind, columns) in [
        ("idx_a", IndexKind::NonClustered, vec!["last_name"]),
        ("idx_b", IndexKind::Unique, vec!["email"]),
        ("idx_c", IndexKind::Composite, vec!["last_name", "email"]),
    ] {
        catalog
            .create_index(IndexDescriptor::new(
                name,
                "users",
                kind,
                columns.into_iter().map(String::from).collect(),
            ))
            .unwrap();
    }
    let listed: Vec<&str> = catalog
        .list_indexes("users")
        .unwrap()
        .iter()
        .map(|descriptor| descriptor.name.as_str())
        .collect();
    assert_eq!(listed, vec!["idx_a", "idx_b", "idx_c"]);
}

#[test]
fn duplicate_index_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    let descriptor = IndexDescriptor::new(
        "idx_users_last_name",
        "users",
        IndexKind::NonClustered,
        vec!["last_name".into()],
    );
    catalog.create_index(descriptor.clone()).unwrap();
    assert!(matches!(
        catalog.create_index(descriptor),
        Err(EngineError::AlreadyExists(name)) if name == "idx_users_last_name"
    ));
    assert_eq!(catalog.list_indexes("users").unwrap().len(), 1);
}

#[test]
fn second_clustered_index_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    catalog
        .create_index(IndexDescriptor::new(
            "idx_users_pk",
            "users",
            IndexKind::Clustered,
            vec!["id".into()],
        ))
        .unwrap();
    let err = catalog.create_index(IndexDescriptor::new(
        "idx_users_pk2",
        "users",
        IndexKind::Clustered,
        vec!["email".into()],
    ));
    assert!(matches!(
        err,
        Err(EngineError::ClusteredConflict { ref existing, .. }) if existing == "idx_users_pk"
    ));
}

#[test]
fn drop_unknown_index_is_not_found() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    assert!(matches!(
        catalog.drop_index("users", "idx_missing"),
        Err(EngineError::NotFound(name)) if name == "idx_missing"
    ));
    assert!(matches!(
        catalog.drop_index("orders", "idx_missing"),
        Err(EngineError::TableNotFound(_))
    ));
}

#[test]
fn drop_unregisters_the_index() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    catalog
        .create_index(IndexDescriptor::new(
            "idx_users_last_name",
            "users",
            IndexKind::NonClustered,
            vec!["last_name".into()],
        ))
        .unwrap();
    let descriptor = catalog.drop_index("users", "idx_users_last_name").unwrap();
    assert_eq!(descriptor.name, "idx_users_last_name");
    assert!(catalog.list_indexes("users").unwrap().is_empty());
    // A fresh index under the old name starts empty and is usable.
    catalog
        .create_index(IndexDescriptor::new(
            "idx_users_last_name",
            "users",
            IndexKind::NonClustered,
            vec!["last_name".into()],
        ))
        .unwrap();
    assert_eq!(catalog.list_indexes("users").unwrap().len(), 1);
}

#[test]
fn create_index_backfills_existing_rows() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    {
        let table = catalog.table("users").unwrap();
        for i in 0..20 {
            table
                .insert_row(user(i, &format!("name{i}"), &format!("u{i}@example.com"), true))
                .unwrap();
        }
    }
    catalog
        .create_index(IndexDescriptor::new(
            "idx_users_last_name",
            "users",
            IndexKind::NonClustered,
            vec!["last_name".into()],
        ))
        .unwrap();
    let table = catalog.table("users").unwrap();
    let index = table.find_index("idx_users_last_name").unwrap();
    for i in 0..20 {
        let key = IndexKey::new(vec![KeyComponent::Text(format!("name{i}"))]);
        assert_eq!(index.btree.lookup(&key).unwrap().len(), 1, "key name{i}");
    }
}

#[test]
fn boolean_key_column_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    assert!(matches!(
        catalog.create_index(IndexDescriptor::new(
            "idx_users_active",
            "users",
            IndexKind::NonClustered,
            vec!["active".into()],
        )),
        Err(EngineError::InvalidKeyType(_))
    ));
    assert!(catalog.list_indexes("users").unwrap().is_empty());
}

#[test]
fn malformed_descriptors_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();

    // Covering without included columns.
    let covering = IndexDescriptor::new(
        "idx_cover",
        "users",
        IndexKind::Covering,
        vec!["last_name".into()],
    );
    assert!(matches!(
        catalog.create_index(covering),
        Err(EngineError::InvalidDescriptor(_))
    ));

    // Composite with a single key column.
    let composite = IndexDescriptor::new(
        "idx_single",
        "users",
        IndexKind::Composite,
        vec!["last_name".into()],
    );
    assert!(matches!(
        catalog.create_index(composite),
        Err(EngineError::InvalidDescriptor(_))
    ));

    // Column listed as both key and included.
    let overlapping = IndexDescriptor::new(
        "idx_overlap",
        "users",
        IndexKind::Covering,
        vec!["last_name".into()],
    )
    .with_included(vec!["last_name".into()]);
    assert!(matches!(
        catalog.create_index(overlapping),
        Err(EngineError::InvalidDescriptor(_))
    ));

    // Unknown column.
    let unknown = IndexDescriptor::new(
        "idx_unknown",
        "users",
        IndexKind::NonClustered,
        vec!["nickname".into()],
    );
    assert!(matches!(
        catalog.create_index(unknown),
        Err(EngineError::Schema(_))
    ));
}

#[test]
fn unknown_table_is_reported() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    assert!(matches!(
        catalog.create_index(IndexDescriptor::new(
            "idx_orders",
            "orders",
            IndexKind::NonClustered,
            vec!["id".into()],
        )),
        Err(EngineError::TableNotFound(table)) if table == "orders"
    ));
    assert!(matches!(
        catalog.list_indexes("orders"),
        Err(EngineError::TableNotFound(_))
    ));
}

#[test]
fn duplicate_table_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut catalog = catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    assert!(matches!(
        catalog.create_table("users", users_schema()),
        Err(EngineError::TableExists(_))
    ));
}
