mod common;

use tempfile::TempDir;

use common::{catalog, user, users_schema};
use engine::{
    EngineError, Index, IndexCatalog, IndexDescriptor, IndexKey, IndexKind, IndexRange,
    KeyComponent, Value,
};

fn setup(dir: &TempDir) -> IndexCatalog {
    let mut catalog = catalog(dir);
    catalog.create_table("users", users_schema()).unwrap();
    catalog
        .create_index(IndexDescriptor::new(
            "idx_users_email",
            "users",
            IndexKind::Unique,
            vec!["email".into()],
        ))
        .unwrap();
    catalog
        .create_index(IndexDescriptor::new(
            "idx_users_last_name",
            "users",
            IndexKind::NonClustered,
            vec!["last_name".into()],
        ))
        .unwrap();
    catalog
}

fn text_key(text: &str) -> IndexKey {
    IndexKey::new(vec![KeyComponent::Text(text.into())])
}

#[test]
fn duplicate_unique_key_leaves_no_orphan_state() {
    let dir = TempDir::new().unwrap();
    let catalog = setup(&dir);
    let table = catalog.table("users").unwrap();

    table
        .insert_row(user(1, "smith", "smith@example.com", true))
        .unwrap();
    let err = table.insert_row(user(2, "jones", "smith@example.com", true));
    assert!(matches!(
        err,
        Err(EngineError::DuplicateKey { ref index, .. }) if index == "idx_users_email"
    ));

    // Neither the heap nor any index may retain traces of the failed insert.
    assert_eq!(table.scan_rows().unwrap().len(), 1);
    let names = table.find_index("idx_users_last_name").unwrap();
    assert!(names.btree.lookup(&text_key("jones")).unwrap().is_empty());
    assert_eq!(names.btree.lookup(&text_key("smith")).unwrap().len(), 1);
}

#[test]
fn update_moves_index_entry_from_old_to_new_key() {
    let dir = TempDir::new().unwrap();
    let catalog = setup(&dir);
    let table = catalog.table("users").unwrap();

    let rid = table
        .insert_row(user(1, "Smith", "smith@example.com", true))
        .unwrap();
    table
        .update_row(rid, user(1, "Jones", "smith@example.com", true))
        .unwrap();

    let names = table.find_index("idx_users_last_name").unwrap();
    assert!(names.btree.lookup(&text_key("Smith")).unwrap().is_empty());
    let found = names.btree.lookup(&text_key("Jones")).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].rid(), rid);
}

#[test]
fn update_into_taken_unique_key_is_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let catalog = setup(&dir);
    let table = catalog.table("users").unwrap();

    table
        .insert_row(user(1, "smith", "smith@example.com", true))
        .unwrap();
    let rid = table
        .insert_row(user(2, "jones", "jones@example.com", true))
        .unwrap();

    let err = table.update_row(rid, user(2, "jones", "smith@example.com", true));
    assert!(matches!(err, Err(EngineError::DuplicateKey { .. })));

    // The row keeps its old email and the unique index still resolves both.
    assert_eq!(
        table.get_row(rid).unwrap(),
        Some(user(2, "jones", "jones@example.com", true))
    );
    let emails = table.find_index("idx_users_email").unwrap();
    assert_eq!(emails.btree.lookup(&text_key("jones@example.com")).unwrap().len(), 1);
    assert_eq!(emails.btree.lookup(&text_key("smith@example.com")).unwrap().len(), 1);
}

#[test]
fn updating_unique_key_to_itself_is_allowed() {
    let dir = TempDir::new().unwrap();
    let catalog = setup(&dir);
    let table = catalog.table("users").unwrap();

    let rid = table
        .insert_row(user(1, "smith", "smith@example.com", true))
        .unwrap();
    // Same email, different active flag: must not trip the unique check.
    table
        .update_row(rid, user(1, "smith", "smith@example.com", false))
        .unwrap();
    assert_eq!(
        table.get_row(rid).unwrap(),
        Some(user(1, "smith", "smith@example.com", false))
    );
}

#[test]
fn delete_removes_entries_from_every_index() {
    let dir = TempDir::new().unwrap();
    let catalog = setup(&dir);
    let table = catalog.table("users").unwrap();

    let rid = table
        .insert_row(user(1, "smith", "smith@example.com", true))
        .unwrap();
    assert!(table.delete_row(rid).unwrap());
    assert!(!table.delete_row(rid).unwrap());

    let emails = table.find_index("idx_users_email").unwrap();
    assert!(emails
        .btree
        .lookup(&text_key("smith@example.com"))
        .unwrap()
        .is_empty());
    let names = table.find_index("idx_users_last_name").unwrap();
    assert!(names.btree.lookup(&text_key("smith")).unwrap().is_empty());
    assert!(table.scan_rows().unwrap().is_empty());
}

#[test]
fn relocating_update_repairs_index_rids() {
    let dir = TempDir::new().unwrap();
    let catalog = setup(&dir);
    let table = catalog.table("users").unwrap();

    let rid = table
        .insert_row(user(1, "smith", "smith@example.com", true))
        .unwrap();
    // Fill the first page so the grown row cannot stay in place.
    for i in 2..40 {
        table
            .insert_row(user(i, &"pad".repeat(20), &format!("pad{i}@example.com"), true))
            .unwrap();
    }
    let long_email = format!("{}@example.com", "smith".repeat(9));
    let new_rid = table
        .update_row(rid, user(1, "smith", &long_email, true))
        .unwrap();
    assert_ne!(new_rid, rid);

    let emails = table.find_index("idx_users_email").unwrap();
    let found = emails.btree.lookup(&text_key(&long_email)).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].rid(), new_rid);
    // The unchanged-key index must point at the new location too.
    let names = table.find_index("idx_users_last_name").unwrap();
    let found = names.btree.lookup(&text_key("smith")).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].rid(), new_rid);
}

#[test]
fn oversized_update_leaves_heap_and_index_consistent() {
    let dir = TempDir::new().unwrap();
    let mut catalog = common::catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    catalog
        .create_index(IndexDescriptor::new(
            "idx_users_pk",
            "users",
            IndexKind::Clustered,
            vec!["id".into()],
        ))
        .unwrap();
    let table = catalog.table("users").unwrap();

    let rid = table
        .insert_row(user(1, "smith", "smith@example.com", true))
        .unwrap();
    // The clustered entry carries the whole row; a huge email pushes it
    // past what a leaf can take.
    let grown = user(1, "smith", &"x".repeat(2000), true);
    assert!(matches!(
        table.update_row(rid, grown),
        Err(EngineError::EntryTooLarge)
    ));

    // The failed update must touch neither the heap nor the index.
    assert_eq!(
        table.get_row(rid).unwrap(),
        Some(user(1, "smith", "smith@example.com", true))
    );
    let pk = table.find_index("idx_users_pk").unwrap();
    let found = pk
        .btree
        .lookup(&IndexKey::new(vec![KeyComponent::Integer(1)]))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].rid(), rid);
}

#[test]
fn concurrent_inserts_land_in_every_index() {
    let dir = TempDir::new().unwrap();
    let catalog = setup(&dir);
    let table = catalog.table("users").unwrap();

    std::thread::scope(|scope| {
        for t in 0..2i64 {
            scope.spawn(move || {
                for i in 0..150 {
                    let id = t * 1000 + i;
                    table
                        .insert_row(user(
                            id,
                            &format!("name{id}"),
                            &format!("user{id}@example.com"),
                            true,
                        ))
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(table.scan_rows().unwrap().len(), 300);
    let names = table.find_index("idx_users_last_name").unwrap();
    let entries = names
        .btree
        .range_scan(IndexRange::full())
        .unwrap()
        .collect_entries()
        .unwrap();
    assert_eq!(entries.len(), 300);
    let emails = table.find_index("idx_users_email").unwrap();
    let entries = emails
        .btree
        .range_scan(IndexRange::full())
        .unwrap()
        .collect_entries()
        .unwrap();
    assert_eq!(entries.len(), 300);
}

#[test]
fn unique_last_name_rejects_second_smith() {
    let dir = TempDir::new().unwrap();
    let mut catalog = common::catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    catalog
        .create_index(IndexDescriptor::new(
            "idx_users_last_name",
            "users",
            IndexKind::Unique,
            vec!["last_name".into()],
        ))
        .unwrap();
    let table = catalog.table("users").unwrap();

    table
        .insert_row(user(1, "Smith", "smith@example.com", true))
        .unwrap();
    table
        .insert_row(user(2, "Jones", "jones@example.com", true))
        .unwrap();
    assert!(matches!(
        table.insert_row(user(3, "Smith", "smith2@example.com", true)),
        Err(EngineError::DuplicateKey { ref key, .. }) if key.contains("Smith")
    ));
    assert_eq!(table.scan_rows().unwrap().len(), 2);
}

#[test]
fn null_keys_bypass_unique_enforcement() {
    let dir = TempDir::new().unwrap();
    let mut catalog = common::catalog(&dir);
    catalog.create_table("users", users_schema()).unwrap();
    catalog
        .create_index(IndexDescriptor::new(
            "idx_users_email",
            "users",
            IndexKind::Unique,
            vec!["email".into()],
        ))
        .unwrap();
    let table = catalog.table("users").unwrap();

    let null_email = |id: i64| {
        vec![
            Value::Integer(id),
            Value::Text("smith".into()),
            Value::Null,
            Value::Boolean(true),
        ]
    };
    table.insert_row(null_email(1)).unwrap();
    table.insert_row(null_email(2)).unwrap();
    assert_eq!(table.scan_rows().unwrap().len(), 2);
}
