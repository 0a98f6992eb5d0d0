#![forbid(unsafe_code)]

use rusqlite::{Connection, params};
use tempfile::TempDir;
use ww_core::{Assertion, END_OF_TIME};
use ww_storage::{ReconstituteOptions, SqliteStore, StoreConfig, StoreError};

fn open_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = SqliteStore::open(dir.path()).expect("fresh store should open");
    (dir, store)
}

fn row_count(store: &SqliteStore) -> i64 {
    let conn = Connection::open(store.config().db_path()).expect("raw connection");
    conn.query_row("SELECT COUNT(1) FROM assertion", [], |row| row.get(0))
        .expect("count rows")
}

#[test]
fn insert_failure_rolls_back_batch_and_reloads_snapshot() {
    let (_dir, mut store) = open_store();
    let root = store.root_path();
    store
        .apply_transaction(vec![Assertion::create(&root, "x", 1, 1).expect("create")])
        .expect("create applies");
    let taken = store
        .snapshot()
        .expect("snapshot")
        .current(1)
        .and_then(|row| row.assertion_id)
        .expect("stored row id");
    let generation = store.snapshot().expect("snapshot").generation();

    let fresh = Assertion::create(&root, "x", 2, 2).expect("create");
    let mut clashing = Assertion::create(&root, "x", 3, 2).expect("create");
    clashing.assertion_id = Some(taken);

    let err = store
        .apply_transaction(vec![fresh, clashing])
        .expect_err("primary key clash must fail");
    assert!(err.is_conflict(), "unexpected error: {err}");

    assert_eq!(row_count(&store), 1);
    let snapshot = store.snapshot().expect("reloaded snapshot");
    assert!(snapshot.generation() > generation);
    assert!(snapshot.node(2).is_none());
    assert!(snapshot.node(3).is_none());
    assert_eq!(
        store
            .get_by_id(2, &ReconstituteOptions::default())
            .expect("get_by_id"),
        None
    );
}

#[test]
fn multi_partition_batch_is_all_or_nothing() {
    let (_dir, mut store) = open_store();
    let root = store.root_path();
    store
        .apply_transaction(vec![Assertion::create(&root, "x", 1, 1).expect("create")])
        .expect("create applies");
    let base = store
        .snapshot()
        .expect("snapshot")
        .current(1)
        .cloned()
        .expect("open version");
    store
        .apply_transaction(vec![base.revise(2)])
        .expect("update applies");

    let new_node = Assertion::create(&root, "x", 5, 10).expect("create");
    let stale = base.revise(11).with_attr1("stale");
    let err = store
        .apply_transactions(vec![stale, new_node])
        .expect_err("stale partition fails the whole batch");
    assert!(err.is_conflict());
    assert!(store.snapshot().expect("snapshot").node(5).is_none());
    assert_eq!(row_count(&store), 2);
}

#[test]
fn multi_partition_batch_stamps_each_partition_in_order() {
    let (_dir, mut store) = open_store();
    let root = store.root_path();

    let created = Assertion::create(&root, "x", 5, 10)
        .expect("create")
        .with_attr1("draft");
    let edited = created.revise(11).with_attr1("final");
    let sibling = Assertion::create(&root, "x", 6, 12).expect("create");

    let receipts = store
        .apply_transactions(vec![sibling, edited, created])
        .expect("batch applies");
    assert_eq!(receipts.len(), 3);
    assert!(receipts.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(receipts[1].closed, 1);

    let history = store
        .get_by_id(5, &ReconstituteOptions::with_history())
        .expect("get_by_id")
        .expect("node 5");
    assert_eq!(history.fields.attr1, Some("final".into()));
    let versions = history.versions.expect("versions");
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].valid_to, receipts[1].timestamp);
    assert_eq!(versions[1].valid_to, END_OF_TIME);
}

#[test]
fn chain_gap_in_storage_fails_reconstruction() {
    let (_dir, mut store) = open_store();
    let root = store.root_path();
    store
        .apply_transaction(vec![Assertion::create(&root, "x", 1, 1).expect("create")])
        .expect("create applies");
    let base = store
        .snapshot()
        .expect("snapshot")
        .current(1)
        .cloned()
        .expect("open version");
    store
        .apply_transaction(vec![base.revise(2)])
        .expect("update applies");

    let conn = Connection::open(store.config().db_path()).expect("raw connection");
    conn.execute(
        "UPDATE assertion SET valid_to = valid_to - 1 WHERE id=?1 AND valid_to < ?2",
        params![1, END_OF_TIME],
    )
    .expect("corrupt history");
    drop(conn);
    store.request_reload();

    let err = store
        .get_all(&ReconstituteOptions::default())
        .expect_err("gap must fail");
    assert!(matches!(err, StoreError::ChainBroken { node_id: 1, .. }));
    let err = store
        .get_by_id(1, &ReconstituteOptions::default())
        .expect_err("gap must fail");
    assert!(matches!(err, StoreError::ChainBroken { node_id: 1, .. }));
}

#[test]
fn open_is_fail_closed_on_foreign_schema() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = StoreConfig::new(dir.path());

    let conn = Connection::open(config.db_path()).expect("foreign db must open");
    conn.execute("CREATE TABLE legacy_entries(id TEXT PRIMARY KEY)", [])
        .expect("legacy table should be created");
    drop(conn);

    let err = SqliteStore::open_with_config(config).expect_err("foreign schema must be rejected");
    assert!(matches!(
        err,
        StoreError::InvalidInput(message) if message.starts_with("RESET_REQUIRED")
    ));
}

#[test]
fn open_with_toml_config() {
    let dir = tempfile::tempdir().expect("temp dir");
    let text = format!(
        "storage_dir = {:?}\ndb_file_name = \"custom.db\"\nroot_tag = \"lex\"\n",
        dir.path().display().to_string()
    );
    let config = StoreConfig::from_toml_str(&text).expect("config parses");
    let mut store = SqliteStore::open_with_config(config).expect("open");
    assert!(dir.path().join("custom.db").exists());

    let root = store.root_path();
    assert_eq!(root.root_tag(), "lex");
    store
        .apply_transaction(vec![Assertion::create(&root, "x", 1, 1).expect("create")])
        .expect("create applies");
    let json = store
        .export_json(&ReconstituteOptions::default())
        .expect("export");
    assert_eq!(json["x"][0]["ty0"], "lex");
    assert_eq!(json["x"][0]["id1"], 1);
}

#[test]
fn chain_gap_on_one_node_leaves_others_writable() {
    let (_dir, mut store) = open_store();
    let root = store.root_path();
    let damaged = Assertion::create(&root, "x", 1, 1).expect("create");
    let healthy = Assertion::create(&root, "x", 2, 1).expect("create");
    store
        .apply_transaction(vec![damaged, healthy])
        .expect("create applies");
    let open = store
        .snapshot()
        .expect("snapshot")
        .current(1)
        .cloned()
        .expect("open version");
    store
        .apply_transaction(vec![open.revise(2)])
        .expect("update applies");

    let conn = Connection::open(store.config().db_path()).expect("raw connection");
    conn.execute(
        "UPDATE assertion SET valid_to = valid_to - 1 WHERE id=?1 AND valid_to < ?2",
        params![1, END_OF_TIME],
    )
    .expect("corrupt history");
    drop(conn);
    store.request_reload();

    let snapshot = store.snapshot().expect("damaged history still loads");
    assert!(snapshot.fault(1).is_some());
    let base = snapshot.current(2).cloned().expect("node 2 open");
    let touch = snapshot.current(1).cloned().expect("node 1 open");

    store
        .apply_transaction(vec![base.revise(3).with_attr1("edited")])
        .expect("unrelated node stays writable");
    store
        .apply_transaction(vec![Assertion::create(&root, "x", 3, 4).expect("create")])
        .expect("new nodes can still be created");

    let err = store
        .apply_transaction(vec![touch.revise(5)])
        .expect_err("damaged node rejects edits");
    assert!(matches!(err, StoreError::ChainBroken { node_id: 1, .. }));

    let two = store
        .get_by_id(2, &ReconstituteOptions::default())
        .expect("healthy subtree readable")
        .expect("node 2");
    assert_eq!(two.fields.attr1, Some("edited".into()));
    assert!(matches!(
        store.get_all(&ReconstituteOptions::default()),
        Err(StoreError::ChainBroken { node_id: 1, .. })
    ));
}

#[test]
fn open_is_fail_closed_on_other_schema_version() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = StoreConfig::new(dir.path());
    drop(SqliteStore::open_with_config(config.clone()).expect("fresh store"));

    let conn = Connection::open(config.db_path()).expect("raw connection");
    conn.execute("UPDATE store_state SET schema_version = 99", [])
        .expect("bump version");
    drop(conn);

    let err = SqliteStore::open_with_config(config).expect_err("other version must be rejected");
    assert!(matches!(
        err,
        StoreError::InvalidInput(message) if message.starts_with("RESET_REQUIRED")
    ));
}
