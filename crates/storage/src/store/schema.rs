#![forbid(unsafe_code)]

use super::StoreError;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;

const SCHEMA_VERSION: i64 = 1;

/// Tables this store owns; anything else means the file belongs to something else.
const STORE_TABLES: [&str; 2] = ["assertion", "store_state"];

/// Refuses databases this build cannot use as-is. There is no migration path: a foreign
/// or older file has to be reset.
pub(super) fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let tables = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<String>, _>>()?;

    if tables.is_empty() {
        return Ok(());
    }
    if tables.iter().any(|name| !STORE_TABLES.contains(&name.as_str())) {
        return Err(StoreError::InvalidInput(
            "RESET_REQUIRED: database holds tables that are not assertion store tables",
        ));
    }
    if tables.len() != STORE_TABLES.len() {
        return Err(StoreError::InvalidInput(
            "RESET_REQUIRED: assertion store is only partly installed",
        ));
    }

    let version: Option<i64> = conn
        .query_row(
            "SELECT schema_version FROM store_state WHERE singleton=1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match version {
        Some(SCHEMA_VERSION) => Ok(()),
        Some(_) => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: assertion store was written by another schema version",
        )),
        None => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: assertion store has no schema version row",
        )),
    }
}

pub(super) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    // 9007199254740991 is END_OF_TIME; at most one open version per node.
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_state (
          singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
          schema_version INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS assertion (
          assertion_id INTEGER PRIMARY KEY,
          ty0 TEXT NOT NULL,
          ty1 TEXT, id1 INTEGER,
          ty2 TEXT, id2 INTEGER,
          ty3 TEXT, id3 INTEGER,
          ty4 TEXT, id4 INTEGER,
          ty5 TEXT, id5 INTEGER,
          ty TEXT NOT NULL,
          id INTEGER NOT NULL,
          order_key TEXT,
          valid_from INTEGER NOT NULL,
          valid_to INTEGER NOT NULL,
          published_from INTEGER,
          published_to INTEGER,
          attr1, attr2, attr3, attr4, attr5,
          variant TEXT,
          note TEXT,
          UNIQUE(id, valid_from),
          CHECK(valid_from <= valid_to),
          CHECK(id <> 0)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_assertion_open
          ON assertion(id) WHERE valid_to = 9007199254740991;

        CREATE INDEX IF NOT EXISTS idx_assertion_id1 ON assertion(id1, valid_to);
        CREATE INDEX IF NOT EXISTS idx_assertion_id2 ON assertion(id2, valid_to);
        CREATE INDEX IF NOT EXISTS idx_assertion_id3 ON assertion(id3, valid_to);
        CREATE INDEX IF NOT EXISTS idx_assertion_id4 ON assertion(id4, valid_to);
        CREATE INDEX IF NOT EXISTS idx_assertion_id5 ON assertion(id5, valid_to);
        "#,
    )?;

    conn.execute(
        "INSERT INTO store_state(singleton, schema_version, created_at_ms, updated_at_ms) \
         VALUES (1, ?1, \
                 CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER), \
                 CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)) \
         ON CONFLICT(singleton) DO UPDATE SET updated_at_ms=excluded.updated_at_ms",
        params![SCHEMA_VERSION],
    )?;

    Ok(())
}
