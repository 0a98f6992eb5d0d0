#![forbid(unsafe_code)]

use super::StoreError;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use std::collections::BTreeMap;
use ww_core::path::PathColumns;
use ww_core::{AncestorPath, Assertion, AttrValue, END_OF_TIME, MAX_DEPTH, NodeId, Timestamp};

pub(super) const ASSERTION_COLUMNS: &str = "assertion_id, ty0, ty1, id1, ty2, id2, ty3, id3, ty4, id4, ty5, id5, \
     ty, id, order_key, valid_from, valid_to, published_from, published_to, \
     attr1, attr2, attr3, attr4, attr5, variant, note";

/// Column holding the ancestor id at depth `d` is `ID_COLUMNS[d - 1]`.
const ID_COLUMNS: [&str; MAX_DEPTH] = ["id1", "id2", "id3", "id4", "id5"];

fn read_assertion(row: &Row<'_>) -> Result<Assertion, StoreError> {
    let path = AncestorPath::from_columns(PathColumns {
        ty0: row.get(1)?,
        ty1: row.get(2)?,
        id1: row.get(3)?,
        ty2: row.get(4)?,
        id2: row.get(5)?,
        ty3: row.get(6)?,
        id3: row.get(7)?,
        ty4: row.get(8)?,
        id4: row.get(9)?,
        ty5: row.get(10)?,
        id5: row.get(11)?,
    })?;
    Ok(Assertion {
        assertion_id: row.get(0)?,
        ty: row.get(12)?,
        id: row.get(13)?,
        path,
        order_key: row.get(14)?,
        valid_from: row.get(15)?,
        valid_to: row.get(16)?,
        published_from: row.get(17)?,
        published_to: row.get(18)?,
        attr1: read_attr(row, 19)?,
        attr2: read_attr(row, 20)?,
        attr3: read_attr(row, 21)?,
        attr4: read_attr(row, 22)?,
        attr5: read_attr(row, 23)?,
        variant: row.get(24)?,
        note: row.get(25)?,
        base_valid_from: None,
    })
}

fn read_attr(row: &Row<'_>, index: usize) -> Result<Option<AttrValue>, StoreError> {
    match row.get::<_, Value>(index)? {
        Value::Null => Ok(None),
        Value::Integer(v) => Ok(Some(AttrValue::Integer(v))),
        Value::Real(v) => Ok(Some(AttrValue::Real(v))),
        Value::Text(v) => Ok(Some(AttrValue::Text(v))),
        Value::Blob(_) => Err(StoreError::InvalidInput("attr column holds a blob")),
    }
}

fn attr_value(attr: &Option<AttrValue>) -> Value {
    match attr {
        None => Value::Null,
        Some(AttrValue::Integer(v)) => Value::Integer(*v),
        Some(AttrValue::Real(v)) => Value::Real(*v),
        Some(AttrValue::Text(v)) => Value::Text(v.clone()),
    }
}

fn collect_rows(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Assertion>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_assertion(row)?);
    }
    Ok(out)
}

pub(super) fn select_all_rows(conn: &Connection) -> Result<Vec<Assertion>, StoreError> {
    collect_rows(
        conn,
        &format!("SELECT {ASSERTION_COLUMNS} FROM assertion ORDER BY id, valid_from"),
        [],
    )
}

/// Depth at which `id` sits, from any one of its rows.
pub(super) fn node_depth(conn: &Connection, id: NodeId) -> Result<Option<usize>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {ASSERTION_COLUMNS} FROM assertion WHERE id=?1 LIMIT 1"),
            params![id],
            |row| Ok(read_assertion(row)),
        )
        .optional()?;
    match row {
        Some(assertion) => Ok(Some(assertion?.depth())),
        None => Ok(None),
    }
}

/// Every row in the subtree rooted at `id` (at `depth`), the root's own rows included.
pub(super) fn select_subtree_rows(
    conn: &Connection,
    id: NodeId,
    depth: usize,
) -> Result<Vec<Assertion>, StoreError> {
    let Some(column) = depth.checked_sub(1).and_then(|slot| ID_COLUMNS.get(slot)) else {
        return Err(StoreError::InvalidInput("node depth out of range"));
    };
    collect_rows(
        conn,
        &format!(
            "SELECT {ASSERTION_COLUMNS} FROM assertion WHERE {column}=?1 ORDER BY id, valid_from"
        ),
        params![id],
    )
}

/// Rows of several subtrees; roots at the same depth share one `IN (...)` scan.
pub(super) fn select_subtrees_rows(
    conn: &Connection,
    roots: &BTreeMap<usize, Vec<NodeId>>,
) -> Result<Vec<Assertion>, StoreError> {
    let mut out = Vec::new();
    for (depth, ids) in roots {
        let Some(column) = depth.checked_sub(1).and_then(|slot| ID_COLUMNS.get(slot)) else {
            return Err(StoreError::InvalidInput("node depth out of range"));
        };
        if ids.is_empty() {
            continue;
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        out.extend(collect_rows(
            conn,
            &format!(
                "SELECT {ASSERTION_COLUMNS} FROM assertion WHERE {column} IN ({placeholders}) ORDER BY id, valid_from"
            ),
            params_from_iter(ids.iter()),
        )?);
    }
    Ok(out)
}

/// Highest `valid_from` / closed `valid_to` on record.
pub(super) fn max_time(conn: &Connection) -> Result<Timestamp, StoreError> {
    let (max_from, max_to) = conn.query_row(
        "SELECT MAX(valid_from), MAX(CASE WHEN valid_to < ?1 THEN valid_to END) FROM assertion",
        params![END_OF_TIME],
        |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?)),
    )?;
    Ok(max_from.unwrap_or(0).max(max_to.unwrap_or(0)))
}

pub(super) fn insert_assertion_tx(
    tx: &Transaction<'_>,
    assertion: &Assertion,
) -> Result<i64, StoreError> {
    let columns = assertion.path.to_columns();
    tx.execute(
        &format!(
            "INSERT INTO assertion({ASSERTION_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, \
              ?20, ?21, ?22, ?23, ?24, ?25, ?26)"
        ),
        params![
            assertion.assertion_id,
            columns.ty0,
            columns.ty1,
            columns.id1,
            columns.ty2,
            columns.id2,
            columns.ty3,
            columns.id3,
            columns.ty4,
            columns.id4,
            columns.ty5,
            columns.id5,
            assertion.ty,
            assertion.id,
            assertion.order_key,
            assertion.valid_from,
            assertion.valid_to,
            assertion.published_from,
            assertion.published_to,
            attr_value(&assertion.attr1),
            attr_value(&assertion.attr2),
            attr_value(&assertion.attr3),
            attr_value(&assertion.attr4),
            attr_value(&assertion.attr5),
            assertion.variant,
            assertion.note,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Closes a previously open row. Returns false when the row was no longer open.
pub(super) fn close_assertion_tx(
    tx: &Transaction<'_>,
    assertion_id: i64,
    valid_to: Timestamp,
) -> Result<bool, StoreError> {
    let changed = tx.execute(
        "UPDATE assertion SET valid_to=?1 WHERE assertion_id=?2 AND valid_to=?3",
        params![valid_to, assertion_id, END_OF_TIME],
    )?;
    Ok(changed == 1)
}
