#![forbid(unsafe_code)]

use super::rows::{close_assertion_tx, insert_assertion_tx};
use super::snapshot::Snapshot;
use super::{SqliteStore, StoreError, is_constraint_violation};
use rusqlite::{Connection, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use ww_core::clock::format_timestamp_utc;
use ww_core::{Assertion, Clock, END_OF_TIME, Timestamp};

/// Outcome of one committed partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionReceipt {
    /// Server timestamp that replaced the provisional one.
    pub timestamp: Timestamp,
    pub inserted: usize,
    pub closed: usize,
}

impl SqliteStore {
    /// Applies one edit: every row must carry the same provisional `valid_from`.
    ///
    /// Returns `None` for an empty batch, which consumes no timestamp and writes nothing.
    pub fn apply_transaction(
        &mut self,
        assertions: Vec<Assertion>,
    ) -> Result<Option<TransactionReceipt>, StoreError> {
        if assertions.is_empty() {
            return Ok(None);
        }
        let mut receipts = self.apply_partitions(vec![assertions])?;
        Ok(receipts.pop())
    }

    /// Applies several edits, one per distinct provisional timestamp, in ascending order.
    ///
    /// All partitions commit together or not at all.
    pub fn apply_transactions(
        &mut self,
        assertions: Vec<Assertion>,
    ) -> Result<Vec<TransactionReceipt>, StoreError> {
        let mut partitions: BTreeMap<Timestamp, Vec<Assertion>> = BTreeMap::new();
        for row in assertions {
            partitions.entry(row.valid_from).or_default().push(row);
        }
        self.apply_partitions(partitions.into_values().collect())
    }

    fn apply_partitions(
        &mut self,
        partitions: Vec<Vec<Assertion>>,
    ) -> Result<Vec<TransactionReceipt>, StoreError> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }
        let outcome = self.snapshot().and_then(|base| {
            let working = Snapshot::clone(&base);
            write_partitions(
                &mut self.conn,
                &mut self.clock,
                &self.config.root_tag,
                working,
                partitions,
            )
        });

        match outcome {
            Ok((snapshot, receipts)) => {
                self.generation += 1;
                self.snapshot = Some(Arc::new(snapshot.with_generation(self.generation)));
                self.views.clear();
                for receipt in &receipts {
                    info!(
                        timestamp = receipt.timestamp,
                        at = %format_timestamp_utc(receipt.timestamp, self.clock.config()),
                        inserted = receipt.inserted,
                        closed = receipt.closed,
                        "committed transaction"
                    );
                }
                Ok(receipts)
            }
            Err(err) => {
                warn!(error = %err, "transaction failed; discarding snapshot");
                self.request_reload();
                Err(err)
            }
        }
    }
}

fn write_partitions(
    conn: &mut Connection,
    clock: &mut Clock,
    root_tag: &str,
    mut snapshot: Snapshot,
    partitions: Vec<Vec<Assertion>>,
) -> Result<(Snapshot, Vec<TransactionReceipt>), StoreError> {
    let tx = conn.transaction()?;
    let mut receipts: Vec<TransactionReceipt> = Vec::with_capacity(partitions.len());
    let mut stamped: BTreeMap<Timestamp, Timestamp> = BTreeMap::new();
    for mut rows in partitions {
        // A later edit may be based on a version created earlier in this batch.
        for row in &mut rows {
            if let Some(server) = row.base_valid_from.and_then(|base| stamped.get(&base)) {
                row.base_valid_from = Some(*server);
            }
        }
        let provisional = rows.first().map(|row| row.valid_from);
        let receipt = write_partition(&tx, clock, root_tag, &mut snapshot, rows)?;
        if let Some(provisional) = provisional {
            stamped.insert(provisional, receipt.timestamp);
        }
        receipts.push(receipt);
    }
    tx.commit()?;
    Ok((snapshot, receipts))
}

fn write_partition(
    tx: &Transaction<'_>,
    clock: &mut Clock,
    root_tag: &str,
    snapshot: &mut Snapshot,
    mut rows: Vec<Assertion>,
) -> Result<TransactionReceipt, StoreError> {
    let provisional = validate_partition(&rows, root_tag)?;
    let timestamp = clock.next_time()?;
    debug!(provisional, timestamp, rows = rows.len(), "stamping partition");
    for row in &mut rows {
        stamp(row, provisional, timestamp);
    }
    // Parents before children, whatever order the caller listed them in.
    rows.sort_by_key(Assertion::depth);

    let mut closed = Vec::new();
    for row in &rows {
        if let Some(previous) = snapshot.apply_proposed(row)? {
            closed.push(previous);
        }
    }

    for previous in &closed {
        let Some(assertion_id) = previous.assertion_id else {
            return Err(StoreError::InvalidInput("open version has no stored row"));
        };
        if !close_assertion_tx(tx, assertion_id, previous.valid_to)? {
            return Err(StoreError::RevisionMismatch {
                node_id: previous.id,
                expected: Some(previous.valid_from),
                actual: None,
            });
        }
    }
    for row in &rows {
        let assertion_id = insert_assertion_tx(tx, row).map_err(|err| map_insert_conflict(err, row))?;
        snapshot.assign_assertion_id(row.id, row.valid_from, assertion_id);
    }

    Ok(TransactionReceipt {
        timestamp,
        inserted: rows.len(),
        closed: closed.len(),
    })
}

/// Checks one partition's shape and returns its provisional timestamp.
fn validate_partition(rows: &[Assertion], root_tag: &str) -> Result<Timestamp, StoreError> {
    let Some(first) = rows.first() else {
        return Err(StoreError::MalformedTransaction("empty transaction"));
    };
    let provisional = first.valid_from;
    if provisional == END_OF_TIME {
        return Err(StoreError::MalformedTransaction(
            "provisional timestamp cannot be END_OF_TIME",
        ));
    }
    let mut seen = BTreeSet::new();
    for row in rows {
        if row.valid_from != provisional {
            return Err(StoreError::MalformedTransaction(
                "rows do not share one provisional timestamp",
            ));
        }
        if row.valid_to != END_OF_TIME && row.valid_to != provisional {
            return Err(StoreError::MalformedTransaction(
                "valid_to must be END_OF_TIME or the provisional timestamp",
            ));
        }
        if !seen.insert(row.id) {
            return Err(StoreError::MalformedTransaction(
                "node appears twice in one transaction",
            ));
        }
        if row.path.root_tag() != root_tag {
            return Err(StoreError::InvalidInput("root marker does not match this store"));
        }
        row.validate_shape()?;
    }
    Ok(provisional)
}

fn stamp(row: &mut Assertion, provisional: Timestamp, timestamp: Timestamp) {
    let rewrite = |value: &mut Timestamp| {
        if *value == provisional {
            *value = timestamp;
        }
    };
    rewrite(&mut row.valid_from);
    rewrite(&mut row.valid_to);
    if let Some(published_from) = row.published_from.as_mut() {
        rewrite(published_from);
    }
    if let Some(published_to) = row.published_to.as_mut() {
        rewrite(published_to);
    }
}

fn map_insert_conflict(err: StoreError, row: &Assertion) -> StoreError {
    match &err {
        StoreError::Sql(sql) if is_constraint_violation(sql) => StoreError::RevisionMismatch {
            node_id: row.id,
            expected: row.base_valid_from,
            actual: None,
        },
        _ => err,
    }
}
