#![forbid(unsafe_code)]

mod apply;
mod config;
mod error;
mod reconstruct;
mod rows;
mod schema;
mod snapshot;

pub use apply::TransactionReceipt;
pub use config::StoreConfig;
pub use error::StoreError;
pub use reconstruct::{ReconstituteOptions, Record, Relations, reconstitute};
pub use snapshot::{NodeFault, NodeHistory, Snapshot};

use rusqlite::{Connection, ErrorCode};
use schema::{install_schema, preflight_gate};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use ww_core::{AncestorPath, Assertion, Clock, NodeId, ROOT_ID, Timestamp};

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    config: StoreConfig,
    clock: Clock,
    snapshot: Option<Arc<Snapshot>>,
    generation: u64,
    views: HashMap<ReconstituteOptions, Arc<Relations>>,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(StoreConfig::new(storage_dir))
    }

    pub fn open_with_config(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.storage_dir)?;

        let db_path = config.db_path();
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        preflight_gate(&conn)?;
        install_schema(&conn)?;

        let max_time = rows::max_time(&conn)?;
        let clock = Clock::new(config.clock.clone(), max_time);
        info!(path = %db_path.display(), max_time, "opened assertion store");

        Ok(Self {
            conn,
            config,
            clock,
            snapshot: None,
            generation: 0,
            views: HashMap::new(),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Ancestor path of the document root, the parent of every depth-1 node.
    pub fn root_path(&self) -> AncestorPath {
        AncestorPath::root(self.config.root_tag.clone())
    }

    /// Highest timestamp recorded in durable storage.
    pub fn max_time(&self) -> Result<Timestamp, StoreError> {
        rows::max_time(&self.conn)
    }

    /// Last timestamp handed out (or observed at open).
    pub fn last_timestamp(&self) -> Timestamp {
        self.clock.last()
    }

    /// Current in-memory index, loading it from storage when it was discarded.
    pub fn snapshot(&mut self) -> Result<Arc<Snapshot>, StoreError> {
        if let Some(snapshot) = &self.snapshot {
            return Ok(Arc::clone(snapshot));
        }
        self.generation += 1;
        let rows = rows::select_all_rows(&self.conn)?;
        let row_count = rows.len();
        let snapshot = Arc::new(Snapshot::from_rows(self.generation, rows)?);
        self.clock.observe(snapshot.max_time());
        debug!(
            generation = self.generation,
            rows = row_count,
            nodes = snapshot.len(),
            damaged = snapshot.fault_count(),
            "loaded snapshot"
        );
        self.snapshot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Drops the in-memory index and cached views; the next read reloads from storage.
    pub fn request_reload(&mut self) {
        self.snapshot = None;
        self.views.clear();
    }

    /// Reconstructs one node and its subtree straight from storage.
    pub fn get_by_id(
        &self,
        id: NodeId,
        options: &ReconstituteOptions,
    ) -> Result<Option<Record>, StoreError> {
        let Some(depth) = rows::node_depth(&self.conn, id)? else {
            return Ok(None);
        };
        let subtree = rows::select_subtree_rows(&self.conn, id, depth)?;
        reconstitute_node(subtree, id, options)
    }

    /// Reconstructs several nodes; every requested id must resolve to a visible node.
    pub fn get_by_ids(
        &self,
        ids: &[NodeId],
        options: &ReconstituteOptions,
    ) -> Result<Vec<Record>, StoreError> {
        let mut missing = Vec::new();
        let mut by_depth: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
        for id in ids {
            match rows::node_depth(&self.conn, *id)? {
                Some(depth) => by_depth.entry(depth).or_default().push(*id),
                None => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::MissingIds { ids: missing });
        }

        let rows = rows::select_subtrees_rows(&self.conn, &by_depth)?;
        let mut out = Vec::with_capacity(ids.len());
        for (id, depth) in ids.iter().filter_map(|id| {
            by_depth
                .iter()
                .find(|(_, ids)| ids.contains(id))
                .map(|(depth, _)| (*id, *depth))
        }) {
            let subtree = rows
                .iter()
                .filter(|row| row.path.id_at(depth) == Some(id))
                .cloned()
                .collect();
            match reconstitute_node(subtree, id, options)? {
                Some(record) => out.push(record),
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::MissingIds { ids: missing });
        }
        Ok(out)
    }

    /// Whole document, cached per option set until the next transaction or reload.
    pub fn get_all(&mut self, options: &ReconstituteOptions) -> Result<Arc<Relations>, StoreError> {
        if let Some(view) = self.views.get(options) {
            return Ok(Arc::clone(view));
        }
        let snapshot = self.snapshot()?;
        let view = Arc::new(snapshot.reconstitute(ROOT_ID, options)?);
        self.views.insert(*options, Arc::clone(&view));
        Ok(view)
    }

    pub fn export_json(
        &mut self,
        options: &ReconstituteOptions,
    ) -> Result<serde_json::Value, StoreError> {
        let view = self.get_all(options)?;
        Ok(serde_json::to_value(view.as_ref())?)
    }
}

fn reconstitute_node(
    subtree: Vec<Assertion>,
    id: NodeId,
    options: &ReconstituteOptions,
) -> Result<Option<Record>, StoreError> {
    let Some(parent) = subtree
        .iter()
        .find(|row| row.id == id)
        .and_then(Assertion::parent_id)
    else {
        return Ok(None);
    };
    let mut relations = reconstitute(subtree, parent, options)?;
    Ok(relations
        .values_mut()
        .find_map(|records| {
            records
                .iter()
                .position(|record| record.id() == id)
                .map(|index| records.swap_remove(index))
        }))
}

/// UNIQUE or PRIMARY KEY clash: the row collides with history already on disk.
fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}
