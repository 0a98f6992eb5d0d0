#![forbid(unsafe_code)]

use ww_core::{ClockError, NodeId, OrderKeyError, PathError, Timestamp};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("malformed transaction: {0}")]
    MalformedTransaction(&'static str),
    #[error("revision mismatch on node {node_id} (expected={expected:?}, actual={actual:?})")]
    RevisionMismatch {
        node_id: NodeId,
        expected: Option<Timestamp>,
        actual: Option<Timestamp>,
    },
    #[error(
        "version chain broken on node {node_id} (prev.valid_to={prev_valid_to}, next.valid_from={next_valid_from})"
    )]
    ChainBroken {
        node_id: NodeId,
        prev_valid_to: Timestamp,
        next_valid_from: Timestamp,
    },
    #[error("row for node {node_id} does not belong to the requested tree")]
    ExtraneousRow { node_id: NodeId },
    #[error("missing required ids: {ids:?}")]
    MissingIds { ids: Vec<NodeId> },
    #[error("path: {0}")]
    Path(#[from] PathError),
    #[error("order key: {0}")]
    OrderKey(#[from] OrderKeyError),
    #[error("clock: {0}")]
    Clock(#[from] ClockError),
    #[error("unknown id")]
    UnknownId,
}

impl StoreError {
    /// Caller should re-read and retry the edit.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::RevisionMismatch { .. })
    }
}
