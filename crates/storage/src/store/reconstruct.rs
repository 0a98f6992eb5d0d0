#![forbid(unsafe_code)]

use super::StoreError;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use ww_core::orderkey::compare_order_keys;
use ww_core::{Assertion, NodeId, Timestamp};

/// Which view of the tree to rebuild. Also the cache key for `SqliteStore::get_all`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ReconstituteOptions {
    /// Attach `_versions` and keep deleted nodes (tagged `_deleted`).
    pub include_history: bool,
    /// Rebuild the tree as it was valid at this instant instead of now.
    pub as_of: Option<Timestamp>,
    /// Drop nodes whose publication interval does not cover this instant.
    pub published_at: Option<Timestamp>,
}

impl ReconstituteOptions {
    pub fn with_history() -> Self {
        Self {
            include_history: true,
            ..Self::default()
        }
    }
}

/// One reconstructed node: its chosen version plus child relations keyed by `ty`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    #[serde(flatten)]
    pub fields: Assertion,
    #[serde(rename = "_source")]
    pub source: Timestamp,
    #[serde(rename = "_deleted", skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(rename = "_versions", skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<Assertion>>,
    #[serde(flatten)]
    pub children: Relations,
}

impl Record {
    pub fn id(&self) -> NodeId {
        self.fields.id
    }

    pub fn relation(&self, ty: &str) -> &[Record] {
        self.children.get(ty).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Child relations of one node, keyed by relation tag.
pub type Relations = BTreeMap<String, Vec<Record>>;

struct Partitions {
    versions: HashMap<NodeId, Vec<Assertion>>,
    children: HashMap<NodeId, Vec<NodeId>>,
}

/// Rebuilds the relations below `root` from the flat rows of its subtree.
///
/// `rows` may include the root's own versions; every other row must hang below `root`
/// through nodes that are also present, or the call fails with `ExtraneousRow`.
pub fn reconstitute(
    rows: Vec<Assertion>,
    root: NodeId,
    options: &ReconstituteOptions,
) -> Result<Relations, StoreError> {
    let partitions = partition(rows, root)?;
    build_relations(&partitions, root, options)
}

fn partition(rows: Vec<Assertion>, root: NodeId) -> Result<Partitions, StoreError> {
    let mut versions: HashMap<NodeId, Vec<Assertion>> = HashMap::new();
    for row in rows {
        if row.id == root {
            continue;
        }
        let below_root = (0..row.depth()).any(|d| row.path.id_at(d) == Some(root));
        if !below_root {
            return Err(StoreError::ExtraneousRow { node_id: row.id });
        }
        versions.entry(row.id).or_default().push(row);
    }

    let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for (id, chain) in versions.iter_mut() {
        chain.sort_by_key(|v| v.valid_from);
        check_chain(*id, chain)?;
        let parent = chain
            .first()
            .and_then(Assertion::parent_id)
            .ok_or(StoreError::ExtraneousRow { node_id: *id })?;
        children.entry(parent).or_default().push(*id);
    }

    let known: HashSet<NodeId> = versions.keys().copied().collect();
    for (parent, ids) in &children {
        if *parent != root && !known.contains(parent) {
            if let Some(orphan) = ids.iter().min() {
                return Err(StoreError::ExtraneousRow { node_id: *orphan });
            }
        }
    }
    Ok(Partitions { versions, children })
}

fn check_chain(id: NodeId, chain: &[Assertion]) -> Result<(), StoreError> {
    for pair in chain.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.valid_to != next.valid_from || prev.valid_from >= next.valid_from {
            return Err(StoreError::ChainBroken {
                node_id: id,
                prev_valid_to: prev.valid_to,
                next_valid_from: next.valid_from,
            });
        }
        if prev.path != next.path {
            return Err(StoreError::ExtraneousRow { node_id: id });
        }
    }
    Ok(())
}

fn build_relations(
    partitions: &Partitions,
    parent: NodeId,
    options: &ReconstituteOptions,
) -> Result<Relations, StoreError> {
    let mut relations = Relations::new();
    let Some(ids) = partitions.children.get(&parent) else {
        return Ok(relations);
    };
    for id in ids {
        let Some(chain) = partitions.versions.get(id) else {
            continue;
        };
        if let Some(record) = build_record(partitions, chain, options)? {
            relations
                .entry(record.fields.ty.clone())
                .or_default()
                .push(record);
        }
    }
    for siblings in relations.values_mut() {
        siblings.sort_by(|a, b| {
            compare_order_keys(a.fields.order_key.as_deref(), b.fields.order_key.as_deref())
                .then(a.fields.id.cmp(&b.fields.id))
                .then(a.fields.valid_from.cmp(&b.fields.valid_from))
        });
    }
    Ok(relations)
}

fn build_record(
    partitions: &Partitions,
    chain: &[Assertion],
    options: &ReconstituteOptions,
) -> Result<Option<Record>, StoreError> {
    let visible: &[Assertion] = match options.as_of {
        Some(at) => {
            let upto = chain.partition_point(|v| v.valid_from <= at);
            &chain[..upto]
        }
        None => chain,
    };
    let Some(last) = visible.last() else {
        return Ok(None);
    };
    let current = match options.as_of {
        Some(at) => visible.iter().rev().find(|v| v.valid_at(at)),
        None => Some(last).filter(|v| v.is_current()),
    };
    if current.is_none() && !options.include_history {
        return Ok(None);
    }
    if let Some(at) = options.published_at {
        if !current.is_some_and(|v| v.published_at(at)) {
            return Ok(None);
        }
    }

    let fields = current.unwrap_or(last).clone();
    let children = build_relations(partitions, fields.id, options)?;
    Ok(Some(Record {
        source: fields.valid_from,
        deleted: current.is_none(),
        versions: options.include_history.then(|| visible.to_vec()),
        children,
        fields,
    }))
}
