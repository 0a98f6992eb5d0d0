#![forbid(unsafe_code)]

//! Immutable in-memory index of every node's version history.
//!
//! Writers clone the whole snapshot, apply a transaction to the clone, and publish it
//! only after the durable write commits. Readers holding an `Arc<Snapshot>` keep seeing
//! the tree as it was when they took it.

use super::StoreError;
use super::reconstruct::{ReconstituteOptions, Relations, reconstitute};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;
use ww_core::orderkey::{self, compare_order_keys};
use ww_core::{AncestorPath, Assertion, BEGINNING_OF_TIME, NodeId, ROOT_ID, Timestamp};

#[derive(Clone, Debug)]
pub struct NodeHistory {
    ty: String,
    path: AncestorPath,
    versions: Vec<Assertion>,
}

impl NodeHistory {
    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn path(&self) -> &AncestorPath {
        &self.path
    }

    /// All versions, oldest first.
    pub fn versions(&self) -> &[Assertion] {
        &self.versions
    }

    pub fn current(&self) -> Option<&Assertion> {
        self.versions.last().filter(|v| v.is_current())
    }
}

/// Damage found in a node's stored history while loading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeFault {
    ChainBroken {
        prev_valid_to: Timestamp,
        next_valid_from: Timestamp,
    },
    PathDisagrees,
}

impl NodeFault {
    fn to_error(self, node_id: NodeId) -> StoreError {
        match self {
            Self::ChainBroken {
                prev_valid_to,
                next_valid_from,
            } => StoreError::ChainBroken {
                node_id,
                prev_valid_to,
                next_valid_from,
            },
            Self::PathDisagrees => StoreError::ExtraneousRow { node_id },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    generation: u64,
    max_time: Timestamp,
    nodes: HashMap<NodeId, NodeHistory>,
    children: HashMap<NodeId, BTreeSet<NodeId>>,
    faults: HashMap<NodeId, NodeFault>,
}

impl Snapshot {
    /// Builds the index from stored rows.
    ///
    /// A node with a broken version chain is still indexed but marked faulty: edits to it
    /// and reconstructions that include it fail, the rest of the tree stays usable.
    pub(super) fn from_rows(
        generation: u64,
        mut rows: Vec<Assertion>,
    ) -> Result<Self, StoreError> {
        rows.sort_by_key(|row| (row.id, row.valid_from));
        let mut snapshot = Self {
            generation,
            max_time: BEGINNING_OF_TIME,
            ..Self::default()
        };
        for row in rows {
            snapshot.load_row(row)?;
        }
        Ok(snapshot)
    }

    fn load_row(&mut self, row: Assertion) -> Result<(), StoreError> {
        row.validate_shape()?;
        self.observe(&row);
        match self.nodes.get_mut(&row.id) {
            Some(history) => {
                let fault = if history.path != row.path || history.ty != row.ty {
                    Some(NodeFault::PathDisagrees)
                } else {
                    history
                        .versions
                        .last()
                        .filter(|prev| {
                            prev.valid_to != row.valid_from || prev.valid_from >= row.valid_from
                        })
                        .map(|prev| NodeFault::ChainBroken {
                            prev_valid_to: prev.valid_to,
                            next_valid_from: row.valid_from,
                        })
                };
                if let Some(fault) = fault {
                    warn!(node_id = row.id, ?fault, "stored history is damaged");
                    self.faults.entry(row.id).or_insert(fault);
                }
                history.versions.push(row);
            }
            None => self.insert_node(row),
        }
        Ok(())
    }

    fn insert_node(&mut self, row: Assertion) {
        let parent = row.parent_id().unwrap_or(ROOT_ID);
        self.children.entry(parent).or_default().insert(row.id);
        self.nodes.insert(
            row.id,
            NodeHistory {
                ty: row.ty.clone(),
                path: row.path.clone(),
                versions: vec![row],
            },
        );
    }

    fn observe(&mut self, row: &Assertion) {
        self.max_time = self.max_time.max(row.valid_from);
        if !row.is_current() {
            self.max_time = self.max_time.max(row.valid_to);
        }
    }

    /// Applies one stamped, proposed row and returns the version it closed, if any.
    ///
    /// Fails with `RevisionMismatch` when the row's `base_valid_from` is not the node's
    /// recorded open version (or when a create targets an existing id).
    pub(super) fn apply_proposed(
        &mut self,
        row: &Assertion,
    ) -> Result<Option<Assertion>, StoreError> {
        row.validate_shape()?;
        let stored = Assertion {
            base_valid_from: None,
            ..row.clone()
        };
        if let Some(fault) = self.faults.get(&row.id) {
            return Err(fault.to_error(row.id));
        }
        let parent = row.parent_id().unwrap_or(ROOT_ID);
        if parent != ROOT_ID {
            let Some(parent_history) = self.nodes.get(&parent) else {
                return Err(StoreError::InvalidInput("parent node does not exist"));
            };
            let expected = parent_history.path.child(
                parent_history.path.depth() + 1,
                row.ty.clone(),
                row.id,
            )?;
            if expected != row.path {
                return Err(StoreError::InvalidInput(
                    "ancestor path does not extend the parent's recorded path",
                ));
            }
        }

        let Some(history) = self.nodes.get_mut(&row.id) else {
            if row.base_valid_from.is_some() {
                return Err(StoreError::RevisionMismatch {
                    node_id: row.id,
                    expected: row.base_valid_from,
                    actual: None,
                });
            }
            self.observe(&stored);
            self.insert_node(stored);
            return Ok(None);
        };

        if history.path != row.path || history.ty != row.ty {
            return Err(StoreError::InvalidInput(
                "ancestor path of an existing node cannot change",
            ));
        }
        let actual = history.current().map(|open| open.valid_from);
        if row.base_valid_from.is_none() || actual != row.base_valid_from {
            return Err(StoreError::RevisionMismatch {
                node_id: row.id,
                expected: row.base_valid_from,
                actual,
            });
        }
        let Some(open) = history.versions.last_mut() else {
            return Err(StoreError::UnknownId);
        };
        if open.valid_from >= row.valid_from {
            return Err(StoreError::MalformedTransaction(
                "new version does not follow the open version",
            ));
        }
        open.valid_to = row.valid_from;
        let closed = open.clone();
        history.versions.push(stored);
        self.observe(row);
        Ok(Some(closed))
    }

    pub(super) fn assign_assertion_id(
        &mut self,
        id: NodeId,
        valid_from: Timestamp,
        assertion_id: i64,
    ) {
        if let Some(version) = self
            .nodes
            .get_mut(&id)
            .and_then(|h| h.versions.iter_mut().rev().find(|v| v.valid_from == valid_from))
        {
            version.assertion_id = Some(assertion_id);
        }
    }

    pub(super) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn max_time(&self) -> Timestamp {
        self.max_time
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn fault(&self, id: NodeId) -> Option<NodeFault> {
        self.faults.get(&id).copied()
    }

    pub fn fault_count(&self) -> usize {
        self.faults.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeHistory> {
        self.nodes.get(&id)
    }

    pub fn current(&self, id: NodeId) -> Option<&Assertion> {
        self.node(id).and_then(NodeHistory::current)
    }

    /// Current children of `parent` in relation `ty`, in sibling order.
    pub fn current_children(&self, parent: NodeId, ty: &str) -> Vec<&Assertion> {
        let mut out: Vec<&Assertion> = self
            .children
            .get(&parent)
            .into_iter()
            .flatten()
            .filter_map(|id| self.current(*id))
            .filter(|current| current.ty == ty)
            .collect();
        out.sort_by(|a, b| {
            compare_order_keys(a.order_key.as_deref(), b.order_key.as_deref())
                .then(a.id.cmp(&b.id))
                .then(a.valid_from.cmp(&b.valid_from))
        });
        out
    }

    pub fn order_key_before(
        &self,
        parent: NodeId,
        ty: &str,
        sibling: NodeId,
    ) -> Result<String, StoreError> {
        let siblings = self.current_children(parent, ty);
        let index = sibling_index(&siblings, sibling)?;
        let lower = index
            .checked_sub(1)
            .and_then(|i| siblings[i].order_key.as_deref());
        Ok(orderkey::between(lower, siblings[index].order_key.as_deref())?)
    }

    pub fn order_key_after(
        &self,
        parent: NodeId,
        ty: &str,
        sibling: NodeId,
    ) -> Result<String, StoreError> {
        let siblings = self.current_children(parent, ty);
        let index = sibling_index(&siblings, sibling)?;
        let upper = siblings.get(index + 1).and_then(|s| s.order_key.as_deref());
        Ok(orderkey::between(siblings[index].order_key.as_deref(), upper)?)
    }

    pub fn order_key_at_end(&self, parent: NodeId, ty: &str) -> Result<String, StoreError> {
        let siblings = self.current_children(parent, ty);
        let last = siblings.last().and_then(|s| s.order_key.as_deref());
        Ok(orderkey::between(last, None)?)
    }

    /// Rebuilds the nested document below `root` from this snapshot.
    pub fn reconstitute(
        &self,
        root: NodeId,
        options: &ReconstituteOptions,
    ) -> Result<Relations, StoreError> {
        let mut rows = Vec::new();
        let mut pending = vec![root];
        if root != ROOT_ID && !self.nodes.contains_key(&root) {
            return Ok(Relations::new());
        }
        while let Some(id) = pending.pop() {
            if let Some(history) = self.nodes.get(&id) {
                rows.extend(history.versions.iter().cloned());
            }
            if let Some(children) = self.children.get(&id) {
                pending.extend(children.iter().copied());
            }
        }
        reconstitute(rows, root, options)
    }
}

fn sibling_index(siblings: &[&Assertion], sibling: NodeId) -> Result<usize, StoreError> {
    siblings
        .iter()
        .position(|s| s.id == sibling)
        .ok_or(StoreError::UnknownId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ww_core::END_OF_TIME;

    fn root() -> AncestorPath {
        AncestorPath::root("dct")
    }

    fn stamped(mut row: Assertion, at: Timestamp) -> Assertion {
        row.valid_from = at;
        if !row.is_current() {
            row.valid_to = at;
        }
        row
    }

    #[test]
    fn update_closes_open_version() {
        let mut snapshot = Snapshot::default();
        let created = Assertion::create(&root(), "ent", 1, 10).unwrap();
        assert_eq!(snapshot.apply_proposed(&created).unwrap(), None);

        let update = stamped(created.revise(0), 20);
        let closed = snapshot.apply_proposed(&update).unwrap().unwrap();
        assert_eq!((closed.valid_from, closed.valid_to), (10, 20));
        assert_eq!(snapshot.current(1).unwrap().valid_from, 20);
        assert_eq!(snapshot.node(1).unwrap().versions().len(), 2);
        assert_eq!(snapshot.max_time(), 20);
    }

    #[test]
    fn stale_base_is_a_revision_mismatch() {
        let mut snapshot = Snapshot::default();
        let created = Assertion::create(&root(), "ent", 1, 10).unwrap();
        snapshot.apply_proposed(&created).unwrap();
        snapshot
            .apply_proposed(&stamped(created.revise(0), 20))
            .unwrap();

        let err = snapshot
            .apply_proposed(&stamped(created.revise(0), 30))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::RevisionMismatch {
                node_id: 1,
                expected: Some(10),
                actual: Some(20)
            }
        ));

        let again = snapshot.apply_proposed(&created).unwrap_err();
        assert!(again.is_conflict());
    }

    #[test]
    fn retire_leaves_no_open_version() {
        let mut snapshot = Snapshot::default();
        let created = Assertion::create(&root(), "ent", 1, 10).unwrap();
        snapshot.apply_proposed(&created).unwrap();
        snapshot
            .apply_proposed(&stamped(created.retire(0), 20))
            .unwrap();
        assert!(snapshot.current(1).is_none());

        let err = snapshot
            .apply_proposed(&stamped(created.revise(0), 30))
            .unwrap_err();
        assert!(matches!(err, StoreError::RevisionMismatch { actual: None, .. }));
    }

    #[test]
    fn rejects_orphans_and_reparenting() {
        let mut snapshot = Snapshot::default();
        let parent = root().child(1, "ent", 5).unwrap();
        let orphan = Assertion::create(&parent, "sub", 6, 10).unwrap();
        assert!(matches!(
            snapshot.apply_proposed(&orphan),
            Err(StoreError::InvalidInput(_))
        ));

        let a = Assertion::create(&root(), "ent", 1, 10).unwrap();
        let b = Assertion::create(&root(), "ent", 2, 10).unwrap();
        let child = Assertion::create(&a.path, "sub", 3, 10).unwrap();
        for row in [&a, &b, &child] {
            snapshot.apply_proposed(row).unwrap();
        }
        let mut moved = stamped(child.revise(0), 20);
        moved.path = b.path.child(2, "sub", 3).unwrap();
        assert!(matches!(
            snapshot.apply_proposed(&moved),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn chain_gap_only_blocks_the_damaged_node() {
        let first = Assertion {
            valid_to: 20,
            assertion_id: Some(1),
            ..Assertion::create(&root(), "ent", 1, 10).unwrap()
        };
        let second = Assertion {
            assertion_id: Some(2),
            valid_from: 25,
            valid_to: END_OF_TIME,
            ..first.clone()
        };
        let other = Assertion {
            assertion_id: Some(3),
            ..Assertion::create(&root(), "ent", 2, 10).unwrap()
        };
        let mut snapshot = Snapshot::from_rows(1, vec![second, other.clone(), first]).unwrap();
        assert_eq!(
            snapshot.fault(1),
            Some(NodeFault::ChainBroken {
                prev_valid_to: 20,
                next_valid_from: 25
            })
        );
        assert_eq!(snapshot.fault_count(), 1);

        let edit = stamped(snapshot.current(1).unwrap().revise(0), 30);
        let touch = snapshot.apply_proposed(&edit).unwrap_err();
        assert!(matches!(touch, StoreError::ChainBroken { node_id: 1, .. }));
        assert!(matches!(
            snapshot.reconstitute(ROOT_ID, &ReconstituteOptions::default()),
            Err(StoreError::ChainBroken { node_id: 1, .. })
        ));

        snapshot
            .apply_proposed(&stamped(other.revise(0), 30))
            .unwrap();
        let two = snapshot
            .reconstitute(2, &ReconstituteOptions::default())
            .unwrap();
        assert!(two.is_empty());
        assert_eq!(snapshot.current(2).unwrap().valid_from, 30);
    }

    #[test]
    fn child_path_must_extend_parent_path() {
        let mut snapshot = Snapshot::default();
        let e1 = Assertion::create(&root(), "ent", 1, 10).unwrap();
        let e2 = Assertion::create(&root(), "ent", 2, 10).unwrap();
        let sense = Assertion::create(&e2.path, "sense", 5, 10).unwrap();
        for row in [&e1, &e2, &sense] {
            snapshot.apply_proposed(row).unwrap();
        }

        let forged_parent = e1.path.child(2, "sense", 5).unwrap();
        let forged = Assertion::create(&forged_parent, "gloss", 9, 10).unwrap();
        assert_eq!(forged.parent_id(), Some(5));
        assert!(matches!(
            snapshot.apply_proposed(&forged),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(snapshot.node(9).is_none());

        let gloss = Assertion::create(&sense.path, "gloss", 9, 10).unwrap();
        snapshot.apply_proposed(&gloss).unwrap();
        assert_eq!(snapshot.current_children(5, "gloss").len(), 1);
    }

    #[test]
    fn sibling_keys() {
        let mut snapshot = Snapshot::default();
        let keys = orderkey::initial(3);
        for (i, key) in keys.iter().enumerate() {
            let row = Assertion::create(&root(), "ent", i as NodeId + 1, 10)
                .unwrap()
                .with_order_key(key.clone());
            snapshot.apply_proposed(&row).unwrap();
        }
        let ordered: Vec<NodeId> = snapshot
            .current_children(ROOT_ID, "ent")
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ordered, vec![1, 2, 3]);

        let before_first = snapshot.order_key_before(ROOT_ID, "ent", 1).unwrap();
        assert!(before_first.as_str() < keys[0].as_str());
        let after_first = snapshot.order_key_after(ROOT_ID, "ent", 1).unwrap();
        assert!(keys[0].as_str() < after_first.as_str() && after_first.as_str() < keys[1].as_str());
        let end = snapshot.order_key_at_end(ROOT_ID, "ent").unwrap();
        assert!(end.as_str() > keys[2].as_str());
        assert!(matches!(
            snapshot.order_key_before(ROOT_ID, "ent", 99),
            Err(StoreError::UnknownId)
        ));
        assert_eq!(
            snapshot.order_key_at_end(ROOT_ID, "sub").unwrap(),
            orderkey::between(None, None).unwrap()
        );
    }
}
