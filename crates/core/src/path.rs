#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub type NodeId = i64;

/// Deepest node a path can describe; fixed by the number of `tyN`/`idN` columns.
pub const MAX_DEPTH: usize = 5;

/// The implicit root every path hangs from.
pub const ROOT_ID: NodeId = 0;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("depth {depth} is outside 1..=5")]
    DepthOutOfRange { depth: usize },
    #[error("declared depth {declared} does not extend an ancestor chain of length {ancestors}")]
    DepthMismatch { declared: usize, ancestors: usize },
    #[error("path column {depth} has a type without an id (or an id without a type)")]
    HalfFilledColumn { depth: usize },
    #[error("path column {depth} is set below an empty column")]
    Gap { depth: usize },
    #[error("path tip ({path_ty:?}, {path_id:?}) does not name the node ({ty}, {id})")]
    TipMismatch {
        ty: String,
        id: NodeId,
        path_ty: Option<String>,
        path_id: Option<NodeId>,
    },
    #[error("the root id 0 cannot be asserted")]
    RootNode,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathStep {
    pub ty: String,
    pub id: NodeId,
}

/// Materialized ancestor chain: slot `d - 1` holds the (type, id) at depth `d`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathColumns", into = "PathColumns")]
pub struct AncestorPath {
    root_tag: String,
    steps: [Option<PathStep>; MAX_DEPTH],
}

impl AncestorPath {
    pub fn root(root_tag: impl Into<String>) -> Self {
        Self {
            root_tag: root_tag.into(),
            steps: Default::default(),
        }
    }

    pub fn root_tag(&self) -> &str {
        &self.root_tag
    }

    pub fn depth(&self) -> usize {
        self.steps.iter().take_while(|step| step.is_some()).count()
    }

    pub fn step(&self, depth: usize) -> Option<&PathStep> {
        depth
            .checked_sub(1)
            .and_then(|slot| self.steps.get(slot))
            .and_then(Option::as_ref)
    }

    /// Id at `depth`; depth 0 is the root.
    pub fn id_at(&self, depth: usize) -> Option<NodeId> {
        if depth == 0 {
            return Some(ROOT_ID);
        }
        self.step(depth).map(|step| step.id)
    }

    pub fn tip(&self) -> Option<&PathStep> {
        self.step(self.depth())
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.depth().checked_sub(1).and_then(|d| self.id_at(d))
    }

    pub fn steps(&self) -> impl Iterator<Item = &PathStep> {
        self.steps.iter().map_while(Option::as_ref)
    }

    /// Path of a child at `depth` below this chain.
    ///
    /// Copies this chain's columns `1..depth` verbatim and sets column `depth` to the
    /// child. `depth` must be exactly one past this chain.
    pub fn child(
        &self,
        depth: usize,
        ty: impl Into<String>,
        id: NodeId,
    ) -> Result<Self, PathError> {
        if depth == 0 || depth > MAX_DEPTH {
            return Err(PathError::DepthOutOfRange { depth });
        }
        let ancestors = self.depth();
        if ancestors + 1 != depth {
            return Err(PathError::DepthMismatch {
                declared: depth,
                ancestors,
            });
        }
        let mut child = self.clone();
        child.steps[depth - 1] = Some(PathStep { ty: ty.into(), id });
        Ok(child)
    }

    pub fn from_columns(columns: PathColumns) -> Result<Self, PathError> {
        let PathColumns {
            ty0,
            ty1,
            id1,
            ty2,
            id2,
            ty3,
            id3,
            ty4,
            id4,
            ty5,
            id5,
        } = columns;
        let pairs = [(ty1, id1), (ty2, id2), (ty3, id3), (ty4, id4), (ty5, id5)];

        let mut path = Self::root(ty0);
        let mut ended = false;
        for (slot, pair) in pairs.into_iter().enumerate() {
            let depth = slot + 1;
            match pair {
                (Some(ty), Some(id)) => {
                    if ended {
                        return Err(PathError::Gap { depth });
                    }
                    path.steps[slot] = Some(PathStep { ty, id });
                }
                (None, None) => ended = true,
                _ => return Err(PathError::HalfFilledColumn { depth }),
            }
        }
        Ok(path)
    }

    pub fn to_columns(&self) -> PathColumns {
        let ty = |slot: usize| self.steps[slot].as_ref().map(|s| s.ty.clone());
        let id = |slot: usize| self.steps[slot].as_ref().map(|s| s.id);
        PathColumns {
            ty0: self.root_tag.clone(),
            ty1: ty(0),
            id1: id(0),
            ty2: ty(1),
            id2: id(1),
            ty3: ty(2),
            id3: id(2),
            ty4: ty(3),
            id4: id(3),
            ty5: ty(4),
            id5: id(4),
        }
    }
}

/// Flat column form of an [`AncestorPath`], as stored and sent over the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathColumns {
    pub ty0: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ty1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id1: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ty2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id2: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ty3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id3: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ty4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id4: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ty5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id5: Option<NodeId>,
}

impl TryFrom<PathColumns> for AncestorPath {
    type Error = PathError;

    fn try_from(value: PathColumns) -> Result<Self, Self::Error> {
        Self::from_columns(value)
    }
}

impl From<AncestorPath> for PathColumns {
    fn from(value: AncestorPath) -> Self {
        value.to_columns()
    }
}
