#![forbid(unsafe_code)]

use crate::clock::{END_OF_TIME, Timestamp};
use crate::path::{AncestorPath, NodeId, PathError, ROOT_ID};
use serde::{Deserialize, Serialize};

/// Dynamically typed payload column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One version of one tree node, in the flat row shape used by storage and clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion_id: Option<i64>,
    pub id: NodeId,
    pub ty: String,
    #[serde(flatten)]
    pub path: AncestorPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_key: Option<String>,
    pub valid_from: Timestamp,
    pub valid_to: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_from: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_to: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr1: Option<AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr2: Option<AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr3: Option<AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr4: Option<AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr5: Option<AttrValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// `valid_from` of the version this edit was made against; `None` for a new node.
    /// Only meaningful on proposed rows, never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_valid_from: Option<Timestamp>,
}

impl Assertion {
    /// First version of a new node directly below `parent`.
    pub fn create(
        parent: &AncestorPath,
        ty: impl Into<String>,
        id: NodeId,
        provisional: Timestamp,
    ) -> Result<Self, PathError> {
        let ty = ty.into();
        let path = parent.child(parent.depth() + 1, ty.clone(), id)?;
        Ok(Self {
            assertion_id: None,
            id,
            ty,
            path,
            order_key: None,
            valid_from: provisional,
            valid_to: END_OF_TIME,
            published_from: None,
            published_to: None,
            attr1: None,
            attr2: None,
            attr3: None,
            attr4: None,
            attr5: None,
            variant: None,
            note: None,
            base_valid_from: None,
        })
    }

    /// Successor version carrying this version's fields, for the caller to edit.
    pub fn revise(&self, provisional: Timestamp) -> Self {
        Self {
            assertion_id: None,
            valid_from: provisional,
            valid_to: END_OF_TIME,
            base_valid_from: Some(self.valid_from),
            ..self.clone()
        }
    }

    /// Delete marker: closes this version and leaves the node without an open row.
    pub fn retire(&self, provisional: Timestamp) -> Self {
        Self {
            valid_to: provisional,
            ..self.revise(provisional)
        }
    }

    pub fn with_order_key(mut self, order_key: impl Into<String>) -> Self {
        self.order_key = Some(order_key.into());
        self
    }

    pub fn with_attr1(mut self, value: impl Into<AttrValue>) -> Self {
        self.attr1 = Some(value.into());
        self
    }

    pub fn is_current(&self) -> bool {
        self.valid_to == END_OF_TIME
    }

    pub fn depth(&self) -> usize {
        self.path.depth()
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.path.parent_id()
    }

    pub fn valid_at(&self, at: Timestamp) -> bool {
        self.valid_from <= at && at < self.valid_to
    }

    pub fn published_at(&self, at: Timestamp) -> bool {
        match self.published_from {
            Some(from) => from <= at && at < self.published_to.unwrap_or(END_OF_TIME),
            None => false,
        }
    }

    /// The path must end in this node, and the node must not be the root.
    pub fn validate_shape(&self) -> Result<(), PathError> {
        if self.id == ROOT_ID {
            return Err(PathError::RootNode);
        }
        match self.path.tip() {
            Some(tip) if tip.ty == self.ty && tip.id == self.id => Ok(()),
            tip => Err(PathError::TipMismatch {
                ty: self.ty.clone(),
                id: self.id,
                path_ty: tip.map(|t| t.ty.clone()),
                path_id: tip.map(|t| t.id),
            }),
        }
    }
}
