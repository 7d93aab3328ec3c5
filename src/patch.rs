//! Backend-produced patches: diff sets plus causal metadata.

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::PatchError;
use crate::identity::{ActorId, ElemId, ObjectId};
use crate::value::{DataType, Scalar};

/// Diff vocabulary. Note the deliberate split from the frontend op enum:
/// the backend emits `insert` diffs, the frontend emits `ins` ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Create,
    Set,
    Insert,
    Remove,
}

/// Kind of the object a diff addresses. Text materialises as a list and
/// table as a map; their rich surfaces live in the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjType {
    Map,
    List,
    Text,
    Table,
}

/// A losing candidate recorded for a conflicted field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictValue {
    pub actor: ActorId,
    pub value: Scalar,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datatype: Option<DataType>,
}

/// One backend diff, applied in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub action: DiffAction,
    #[serde(rename = "type")]
    pub obj_type: ObjType,
    pub obj: ObjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Scalar>,
    #[serde(rename = "elemId", skip_serializing_if = "Option::is_none")]
    pub elem_id: Option<ElemId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<ConflictValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datatype: Option<DataType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<bool>,
}

impl Diff {
    fn bare(action: DiffAction, obj_type: ObjType, obj: ObjectId) -> Self {
        Self {
            action,
            obj_type,
            obj,
            key: None,
            index: None,
            value: None,
            elem_id: None,
            conflicts: None,
            datatype: None,
            link: None,
        }
    }

    pub fn create(obj: ObjectId, obj_type: ObjType) -> Self {
        Self::bare(DiffAction::Create, obj_type, obj)
    }

    pub fn set_key(obj: ObjectId, obj_type: ObjType, key: impl Into<String>, value: Scalar) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value),
            ..Self::bare(DiffAction::Set, obj_type, obj)
        }
    }

    pub fn set_index(obj: ObjectId, obj_type: ObjType, index: usize, value: Scalar) -> Self {
        Self {
            index: Some(index),
            value: Some(value),
            ..Self::bare(DiffAction::Set, obj_type, obj)
        }
    }

    pub fn insert(
        obj: ObjectId,
        obj_type: ObjType,
        index: usize,
        value: Scalar,
        elem_id: ElemId,
    ) -> Self {
        Self {
            index: Some(index),
            value: Some(value),
            elem_id: Some(elem_id),
            ..Self::bare(DiffAction::Insert, obj_type, obj)
        }
    }

    pub fn remove_key(obj: ObjectId, obj_type: ObjType, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::bare(DiffAction::Remove, obj_type, obj)
        }
    }

    pub fn remove_index(obj: ObjectId, obj_type: ObjType, index: usize) -> Self {
        Self {
            index: Some(index),
            ..Self::bare(DiffAction::Remove, obj_type, obj)
        }
    }

    pub fn with_link(mut self) -> Self {
        self.link = Some(true);
        self
    }

    pub fn with_datatype(mut self, datatype: DataType) -> Self {
        self.datatype = Some(datatype);
        self
    }

    pub fn with_conflicts(mut self, conflicts: Vec<ConflictValue>) -> Self {
        self.conflicts = Some(conflicts);
        self
    }

    /// Structural validation: the fields each action requires.
    pub(crate) fn validate(&self) -> Result<(), PatchError> {
        match self.action {
            DiffAction::Create => Ok(()),
            DiffAction::Set => {
                if self.value.is_none() {
                    return Err(PatchError::malformed("set diff missing value"));
                }
                if self.key.is_none() && self.index.is_none() {
                    return Err(PatchError::malformed("set diff missing key or index"));
                }
                self.validate_link()
            }
            DiffAction::Insert => {
                if self.index.is_none() {
                    return Err(PatchError::malformed("insert diff missing index"));
                }
                if self.value.is_none() {
                    return Err(PatchError::malformed("insert diff missing value"));
                }
                if self.elem_id.is_none() {
                    return Err(PatchError::malformed("insert diff missing elemId"));
                }
                self.validate_link()
            }
            DiffAction::Remove => {
                if self.key.is_none() && self.index.is_none() {
                    return Err(PatchError::malformed("remove diff missing key or index"));
                }
                Ok(())
            }
        }
    }

    fn validate_link(&self) -> Result<(), PatchError> {
        if self.link == Some(true) && !matches!(self.value, Some(Scalar::Str(_))) {
            return Err(PatchError::malformed("link diff value must be an object id"));
        }
        Ok(())
    }
}

/// A backend patch: diffs in apply order plus optional causal metadata.
///
/// `actor` + `seq` are present iff the patch acknowledges a local request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock: Option<Clock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deps: Option<Clock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_undo: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_redo: Option<bool>,
    #[serde(default)]
    pub diffs: Vec<Diff>,
}

impl Patch {
    /// Parse a wire patch, surfacing serde failures (unknown actions,
    /// missing required fields) as `MalformedPatch`.
    pub fn from_json(value: serde_json::Value) -> Result<Self, PatchError> {
        serde_json::from_value(value).map_err(|e| PatchError::malformed(e.to_string()))
    }
}
