//! Deterministic application of frontend ops onto a view.
//!
//! Two callers: the commit path folds a fresh change's ops into the
//! rendered view (strict - any failure aborts the change), and the
//! reconciliation path replays still-pending requests on top of new
//! authoritative state (lenient - an op whose target a remote edit removed
//! is skipped; the backend's eventual acknowledgment is authoritative).

use tracing::trace;

use crate::error::ChangeError;
use crate::identity::{ActorId, ElemId, ObjectId, HEAD};
use crate::op::{Op, OpAction};
use crate::tree::{Node, View};
use crate::value::{DataType, Scalar, Timestamp, Value};

/// Strict fold. Used while capturing a change.
pub(crate) fn apply_ops(view: &mut View, actor: &ActorId, ops: &[Op]) -> Result<(), ChangeError> {
    for op in ops {
        apply_op(view, actor, op)?;
    }
    Ok(())
}

/// Lenient fold. Used when replaying pending requests after a patch.
pub(crate) fn replay_ops(view: &mut View, actor: &ActorId, ops: &[Op]) {
    for op in ops {
        if let Err(err) = apply_op(view, actor, op) {
            trace!(?err, action = ?op.action, obj = %op.obj, "skipping stale pending op");
        }
    }
}

fn apply_op(view: &mut View, actor: &ActorId, op: &Op) -> Result<(), ChangeError> {
    match op.action {
        OpAction::MakeMap => {
            view.create(op.obj.clone(), Node::empty_map());
            Ok(())
        }
        OpAction::MakeList => {
            view.create(op.obj.clone(), Node::empty_list());
            Ok(())
        }
        OpAction::Set => {
            let key = required_key(op)?;
            let value = op_value(op)?;
            write_at(view, &op.obj, key, value)
        }
        OpAction::Link => {
            let key = required_key(op)?;
            let child = link_target(op)?;
            write_at(view, &op.obj, key, Value::Object(child))
        }
        OpAction::Del => {
            let key = required_key(op)?;
            if is_list(view, &op.obj) {
                let index = elem_index(view, &op.obj, key)?;
                view.list_remove(&op.obj, index)?;
            } else {
                view.remove_field(&op.obj, key)?;
            }
            Ok(())
        }
        OpAction::Ins => {
            let pred = required_key(op)?;
            let counter = op.elem.ok_or_else(|| ChangeError::UnsupportedValue {
                reason: "ins op missing elem counter".into(),
            })?;
            insert_elem(view, &op.obj, actor, pred, counter)
        }
        OpAction::Inc => {
            let key = required_key(op)?;
            let delta = op
                .value
                .as_ref()
                .and_then(Scalar::as_i64)
                .ok_or_else(|| ChangeError::UnsupportedValue {
                    reason: "inc op missing integer delta".into(),
                })?;
            if is_list(view, &op.obj) {
                let index = elem_index(view, &op.obj, key)?;
                let current = view
                    .list(&op.obj)
                    .map_err(ChangeError::from)?
                    .get(index)
                    .and_then(Value::as_counter);
                match current {
                    Some(counter) => {
                        view.list_set(&op.obj, index, Value::Counter(counter + delta))?;
                        Ok(())
                    }
                    None => Err(ChangeError::NotACounter {
                        obj: op.obj.clone(),
                        key: key.to_string(),
                    }),
                }
            } else {
                view.increment_field(&op.obj, key, delta)?;
                Ok(())
            }
        }
    }
}

/// RGA-style integration: land after the predecessor, then skip over any
/// sibling whose elem id is greater - concurrent same-predecessor inserts
/// settle in descending id order on every replica.
fn insert_elem(
    view: &mut View,
    obj: &ObjectId,
    actor: &ActorId,
    pred: &str,
    counter: u64,
) -> Result<(), ChangeError> {
    let elem_id = ElemId::new(actor.clone(), counter);
    let list = view.list(obj).map_err(ChangeError::from)?;
    let mut index = if pred == HEAD {
        0
    } else {
        let pred_id = ElemId::parse(pred).map_err(|_| ChangeError::UnsupportedValue {
            reason: format!("ins predecessor `{pred}` is not an elem id"),
        })?;
        list.index_of(&pred_id)
            .ok_or_else(|| ChangeError::MissingObject(obj.clone()))?
            + 1
    };
    while list.elem_id(index).is_some_and(|sib| *sib > elem_id) {
        index += 1;
    }
    view.list_insert(obj, index, elem_id, Value::Scalar(Scalar::Null))?;
    Ok(())
}

/// Write by key into a map, or by elem id into a list. A plain write
/// resolves any conflict recorded for the key.
fn write_at(view: &mut View, obj: &ObjectId, key: &str, value: Value) -> Result<(), ChangeError> {
    if is_list(view, obj) {
        let index = elem_index(view, obj, key)?;
        view.list_set(obj, index, value)?;
    } else {
        view.put_field(obj, key, value)?;
    }
    view.clear_conflicts(obj, key);
    Ok(())
}

fn is_list(view: &View, obj: &ObjectId) -> bool {
    view.node(obj).is_some_and(|node| node.as_list().is_some())
}

fn elem_index(view: &View, obj: &ObjectId, key: &str) -> Result<usize, ChangeError> {
    let elem_id = ElemId::parse(key).map_err(|_| ChangeError::UnsupportedValue {
        reason: format!("list key `{key}` is not an elem id"),
    })?;
    let list = view.list(obj).map_err(ChangeError::from)?;
    list.index_of(&elem_id)
        .ok_or_else(|| ChangeError::MissingObject(obj.clone()))
}

fn required_key(op: &Op) -> Result<&str, ChangeError> {
    op.key.as_deref().ok_or_else(|| ChangeError::UnsupportedValue {
        reason: format!("{:?} op missing key", op.action),
    })
}

fn link_target(op: &Op) -> Result<ObjectId, ChangeError> {
    let raw = op
        .value
        .as_ref()
        .and_then(Scalar::as_str)
        .ok_or_else(|| ChangeError::UnsupportedValue {
            reason: "link op missing target object id".into(),
        })?;
    ObjectId::new(raw).map_err(|_| ChangeError::UnsupportedValue {
        reason: "link op target is not an object id".into(),
    })
}

fn op_value(op: &Op) -> Result<Value, ChangeError> {
    let scalar = op
        .value
        .clone()
        .ok_or_else(|| ChangeError::UnsupportedValue {
            reason: "set op missing value".into(),
        })?;
    match op.datatype {
        None => Ok(Value::Scalar(scalar)),
        Some(DataType::Counter) => scalar
            .as_i64()
            .map(|n| Value::Counter(n.into()))
            .ok_or_else(|| ChangeError::UnsupportedValue {
                reason: "counter value must be an integer".into(),
            }),
        Some(DataType::Timestamp) => scalar
            .as_i64()
            .map(|ms| Value::Timestamp(Timestamp::from_millis(ms)))
            .ok_or_else(|| ChangeError::UnsupportedValue {
                reason: "timestamp value must be integer milliseconds".into(),
            }),
    }
}
