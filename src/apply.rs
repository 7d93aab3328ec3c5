//! Deterministic folding of backend diffs into a view.

use std::collections::BTreeMap;

use crate::error::PatchError;
use crate::identity::{ActorId, ObjectId};
use crate::patch::{ConflictValue, Diff, DiffAction, ObjType};
use crate::tree::{Node, View};
use crate::value::{DataType, Scalar, Timestamp, Value};

pub(crate) fn apply_diffs(view: &mut View, diffs: &[Diff]) -> Result<(), PatchError> {
    for diff in diffs {
        apply_diff(view, diff)?;
    }
    Ok(())
}

fn apply_diff(view: &mut View, diff: &Diff) -> Result<(), PatchError> {
    diff.validate()?;
    match diff.action {
        DiffAction::Create => {
            let node = match diff.obj_type {
                ObjType::Map | ObjType::Table => Node::empty_map(),
                ObjType::List | ObjType::Text => Node::empty_list(),
            };
            view.create(diff.obj.clone(), node);
            Ok(())
        }
        DiffAction::Set => match (&diff.key, diff.index) {
            (Some(key), _) => {
                let value = diff_value(view, diff)?;
                view.put_field(&diff.obj, key, value)?;
                record_conflicts(view, diff, key)?;
                Ok(())
            }
            (None, Some(index)) => {
                let value = diff_value(view, diff)?;
                let key = list_key(view, diff, index)?;
                view.list_set(&diff.obj, index, value)?;
                record_conflicts(view, diff, &key)?;
                Ok(())
            }
            (None, None) => unreachable!("validated set diff has key or index"),
        },
        DiffAction::Insert => {
            let index = diff.index.expect("validated insert diff has index");
            let elem_id = diff
                .elem_id
                .clone()
                .expect("validated insert diff has elemId");
            let value = diff_value(view, diff)?;
            let key = elem_id.to_string();
            view.list_insert(&diff.obj, index, elem_id, value)?;
            record_conflicts(view, diff, &key)?;
            Ok(())
        }
        DiffAction::Remove => match (&diff.key, diff.index) {
            (Some(key), _) => {
                view.remove_field(&diff.obj, key)?;
                Ok(())
            }
            (None, Some(index)) => {
                view.list_remove(&diff.obj, index)?;
                Ok(())
            }
            (None, None) => unreachable!("validated remove diff has key or index"),
        },
    }
}

/// The winning value a diff writes. Links must resolve inside the cache -
/// a patch may not introduce dangling refs.
fn diff_value(view: &View, diff: &Diff) -> Result<Value, PatchError> {
    let scalar = diff.value.clone().expect("validated diff has value");
    wire_value(view, scalar, diff.link, diff.datatype)
}

fn wire_value(
    view: &View,
    scalar: Scalar,
    link: Option<bool>,
    datatype: Option<DataType>,
) -> Result<Value, PatchError> {
    if link == Some(true) {
        let raw = scalar
            .as_str()
            .ok_or_else(|| PatchError::malformed("link value must be an object id"))?;
        let child =
            ObjectId::new(raw).map_err(|_| PatchError::malformed("link value must be non-empty"))?;
        if !view.contains(&child) {
            return Err(PatchError::MissingObject(child));
        }
        return Ok(Value::Object(child));
    }
    match datatype {
        None => Ok(Value::Scalar(scalar)),
        Some(DataType::Counter) => scalar
            .as_i64()
            .map(|n| Value::Counter(n.into()))
            .ok_or_else(|| PatchError::malformed("counter value must be an integer")),
        Some(DataType::Timestamp) => scalar
            .as_i64()
            .map(|ms| Value::Timestamp(Timestamp::from_millis(ms)))
            .ok_or_else(|| PatchError::malformed("timestamp value must be integer milliseconds")),
    }
}

/// A diff with conflicts replaces the field's bucket; a clean write clears
/// it. Bucket values never get inbound entries - they are not part of the
/// main materialised view.
fn record_conflicts(view: &mut View, diff: &Diff, key: &str) -> Result<(), PatchError> {
    match &diff.conflicts {
        Some(conflicts) => {
            let bucket = conflict_bucket(view, conflicts)?;
            view.set_conflicts(&diff.obj, key, bucket);
            Ok(())
        }
        None => {
            view.clear_conflicts(&diff.obj, key);
            Ok(())
        }
    }
}

fn conflict_bucket(
    view: &View,
    conflicts: &[ConflictValue],
) -> Result<BTreeMap<ActorId, Value>, PatchError> {
    let mut bucket = BTreeMap::new();
    for entry in conflicts {
        let value = wire_value(view, entry.value.clone(), entry.link, entry.datatype)?;
        bucket.insert(entry.actor.clone(), value);
    }
    Ok(bucket)
}

/// Elem id string for the element a list diff addresses. Conflict buckets
/// for lists are keyed by elem id, which splices do not shift.
fn list_key(view: &View, diff: &Diff, index: usize) -> Result<String, PatchError> {
    let list = view.list(&diff.obj).map_err(PatchError::from)?;
    list.elem_id(index)
        .map(ToString::to_string)
        .ok_or(PatchError::IndexOutOfBounds {
            index,
            len: list.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ElemId;

    fn actor(s: &str) -> ActorId {
        ActorId::new(s).unwrap()
    }

    #[test]
    fn create_set_builds_a_map() {
        let mut view = View::new();
        let birds = ObjectId::random();
        apply_diffs(
            &mut view,
            &[
                Diff::create(birds.clone(), ObjType::Map),
                Diff::set_key(birds.clone(), ObjType::Map, "wrens", Scalar::Int(3)),
                Diff::set_key(
                    ObjectId::root(),
                    ObjType::Map,
                    "birds",
                    Scalar::Str(birds.to_string()),
                )
                .with_link(),
            ],
        )
        .expect("apply diffs");

        assert_eq!(
            view.to_json(&ObjectId::root()),
            serde_json::json!({ "birds": { "wrens": 3 } })
        );
        assert_eq!(view.path_of(&birds), Some(vec!["birds".to_string()]));
    }

    #[test]
    fn dangling_link_is_rejected() {
        let mut view = View::new();
        let err = apply_diffs(
            &mut view,
            &[Diff::set_key(
                ObjectId::root(),
                ObjType::Map,
                "ghost",
                Scalar::Str("no-such-object".into()),
            )
            .with_link()],
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::MissingObject(_)));
    }

    #[test]
    fn insert_diffs_splice_and_advance_max_elem() {
        let mut view = View::new();
        let list = ObjectId::random();
        apply_diffs(
            &mut view,
            &[
                Diff::create(list.clone(), ObjType::List),
                Diff::insert(
                    list.clone(),
                    ObjType::List,
                    0,
                    Scalar::from("swift"),
                    ElemId::parse("B:4").unwrap(),
                ),
                Diff::insert(
                    list.clone(),
                    ObjType::List,
                    1,
                    Scalar::from("swallow"),
                    ElemId::parse("B:5").unwrap(),
                ),
                Diff::remove_index(list.clone(), ObjType::List, 0),
            ],
        )
        .expect("apply diffs");

        assert_eq!(view.to_json(&list), serde_json::json!(["swallow"]));
        // Counters already observed keep the high-water mark.
        assert_eq!(view.max_elem(&list), 5);
    }

    #[test]
    fn conflicts_record_losing_values_and_clear_on_clean_write() {
        let mut view = View::new();
        let root = ObjectId::root();
        apply_diffs(
            &mut view,
            &[
                Diff::set_key(root.clone(), ObjType::Map, "bird", Scalar::from("magpie"))
                    .with_conflicts(vec![ConflictValue {
                        actor: actor("B"),
                        value: Scalar::from("robin"),
                        link: None,
                        datatype: None,
                    }]),
            ],
        )
        .expect("conflicted set");

        let bucket = view.conflicts_for(&root, "bird").expect("bucket");
        assert_eq!(
            bucket.get(&actor("B")),
            Some(&Value::Scalar(Scalar::from("robin")))
        );

        apply_diffs(
            &mut view,
            &[Diff::set_key(
                root.clone(),
                ObjType::Map,
                "bird",
                Scalar::from("wren"),
            )],
        )
        .expect("clean set");
        assert!(view.conflicts_for(&root, "bird").is_none());
    }

    #[test]
    fn losing_branch_edits_stay_out_of_the_main_view() {
        let mut view = View::new();
        let root = ObjectId::root();
        let winner = ObjectId::random();
        let loser = ObjectId::random();
        apply_diffs(
            &mut view,
            &[
                Diff::create(winner.clone(), ObjType::Map),
                Diff::create(loser.clone(), ObjType::Map),
                Diff::set_key(
                    root.clone(),
                    ObjType::Map,
                    "nest",
                    Scalar::Str(winner.to_string()),
                )
                .with_link()
                .with_conflicts(vec![ConflictValue {
                    actor: actor("B"),
                    value: Scalar::Str(loser.to_string()),
                    link: Some(true),
                    datatype: None,
                }]),
                // A later edit lands inside the losing branch.
                Diff::set_key(loser.clone(), ObjType::Map, "eggs", Scalar::Int(2)),
            ],
        )
        .expect("apply diffs");

        // The main view renders the winner untouched.
        assert_eq!(
            view.to_json(&root),
            serde_json::json!({ "nest": {} })
        );
        // The losing branch is reachable through the bucket and shows the
        // edit; it never gains an inbound path.
        let bucket = view.conflicts_for(&root, "nest").expect("bucket");
        assert_eq!(bucket.get(&actor("B")), Some(&Value::Object(loser.clone())));
        assert_eq!(view.to_json(&loser), serde_json::json!({ "eggs": 2 }));
        assert_eq!(view.path_of(&loser), None);
    }

    #[test]
    fn text_and_table_creates_materialise() {
        let mut view = View::new();
        let text = ObjectId::random();
        let table = ObjectId::random();
        apply_diffs(
            &mut view,
            &[
                Diff::create(text.clone(), ObjType::Text),
                Diff::create(table.clone(), ObjType::Table),
                Diff::insert(
                    text.clone(),
                    ObjType::Text,
                    0,
                    Scalar::from("a"),
                    ElemId::parse("A:1").unwrap(),
                ),
                Diff::set_key(table.clone(), ObjType::Table, "row", Scalar::Int(1)),
            ],
        )
        .expect("apply diffs");
        assert_eq!(view.to_json(&text), serde_json::json!(["a"]));
        assert_eq!(view.to_json(&table), serde_json::json!({ "row": 1 }));
    }

    #[test]
    fn malformed_diffs_surface() {
        let mut view = View::new();
        let bad = Diff {
            value: None,
            ..Diff::set_key(ObjectId::root(), ObjType::Map, "k", Scalar::Null)
        };
        assert!(matches!(
            apply_diffs(&mut view, &[bad]),
            Err(PatchError::Malformed { .. })
        ));

        let unknown_obj = Diff::set_key(ObjectId::random(), ObjType::Map, "k", Scalar::Int(1));
        assert!(matches!(
            apply_diffs(&mut view, &[unknown_obj]),
            Err(PatchError::MissingObject(_))
        ));
    }
}
