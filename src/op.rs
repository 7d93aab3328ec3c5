//! Frontend operations and the outbound `Change` wire format.
//!
//! `ins` here is the frontend op; the backend's list-insert *diff* is the
//! separate `insert` action in the patch vocabulary.

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::identity::{ActorId, ObjectId};
use crate::value::{DataType, Scalar};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpAction {
    MakeMap,
    MakeList,
    Set,
    Del,
    Link,
    Ins,
    Inc,
}

/// One captured mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub action: OpAction,
    pub obj: ObjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Scalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elem: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datatype: Option<DataType>,
}

impl Op {
    fn bare(action: OpAction, obj: ObjectId) -> Self {
        Self {
            action,
            obj,
            key: None,
            value: None,
            elem: None,
            datatype: None,
        }
    }

    pub fn make_map(obj: ObjectId) -> Self {
        Self::bare(OpAction::MakeMap, obj)
    }

    pub fn make_list(obj: ObjectId) -> Self {
        Self::bare(OpAction::MakeList, obj)
    }

    pub fn set(obj: ObjectId, key: String, value: Scalar, datatype: Option<DataType>) -> Self {
        Self {
            key: Some(key),
            value: Some(value),
            datatype,
            ..Self::bare(OpAction::Set, obj)
        }
    }

    pub fn del(obj: ObjectId, key: String) -> Self {
        Self {
            key: Some(key),
            ..Self::bare(OpAction::Del, obj)
        }
    }

    pub fn link(obj: ObjectId, key: String, child: &ObjectId) -> Self {
        Self {
            key: Some(key),
            value: Some(Scalar::Str(child.to_string())),
            ..Self::bare(OpAction::Link, obj)
        }
    }

    /// Insert a fresh element after `pred_key` (`"_head"` or a predecessor
    /// elem id string); `elem` is the newly minted counter.
    pub fn ins(obj: ObjectId, pred_key: String, elem: u64) -> Self {
        Self {
            key: Some(pred_key),
            elem: Some(elem),
            ..Self::bare(OpAction::Ins, obj)
        }
    }

    pub fn inc(obj: ObjectId, key: String, delta: i64) -> Self {
        Self {
            key: Some(key),
            value: Some(Scalar::Int(delta)),
            ..Self::bare(OpAction::Inc, obj)
        }
    }

}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Change,
    Undo,
    Redo,
}

/// A causally-dated batch of ops produced by one actor, sent to the
/// backend verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub request_type: RequestType,
    pub actor: ActorId,
    pub seq: u64,
    pub deps: Clock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub ops: Vec<Op>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_wire_shape() {
        let obj = ObjectId::root();
        let change = Change {
            request_type: RequestType::Change,
            actor: ActorId::new("A").unwrap(),
            seq: 1,
            deps: Clock::new(),
            message: None,
            ops: vec![Op::set(
                obj,
                "bird".into(),
                Scalar::from("magpie"),
                None,
            )],
        };
        let wire = serde_json::to_value(&change).expect("serialize change");
        assert_eq!(
            wire,
            json!({
                "requestType": "change",
                "actor": "A",
                "seq": 1,
                "deps": {},
                "ops": [{
                    "action": "set",
                    "obj": "00000000-0000-0000-0000-000000000000",
                    "key": "bird",
                    "value": "magpie",
                }],
            })
        );
        let back: Change = serde_json::from_value(wire).expect("deserialize change");
        assert_eq!(back, change);
    }

    #[test]
    fn op_action_tags_are_camel_case() {
        assert_eq!(
            serde_json::to_string(&OpAction::MakeMap).unwrap(),
            "\"makeMap\""
        );
        assert_eq!(
            serde_json::to_string(&OpAction::MakeList).unwrap(),
            "\"makeList\""
        );
        assert_eq!(serde_json::to_string(&OpAction::Ins).unwrap(), "\"ins\"");
    }

    #[test]
    fn ins_op_carries_predecessor_and_counter() {
        let obj = ObjectId::random();
        let op = Op::ins(obj.clone(), crate::identity::HEAD.into(), 1);
        let wire = serde_json::to_value(&op).expect("serialize op");
        assert_eq!(
            wire,
            json!({ "action": "ins", "obj": obj.as_str(), "key": "_head", "elem": 1 })
        );
    }

    #[test]
    fn datatype_round_trips_on_set() {
        let op = Op::set(
            ObjectId::root(),
            "wrens".into(),
            Scalar::Int(1),
            Some(DataType::Counter),
        );
        let wire = serde_json::to_value(&op).expect("serialize op");
        assert_eq!(wire["datatype"], json!("counter"));
        let back: Op = serde_json::from_value(wire).expect("deserialize op");
        assert_eq!(back.datatype, Some(DataType::Counter));
    }
}
