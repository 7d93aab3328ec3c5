//! Identity atoms.
//!
//! ActorId: replica self-identification.
//! ObjectId: map/list identity within a document; the root is reserved.
//! ElemId: (actor, counter) list position identity, totally ordered.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidId;

/// The reserved root object id.
pub const ROOT_ID: &str = "00000000-0000-0000-0000-000000000000";

/// List head sentinel used as the `key` of an `ins` op inserting at
/// position zero.
pub const HEAD: &str = "_head";

/// Actor identifier - non-empty string, normally a UUID.
///
/// Minted ids are v4 UUIDs; parsing accepts any non-empty string because
/// backends and fixtures name actors freely.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            Err(InvalidId::Actor {
                raw: s,
                reason: "empty".into(),
            })
        } else {
            Ok(Self(s))
        }
    }

    /// Mint a fresh random actor id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({:?})", self.0)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object identifier - the reserved root or a minted UUID.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// The reserved root object id.
    pub fn root() -> Self {
        Self(ROOT_ID.to_string())
    }

    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            Err(InvalidId::Object {
                raw: s,
                reason: "empty".into(),
            })
        } else {
            Ok(Self(s))
        }
    }

    /// Mint a fresh object id for a nested map or list.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:?})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// List element identity - `(actor, counter)`, serialised `actor:counter`.
///
/// Total order is by counter first, then actor lexicographically. Among
/// elements inserted after the same predecessor, greater ids integrate
/// first.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ElemId {
    actor: ActorId,
    counter: u64,
}

impl ElemId {
    pub fn new(actor: ActorId, counter: u64) -> Self {
        Self { actor, counter }
    }

    /// Parse from the `actor:counter` wire form. The actor part may itself
    /// contain colons; the counter starts at the last one.
    pub fn parse(s: &str) -> Result<Self, InvalidId> {
        let Some((actor_raw, counter_raw)) = s.rsplit_once(':') else {
            return Err(InvalidId::Elem {
                raw: s.to_string(),
                reason: "must contain ':' separator".into(),
            });
        };
        let counter = counter_raw.parse::<u64>().map_err(|_| InvalidId::Elem {
            raw: s.to_string(),
            reason: "counter must be an unsigned integer".into(),
        })?;
        let actor = ActorId::new(actor_raw).map_err(|_| InvalidId::Elem {
            raw: s.to_string(),
            reason: "missing actor".into(),
        })?;
        Ok(Self { actor, counter })
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl PartialOrd for ElemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ElemId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.actor.cmp(&other.actor))
    }
}

impl fmt::Debug for ElemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElemId({}:{})", self.actor, self.counter)
    }
}

impl fmt::Display for ElemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor, self.counter)
    }
}

impl Serialize for ElemId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ElemId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ElemId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_id_rejects_empty() {
        assert!(ActorId::new("").is_err());
        assert!(ActorId::new("local").is_ok());
    }

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(ActorId::random(), ActorId::random());
        assert_ne!(ObjectId::random(), ObjectId::random());
    }

    #[test]
    fn root_is_reserved() {
        let root = ObjectId::root();
        assert!(root.is_root());
        assert_eq!(root.as_str(), ROOT_ID);
        assert!(!ObjectId::random().is_root());
    }

    #[test]
    fn elem_id_round_trips() {
        let id = ElemId::new(ActorId::new("a").unwrap(), 7);
        assert_eq!(id.to_string(), "a:7");
        assert_eq!(ElemId::parse("a:7").unwrap(), id);
    }

    #[test]
    fn elem_id_parses_at_last_colon() {
        let id = ElemId::parse("a:b:3").unwrap();
        assert_eq!(id.actor().as_str(), "a:b");
        assert_eq!(id.counter(), 3);
    }

    #[test]
    fn elem_id_rejects_garbage() {
        assert!(ElemId::parse("no-separator").is_err());
        assert!(ElemId::parse("a:not-a-number").is_err());
        assert!(ElemId::parse(":3").is_err());
    }

    #[test]
    fn elem_id_orders_by_counter_then_actor() {
        let a1 = ElemId::parse("a:1").unwrap();
        let b1 = ElemId::parse("b:1").unwrap();
        let a2 = ElemId::parse("a:2").unwrap();
        assert!(a1 < b1);
        assert!(b1 < a2);
        assert!(a1 < a2);
    }
}
