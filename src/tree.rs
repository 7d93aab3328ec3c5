//! Materialised document tree: immutable nodes with structural sharing.
//!
//! Nodes live in a [`Cache`] behind `Arc`s. Cloning a cache shares every
//! node; edits go through [`Cache::update`], which copies only the touched
//! node. Two document versions therefore answer `Arc::ptr_eq` for every
//! subtree the edit did not reach.
//!
//! A [`View`] is a cache plus the companion indexes that cannot live on
//! frozen nodes: reverse links (for path construction), conflict buckets,
//! and the per-list high-water mark of minted element counters.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::identity::{ActorId, ElemId, ObjectId};
use crate::value::Value;

/// Tree-level failure, translated by callers into the change- or
/// patch-side error vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TreeError {
    Missing(ObjectId),
    WrongKind {
        obj: ObjectId,
        expected: &'static str,
    },
    OutOfBounds {
        index: usize,
        len: usize,
    },
    NotACounter {
        obj: ObjectId,
        key: String,
    },
}

impl From<TreeError> for crate::error::ChangeError {
    fn from(e: TreeError) -> Self {
        use crate::error::ChangeError;
        match e {
            TreeError::Missing(obj) => ChangeError::MissingObject(obj),
            TreeError::WrongKind { obj, expected } => ChangeError::WrongNodeKind { obj, expected },
            TreeError::OutOfBounds { index, len } => ChangeError::IndexOutOfBounds { index, len },
            TreeError::NotACounter { obj, key } => ChangeError::NotACounter { obj, key },
        }
    }
}

impl From<TreeError> for crate::error::PatchError {
    fn from(e: TreeError) -> Self {
        use crate::error::PatchError;
        match e {
            TreeError::Missing(obj) => PatchError::MissingObject(obj),
            TreeError::WrongKind { obj, expected } => PatchError::WrongNodeKind { obj, expected },
            TreeError::OutOfBounds { index, len } => PatchError::IndexOutOfBounds { index, len },
            TreeError::NotACounter { obj, key } => PatchError::NotACounter { obj, key },
        }
    }
}

/// A map object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapNode {
    fields: BTreeMap<String, Value>,
}

impl MapNode {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    fn set(&mut self, key: String, value: Value) -> Option<Value> {
        self.fields.insert(key, value)
    }

    fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }
}

/// A list object. Elements and their identities move together, so
/// `elements.len() == elem_ids.len()` holds structurally.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListNode {
    elements: Vec<Value>,
    elem_ids: Vec<ElemId>,
}

impl ListNode {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.elements.get(index)
    }

    pub fn elem_id(&self, index: usize) -> Option<&ElemId> {
        self.elem_ids.get(index)
    }

    pub fn index_of(&self, elem_id: &ElemId) -> Option<usize> {
        self.elem_ids.iter().position(|e| e == elem_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ElemId, &Value)> {
        self.elem_ids.iter().zip(self.elements.iter())
    }

    fn insert(&mut self, index: usize, elem_id: ElemId, value: Value) {
        self.elements.insert(index, value);
        self.elem_ids.insert(index, elem_id);
    }

    fn set(&mut self, index: usize, value: Value) -> Value {
        std::mem::replace(&mut self.elements[index], value)
    }

    fn remove(&mut self, index: usize) -> (ElemId, Value) {
        let value = self.elements.remove(index);
        let elem_id = self.elem_ids.remove(index);
        (elem_id, value)
    }
}

/// One materialised object.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Map(MapNode),
    List(ListNode),
}

impl Node {
    pub fn empty_map() -> Self {
        Node::Map(MapNode::default())
    }

    pub fn empty_list() -> Self {
        Node::List(ListNode::default())
    }

    pub fn as_map(&self) -> Option<&MapNode> {
        match self {
            Node::Map(m) => Some(m),
            Node::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListNode> {
        match self {
            Node::List(l) => Some(l),
            Node::Map(_) => None,
        }
    }
}

/// Object store with copy-on-write node sharing.
#[derive(Clone, Debug, Default)]
pub struct Cache {
    nodes: BTreeMap<ObjectId, Arc<Node>>,
}

impl Cache {
    pub fn get(&self, id: &ObjectId) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn insert(&mut self, id: ObjectId, node: Node) {
        self.nodes.insert(id, Arc::new(node));
    }

    /// Copy-on-write edit. The closure runs on a node no older snapshot can
    /// see: if the `Arc` is shared the node is cloned first.
    fn update<R>(
        &mut self,
        id: &ObjectId,
        f: impl FnOnce(&mut Node) -> Result<R, TreeError>,
    ) -> Result<R, TreeError> {
        let arc = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| TreeError::Missing(id.clone()))?;
        f(Arc::make_mut(arc))
    }
}

/// A materialised view: the cache plus its companion indexes.
#[derive(Clone, Debug, Default)]
pub struct View {
    cache: Cache,
    /// child -> (parent, key). Key is the field name for maps, the elem id
    /// string for lists. Covers links present in cache nodes only - values
    /// recorded in conflict buckets have no inbound entry.
    inbound: BTreeMap<ObjectId, (ObjectId, String)>,
    /// obj -> key -> losing actor -> losing value.
    conflicts: BTreeMap<ObjectId, BTreeMap<String, BTreeMap<ActorId, Value>>>,
    /// Highest list element counter observed per list, local or remote.
    max_elem: BTreeMap<ObjectId, u64>,
}

impl View {
    /// A view holding just the empty root map.
    pub fn new() -> Self {
        let mut view = Self::default();
        view.cache.insert(ObjectId::root(), Node::empty_map());
        view
    }

    pub fn node(&self, id: &ObjectId) -> Option<&Arc<Node>> {
        self.cache.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.cache.contains(id)
    }

    pub fn create(&mut self, id: ObjectId, node: Node) {
        self.cache.insert(id, node);
    }

    pub(crate) fn map(&self, id: &ObjectId) -> Result<&MapNode, TreeError> {
        self.cache
            .get(id)
            .ok_or_else(|| TreeError::Missing(id.clone()))?
            .as_map()
            .ok_or_else(|| TreeError::WrongKind {
                obj: id.clone(),
                expected: "map",
            })
    }

    pub(crate) fn list(&self, id: &ObjectId) -> Result<&ListNode, TreeError> {
        self.cache
            .get(id)
            .ok_or_else(|| TreeError::Missing(id.clone()))?
            .as_list()
            .ok_or_else(|| TreeError::WrongKind {
                obj: id.clone(),
                expected: "list",
            })
    }

    // =====================================================================
    // Map edits
    // =====================================================================

    pub(crate) fn put_field(
        &mut self,
        parent: &ObjectId,
        key: &str,
        value: Value,
    ) -> Result<(), TreeError> {
        let new_child = value.as_object().cloned();
        let old = self.cache.update(parent, |node| match node {
            Node::Map(map) => Ok(map.set(key.to_string(), value)),
            Node::List(_) => Err(TreeError::WrongKind {
                obj: parent.clone(),
                expected: "map",
            }),
        })?;
        self.relink(parent, key, old.as_ref(), new_child);
        Ok(())
    }

    pub(crate) fn remove_field(&mut self, parent: &ObjectId, key: &str) -> Result<(), TreeError> {
        let old = self.cache.update(parent, |node| match node {
            Node::Map(map) => Ok(map.remove(key)),
            Node::List(_) => Err(TreeError::WrongKind {
                obj: parent.clone(),
                expected: "map",
            }),
        })?;
        self.relink(parent, key, old.as_ref(), None);
        self.clear_conflicts(parent, key);
        Ok(())
    }

    pub(crate) fn increment_field(
        &mut self,
        parent: &ObjectId,
        key: &str,
        delta: i64,
    ) -> Result<(), TreeError> {
        self.cache.update(parent, |node| match node {
            Node::Map(map) => match map.get(key) {
                Some(Value::Counter(c)) => {
                    let bumped = Value::Counter(*c + delta);
                    map.set(key.to_string(), bumped);
                    Ok(())
                }
                _ => Err(TreeError::NotACounter {
                    obj: parent.clone(),
                    key: key.to_string(),
                }),
            },
            Node::List(_) => Err(TreeError::WrongKind {
                obj: parent.clone(),
                expected: "map",
            }),
        })
    }

    // =====================================================================
    // List edits
    // =====================================================================

    pub(crate) fn list_insert(
        &mut self,
        parent: &ObjectId,
        index: usize,
        elem_id: ElemId,
        value: Value,
    ) -> Result<(), TreeError> {
        let new_child = value.as_object().cloned();
        let key = elem_id.to_string();
        let counter = elem_id.counter();
        self.cache.update(parent, |node| match node {
            Node::List(list) => {
                if index > list.len() {
                    return Err(TreeError::OutOfBounds {
                        index,
                        len: list.len(),
                    });
                }
                list.insert(index, elem_id, value);
                Ok(())
            }
            Node::Map(_) => Err(TreeError::WrongKind {
                obj: parent.clone(),
                expected: "list",
            }),
        })?;
        self.observe_elem(parent, counter);
        self.relink(parent, &key, None, new_child);
        Ok(())
    }

    pub(crate) fn list_set(
        &mut self,
        parent: &ObjectId,
        index: usize,
        value: Value,
    ) -> Result<(), TreeError> {
        let new_child = value.as_object().cloned();
        let (key, old) = self.cache.update(parent, |node| match node {
            Node::List(list) => {
                if index >= list.len() {
                    return Err(TreeError::OutOfBounds {
                        index,
                        len: list.len(),
                    });
                }
                let key = list.elem_id(index).map(ToString::to_string);
                let old = list.set(index, value);
                Ok((key, old))
            }
            Node::Map(_) => Err(TreeError::WrongKind {
                obj: parent.clone(),
                expected: "list",
            }),
        })?;
        if let Some(key) = key {
            self.relink(parent, &key, Some(&old), new_child);
        }
        Ok(())
    }

    pub(crate) fn list_remove(&mut self, parent: &ObjectId, index: usize) -> Result<(), TreeError> {
        let (elem_id, old) = self.cache.update(parent, |node| match node {
            Node::List(list) => {
                if index >= list.len() {
                    return Err(TreeError::OutOfBounds {
                        index,
                        len: list.len(),
                    });
                }
                Ok(list.remove(index))
            }
            Node::Map(_) => Err(TreeError::WrongKind {
                obj: parent.clone(),
                expected: "list",
            }),
        })?;
        let key = elem_id.to_string();
        self.relink(parent, &key, Some(&old), None);
        self.clear_conflicts(parent, &key);
        Ok(())
    }

    // =====================================================================
    // Inbound links & paths
    // =====================================================================

    fn relink(
        &mut self,
        parent: &ObjectId,
        key: &str,
        old: Option<&Value>,
        new_child: Option<ObjectId>,
    ) {
        if let Some(Value::Object(old_child)) = old {
            let points_here = self
                .inbound
                .get(old_child)
                .is_some_and(|(p, k)| p == parent && k == key);
            if points_here {
                self.inbound.remove(old_child);
            }
        }
        if let Some(child) = new_child {
            self.inbound.insert(child, (parent.clone(), key.to_string()));
        }
    }

    pub(crate) fn parent_of(&self, child: &ObjectId) -> Option<&(ObjectId, String)> {
        self.inbound.get(child)
    }

    /// Keys from the root down to the given object, built from the reverse
    /// links. `None` when the object is not linked into the view.
    pub fn path_of(&self, obj: &ObjectId) -> Option<Vec<String>> {
        if obj.is_root() {
            return Some(Vec::new());
        }
        let mut path = Vec::new();
        let mut cursor = obj.clone();
        // A well-formed view has no link cycles; the bound guards against
        // a corrupt inbound index looping forever.
        for _ in 0..=self.inbound.len() {
            let (parent, key) = self.inbound.get(&cursor)?;
            path.push(key.clone());
            if parent.is_root() {
                path.reverse();
                return Some(path);
            }
            cursor = parent.clone();
        }
        None
    }

    // =====================================================================
    // Conflict buckets
    // =====================================================================

    pub(crate) fn set_conflicts(
        &mut self,
        obj: &ObjectId,
        key: &str,
        bucket: BTreeMap<ActorId, Value>,
    ) {
        self.conflicts
            .entry(obj.clone())
            .or_default()
            .insert(key.to_string(), bucket);
    }

    pub(crate) fn clear_conflicts(&mut self, obj: &ObjectId, key: &str) {
        if let Some(keys) = self.conflicts.get_mut(obj) {
            keys.remove(key);
            if keys.is_empty() {
                self.conflicts.remove(obj);
            }
        }
    }

    pub fn conflicts_for(&self, obj: &ObjectId, key: &str) -> Option<&BTreeMap<ActorId, Value>> {
        self.conflicts.get(obj)?.get(key)
    }

    // =====================================================================
    // Element counters
    // =====================================================================

    pub(crate) fn observe_elem(&mut self, obj: &ObjectId, counter: u64) {
        let entry = self.max_elem.entry(obj.clone()).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    pub(crate) fn max_elem(&self, obj: &ObjectId) -> u64 {
        self.max_elem.get(obj).copied().unwrap_or(0)
    }

    // =====================================================================
    // Projection
    // =====================================================================

    /// Plain-data projection of a subtree. Counters render as their value,
    /// timestamps as their millisecond count.
    pub fn to_json(&self, obj: &ObjectId) -> serde_json::Value {
        match self.cache.get(obj).map(|arc| arc.as_ref()) {
            Some(Node::Map(map)) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.value_to_json(v)))
                    .collect(),
            ),
            Some(Node::List(list)) => serde_json::Value::Array(
                list.iter().map(|(_, v)| self.value_to_json(v)).collect(),
            ),
            None => serde_json::Value::Null,
        }
    }

    fn value_to_json(&self, value: &Value) -> serde_json::Value {
        match value {
            Value::Scalar(s) => {
                serde_json::to_value(s).unwrap_or(serde_json::Value::Null)
            }
            Value::Counter(c) => serde_json::Value::from(c.value()),
            Value::Timestamp(t) => serde_json::Value::from(t.millis()),
            Value::Object(id) => self.to_json(id),
        }
    }
}
