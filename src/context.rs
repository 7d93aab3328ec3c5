//! Mutation capture inside a change block.
//!
//! The dynamic-host original intercepts mutations through a transparent
//! proxy; here the same semantics are an explicit context whose methods the
//! change callback invokes. Every mutation records an op (subject to the
//! coalescing rules) and lands immediately in a scratch view, so later
//! reads inside the same change observe earlier writes.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::ChangeError;
use crate::identity::{ActorId, ElemId, ObjectId, HEAD};
use crate::interp;
use crate::op::{Op, OpAction};
use crate::tree::View;
use crate::value::{Counter, Scalar, Timestamp, Value};

/// A value being assigned into the document: a scalar, a counter or
/// timestamp wrapper, or a nested literal expanded into `makeMap` /
/// `makeList` + contents + `link` ops.
#[derive(Clone, Debug, PartialEq)]
pub enum NewValue {
    Scalar(Scalar),
    Counter(i64),
    Timestamp(i64),
    Map(Vec<(String, NewValue)>),
    List(Vec<NewValue>),
}

impl NewValue {
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, NewValue)>) -> Self {
        NewValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn list(items: impl IntoIterator<Item = NewValue>) -> Self {
        NewValue::List(items.into_iter().collect())
    }
}

impl From<&str> for NewValue {
    fn from(s: &str) -> Self {
        NewValue::Scalar(Scalar::from(s))
    }
}

impl From<String> for NewValue {
    fn from(s: String) -> Self {
        NewValue::Scalar(Scalar::from(s))
    }
}

impl From<i64> for NewValue {
    fn from(n: i64) -> Self {
        NewValue::Scalar(Scalar::Int(n))
    }
}

impl From<f64> for NewValue {
    fn from(n: f64) -> Self {
        NewValue::Scalar(Scalar::F64(n))
    }
}

impl From<bool> for NewValue {
    fn from(b: bool) -> Self {
        NewValue::Scalar(Scalar::Bool(b))
    }
}

impl From<Counter> for NewValue {
    fn from(c: Counter) -> Self {
        NewValue::Counter(c.value())
    }
}

impl From<Timestamp> for NewValue {
    fn from(t: Timestamp) -> Self {
        NewValue::Timestamp(t.millis())
    }
}

impl From<time::OffsetDateTime> for NewValue {
    fn from(t: time::OffsetDateTime) -> Self {
        NewValue::Timestamp(Timestamp::from(t).millis())
    }
}

impl TryFrom<serde_json::Value> for NewValue {
    type Error = ChangeError;

    fn try_from(value: serde_json::Value) -> Result<Self, ChangeError> {
        match value {
            serde_json::Value::Null => Ok(NewValue::Scalar(Scalar::Null)),
            serde_json::Value::Bool(b) => Ok(NewValue::Scalar(Scalar::Bool(b))),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(NewValue::Scalar(Scalar::Int(i)))
                } else if n.is_u64() {
                    // Past i64::MAX the value would silently lose precision.
                    Err(ChangeError::UnsupportedValue {
                        reason: format!("integer {n} overflows the representable range"),
                    })
                } else if let Some(f) = n.as_f64() {
                    Ok(NewValue::Scalar(Scalar::F64(f)))
                } else {
                    Err(ChangeError::UnsupportedValue {
                        reason: format!("number {n} has no CRDT representation"),
                    })
                }
            }
            serde_json::Value::String(s) => Ok(NewValue::Scalar(Scalar::Str(s))),
            serde_json::Value::Array(items) => Ok(NewValue::List(
                items
                    .into_iter()
                    .map(NewValue::try_from)
                    .collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(entries) => Ok(NewValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, NewValue::try_from(v)?)))
                    .collect::<Result<_, ChangeError>>()?,
            )),
        }
    }
}

struct ContextInner {
    actor: Option<ActorId>,
    view: View,
    ops: Vec<Op>,
}

/// The mutable-looking face of a document inside a change block.
pub struct ChangeContext {
    inner: Rc<RefCell<ContextInner>>,
}

impl ChangeContext {
    pub(crate) fn new(actor: Option<ActorId>, view: View) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ContextInner {
                actor,
                view,
                ops: Vec::new(),
            })),
        }
    }

    pub(crate) fn finish(self) -> (View, Vec<Op>) {
        let inner = Rc::try_unwrap(self.inner)
            .unwrap_or_else(|rc| RefCell::new(rc.borrow().snapshot()))
            .into_inner();
        (inner.view, inner.ops)
    }

    // =====================================================================
    // Reads
    // =====================================================================

    pub fn root(&self) -> ObjectId {
        ObjectId::root()
    }

    pub fn get(&self, obj: &ObjectId, key: &str) -> Option<Value> {
        let inner = self.inner.borrow();
        inner.view.map(obj).ok()?.get(key).cloned()
    }

    pub fn get_index(&self, obj: &ObjectId, index: usize) -> Option<Value> {
        let inner = self.inner.borrow();
        inner.view.list(obj).ok()?.get(index).cloned()
    }

    /// Object id behind a map field, when the field links to one.
    pub fn object_at(&self, obj: &ObjectId, key: &str) -> Option<ObjectId> {
        self.get(obj, key)?.as_object().cloned()
    }

    pub fn list_len(&self, obj: &ObjectId) -> Option<usize> {
        let inner = self.inner.borrow();
        inner.view.list(obj).ok().map(|l| l.len())
    }

    /// Live handle to a counter field, valid for this change only.
    pub fn counter_at(&self, obj: &ObjectId, key: &str) -> Result<CounterRef, ChangeError> {
        let inner = self.inner.borrow();
        match inner.view.map(obj).map_err(ChangeError::from)?.get(key) {
            Some(Value::Counter(_)) => Ok(CounterRef {
                inner: Rc::downgrade(&self.inner),
                obj: obj.clone(),
                key: key.to_string(),
            }),
            _ => Err(ChangeError::NotACounter {
                obj: obj.clone(),
                key: key.to_string(),
            }),
        }
    }

    // =====================================================================
    // Map writes
    // =====================================================================

    pub fn set(
        &mut self,
        obj: &ObjectId,
        key: &str,
        value: impl Into<NewValue>,
    ) -> Result<(), ChangeError> {
        let mut inner = self.inner.borrow_mut();
        inner.require_actor()?;
        let map = inner.view.map(obj).map_err(ChangeError::from)?;
        if map.get(key).is_some_and(Value::is_counter) {
            return Err(ChangeError::CannotOverwriteCounter {
                obj: obj.clone(),
                key: key.to_string(),
            });
        }
        inner.assign(obj, key.to_string(), value.into())
    }

    pub fn delete(&mut self, obj: &ObjectId, key: &str) -> Result<(), ChangeError> {
        let mut inner = self.inner.borrow_mut();
        inner.require_actor()?;
        let map = inner.view.map(obj).map_err(ChangeError::from)?;
        if !map.contains_key(key) {
            return Ok(());
        }
        inner.record(Op::del(obj.clone(), key.to_string()))
    }

    // =====================================================================
    // List writes
    // =====================================================================

    pub fn insert<V: Into<NewValue>>(
        &mut self,
        obj: &ObjectId,
        index: usize,
        values: impl IntoIterator<Item = V>,
    ) -> Result<(), ChangeError> {
        let mut inner = self.inner.borrow_mut();
        inner.require_actor()?;
        let list = inner.view.list(obj).map_err(ChangeError::from)?;
        if index > list.len() {
            return Err(ChangeError::IndexOutOfBounds {
                index,
                len: list.len(),
            });
        }
        let mut pred = if index == 0 {
            HEAD.to_string()
        } else {
            list.elem_id(index - 1)
                .map(ToString::to_string)
                .expect("index bound checked")
        };
        for value in values {
            let actor = inner.require_actor()?;
            let counter = inner.view.max_elem(obj) + 1;
            let elem_id = ElemId::new(actor, counter);
            inner.record(Op::ins(obj.clone(), pred, counter))?;
            inner.assign(obj, elem_id.to_string(), value.into())?;
            pred = elem_id.to_string();
        }
        Ok(())
    }

    pub fn push(
        &mut self,
        obj: &ObjectId,
        value: impl Into<NewValue>,
    ) -> Result<(), ChangeError> {
        let len = {
            let inner = self.inner.borrow();
            inner.view.list(obj).map_err(ChangeError::from)?.len()
        };
        self.insert(obj, len, [value.into()])
    }

    pub fn set_index(
        &mut self,
        obj: &ObjectId,
        index: usize,
        value: impl Into<NewValue>,
    ) -> Result<(), ChangeError> {
        let mut inner = self.inner.borrow_mut();
        inner.require_actor()?;
        let list = inner.view.list(obj).map_err(ChangeError::from)?;
        let len = list.len();
        let (elem_key, current) = match (list.elem_id(index), list.get(index)) {
            (Some(id), Some(value)) => (id.to_string(), value.clone()),
            _ => return Err(ChangeError::IndexOutOfBounds { index, len }),
        };
        if current.is_counter() {
            return Err(ChangeError::CannotOverwriteCounter {
                obj: obj.clone(),
                key: elem_key,
            });
        }
        inner.assign(obj, elem_key, value.into())
    }

    pub fn delete_index(&mut self, obj: &ObjectId, index: usize) -> Result<(), ChangeError> {
        let mut inner = self.inner.borrow_mut();
        inner.require_actor()?;
        let list = inner.view.list(obj).map_err(ChangeError::from)?;
        let elem_key = list
            .elem_id(index)
            .map(ToString::to_string)
            .ok_or(ChangeError::IndexOutOfBounds {
                index,
                len: list.len(),
            })?;
        inner.record(Op::del(obj.clone(), elem_key))
    }

    // =====================================================================
    // Counters
    // =====================================================================

    pub fn increment(&mut self, obj: &ObjectId, key: &str, delta: i64) -> Result<(), ChangeError> {
        self.inner.borrow_mut().increment(obj, key, delta)
    }

    pub fn decrement(&mut self, obj: &ObjectId, key: &str, delta: i64) -> Result<(), ChangeError> {
        self.inner.borrow_mut().increment(obj, key, -delta)
    }
}

impl ContextInner {
    fn snapshot(&self) -> ContextInner {
        ContextInner {
            actor: self.actor.clone(),
            view: self.view.clone(),
            ops: self.ops.clone(),
        }
    }

    fn require_actor(&self) -> Result<ActorId, ChangeError> {
        self.actor.clone().ok_or(ChangeError::ActorIdUnset)
    }

    /// Append an op (after coalescing) and fold it into the scratch view.
    fn record(&mut self, op: Op) -> Result<(), ChangeError> {
        let actor = self.require_actor()?;
        interp::apply_ops(&mut self.view, &actor, std::slice::from_ref(&op))?;
        self.coalesce(op);
        Ok(())
    }

    /// The mandatory op-stream compressions:
    /// 1. counter `set` followed by `inc` on the same field becomes one
    ///    plain `set` holding the final value;
    /// 2. consecutive `inc`s on one field sum;
    /// 3. re-`set` of one field keeps only the last write.
    fn coalesce(&mut self, op: Op) {
        match op.action {
            OpAction::Set => {
                self.ops.retain(|prev| {
                    !(prev.action == OpAction::Set && prev.obj == op.obj && prev.key == op.key)
                });
                self.ops.push(op);
            }
            OpAction::Inc => {
                let delta = op.value.as_ref().and_then(Scalar::as_i64).unwrap_or(0);
                let folded = self
                    .ops
                    .iter_mut()
                    .rev()
                    .find(|prev| prev.obj == op.obj && prev.key == op.key)
                    .and_then(|prev| {
                        let base = prev.value.as_ref().and_then(Scalar::as_i64)?;
                        match prev.action {
                            OpAction::Set => {
                                prev.value = Some(Scalar::Int(base + delta));
                                prev.datatype = None;
                                Some(())
                            }
                            OpAction::Inc => {
                                prev.value = Some(Scalar::Int(base + delta));
                                Some(())
                            }
                            _ => None,
                        }
                    });
                if folded.is_none() {
                    self.ops.push(op);
                }
            }
            _ => self.ops.push(op),
        }
    }

    fn assign(&mut self, parent: &ObjectId, key: String, value: NewValue) -> Result<(), ChangeError> {
        match value {
            NewValue::Scalar(scalar) => {
                validate_scalar(&scalar)?;
                self.record(Op::set(parent.clone(), key, scalar, None))
            }
            NewValue::Counter(n) => self.record(Op::set(
                parent.clone(),
                key,
                Scalar::Int(n),
                Some(crate::value::DataType::Counter),
            )),
            NewValue::Timestamp(ms) => self.record(Op::set(
                parent.clone(),
                key,
                Scalar::Int(ms),
                Some(crate::value::DataType::Timestamp),
            )),
            NewValue::Map(entries) => {
                let child = ObjectId::random();
                self.record(Op::make_map(child.clone()))?;
                for (field, entry) in entries {
                    self.assign(&child, field, entry)?;
                }
                self.record(Op::link(parent.clone(), key, &child))
            }
            NewValue::List(items) => {
                let child = ObjectId::random();
                self.record(Op::make_list(child.clone()))?;
                let mut pred = HEAD.to_string();
                for item in items {
                    let actor = self.require_actor()?;
                    let counter = self.view.max_elem(&child) + 1;
                    let elem_id = ElemId::new(actor, counter);
                    self.record(Op::ins(child.clone(), pred, counter))?;
                    self.assign(&child, elem_id.to_string(), item)?;
                    pred = elem_id.to_string();
                }
                self.record(Op::link(parent.clone(), key, &child))
            }
        }
    }

    fn increment(&mut self, obj: &ObjectId, key: &str, delta: i64) -> Result<(), ChangeError> {
        self.require_actor()?;
        let holds_counter = match self.view.map(obj) {
            Ok(map) => map.get(key).is_some_and(Value::is_counter),
            Err(_) => {
                // Counters can also live in list slots, addressed by elem id.
                let list = self.view.list(obj).map_err(ChangeError::from)?;
                ElemId::parse(key)
                    .ok()
                    .and_then(|id| list.index_of(&id))
                    .and_then(|i| list.get(i))
                    .is_some_and(Value::is_counter)
            }
        };
        if !holds_counter {
            return Err(ChangeError::NotACounter {
                obj: obj.clone(),
                key: key.to_string(),
            });
        }
        self.record(Op::inc(obj.clone(), key.to_string(), delta))
    }
}

/// Handle to a counter field, live for the duration of its change block.
///
/// The handle may outlive the block; mutation through a dead handle fails
/// with [`ChangeError::CounterReadOnly`].
pub struct CounterRef {
    inner: Weak<RefCell<ContextInner>>,
    obj: ObjectId,
    key: String,
}

impl CounterRef {
    fn live(&self) -> Result<Rc<RefCell<ContextInner>>, ChangeError> {
        self.inner.upgrade().ok_or(ChangeError::CounterReadOnly)
    }

    pub fn value(&self) -> Result<i64, ChangeError> {
        let rc = self.live()?;
        let inner = rc.borrow();
        match inner.view.map(&self.obj).map_err(ChangeError::from)?.get(&self.key) {
            Some(Value::Counter(c)) => Ok(c.value()),
            _ => Err(ChangeError::NotACounter {
                obj: self.obj.clone(),
                key: self.key.clone(),
            }),
        }
    }

    pub fn increment(&self, delta: i64) -> Result<(), ChangeError> {
        let rc = self.live()?;
        let mut inner = rc.borrow_mut();
        inner.increment(&self.obj, &self.key, delta)
    }

    pub fn decrement(&self, delta: i64) -> Result<(), ChangeError> {
        self.increment(-delta)
    }
}

fn validate_scalar(scalar: &Scalar) -> Result<(), ChangeError> {
    match scalar {
        Scalar::F64(f) if !f.is_finite() => Err(ChangeError::UnsupportedValue {
            reason: format!("float {f} has no CRDT representation"),
        }),
        _ => Ok(()),
    }
}
