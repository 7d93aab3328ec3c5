//! The document handle: an immutable value combining the rendered view,
//! the authoritative (backend-acknowledged) view, and the optimistic
//! request queue.
//!
//! Mutation happens only through [`Document::change`] (captures ops,
//! queues a request) and [`Document::apply_patch`] (folds backend diffs,
//! trims the queue). Both return a new handle; unchanged subtrees are
//! shared by reference with the old one.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::apply;
use crate::clock::Clock;
use crate::context::ChangeContext;
use crate::error::{ChangeError, Error, PatchError};
use crate::identity::{ActorId, ElemId, ObjectId};
use crate::interp;
use crate::op::{Change, RequestType};
use crate::patch::Patch;
use crate::tree::{Node, View};
use crate::value::Value;

/// A local change sent to the backend but not yet acknowledged.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    change: Change,
    before: View,
}

impl PendingRequest {
    pub fn change(&self) -> &Change {
        &self.change
    }

    pub fn seq(&self) -> u64 {
        self.change.seq
    }

    /// Rendered view from just before this change was captured. Kept so
    /// integration glue can roll back if the backend rejects the request;
    /// this layer never rolls back on its own.
    pub fn before(&self) -> &View {
        &self.before
    }
}

/// A conflict-free replicated JSON document, frontend side.
#[derive(Clone, Debug)]
pub struct Document {
    actor_id: Option<ActorId>,
    seq: u64,
    deps: Clock,
    /// What applications read: authoritative state plus pending local edits.
    rendered: View,
    /// Backend-acknowledged state only.
    authoritative: View,
    requests: VecDeque<PendingRequest>,
    can_undo: bool,
    can_redo: bool,
    backend_state: Option<Arc<serde_json::Value>>,
}

impl Document {
    fn init(actor_id: Option<ActorId>) -> Self {
        let view = View::new();
        Self {
            actor_id,
            seq: 0,
            deps: Clock::new(),
            rendered: view.clone(),
            authoritative: view,
            requests: VecDeque::new(),
            can_undo: false,
            can_redo: false,
            backend_state: None,
        }
    }

    /// Empty document with a freshly minted actor id.
    pub fn new() -> Self {
        Self::init(Some(ActorId::random()))
    }

    pub fn with_actor_id(actor_id: ActorId) -> Self {
        Self::init(Some(actor_id))
    }

    /// Empty document with the actor id deferred; writes fail with
    /// [`ChangeError::ActorIdUnset`] until [`Document::set_actor_id`].
    pub fn deferred() -> Self {
        Self::init(None)
    }

    pub fn actor_id(&self) -> Option<&ActorId> {
        self.actor_id.as_ref()
    }

    pub fn set_actor_id(&self, actor_id: ActorId) -> Document {
        let mut doc = self.clone();
        doc.actor_id = Some(actor_id);
        doc
    }

    // =====================================================================
    // Reads (rendered view)
    // =====================================================================

    pub fn root(&self) -> ObjectId {
        ObjectId::root()
    }

    pub fn get(&self, obj: &ObjectId, key: &str) -> Option<&Value> {
        self.rendered.map(obj).ok()?.get(key)
    }

    pub fn get_index(&self, obj: &ObjectId, index: usize) -> Option<&Value> {
        self.rendered.list(obj).ok()?.get(index)
    }

    /// Object id behind a map field, when the field links to one.
    pub fn object_at(&self, obj: &ObjectId, key: &str) -> Option<ObjectId> {
        self.get(obj, key)?.as_object().cloned()
    }

    pub fn list_len(&self, obj: &ObjectId) -> Option<usize> {
        self.rendered.list(obj).ok().map(|l| l.len())
    }

    pub fn elem_id_at(&self, obj: &ObjectId, index: usize) -> Option<&ElemId> {
        self.rendered.list(obj).ok()?.elem_id(index)
    }

    /// Shared node handle; two document versions answer `Arc::ptr_eq` here
    /// for every subtree an edit did not touch.
    pub fn node(&self, obj: &ObjectId) -> Option<&Arc<Node>> {
        self.rendered.node(obj)
    }

    /// Losing candidates for a conflicted map field, keyed by actor.
    pub fn get_conflicts(&self, obj: &ObjectId, key: &str) -> Option<&BTreeMap<ActorId, Value>> {
        self.rendered.conflicts_for(obj, key)
    }

    /// Losing candidates for a conflicted list element.
    pub fn get_conflicts_at(
        &self,
        obj: &ObjectId,
        index: usize,
    ) -> Option<&BTreeMap<ActorId, Value>> {
        let key = self.elem_id_at(obj, index)?.to_string();
        self.rendered.conflicts_for(obj, &key)
    }

    /// Keys from the root down to the given object.
    pub fn path_of(&self, obj: &ObjectId) -> Option<Vec<String>> {
        self.rendered.path_of(obj)
    }

    /// Plain-data projection of the whole document.
    pub fn to_json(&self) -> serde_json::Value {
        self.rendered.to_json(&ObjectId::root())
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn deps(&self) -> &Clock {
        &self.deps
    }

    pub fn can_undo(&self) -> bool {
        self.can_undo
    }

    pub fn can_redo(&self) -> bool {
        self.can_redo
    }

    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = &PendingRequest> {
        self.requests.iter()
    }

    /// Opaque backend state attachment, when integration glue stored one.
    pub fn backend_state(&self) -> Option<&serde_json::Value> {
        self.backend_state.as_deref()
    }

    pub fn set_backend_state(&self, state: serde_json::Value) -> Document {
        let mut doc = self.clone();
        doc.backend_state = Some(Arc::new(state));
        doc
    }

    // =====================================================================
    // Mutation
    // =====================================================================

    /// Run a change callback atomically. A callback error aborts with no
    /// observable effect; a callback that records no ops returns a handle
    /// sharing every node with `self` and no change to send.
    pub fn change<F>(&self, message: Option<&str>, f: F) -> Result<(Document, Option<Change>), Error>
    where
        F: FnOnce(&mut ChangeContext) -> Result<(), Error>,
    {
        let mut ctx = ChangeContext::new(self.actor_id.clone(), self.rendered.clone());
        f(&mut ctx)?;
        let (view, ops) = ctx.finish();
        if ops.is_empty() {
            return Ok((self.clone(), None));
        }
        // Ops imply mutation, and mutation required an actor.
        let actor = self.actor_id.clone().ok_or(ChangeError::ActorIdUnset)?;
        let change = Change {
            request_type: RequestType::Change,
            actor,
            seq: self.seq + 1,
            deps: self.emitted_deps(),
            message: message.map(str::to_string),
            ops,
        };
        Ok((self.enqueue(change.clone(), view), Some(change)))
    }

    /// Allocate a sequence number for a change with no ops. Unlike a no-op
    /// callback this does produce a request, marking a point in history.
    pub fn empty_change(&self, message: Option<&str>) -> Result<(Document, Change), Error> {
        self.request_without_ops(RequestType::Change, message)
    }

    /// Ask the backend to undo the latest change in its undo log.
    pub fn undo(&self, message: Option<&str>) -> Result<(Document, Change), Error> {
        if !self.can_undo {
            return Err(ChangeError::NothingToUndo.into());
        }
        self.request_without_ops(RequestType::Undo, message)
    }

    /// Ask the backend to redo the latest undone change.
    pub fn redo(&self, message: Option<&str>) -> Result<(Document, Change), Error> {
        if !self.can_redo {
            return Err(ChangeError::NothingToRedo.into());
        }
        self.request_without_ops(RequestType::Redo, message)
    }

    fn request_without_ops(
        &self,
        request_type: RequestType,
        message: Option<&str>,
    ) -> Result<(Document, Change), Error> {
        let actor = self.actor_id.clone().ok_or(ChangeError::ActorIdUnset)?;
        let change = Change {
            request_type,
            actor,
            seq: self.seq + 1,
            deps: self.emitted_deps(),
            message: message.map(str::to_string),
            ops: Vec::new(),
        };
        // The rendered view is unchanged until the backend's diffs arrive.
        Ok((self.enqueue(change.clone(), self.rendered.clone()), change))
    }

    /// Deps for an outgoing change: the authoritative clock minus this
    /// actor's own component, which is implicit in the change's seq.
    fn emitted_deps(&self) -> Clock {
        match &self.actor_id {
            Some(actor) => self.deps.without(actor),
            None => self.deps.clone(),
        }
    }

    fn enqueue(&self, change: Change, rendered: View) -> Document {
        debug!(
            seq = change.seq,
            ops = change.ops.len(),
            request_type = ?change.request_type,
            "captured local change"
        );
        let mut doc = self.clone();
        doc.seq = change.seq;
        doc.requests.push_back(PendingRequest {
            change,
            before: self.rendered.clone(),
        });
        doc.rendered = rendered;
        doc
    }

    // =====================================================================
    // Patches
    // =====================================================================

    /// Fold a backend patch into the document.
    ///
    /// A patch carrying this document's actor and a seq acknowledges the
    /// head pending request; anything else is treated as remote and the
    /// still-pending local requests are replayed on top of the new
    /// authoritative state.
    pub fn apply_patch(&self, patch: &Patch) -> Result<Document, Error> {
        let mut doc = self.clone();

        let acks_local = patch.seq.is_some()
            && patch.actor.is_some()
            && patch.actor.as_ref() == self.actor_id.as_ref();
        if acks_local {
            let got = patch.seq.expect("ack patch has seq");
            let expected = doc.requests.front().map(PendingRequest::seq);
            if expected != Some(got) {
                return Err(PatchError::MismatchedSequence { expected, got }.into());
            }
            doc.requests.pop_front();
            debug!(seq = got, remaining = doc.requests.len(), "request acknowledged");
        }

        apply::apply_diffs(&mut doc.authoritative, &patch.diffs)?;

        // Authoritative causal state. Deps are preferred over the full
        // clock when both are present; components never decrease.
        if let Some(deps) = &patch.deps {
            doc.deps.merge(deps);
        } else if let Some(clock) = &patch.clock {
            doc.deps.merge(clock);
        }
        if let Some(seq) = patch.seq {
            if acks_local && seq > doc.seq {
                doc.seq = seq;
            }
        }
        if let Some(can_undo) = patch.can_undo {
            doc.can_undo = can_undo;
        }
        if let Some(can_redo) = patch.can_redo {
            doc.can_redo = can_redo;
        }

        doc.rendered = if doc.requests.is_empty() {
            doc.authoritative.clone()
        } else {
            let mut view = doc.authoritative.clone();
            for request in &doc.requests {
                interp::replay_ops(&mut view, &request.change.actor, &request.change.ops);
            }
            view
        };

        debug!(
            diffs = patch.diffs.len(),
            acked = acks_local,
            pending = doc.requests.len(),
            "applied patch"
        );
        Ok(doc)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ROOT_ID;
    use crate::op::OpAction;
    use crate::patch::{Diff, ObjType};
    use crate::value::Scalar;
    use serde_json::json;

    fn actor(s: &str) -> ActorId {
        ActorId::new(s).unwrap()
    }

    #[test]
    fn first_change_allocates_seq_one_with_empty_deps() {
        let doc = Document::with_actor_id(actor("A"));
        let (doc, change) = doc
            .change(None, |tx| {
                let root = tx.root();
                tx.set(&root, "bird", "magpie")?;
                Ok(())
            })
            .expect("change");
        let change = change.expect("ops recorded");

        assert_eq!(change.seq, 1);
        assert!(change.deps.is_empty());
        assert_eq!(change.ops.len(), 1);
        assert_eq!(change.ops[0].action, OpAction::Set);
        assert_eq!(change.ops[0].obj.as_str(), ROOT_ID);
        assert_eq!(change.ops[0].value, Some(Scalar::from("magpie")));
        assert_eq!(doc.seq(), 1);
        assert_eq!(doc.to_json(), json!({ "bird": "magpie" }));
        assert_eq!(doc.in_flight(), 1);
    }

    #[test]
    fn noop_change_returns_shared_doc_and_no_request() {
        let doc = Document::with_actor_id(actor("A"));
        let (same, change) = doc.change(None, |_| Ok(())).expect("noop change");
        assert!(change.is_none());
        assert_eq!(same.seq(), 0);
        assert_eq!(same.in_flight(), 0);
        assert!(Arc::ptr_eq(
            doc.node(&doc.root()).unwrap(),
            same.node(&same.root()).unwrap()
        ));
    }

    #[test]
    fn failed_callback_leaves_document_untouched() {
        let doc = Document::with_actor_id(actor("A"));
        let (doc, _) = doc
            .change(None, |tx| {
                let root = tx.root();
                tx.set(&root, "bird", "magpie")?;
                Ok(())
            })
            .expect("seed");

        let err = doc
            .change(None, |tx| {
                let root = tx.root();
                tx.set(&root, "bird", "wren")?;
                Err(Error::Change(ChangeError::UnsupportedValue {
                    reason: "abort".into(),
                }))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Change(_)));
        assert_eq!(doc.to_json(), json!({ "bird": "magpie" }));
        assert_eq!(doc.seq(), 1);
    }

    #[test]
    fn deferred_actor_blocks_writes_until_set() {
        let doc = Document::deferred();
        let err = doc
            .change(None, |tx| {
                let root = tx.root();
                tx.set(&root, "bird", "magpie")?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, Error::Change(ChangeError::ActorIdUnset));

        let doc = doc.set_actor_id(actor("A"));
        let (_, change) = doc
            .change(None, |tx| {
                let root = tx.root();
                tx.set(&root, "bird", "magpie")?;
                Ok(())
            })
            .expect("change after set_actor_id");
        assert_eq!(change.expect("change").actor, actor("A"));
    }

    #[test]
    fn empty_change_still_allocates_a_seq() {
        let doc = Document::with_actor_id(actor("A"));
        let (doc, change) = doc.empty_change(Some("checkpoint")).expect("empty change");
        assert_eq!(change.seq, 1);
        assert!(change.ops.is_empty());
        assert_eq!(change.message.as_deref(), Some("checkpoint"));
        assert_eq!(doc.in_flight(), 1);
        assert_eq!(doc.to_json(), json!({}));
    }

    #[test]
    fn undo_redo_follow_backend_flags() {
        let doc = Document::with_actor_id(actor("A"));
        assert!(matches!(
            doc.undo(None),
            Err(Error::Change(ChangeError::NothingToUndo))
        ));
        assert!(matches!(
            doc.redo(None),
            Err(Error::Change(ChangeError::NothingToRedo))
        ));

        let patch = Patch {
            can_undo: Some(true),
            ..Patch::default()
        };
        let doc = doc.apply_patch(&patch).expect("flag patch");
        let (doc, change) = doc.undo(None).expect("undo");
        assert_eq!(change.request_type, RequestType::Undo);
        assert!(change.ops.is_empty());
        assert_eq!(change.seq, 1);
        assert_eq!(doc.in_flight(), 1);
    }

    #[test]
    fn message_rides_on_the_change() {
        let doc = Document::with_actor_id(actor("A"));
        let (_, change) = doc
            .change(Some("rename bird"), |tx| {
                let root = tx.root();
                tx.set(&root, "bird", "magpie")?;
                Ok(())
            })
            .expect("change");
        assert_eq!(change.expect("change").message.as_deref(), Some("rename bird"));
    }

    #[test]
    fn backend_state_attachment_round_trips() {
        let doc = Document::with_actor_id(actor("A"));
        assert!(doc.backend_state().is_none());
        let doc = doc.set_backend_state(json!({ "opSet": 7 }));
        assert_eq!(doc.backend_state(), Some(&json!({ "opSet": 7 })));
    }

    #[test]
    fn patch_error_leaves_document_untouched() {
        let doc = Document::with_actor_id(actor("A"));
        let bad = Patch {
            diffs: vec![Diff::set_key(
                ObjectId::random(),
                ObjType::Map,
                "k",
                Scalar::Int(1),
            )],
            ..Patch::default()
        };
        assert!(doc.apply_patch(&bad).is_err());
        assert_eq!(doc.to_json(), json!({}));
    }
}
