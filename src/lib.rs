#![forbid(unsafe_code)]

//! Frontend for a conflict-free replicated JSON document engine.
//!
//! Presents a conventional JSON-like document to application code while
//! translating edits into CRDT operation streams and folding
//! backend-produced patches back into the local materialised view.
//!
//! Module hierarchy follows type dependency order:
//! - identity: ActorId, ObjectId, ElemId
//! - clock: vector clocks
//! - value: scalars, counters, timestamps
//! - tree: immutable node cache and materialised views
//! - op / patch: outbound and inbound wire formats
//! - interp / apply: op and diff folding
//! - context: mutation capture inside change blocks
//! - doc: the document handle and request queue

pub mod clock;
pub mod context;
pub mod doc;
pub mod error;
pub mod identity;
pub mod op;
pub mod patch;
pub mod tree;
pub mod value;

mod apply;
mod interp;

pub use clock::Clock;
pub use context::{ChangeContext, CounterRef, NewValue};
pub use doc::{Document, PendingRequest};
pub use error::{ChangeError, Error, InvalidId, PatchError};
pub use identity::{ActorId, ElemId, ObjectId, HEAD, ROOT_ID};
pub use op::{Change, Op, OpAction, RequestType};
pub use patch::{ConflictValue, Diff, DiffAction, ObjType, Patch};
pub use tree::{ListNode, MapNode, Node, View};
pub use value::{Counter, DataType, Scalar, Timestamp, Value};

pub type Result<T> = std::result::Result<T, Error>;
