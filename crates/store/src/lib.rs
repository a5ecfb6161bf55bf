//! The cluster data store.
//!
//! Process-wide authoritative view of every node and every instance. All
//! mutations and reads are queued commands processed by a single task in
//! registration order, which gives totally ordered application of local and
//! remote events without locking in the store body.
//!
//! Local mutations bump the local node's generation and append a json-delta
//! to the patch log; remote heartbeat messages are merged through
//! [`StoreHandle::apply_full`], [`StoreHandle::apply_patch`] and
//! [`StoreHandle::apply_ping`]. Every applied change is republished on the
//! bus so the scheduler, discovery and heartbeat layers react.

mod actor;
mod delta;
mod handle;
mod msg;

pub use actor::{spawn, GenView, StoreError};
pub use delta::{OpKind, Operation, PatchLog};
pub use handle::StoreHandle;
pub use msg::Msg;
