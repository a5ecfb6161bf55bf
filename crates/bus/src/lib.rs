//! In-process typed publish/subscribe bus.
//!
//! Components exchange [`Event`]s through a [`Bus`]. Subscriptions carry a
//! bounded FIFO queue and optional filters on event kind and labels. A slow
//! subscriber never blocks a publisher: when its queue is full the oldest
//! event is dropped, the loss is counted, and the subscription is marked
//! lossy.

mod bus;
mod event;

pub use bus::{Bus, Subscription, DEFAULT_QUEUE_SIZE};
pub use event::{Event, EventKind, Label};
