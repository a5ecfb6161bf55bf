//! The bus proper: subscription registry and fan-out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::event::{Event, EventKind, Label};

/// Default per-subscription queue bound.
pub const DEFAULT_QUEUE_SIZE: usize = 16_000;

struct Filter {
    kind: EventKind,
    labels: Vec<Label>,
}

struct SubState {
    name: String,
    cap: usize,
    filters: RwLock<Vec<Filter>>,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    /// Events dropped because the queue was full.
    dropped: AtomicU64,
    lossy: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
}

impl SubState {
    fn matches(&self, kind: EventKind, labels: &[Label]) -> bool {
        let filters = self.filters.read().expect("bus filter lock");
        if filters.is_empty() {
            return true;
        }
        filters
            .iter()
            .any(|f| f.kind == kind && f.labels.iter().all(|l| labels.contains(l)))
    }

    fn push(&self, event: Event) {
        let mut queue = self.queue.lock().expect("bus queue lock");
        if queue.len() >= self.cap {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.lossy.swap(true, Ordering::Relaxed) {
                warn!(sub = %self.name, cap = self.cap, "subscription queue overflow, dropping oldest");
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Event> {
        self.queue.lock().expect("bus queue lock").pop_front()
    }
}

/// The process-wide event bus. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    name: String,
    next_id: AtomicU64,
    subs: DashMap<u64, Arc<SubState>>,
}

impl Bus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                next_id: AtomicU64::new(0),
                subs: DashMap::new(),
            }),
        }
    }

    /// Allocate a subscription with the default queue bound.
    ///
    /// The subscription starts buffering immediately; call
    /// [`Subscription::start`] before draining it.
    pub fn sub(&self, name: impl Into<String>) -> Subscription {
        self.sub_with_queue_size(name, DEFAULT_QUEUE_SIZE)
    }

    pub fn sub_with_queue_size(&self, name: impl Into<String>, cap: usize) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubState {
            name: name.into(),
            cap,
            filters: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            lossy: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.inner.subs.insert(id, state.clone());
        debug!(bus = %self.inner.name, sub = %state.name, "subscribed");
        Subscription {
            id,
            state,
            bus: self.inner.clone(),
        }
    }

    /// Fan an event out to every matching subscription. Never blocks, never
    /// fails: a full subscriber queue drops its oldest event locally.
    pub fn publish(&self, event: Event, labels: Vec<Label>) {
        let kind = event.kind();
        for entry in self.inner.subs.iter() {
            let sub = entry.value();
            if sub.closed.load(Ordering::Relaxed) {
                continue;
            }
            if sub.matches(kind, &labels) {
                sub.push(event.clone());
            }
        }
    }
}

/// A handle on one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    state: Arc<SubState>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Restrict delivery to events of `kind` whose labels are a superset of
    /// `labels`. May be called several times; filters are OR-ed.
    pub fn add_filter(&self, kind: EventKind, labels: Vec<Label>) {
        self.state
            .filters
            .write()
            .expect("bus filter lock")
            .push(Filter { kind, labels });
    }

    /// Begin draining. Events published since [`Bus::sub`] are already
    /// queued.
    pub fn start(&self) {
        self.state.started.store(true, Ordering::Relaxed);
    }

    /// Await the next event. Returns `None` once the subscription is
    /// stopped and drained.
    pub async fn recv(&self) -> Option<Event> {
        debug_assert!(self.state.started.load(Ordering::Relaxed), "recv before start");
        loop {
            if let Some(event) = self.state.pop() {
                return Some(event);
            }
            if self.state.closed.load(Ordering::Relaxed) {
                return None;
            }
            self.state.notify.notified().await;
        }
    }

    /// Number of events dropped to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// True once at least one event was lost to overflow.
    pub fn is_lossy(&self) -> bool {
        self.state.lossy.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Unregister from the bus. Queued events remain readable.
    pub fn stop(&self) {
        self.state.closed.store(true, Ordering::Relaxed);
        self.bus.subs.remove(&self.id);
        self.state.notify.notify_one();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::path::ObjectPath;

    fn file_event(path: &str) -> (Event, Vec<Label>) {
        let p = ObjectPath::parse(path).unwrap();
        let labels = vec![Label::node("n1"), Label::path(&p)];
        let event = Event::CfgFileUpdated {
            path: p,
            filename: "/tmp/x.conf".into(),
        };
        (event, labels)
    }

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let bus = Bus::new("test");
        let sub = bus.sub("ordered");
        sub.start();
        for name in ["a1", "b1", "c1"] {
            let (event, labels) = file_event(name);
            bus.publish(event, labels);
        }
        for name in ["a1", "b1", "c1"] {
            match sub.recv().await.unwrap() {
                Event::CfgFileUpdated { path, .. } => assert_eq!(path.to_string(), name),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn buffers_before_start() {
        let bus = Bus::new("test");
        let sub = bus.sub("late");
        let (event, labels) = file_event("a1");
        bus.publish(event, labels);
        sub.start();
        assert!(matches!(sub.recv().await, Some(Event::CfgFileUpdated { .. })));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = Bus::new("test");
        let sub = bus.sub_with_queue_size("tiny", 2);
        sub.start();
        for name in ["a1", "b1", "c1"] {
            let (event, labels) = file_event(name);
            bus.publish(event, labels);
        }
        assert_eq!(sub.dropped(), 1);
        assert!(sub.is_lossy());
        // a1 was dropped, b1 and c1 survive in order
        match sub.recv().await.unwrap() {
            Event::CfgFileUpdated { path, .. } => assert_eq!(path.to_string(), "b1"),
            other => panic!("unexpected event {other:?}"),
        }
        match sub.recv().await.unwrap() {
            Event::CfgFileUpdated { path, .. } => assert_eq!(path.to_string(), "c1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn filters_on_kind_and_labels() {
        let bus = Bus::new("test");
        let sub = bus.sub("filtered");
        sub.add_filter(EventKind::CfgFileUpdated, vec![Label::node("n1")]);
        sub.start();

        // matching kind + label
        let (event, labels) = file_event("a1");
        bus.publish(event, labels);
        // matching kind, wrong node
        let p = ObjectPath::parse("b1").unwrap();
        bus.publish(
            Event::CfgFileUpdated {
                path: p.clone(),
                filename: "/tmp/b1.conf".into(),
            },
            vec![Label::node("n2"), Label::path(&p)],
        );
        // wrong kind
        bus.publish(
            Event::CfgFileRemoved {
                path: p.clone(),
                filename: "/tmp/b1.conf".into(),
            },
            vec![Label::node("n1"), Label::path(&p)],
        );

        match sub.recv().await.unwrap() {
            Event::CfgFileUpdated { path, .. } => assert_eq!(path.to_string(), "a1"),
            other => panic!("unexpected event {other:?}"),
        }
        // nothing else queued
        assert!(sub.state.pop().is_none());
    }

    #[tokio::test]
    async fn exact_delivery_with_room() {
        let bus = Bus::new("test");
        let sub = bus.sub_with_queue_size("roomy", 100);
        sub.start();
        for i in 0..50 {
            let (event, labels) = file_event(&format!("s{i}"));
            bus.publish(event, labels);
        }
        for i in 0..50 {
            match sub.recv().await.unwrap() {
                Event::CfgFileUpdated { path, .. } => assert_eq!(path.to_string(), format!("s{i}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(sub.dropped(), 0);
        assert!(!sub.is_lossy());
    }

    #[tokio::test]
    async fn stop_ends_recv() {
        let bus = Bus::new("test");
        let sub = bus.sub("stopping");
        sub.start();
        sub.stop();
        assert!(sub.recv().await.is_none());
    }
}
