//! The closed union of bus events.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hive_core::config::NodeConf;
use hive_core::instance::{InstanceConfig, InstanceStatus};
use hive_core::node::NodeMonitor;
use hive_core::object::ObjectStatus;
use hive_core::path::ObjectPath;

/// A subscription filter label, and the labels attached to publications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label(pub String, pub String);

impl Label {
    pub fn node(node: impl Into<String>) -> Self {
        Self("node".to_string(), node.into())
    }

    pub fn path(path: &ObjectPath) -> Self {
        Self("path".to_string(), path.to_string())
    }
}

/// Events exchanged on the bus.
///
/// Each variant carries the minimal data needed to interpret the event;
/// publishers attach a `node` label (and usually a `path` label) for
/// filtering.
#[derive(Debug, Clone)]
pub enum Event {
    /// The local instance configuration of an object changed in the store.
    InstanceConfigUpdated {
        path: ObjectPath,
        node: String,
        config: InstanceConfig,
    },
    /// The instance configuration was deleted from the store.
    InstanceConfigDeleted { path: ObjectPath, node: String },
    /// The instance status of an object changed in the store.
    InstanceStatusUpdated {
        path: ObjectPath,
        node: String,
        status: InstanceStatus,
    },
    /// The instance status was deleted from the store.
    InstanceStatusDeleted { path: ObjectPath, node: String },
    /// The aggregated object status changed.
    ObjectStatusUpdated {
        path: ObjectPath,
        node: String,
        status: ObjectStatus,
    },
    /// The last instance of an object disappeared.
    ObjectStatusDeleted { path: ObjectPath, node: String },
    /// The node configuration changed.
    NodeConfigUpdated { node: String, config: NodeConf },
    /// The node monitor state changed.
    NodeMonitorUpdated { node: String, monitor: NodeMonitor },
    /// An object configuration file appeared or changed on disk.
    CfgFileUpdated { path: ObjectPath, filename: PathBuf },
    /// An object configuration file disappeared from disk.
    CfgFileRemoved { path: ObjectPath, filename: PathBuf },
    /// An object configuration is available on a node, cluster-wide
    /// announcement.
    CfgUpdated {
        path: ObjectPath,
        node: String,
        config: InstanceConfig,
    },
    /// An object configuration disappeared from a node.
    CfgDeleted { path: ObjectPath, node: String },
    /// Operator control of a daemon component (`hb#1.tx stop`, ...).
    DaemonCtl { component: String, action: String },
    /// A remote configuration fetch completed: the file at `filename` is
    /// ready to be installed. The receiver replies on `reply` once the file
    /// is moved in place.
    RemoteFileConfig {
        path: ObjectPath,
        node: String,
        filename: PathBuf,
        updated: DateTime<Utc>,
        cancel: CancellationToken,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// A per-object configuration watcher terminated.
    ConfigWatcherDone { path: ObjectPath, filename: PathBuf },
    /// A peer stopped heartbeating within the staleness threshold.
    PeerStale { node: String },
    /// The store applied a change, serialized as json-delta operations.
    ClusterPatch {
        node: String,
        ops: Vec<serde_json::Value>,
    },
}

/// Fieldless mirror of [`Event`], the subscription filter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    InstanceConfigUpdated,
    InstanceConfigDeleted,
    InstanceStatusUpdated,
    InstanceStatusDeleted,
    ObjectStatusUpdated,
    ObjectStatusDeleted,
    NodeConfigUpdated,
    NodeMonitorUpdated,
    CfgFileUpdated,
    CfgFileRemoved,
    CfgUpdated,
    CfgDeleted,
    DaemonCtl,
    RemoteFileConfig,
    ConfigWatcherDone,
    PeerStale,
    ClusterPatch,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::InstanceConfigUpdated { .. } => EventKind::InstanceConfigUpdated,
            Event::InstanceConfigDeleted { .. } => EventKind::InstanceConfigDeleted,
            Event::InstanceStatusUpdated { .. } => EventKind::InstanceStatusUpdated,
            Event::InstanceStatusDeleted { .. } => EventKind::InstanceStatusDeleted,
            Event::ObjectStatusUpdated { .. } => EventKind::ObjectStatusUpdated,
            Event::ObjectStatusDeleted { .. } => EventKind::ObjectStatusDeleted,
            Event::NodeConfigUpdated { .. } => EventKind::NodeConfigUpdated,
            Event::NodeMonitorUpdated { .. } => EventKind::NodeMonitorUpdated,
            Event::CfgFileUpdated { .. } => EventKind::CfgFileUpdated,
            Event::CfgFileRemoved { .. } => EventKind::CfgFileRemoved,
            Event::CfgUpdated { .. } => EventKind::CfgUpdated,
            Event::CfgDeleted { .. } => EventKind::CfgDeleted,
            Event::DaemonCtl { .. } => EventKind::DaemonCtl,
            Event::RemoteFileConfig { .. } => EventKind::RemoteFileConfig,
            Event::ConfigWatcherDone { .. } => EventKind::ConfigWatcherDone,
            Event::PeerStale { .. } => EventKind::PeerStale,
            Event::ClusterPatch { .. } => EventKind::ClusterPatch,
        }
    }
}
