//! Per-node state exchanged over heartbeats.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::NodeConf;
use crate::instance::InstanceMap;

/// Node monitor states. Some of them gate the local scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMonitorState {
  /// Not yet initialized.
  #[default]
  Zero,
  Idle,
  Upgrade,
  Shutting,
  Maintenance,
  Draining,
}

impl NodeMonitorState {
  /// True when the state forbids scheduled actions on the node.
  pub fn blocks_scheduling(&self) -> bool {
    matches!(
      self,
      NodeMonitorState::Zero
        | NodeMonitorState::Upgrade
        | NodeMonitorState::Shutting
        | NodeMonitorState::Maintenance
    )
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMonitor {
  #[serde(default)]
  pub state: NodeMonitorState,
  pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
  /// Agent version string.
  #[serde(default)]
  pub agent: String,
  pub updated: Option<DateTime<Utc>>,
}

/// Everything a node publishes about itself: configuration, monitor, status,
/// the generation map, and its local view of every instance.
///
/// `gen` maps each known node to the last generation of that node this node
/// has merged, including an entry for the node itself carrying its own
/// current generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
  #[serde(default)]
  pub config: NodeConf,
  #[serde(default)]
  pub monitor: NodeMonitor,
  #[serde(default)]
  pub status: NodeStatus,
  #[serde(default)]
  pub gen: BTreeMap<String, u64>,
  #[serde(default)]
  pub instances: InstanceMap,
}

impl NodeState {
  /// A fresh state for a node, generation zero.
  pub fn new(nodename: &str) -> Self {
    let mut state = Self::default();
    state.gen.insert(nodename.to_string(), 0);
    state
  }
}
