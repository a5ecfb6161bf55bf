//! Per-instance state: the embodiment of an object on one node.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path::ObjectPath;
use crate::schedule::ScheduleDef;

/// Availability of an instance or object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Avail {
  #[default]
  Undef,
  Up,
  Down,
  Warn,
  #[serde(rename = "n/a")]
  NotApplicable,
}

/// Provisioning state of an instance or object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioned {
  True,
  False,
  Mixed,
  #[default]
  #[serde(rename = "n/a")]
  NotApplicable,
}

impl Provisioned {
  /// True when the state does not forbid scheduled actions.
  pub fn is_usable(&self) -> bool {
    matches!(self, Provisioned::True | Provisioned::NotApplicable)
  }
}

/// The configuration view of an instance, as produced by the per-object
/// configuration watcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
  pub path: Option<ObjectPath>,
  #[serde(default)]
  pub nodename: String,
  /// Sorted list of nodes the object is defined to run on.
  #[serde(default)]
  pub scope: Vec<String>,
  /// MD5 of the configuration file content.
  #[serde(default)]
  pub checksum: String,
  /// Mtime of the configuration file at read time.
  pub updated: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub schedules: Vec<ScheduleDef>,
}

/// The status view of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
  #[serde(default)]
  pub avail: Avail,
  #[serde(default)]
  pub provisioned: Provisioned,
  pub updated: Option<DateTime<Utc>>,
}

/// The monitor view of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceMonitor {
  #[serde(default)]
  pub state: InstanceMonitorState,
  pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceMonitorState {
  #[default]
  Idle,
  Starting,
  Stopping,
  Frozen,
}

/// The three per-instance views held by the cluster data store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub config: Option<InstanceConfig>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<InstanceStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub monitor: Option<InstanceMonitor>,
}

impl Instance {
  pub fn is_empty(&self) -> bool {
    self.config.is_none() && self.status.is_none() && self.monitor.is_none()
  }
}

/// Instance map keyed by canonical path string.
pub type InstanceMap = BTreeMap<String, Instance>;
