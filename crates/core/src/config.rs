//! Configuration file models.
//!
//! All configuration is TOML: `<etc>/ccfg/cluster.conf` for the cluster,
//! `<etc>/node.conf` for the node, and one file per object under `<etc>`.
//!
//! Heartbeat drivers are declared as `[hb.<n>]` sections of the cluster
//! configuration; the section index yields the driver rid (`hb#<n>`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleDef;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("parse {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: toml::de::Error,
  },
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
  let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
    path: path.display().to_string(),
    source,
  })?;
  toml::from_str(&content).map_err(|source| ConfigError::Parse {
    path: path.display().to_string(),
    source,
  })
}

// ============================================================================
// Cluster configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
  #[serde(default)]
  pub cluster: ClusterSection,
  #[serde(default)]
  pub hb: BTreeMap<String, HbSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSection {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub nodes: Vec<String>,
}

/// One heartbeat driver declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HbSection {
  #[serde(rename = "type", default = "default_hb_type")]
  pub kind: String,
  /// Peer address overrides, keyed by nodename. Peers without an entry are
  /// dialed by nodename.
  #[serde(default)]
  pub addr: BTreeMap<String, String>,
  #[serde(default = "default_hb_port")]
  pub port: u16,
  /// Send period, seconds.
  #[serde(default = "default_hb_interval")]
  pub interval: u64,
  /// Peer staleness threshold, seconds.
  #[serde(default = "default_hb_timeout")]
  pub timeout: u64,
}

impl Default for HbSection {
  fn default() -> Self {
    Self {
      kind: default_hb_type(),
      addr: BTreeMap::new(),
      port: default_hb_port(),
      interval: default_hb_interval(),
      timeout: default_hb_timeout(),
    }
  }
}

fn default_hb_type() -> String {
  "unicast".to_string()
}

fn default_hb_port() -> u16 {
  10011
}

fn default_hb_interval() -> u64 {
  5
}

fn default_hb_timeout() -> u64 {
  15
}

impl ClusterConfig {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    load_toml(path)
  }

  /// Configured heartbeat sections, keyed by rid (`hb#<n>`).
  pub fn hb_sections(&self) -> BTreeMap<String, HbSection> {
    self
      .hb
      .iter()
      .map(|(index, section)| (format!("hb#{index}"), section.clone()))
      .collect()
  }

  /// Peers of `nodename`, in cluster node order.
  pub fn peers(&self, nodename: &str) -> Vec<String> {
    self
      .cluster
      .nodes
      .iter()
      .filter(|n| n.as_str() != nodename)
      .cloned()
      .collect()
  }
}

// ============================================================================
// Node configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConf {
  #[serde(default)]
  pub sched: BTreeMap<String, SchedSection>,
}

impl NodeConf {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    load_toml(path)
  }

  pub fn schedule_defs(&self) -> Vec<ScheduleDef> {
    sched_defs(&self.sched)
  }
}

// ============================================================================
// Object configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfig {
  #[serde(default)]
  pub default: DefaultSection,
  #[serde(default)]
  pub sched: BTreeMap<String, SchedSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultSection {
  /// Scope of the object. Empty means every cluster node.
  #[serde(default)]
  pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedSection {
  #[serde(default)]
  pub action: String,
  #[serde(default)]
  pub schedule: String,
  #[serde(default)]
  pub require_collector: bool,
  #[serde(default)]
  pub require_provisioned: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub command: Option<String>,
}

impl ObjectConfig {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    load_toml(path)
  }

  /// Resolve the object scope: the declared node list, or every cluster
  /// node when none is declared. The returned list is sorted.
  pub fn scope(&self, cluster_nodes: &[String]) -> Vec<String> {
    let mut nodes = if self.default.nodes.is_empty() {
      cluster_nodes.to_vec()
    } else {
      self.default.nodes.clone()
    };
    nodes.sort();
    nodes.dedup();
    nodes
  }

  pub fn schedule_defs(&self) -> Vec<ScheduleDef> {
    sched_defs(&self.sched)
  }
}

fn sched_defs(sections: &BTreeMap<String, SchedSection>) -> Vec<ScheduleDef> {
  sections
    .iter()
    .map(|(key, section)| ScheduleDef {
      key: key.clone(),
      action: section.action.clone(),
      schedule: section.schedule.clone(),
      require_collector: section.require_collector,
      require_provisioned: section.require_provisioned,
      command: section.command.clone(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_cluster_config() {
    let config: ClusterConfig = toml::from_str(
      r#"
      [cluster]
      name = "c1"
      nodes = ["n1", "n2", "n3"]

      [hb.1]
      type = "unicast"
      port = 10001

      [hb.1.addr]
      n1 = "10.0.0.1"

      [hb.2]
      "#,
    )
    .unwrap();
    assert_eq!(config.cluster.name, "c1");
    assert_eq!(config.peers("n2"), vec!["n1".to_string(), "n3".to_string()]);

    let sections = config.hb_sections();
    assert_eq!(sections.len(), 2);
    assert_eq!(sections["hb#1"].port, 10001);
    assert_eq!(sections["hb#1"].addr["n1"], "10.0.0.1");
    assert_eq!(sections["hb#2"].kind, "unicast");
    assert_eq!(sections["hb#2"].interval, 5);
  }

  #[test]
  fn parses_object_config() {
    let config: ObjectConfig = toml::from_str(
      r#"
      [default]
      nodes = ["n2", "n1"]

      [sched.status]
      action = "status"
      schedule = "@10"
      require_provisioned = true
      "#,
    )
    .unwrap();
    assert_eq!(config.scope(&[]), vec!["n1".to_string(), "n2".to_string()]);

    let defs = config.schedule_defs();
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].key, "status");
    assert!(defs[0].require_provisioned);
  }

  #[test]
  fn empty_scope_defaults_to_cluster_nodes() {
    let config = ObjectConfig::default();
    let cluster = vec!["n2".to_string(), "n1".to_string()];
    assert_eq!(config.scope(&cluster), vec!["n1".to_string(), "n2".to_string()]);
  }
}
