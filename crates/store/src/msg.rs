//! Heartbeat message envelopes.
//!
//! Three kinds: `full` (complete node state snapshot), `patch` (json-deltas
//! relative to the last generation the slowest peer acknowledged), `ping`
//! (liveness only). Every envelope carries the sender's generation map so
//! receivers can detect gaps and acknowledge what they merged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hive_core::node::NodeState;

use crate::delta::Operation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Msg {
  Full {
    nodename: String,
    gen: BTreeMap<String, u64>,
    full: Box<NodeState>,
  },
  Patch {
    nodename: String,
    gen: BTreeMap<String, u64>,
    /// Generation described by the first delta; `deltas[i]` brings the
    /// receiver to `from_gen + i`.
    from_gen: u64,
    deltas: Vec<Vec<Operation>>,
  },
  Ping {
    nodename: String,
    gen: BTreeMap<String, u64>,
  },
}

impl Msg {
  pub fn nodename(&self) -> &str {
    match self {
      Msg::Full { nodename, .. } | Msg::Patch { nodename, .. } | Msg::Ping { nodename, .. } => nodename,
    }
  }

  pub fn gen(&self) -> &BTreeMap<String, u64> {
    match self {
      Msg::Full { gen, .. } | Msg::Patch { gen, .. } | Msg::Ping { gen, .. } => gen,
    }
  }

  pub fn kind_str(&self) -> &'static str {
    match self {
      Msg::Full { .. } => "full",
      Msg::Patch { .. } => "patch",
      Msg::Ping { .. } => "ping",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn envelope_wire_form() {
    let msg = Msg::Ping {
      nodename: "n1".to_string(),
      gen: BTreeMap::from([("n1".to_string(), 4u64)]),
    };
    let wire = serde_json::to_string(&msg).unwrap();
    assert!(wire.contains(r#""kind":"ping""#), "{wire}");
    assert!(wire.contains(r#""nodename":"n1""#), "{wire}");
    let back: Msg = serde_json::from_str(&wire).unwrap();
    assert_eq!(back, msg);
  }
}
