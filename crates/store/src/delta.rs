//! Json-delta operations and the per-generation patch log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
  Replace,
  Add,
  Remove,
}

/// One change to a json document, addressed by key path from the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
  pub path: Vec<String>,
  pub kind: OpKind,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub value: Option<Value>,
}

impl Operation {
  pub fn replace(path: &[&str], value: Value) -> Self {
    Self {
      path: path.iter().map(|s| s.to_string()).collect(),
      kind: OpKind::Replace,
      value: Some(value),
    }
  }

  pub fn remove(path: &[&str]) -> Self {
    Self {
      path: path.iter().map(|s| s.to_string()).collect(),
      kind: OpKind::Remove,
      value: None,
    }
  }

  /// Apply the operation to a document. Missing intermediate objects are
  /// created on add/replace; removing an absent key is a no-op.
  pub fn apply(&self, root: &mut Value) -> Result<(), DeltaError> {
    let Some((last, parents)) = self.path.split_last() else {
      return Err(DeltaError::EmptyPath);
    };
    let mut node = root;
    for segment in parents {
      let map = node.as_object_mut().ok_or_else(|| DeltaError::NotAnObject {
        path: self.path.join("/"),
      })?;
      node = map
        .entry(segment.clone())
        .or_insert_with(|| Value::Object(Default::default()));
    }
    let map = node.as_object_mut().ok_or_else(|| DeltaError::NotAnObject {
      path: self.path.join("/"),
    })?;
    match self.kind {
      OpKind::Replace | OpKind::Add => {
        let value = self.value.clone().ok_or_else(|| DeltaError::MissingValue {
          path: self.path.join("/"),
        })?;
        map.insert(last.clone(), value);
      }
      OpKind::Remove => {
        map.remove(last);
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeltaError {
  #[error("delta operation with an empty path")]
  EmptyPath,

  #[error("delta path {path} crosses a non-object value")]
  NotAnObject { path: String },

  #[error("delta {path} has no value")]
  MissingValue { path: String },
}

// ============================================================================
// Patch log
// ============================================================================

/// The deltas of the last `window` local generations, keyed by generation.
///
/// Entry `g` describes the change between generation `g-1` and `g`. The log
/// is what lets the store emit `patch` heartbeat messages instead of full
/// snapshots for peers that are only slightly behind.
#[derive(Debug, Clone)]
pub struct PatchLog {
  window: u64,
  entries: BTreeMap<u64, Vec<Operation>>,
}

impl PatchLog {
  pub fn new(window: u64) -> Self {
    Self {
      window,
      entries: BTreeMap::new(),
    }
  }

  pub fn push(&mut self, gen: u64, ops: Vec<Operation>) {
    self.entries.insert(gen, ops);
    while self.entries.len() as u64 > self.window {
      let oldest = *self.entries.keys().next().expect("non-empty patch log");
      self.entries.remove(&oldest);
    }
  }

  /// The deltas for generations `from..=to`, oldest first, or `None` when
  /// part of the range was already pruned.
  pub fn replay(&self, from: u64, to: u64) -> Option<Vec<Vec<Operation>>> {
    if from > to {
      return Some(Vec::new());
    }
    let mut deltas = Vec::with_capacity((to - from + 1) as usize);
    for gen in from..=to {
      deltas.push(self.entries.get(&gen)?.clone());
    }
    Some(deltas)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn apply_replace_creates_intermediates() {
    let mut doc = json!({});
    Operation::replace(&["instances", "foo", "config"], json!({"checksum": "x"}))
      .apply(&mut doc)
      .unwrap();
    assert_eq!(doc, json!({"instances": {"foo": {"config": {"checksum": "x"}}}}));
  }

  #[test]
  fn apply_remove_is_tolerant() {
    let mut doc = json!({"a": {"b": 1}});
    Operation::remove(&["a", "b"]).apply(&mut doc).unwrap();
    Operation::remove(&["a", "b"]).apply(&mut doc).unwrap();
    assert_eq!(doc, json!({"a": {}}));
  }

  #[test]
  fn apply_rejects_scalar_crossing() {
    let mut doc = json!({"a": 1});
    let err = Operation::replace(&["a", "b"], json!(2)).apply(&mut doc);
    assert!(err.is_err());
  }

  #[test]
  fn replay_window() {
    let mut log = PatchLog::new(3);
    for gen in 1..=5 {
      log.push(gen, vec![Operation::replace(&["g"], json!(gen))]);
    }
    // gens 1 and 2 were pruned
    assert!(log.replay(2, 5).is_none());
    let deltas = log.replay(3, 5).unwrap();
    assert_eq!(deltas.len(), 3);
    assert_eq!(deltas[0][0].value, Some(json!(3)));
    // empty range is a valid replay
    assert_eq!(log.replay(6, 5).unwrap().len(), 0);
  }
}
