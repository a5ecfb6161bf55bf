//! Session identifier.
//!
//! A UUIDv4 minted once per daemon or command execution. It is embedded in
//! log records, returned by asynchronous API posts so logs can be streamed,
//! and exported to spawned actions so they share their parent's output
//! cache. It is threaded explicitly through constructors, never read from
//! ambient state.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Environment variable carrying the session id into spawned actions.
pub const SESSION_ENV: &str = "HIVE_SESSION_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }

  /// The session id inherited from the environment, or a fresh one.
  pub fn from_env_or_new() -> Self {
    std::env::var(SESSION_ENV)
      .ok()
      .and_then(|s| Uuid::parse_str(&s).ok())
      .map(Self)
      .unwrap_or_else(Self::new)
  }
}

impl Default for SessionId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for SessionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ids_are_unique() {
    assert_ne!(SessionId::new(), SessionId::new());
  }

  #[test]
  fn display_parses_back() {
    let id = SessionId::new();
    assert_eq!(SessionId(Uuid::parse_str(&id.to_string()).unwrap()), id);
  }
}
