//! The hived daemon: discovery, per-object config watchers, remote config
//! fetching, the local scheduler, and daemon lifecycle plumbing.
//!
//! # Architecture
//!
//! ```text
//! Daemon (supervisor)
//!   ├── Store      (cluster data, command channel)
//!   ├── Heartbeats (dispatcher, reader, janitor, drivers)
//!   ├── FsWatcher  (notify over <etc>, publishes CfgFile* events)
//!   ├── Discover   (per-object watcher lifecycle, remote config fetchers)
//!   │     └── InstCfg (one per local object config file)
//!   └── Scheduler  (timed actions, gated by node monitor state)
//! ```
//!
//! All components share one bus and one root cancellation token; shutdown
//! cancels the leaves first and the store last.

pub mod client;
pub mod discover;
pub mod fetcher;
pub mod fswatch;
pub mod instcfg;
pub mod lifecycle;
pub mod lock;
pub mod sched;

pub use lifecycle::{Daemon, DaemonConfig, DaemonError};

/// The local node name: `$HIVE_NODENAME` when set, the kernel hostname
/// otherwise.
pub fn hostname() -> String {
  if let Ok(name) = std::env::var("HIVE_NODENAME") {
    if !name.is_empty() {
      return name;
    }
  }
  std::fs::read_to_string("/proc/sys/kernel/hostname")
    .map(|s| s.trim().to_string())
    .unwrap_or_else(|_| "localhost".to_string())
}
