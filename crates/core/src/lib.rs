//! Core domain types for the hived cluster manager.
//!
//! This crate holds everything the daemon crates agree on: object paths and
//! kinds, the node/instance state model exchanged over heartbeats, the
//! configuration file models, schedule entries, and the session identifier.
//! It is intentionally free of I/O beyond reading configuration files.

pub mod config;
pub mod instance;
pub mod node;
pub mod object;
pub mod path;
pub mod paths;
pub mod schedule;
pub mod session;

pub use path::{Kind, ObjectPath, PathError};
pub use session::SessionId;
