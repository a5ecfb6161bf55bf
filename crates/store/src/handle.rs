//! Handle to the store task.
//!
//! Cheap to clone. Every method queues a command on the store channel and
//! awaits its reply, so callers observe their own writes on subsequent
//! reads.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};

use hive_core::config::NodeConf;
use hive_core::instance::{InstanceConfig, InstanceStatus};
use hive_core::node::{NodeMonitor, NodeState};
use hive_core::path::ObjectPath;

use crate::actor::{Cmd, GenView, StoreError};
use crate::delta::Operation;
use crate::msg::Msg;

#[derive(Clone)]
pub struct StoreHandle {
  tx: mpsc::Sender<Cmd>,
}

impl StoreHandle {
  pub(crate) fn new(tx: mpsc::Sender<Cmd>) -> Self {
    Self { tx }
  }

  async fn call<T>(&self, cmd: Cmd, rx: oneshot::Receiver<T>) -> Result<T, StoreError> {
    self.tx.send(cmd).await.map_err(|_| StoreError::ChannelClosed)?;
    rx.await.map_err(|_| StoreError::ChannelClosed)
  }

  /// Replace a peer's state wholesale from a `full` heartbeat message.
  pub async fn apply_full(&self, peer: &str, state: NodeState) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::ApplyFull {
          peer: peer.to_string(),
          state: Box::new(state),
          reply,
        },
        rx,
      )
      .await
  }

  /// Apply a `patch` heartbeat message. Returns a gap error when the patch
  /// is out of sequence, in which case the peer is flagged for a full.
  pub async fn apply_patch(
    &self,
    peer: &str,
    gen: BTreeMap<String, u64>,
    from_gen: u64,
    deltas: Vec<Vec<Operation>>,
  ) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::ApplyPatch {
          peer: peer.to_string(),
          gen,
          from_gen,
          deltas,
          reply,
        },
        rx,
      )
      .await?
  }

  /// Record peer liveness from a `ping` heartbeat message.
  pub async fn apply_ping(&self, peer: &str) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::ApplyPing {
          peer: peer.to_string(),
          reply,
        },
        rx,
      )
      .await
  }

  pub async fn set_instance_config(&self, path: &ObjectPath, config: InstanceConfig) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::SetInstanceConfig {
          path: path.clone(),
          config: Box::new(config),
          reply,
        },
        rx,
      )
      .await
  }

  pub async fn del_instance_config(&self, path: &ObjectPath) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::DelInstanceConfig {
          path: path.clone(),
          reply,
        },
        rx,
      )
      .await
  }

  pub async fn set_instance_status(&self, path: &ObjectPath, status: InstanceStatus) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::SetInstanceStatus {
          path: path.clone(),
          status,
          reply,
        },
        rx,
      )
      .await
  }

  pub async fn del_instance_status(&self, path: &ObjectPath) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::DelInstanceStatus {
          path: path.clone(),
          reply,
        },
        rx,
      )
      .await
  }

  pub async fn set_node_monitor(&self, monitor: NodeMonitor) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self.call(Cmd::SetNodeMonitor { monitor, reply }, rx).await
  }

  pub async fn set_node_config(&self, config: NodeConf) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::SetNodeConfig {
          config: Box::new(config),
          reply,
        },
        rx,
      )
      .await
  }

  /// Forget a peer entirely.
  pub async fn drop_peer(&self, peer: &str) -> Result<(), StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::DropPeer {
          peer: peer.to_string(),
          reply,
        },
        rx,
      )
      .await
  }

  /// An immutable copy of a node's state.
  pub async fn get_node_state(&self, node: &str) -> Result<Option<NodeState>, StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::GetNodeState {
          node: node.to_string(),
          reply,
        },
        rx,
      )
      .await
  }

  pub async fn get_instance_config(&self, path: &ObjectPath) -> Result<Option<InstanceConfig>, StoreError> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Cmd::GetInstanceConfig {
          path: path.clone(),
          reply,
        },
        rx,
      )
      .await
  }

  /// The paths of every local instance.
  pub async fn instance_paths(&self) -> Result<Vec<ObjectPath>, StoreError> {
    let (reply, rx) = oneshot::channel();
    self.call(Cmd::InstancePaths { reply }, rx).await
  }

  /// Generation bookkeeping snapshot.
  pub async fn gens(&self) -> Result<GenView, StoreError> {
    let (reply, rx) = oneshot::channel();
    self.call(Cmd::Gens { reply }, rx).await
  }

  /// Build the outgoing heartbeat message for the current state.
  pub async fn hb_message(&self) -> Result<Msg, StoreError> {
    let (reply, rx) = oneshot::channel();
    self.call(Cmd::HbMessage { reply }, rx).await
  }
}
