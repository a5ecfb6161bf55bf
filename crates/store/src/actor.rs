//! The store task: owned state, queued commands, total ordering.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bus::{Bus, Event, Label};
use hive_core::config::NodeConf;
use hive_core::instance::{InstanceConfig, InstanceStatus};
use hive_core::node::{NodeMonitor, NodeState};
use hive_core::object::ObjectStatus;
use hive_core::path::ObjectPath;

use crate::delta::{Operation, PatchLog};
use crate::handle::StoreHandle;
use crate::msg::Msg;

/// Generations kept in the patch log, and so the maximum peer lag served by
/// `patch` messages instead of a full snapshot.
pub const DEFAULT_PATCH_WINDOW: u64 = 8;

/// Queue bound of the store command channel.
const CMD_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
  #[error("patch from {peer} out of sequence: expected generation {expected}, got {got}")]
  StateGap { peer: String, expected: u64, got: u64 },

  #[error("apply delta from {peer}: {detail}")]
  ApplyDelta { peer: String, detail: String },

  #[error("store task is gone")]
  ChannelClosed,
}

/// A read-only view of the generation bookkeeping, for the heartbeat layer
/// and tests.
#[derive(Debug, Clone, Default)]
pub struct GenView {
  /// The local node's own generation.
  pub gen: u64,
  /// The local node's generation map (own entry plus merged peer gens).
  pub gens: BTreeMap<String, u64>,
  /// Highest peer generation locally applied, per peer.
  pub merged_from_peer: BTreeMap<String, u64>,
  /// Highest local generation acknowledged by each peer.
  pub merged_on_peer: BTreeMap<String, u64>,
  /// Peers whose next message must be a full snapshot.
  pub need_full: Vec<String>,
}

pub(crate) enum Cmd {
  ApplyFull {
    peer: String,
    state: Box<NodeState>,
    reply: oneshot::Sender<()>,
  },
  ApplyPatch {
    peer: String,
    gen: BTreeMap<String, u64>,
    from_gen: u64,
    deltas: Vec<Vec<Operation>>,
    reply: oneshot::Sender<Result<(), StoreError>>,
  },
  ApplyPing {
    peer: String,
    reply: oneshot::Sender<()>,
  },
  SetInstanceConfig {
    path: ObjectPath,
    config: Box<InstanceConfig>,
    reply: oneshot::Sender<()>,
  },
  DelInstanceConfig {
    path: ObjectPath,
    reply: oneshot::Sender<()>,
  },
  SetInstanceStatus {
    path: ObjectPath,
    status: InstanceStatus,
    reply: oneshot::Sender<()>,
  },
  DelInstanceStatus {
    path: ObjectPath,
    reply: oneshot::Sender<()>,
  },
  SetNodeMonitor {
    monitor: NodeMonitor,
    reply: oneshot::Sender<()>,
  },
  SetNodeConfig {
    config: Box<NodeConf>,
    reply: oneshot::Sender<()>,
  },
  DropPeer {
    peer: String,
    reply: oneshot::Sender<()>,
  },
  GetNodeState {
    node: String,
    reply: oneshot::Sender<Option<NodeState>>,
  },
  GetInstanceConfig {
    path: ObjectPath,
    reply: oneshot::Sender<Option<InstanceConfig>>,
  },
  InstancePaths {
    reply: oneshot::Sender<Vec<ObjectPath>>,
  },
  Gens {
    reply: oneshot::Sender<GenView>,
  },
  HbMessage {
    reply: oneshot::Sender<Msg>,
  },
}

/// Spawn the store task. The handle is cheap to clone; outgoing heartbeat
/// payloads are enqueued on `hb_send` after every local mutation.
pub fn spawn(
  localnode: impl Into<String>,
  bus: Bus,
  hb_send: mpsc::Sender<Vec<u8>>,
  cancel: CancellationToken,
) -> StoreHandle {
  let localnode = localnode.into();
  let (tx, rx) = mpsc::channel(CMD_QUEUE_SIZE);
  let actor = Actor::new(localnode, bus, hb_send);
  tokio::spawn(actor.run(rx, cancel));
  StoreHandle::new(tx)
}

struct Actor {
  localnode: String,
  nodes: BTreeMap<String, NodeState>,
  merged_from_peer: BTreeMap<String, u64>,
  merged_on_peer: BTreeMap<String, u64>,
  need_full: BTreeSet<String>,
  patch_log: PatchLog,
  bus: Bus,
  hb_send: mpsc::Sender<Vec<u8>>,
}

impl Actor {
  fn new(localnode: String, bus: Bus, hb_send: mpsc::Sender<Vec<u8>>) -> Self {
    let mut nodes = BTreeMap::new();
    let mut local = NodeState::new(&localnode);
    local.status.agent = env!("CARGO_PKG_VERSION").to_string();
    nodes.insert(localnode.clone(), local);
    Self {
      localnode,
      nodes,
      merged_from_peer: BTreeMap::new(),
      merged_on_peer: BTreeMap::new(),
      need_full: BTreeSet::new(),
      patch_log: PatchLog::new(DEFAULT_PATCH_WINDOW),
      bus,
      hb_send,
    }
  }

  async fn run(mut self, mut rx: mpsc::Receiver<Cmd>, cancel: CancellationToken) {
    info!(node = %self.localnode, "store started");
    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("store stopped (cancelled)");
          return;
        }

        cmd = rx.recv() => {
          match cmd {
            Some(cmd) => self.dispatch(cmd),
            None => {
              info!("store stopped (command channel closed)");
              return;
            }
          }
        }
      }
    }
  }

  fn dispatch(&mut self, cmd: Cmd) {
    match cmd {
      Cmd::ApplyFull { peer, state, reply } => {
        self.apply_full(&peer, *state);
        let _ = reply.send(());
      }
      Cmd::ApplyPatch {
        peer,
        gen,
        from_gen,
        deltas,
        reply,
      } => {
        let _ = reply.send(self.apply_patch(&peer, gen, from_gen, deltas));
      }
      Cmd::ApplyPing { peer, reply } => {
        self.apply_ping(&peer);
        let _ = reply.send(());
      }
      Cmd::SetInstanceConfig { path, config, reply } => {
        self.set_instance_config(&path, *config);
        let _ = reply.send(());
      }
      Cmd::DelInstanceConfig { path, reply } => {
        self.del_instance_config(&path);
        let _ = reply.send(());
      }
      Cmd::SetInstanceStatus { path, status, reply } => {
        self.set_instance_status(&path, status);
        let _ = reply.send(());
      }
      Cmd::DelInstanceStatus { path, reply } => {
        self.del_instance_status(&path);
        let _ = reply.send(());
      }
      Cmd::SetNodeMonitor { monitor, reply } => {
        self.set_node_monitor(monitor);
        let _ = reply.send(());
      }
      Cmd::SetNodeConfig { config, reply } => {
        self.set_node_config(*config);
        let _ = reply.send(());
      }
      Cmd::DropPeer { peer, reply } => {
        self.drop_peer(&peer);
        let _ = reply.send(());
      }
      Cmd::GetNodeState { node, reply } => {
        let _ = reply.send(self.nodes.get(&node).cloned());
      }
      Cmd::GetInstanceConfig { path, reply } => {
        let config = self
          .local_state()
          .instances
          .get(&path.to_string())
          .and_then(|i| i.config.clone());
        let _ = reply.send(config);
      }
      Cmd::InstancePaths { reply } => {
        let paths = self
          .local_state()
          .instances
          .keys()
          .filter_map(|s| ObjectPath::parse(s).ok())
          .collect();
        let _ = reply.send(paths);
      }
      Cmd::Gens { reply } => {
        let _ = reply.send(self.gen_view());
      }
      Cmd::HbMessage { reply } => {
        let _ = reply.send(self.hb_message());
      }
    }
  }

  fn local_state(&self) -> &NodeState {
    self.nodes.get(&self.localnode).expect("local node state")
  }

  fn local_state_mut(&mut self) -> &mut NodeState {
    self.nodes.get_mut(&self.localnode).expect("local node state")
  }

  fn local_gen(&self) -> u64 {
    self
      .local_state()
      .gen
      .get(&self.localnode)
      .copied()
      .unwrap_or(0)
  }

  fn gen_view(&self) -> GenView {
    GenView {
      gen: self.local_gen(),
      gens: self.local_state().gen.clone(),
      merged_from_peer: self.merged_from_peer.clone(),
      merged_on_peer: self.merged_on_peer.clone(),
      need_full: self.need_full.iter().cloned().collect(),
    }
  }

  // ==========================================================================
  // Remote applies
  // ==========================================================================

  fn apply_full(&mut self, peer: &str, state: NodeState) {
    let old = self.nodes.get(peer).cloned();
    let peer_gen = state.gen.get(peer).copied().unwrap_or(0);
    if let Some(gen) = state.gen.get(&self.localnode) {
      self.merged_on_peer.insert(peer.to_string(), *gen);
    }
    self.merged_from_peer.insert(peer.to_string(), peer_gen);
    self.need_full.remove(peer);
    self.nodes.insert(peer.to_string(), state.clone());
    self
      .local_state_mut()
      .gen
      .insert(peer.to_string(), peer_gen);

    debug!(peer = %peer, gen = peer_gen, "applied full");
    let ops = vec![serde_json::to_value(Operation::replace(
      &["cluster", "nodes", peer],
      serde_json::to_value(&state).unwrap_or(Value::Null),
    ))
    .unwrap_or(Value::Null)];
    self.bus.publish(
      Event::ClusterPatch {
        node: peer.to_string(),
        ops,
      },
      vec![Label::node(peer)],
    );
    self.diff_peer_configs(peer, old.as_ref());
  }

  fn apply_patch(
    &mut self,
    peer: &str,
    gen: BTreeMap<String, u64>,
    from_gen: u64,
    deltas: Vec<Vec<Operation>>,
  ) -> Result<(), StoreError> {
    let expected = self.merged_from_peer.get(peer).copied().unwrap_or(0) + 1;
    if self.need_full.contains(peer) || from_gen != expected {
      self.need_full.insert(peer.to_string());
      return Err(StoreError::StateGap {
        peer: peer.to_string(),
        expected,
        got: from_gen,
      });
    }
    let old = match self.nodes.get(peer) {
      Some(state) => state.clone(),
      None => {
        self.need_full.insert(peer.to_string());
        return Err(StoreError::StateGap {
          peer: peer.to_string(),
          expected,
          got: from_gen,
        });
      }
    };

    let mut doc = serde_json::to_value(&old).map_err(|e| StoreError::ApplyDelta {
      peer: peer.to_string(),
      detail: e.to_string(),
    })?;
    for ops in &deltas {
      for op in ops {
        op.apply(&mut doc).map_err(|e| {
          self.need_full.insert(peer.to_string());
          StoreError::ApplyDelta {
            peer: peer.to_string(),
            detail: e.to_string(),
          }
        })?;
      }
    }
    let mut state: NodeState = serde_json::from_value(doc).map_err(|e| {
      self.need_full.insert(peer.to_string());
      StoreError::ApplyDelta {
        peer: peer.to_string(),
        detail: e.to_string(),
      }
    })?;

    let merged = from_gen + deltas.len() as u64 - 1;
    state.gen = gen.clone();
    state.gen.insert(peer.to_string(), merged);
    self.nodes.insert(peer.to_string(), state);
    self.merged_from_peer.insert(peer.to_string(), merged);
    if let Some(g) = gen.get(&self.localnode) {
      self.merged_on_peer.insert(peer.to_string(), *g);
    }
    self.local_state_mut().gen.insert(peer.to_string(), merged);

    debug!(peer = %peer, from_gen, count = deltas.len(), "applied patch");
    let ops = deltas
      .iter()
      .flatten()
      .map(|op| {
        let mut prefixed = op.clone();
        let mut path = vec!["cluster".to_string(), "nodes".to_string(), peer.to_string()];
        path.append(&mut prefixed.path);
        prefixed.path = path;
        serde_json::to_value(prefixed).unwrap_or(Value::Null)
      })
      .collect();
    self.bus.publish(
      Event::ClusterPatch {
        node: peer.to_string(),
        ops,
      },
      vec![Label::node(peer)],
    );
    self.diff_peer_configs(peer, Some(&old));
    Ok(())
  }

  fn apply_ping(&mut self, peer: &str) {
    if !self.nodes.contains_key(peer) {
      debug!(peer = %peer, "first contact (ping), creating peer state");
      self.nodes.insert(peer.to_string(), NodeState::new(peer));
    }
  }

  fn drop_peer(&mut self, peer: &str) {
    if peer == self.localnode {
      warn!("refusing to drop the local node state");
      return;
    }
    self.nodes.remove(peer);
    self.merged_from_peer.remove(peer);
    self.merged_on_peer.remove(peer);
    self.need_full.remove(peer);
    self.local_state_mut().gen.remove(peer);
    info!(peer = %peer, "dropped peer state");
  }

  /// Publish CfgUpdated/CfgDeleted for instance configurations that changed
  /// between a peer's previous and current state, so discovery can fetch
  /// remote configuration files.
  fn diff_peer_configs(&self, peer: &str, old: Option<&NodeState>) {
    let new_state = match self.nodes.get(peer) {
      Some(s) => s,
      None => return,
    };
    for (s, instance) in &new_state.instances {
      let Some(config) = &instance.config else { continue };
      let Ok(path) = ObjectPath::parse(s) else { continue };
      let previous = old
        .and_then(|o| o.instances.get(s))
        .and_then(|i| i.config.as_ref());
      let changed = match previous {
        Some(prev) => prev.updated != config.updated || prev.checksum != config.checksum,
        None => true,
      };
      if changed {
        self.bus.publish(
          Event::CfgUpdated {
            path: path.clone(),
            node: peer.to_string(),
            config: config.clone(),
          },
          vec![Label::node(peer), Label::path(&path)],
        );
      }
    }
    if let Some(old) = old {
      for (s, instance) in &old.instances {
        if instance.config.is_none() {
          continue;
        }
        let gone = new_state
          .instances
          .get(s)
          .map(|i| i.config.is_none())
          .unwrap_or(true);
        if gone {
          if let Ok(path) = ObjectPath::parse(s) {
            self.bus.publish(
              Event::CfgDeleted {
                path: path.clone(),
                node: peer.to_string(),
              },
              vec![Label::node(peer), Label::path(&path)],
            );
          }
        }
      }
    }
  }

  // ==========================================================================
  // Local mutations
  // ==========================================================================

  /// Commit a local change: bump the local generation, log the delta,
  /// publish the change on the bus, enqueue a heartbeat payload.
  fn commit_local(&mut self, mut ops: Vec<Operation>, events: Vec<(Event, Vec<Label>)>) {
    let gen = self.local_gen() + 1;
    let localnode = self.localnode.clone();
    self.local_state_mut().gen.insert(localnode.clone(), gen);
    ops.push(Operation::replace(
      &["gen", &localnode],
      serde_json::to_value(gen).unwrap_or(Value::Null),
    ));
    self.patch_log.push(gen, ops.clone());

    let prefixed = ops
      .iter()
      .map(|op| {
        let mut p = op.clone();
        let mut path = vec!["cluster".to_string(), "nodes".to_string(), localnode.clone()];
        path.append(&mut p.path);
        p.path = path;
        serde_json::to_value(p).unwrap_or(Value::Null)
      })
      .collect();
    self.bus.publish(
      Event::ClusterPatch {
        node: localnode.clone(),
        ops: prefixed,
      },
      vec![Label::node(&localnode)],
    );
    for (event, labels) in events {
      self.bus.publish(event, labels);
    }
    self.enqueue_hb_message();
  }

  fn enqueue_hb_message(&self) {
    let msg = self.hb_message();
    match serde_json::to_vec(&msg) {
      Ok(payload) => {
        if self.hb_send.try_send(payload).is_err() {
          // The dispatcher is behind; the next message covers the same
          // generations, nothing is lost.
          debug!("heartbeat send queue full, message skipped");
        }
      }
      Err(e) => error!(error = %e, "serialize heartbeat message"),
    }
  }

  fn set_instance_config(&mut self, path: &ObjectPath, config: InstanceConfig) {
    let s = path.to_string();
    let localnode = self.localnode.clone();
    let value = serde_json::to_value(&config).unwrap_or(Value::Null);
    let instance = self.local_state_mut().instances.entry(s.clone()).or_default();
    instance.config = Some(config.clone());
    let ops = vec![Operation::replace(&["instances", &s, "config"], value)];
    let labels = vec![Label::node(&localnode), Label::path(path)];
    self.commit_local(
      ops,
      vec![
        (
          Event::InstanceConfigUpdated {
            path: path.clone(),
            node: localnode.clone(),
            config: config.clone(),
          },
          labels.clone(),
        ),
        (
          Event::CfgUpdated {
            path: path.clone(),
            node: localnode,
            config,
          },
          labels,
        ),
      ],
    );
  }

  fn del_instance_config(&mut self, path: &ObjectPath) {
    let s = path.to_string();
    let localnode = self.localnode.clone();
    let mut ops = Vec::new();
    {
      let instances = &mut self.local_state_mut().instances;
      let Some(instance) = instances.get_mut(&s) else { return };
      if instance.config.take().is_none() {
        return;
      }
      ops.push(Operation::remove(&["instances", &s, "config"]));
      if instance.is_empty() {
        instances.remove(&s);
        ops.push(Operation::remove(&["instances", &s]));
      }
    }
    let labels = vec![Label::node(&localnode), Label::path(path)];
    self.commit_local(
      ops,
      vec![
        (
          Event::InstanceConfigDeleted {
            path: path.clone(),
            node: localnode.clone(),
          },
          labels.clone(),
        ),
        (
          Event::CfgDeleted {
            path: path.clone(),
            node: localnode,
          },
          labels,
        ),
      ],
    );
  }

  fn set_instance_status(&mut self, path: &ObjectPath, status: InstanceStatus) {
    let s = path.to_string();
    let localnode = self.localnode.clone();
    let value = serde_json::to_value(&status).unwrap_or(Value::Null);
    let instance = self.local_state_mut().instances.entry(s.clone()).or_default();
    instance.status = Some(status.clone());
    let object_status = self.aggregate_object_status(&s);
    let ops = vec![Operation::replace(&["instances", &s, "status"], value)];
    let labels = vec![Label::node(&localnode), Label::path(path)];
    self.commit_local(
      ops,
      vec![
        (
          Event::InstanceStatusUpdated {
            path: path.clone(),
            node: localnode.clone(),
            status,
          },
          labels.clone(),
        ),
        (
          Event::ObjectStatusUpdated {
            path: path.clone(),
            node: localnode,
            status: object_status,
          },
          labels,
        ),
      ],
    );
  }

  fn del_instance_status(&mut self, path: &ObjectPath) {
    let s = path.to_string();
    let localnode = self.localnode.clone();
    let mut ops = Vec::new();
    {
      let instances = &mut self.local_state_mut().instances;
      let Some(instance) = instances.get_mut(&s) else { return };
      if instance.status.take().is_none() {
        return;
      }
      ops.push(Operation::remove(&["instances", &s, "status"]));
      if instance.is_empty() {
        instances.remove(&s);
        ops.push(Operation::remove(&["instances", &s]));
      }
    }
    let object_gone = !self
      .nodes
      .values()
      .any(|n| n.instances.get(&s).map(|i| i.status.is_some()).unwrap_or(false));
    let labels = vec![Label::node(&localnode), Label::path(path)];
    let mut events = vec![(
      Event::InstanceStatusDeleted {
        path: path.clone(),
        node: localnode.clone(),
      },
      labels.clone(),
    )];
    if object_gone {
      events.push((
        Event::ObjectStatusDeleted {
          path: path.clone(),
          node: localnode,
        },
        labels,
      ));
    }
    self.commit_local(ops, events);
  }

  fn aggregate_object_status(&self, s: &str) -> ObjectStatus {
    let statuses: Vec<&InstanceStatus> = self
      .nodes
      .values()
      .filter_map(|n| n.instances.get(s).and_then(|i| i.status.as_ref()))
      .collect();
    ObjectStatus::aggregate(statuses.into_iter(), Utc::now())
  }

  fn set_node_monitor(&mut self, monitor: NodeMonitor) {
    let localnode = self.localnode.clone();
    let value = serde_json::to_value(&monitor).unwrap_or(Value::Null);
    self.local_state_mut().monitor = monitor.clone();
    self.commit_local(
      vec![Operation::replace(&["monitor"], value)],
      vec![(
        Event::NodeMonitorUpdated {
          node: localnode.clone(),
          monitor,
        },
        vec![Label::node(&localnode)],
      )],
    );
  }

  fn set_node_config(&mut self, config: NodeConf) {
    let localnode = self.localnode.clone();
    let value = serde_json::to_value(&config).unwrap_or(Value::Null);
    self.local_state_mut().config = config.clone();
    self.commit_local(
      vec![Operation::replace(&["config"], value)],
      vec![(
        Event::NodeConfigUpdated {
          node: localnode.clone(),
          config,
        },
        vec![Label::node(&localnode)],
      )],
    );
  }

  // ==========================================================================
  // Outgoing heartbeat message
  // ==========================================================================

  /// Build the message to fan out to peers: `ping` when everything is
  /// acknowledged, `patch` when the patch log still covers the slowest
  /// peer, `full` otherwise.
  fn hb_message(&self) -> Msg {
    let mut gen = self.local_state().gen.clone();
    // a peer flagged need-full is advertised at generation zero: the map
    // tells it we merged nothing of it, so its next message is a full
    for peer in &self.need_full {
      gen.insert(peer.clone(), 0);
    }
    let head = self.local_gen();
    let peers: Vec<&String> = self.nodes.keys().filter(|n| **n != self.localnode).collect();

    if peers.is_empty() || (head == 0 && self.merged_on_peer.is_empty()) {
      return Msg::Ping {
        nodename: self.localnode.clone(),
        gen,
      };
    }
    let min_acked = peers
      .iter()
      .map(|p| self.merged_on_peer.get(*p).copied().unwrap_or(0))
      .min()
      .unwrap_or(0);
    if min_acked >= head {
      return Msg::Ping {
        nodename: self.localnode.clone(),
        gen,
      };
    }
    match self.patch_log.replay(min_acked + 1, head) {
      Some(deltas) if min_acked > 0 => Msg::Patch {
        nodename: self.localnode.clone(),
        gen,
        from_gen: min_acked + 1,
        deltas,
      },
      _ => Msg::Full {
        nodename: self.localnode.clone(),
        gen,
        full: Box::new(self.local_state().clone()),
      },
    }
  }
}
