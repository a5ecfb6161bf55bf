//! Heartbeat controller: driver states and peer liveness.
//!
//! Drivers report their lifecycle here. A driver that fails stays
//! registered so a later rescan can retry it. A peer whose last message is
//! older than the staleness threshold is announced on the bus with a
//! `PeerStale` event, which the janitor and discovery react to.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bus::{Bus, Event, Label};

/// Lifecycle of one tx or rx driver half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
  Registered,
  Running,
  Failed,
  Stopped,
}

enum CtrlCmd {
  Register {
    id: String,
  },
  Unregister {
    id: String,
  },
  SetState {
    id: String,
    state: DriverState,
  },
  PeerSeen {
    peer: String,
  },
  States {
    reply: oneshot::Sender<HashMap<String, DriverState>>,
  },
  AlivePeers {
    reply: oneshot::Sender<Vec<String>>,
  },
}

/// Handle to the controller task. Cheap to clone; sends never block.
#[derive(Clone)]
pub struct CtrlHandle {
  tx: mpsc::UnboundedSender<CtrlCmd>,
}

impl CtrlHandle {
  pub fn register(&self, id: &str) {
    let _ = self.tx.send(CtrlCmd::Register { id: id.to_string() });
  }

  pub fn unregister(&self, id: &str) {
    let _ = self.tx.send(CtrlCmd::Unregister { id: id.to_string() });
  }

  pub fn set_state(&self, id: &str, state: DriverState) {
    let _ = self.tx.send(CtrlCmd::SetState {
      id: id.to_string(),
      state,
    });
  }

  /// Record a heartbeat message reception from a peer.
  pub fn peer_seen(&self, peer: &str) {
    let _ = self.tx.send(CtrlCmd::PeerSeen { peer: peer.to_string() });
  }

  pub async fn states(&self) -> HashMap<String, DriverState> {
    let (reply, rx) = oneshot::channel();
    if self.tx.send(CtrlCmd::States { reply }).is_err() {
      return HashMap::new();
    }
    rx.await.unwrap_or_default()
  }

  /// Peers seen within the staleness threshold.
  pub async fn alive_peers(&self) -> Vec<String> {
    let (reply, rx) = oneshot::channel();
    if self.tx.send(CtrlCmd::AlivePeers { reply }).is_err() {
      return Vec::new();
    }
    rx.await.unwrap_or_default()
  }
}

/// Spawn the controller task.
pub fn start(stale_after: Duration, bus: Bus, cancel: CancellationToken) -> CtrlHandle {
  let (tx, mut rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    let mut drivers: HashMap<String, DriverState> = HashMap::new();
    let mut peers: HashMap<String, Instant> = HashMap::new();
    let mut stale: HashMap<String, bool> = HashMap::new();
    let mut check = tokio::time::interval(stale_after / 2);
    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          debug!("hb controller stopped");
          return;
        }

        _ = check.tick() => {
          for (peer, seen) in &peers {
            let is_stale = seen.elapsed() > stale_after;
            let was_stale = stale.insert(peer.clone(), is_stale).unwrap_or(false);
            if is_stale && !was_stale {
              warn!(peer = %peer, "peer heartbeat stale");
              bus.publish(
                Event::PeerStale { node: peer.clone() },
                vec![Label::node(peer.as_str())],
              );
            } else if !is_stale && was_stale {
              info!(peer = %peer, "peer heartbeat restored");
            }
          }
        }

        cmd = rx.recv() => {
          let Some(cmd) = cmd else { return };
          match cmd {
            CtrlCmd::Register { id } => {
              debug!(id = %id, "hb driver registered");
              drivers.entry(id).or_insert(DriverState::Registered);
            }
            CtrlCmd::Unregister { id } => {
              debug!(id = %id, "hb driver unregistered");
              drivers.remove(&id);
            }
            CtrlCmd::SetState { id, state } => {
              debug!(id = %id, state = ?state, "hb driver state");
              drivers.insert(id, state);
            }
            CtrlCmd::PeerSeen { peer } => {
              peers.insert(peer, Instant::now());
            }
            CtrlCmd::States { reply } => {
              let _ = reply.send(drivers.clone());
            }
            CtrlCmd::AlivePeers { reply } => {
              let alive = peers
                .iter()
                .filter(|(_, seen)| seen.elapsed() <= stale_after)
                .map(|(peer, _)| peer.clone())
                .collect();
              let _ = reply.send(alive);
            }
          }
        }
      }
    }
  });
  CtrlHandle { tx }
}
