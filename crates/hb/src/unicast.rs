//! Unicast TCP heartbeat driver.
//!
//! The tx half dials every peer and writes one json line per message,
//! re-sending the last message at the configured interval so liveness is
//! advertised even when the cluster state is quiet. Connections are kept
//! open and re-established on error at the next send.
//!
//! The rx half listens on the configured port, accepts peer connections and
//! feeds parsed messages into the shared read queue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_core::config::{ClusterConfig, HbSection};
use store::Msg;

use crate::ctrl::CtrlHandle;
use crate::driver::{section_signature, HbConfigurer, HbReceiver, HbTransmitter};
use crate::HbError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct UnicastConfigurer {
  rid: String,
  section: HbSection,
  peers: Vec<String>,
  /// `(nodename, addr:port)` dial targets.
  targets: Vec<(String, String)>,
  bind: String,
  interval: Duration,
}

impl UnicastConfigurer {
  pub fn new(rid: &str, section: &HbSection, localnode: &str, cluster: &ClusterConfig) -> Self {
    let peers = cluster.peers(localnode);
    let targets = peers
      .iter()
      .map(|peer| {
        let addr = section.addr.get(peer).cloned().unwrap_or_else(|| peer.clone());
        (peer.clone(), format!("{addr}:{}", section.port))
      })
      .collect();
    Self {
      rid: rid.to_string(),
      section: section.clone(),
      peers,
      targets,
      bind: format!("0.0.0.0:{}", section.port),
      interval: Duration::from_secs(section.interval.max(1)),
    }
  }
}

impl HbConfigurer for UnicastConfigurer {
  fn name(&self) -> String {
    self.rid.clone()
  }

  fn signature(&self) -> String {
    section_signature(&self.rid, &self.section, &self.peers)
  }

  fn tx(&self) -> Box<dyn HbTransmitter> {
    Box::new(UnicastTx {
      id: format!("{}.tx", self.rid),
      targets: self.targets.clone(),
      interval: self.interval,
      cancel: None,
      task: None,
    })
  }

  fn rx(&self) -> Box<dyn HbReceiver> {
    Box::new(UnicastRx {
      id: format!("{}.rx", self.rid),
      bind: self.bind.clone(),
      cancel: None,
      task: None,
    })
  }
}

// ============================================================================
// Tx
// ============================================================================

pub struct UnicastTx {
  id: String,
  targets: Vec<(String, String)>,
  interval: Duration,
  cancel: Option<CancellationToken>,
  task: Option<JoinHandle<()>>,
}

#[async_trait]
impl HbTransmitter for UnicastTx {
  fn id(&self) -> String {
    self.id.clone()
  }

  async fn start(
    &mut self,
    _ctrl: CtrlHandle,
    mut msg_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
  ) -> Result<(), HbError> {
    let id = self.id.clone();
    let targets = self.targets.clone();
    let interval = self.interval;
    self.cancel = Some(cancel.clone());
    self.task = Some(tokio::spawn(async move {
      let mut conns: HashMap<String, Framed<TcpStream, LinesCodec>> = HashMap::new();
      let mut last: Option<String> = None;
      let mut tick = tokio::time::interval(interval);
      info!(id = %id, "hb tx started");
      loop {
        tokio::select! {
          biased;

          _ = cancel.cancelled() => {
            // drain what the dispatcher already handed us
            while let Ok(payload) = msg_rx.try_recv() {
              if let Ok(line) = String::from_utf8(payload) {
                send_all(&targets, &mut conns, &line).await;
              }
            }
            info!(id = %id, "hb tx stopped");
            return;
          }

          payload = msg_rx.recv() => {
            let Some(payload) = payload else {
              debug!(id = %id, "hb tx queue closed");
              return;
            };
            match String::from_utf8(payload) {
              Ok(line) => {
                send_all(&targets, &mut conns, &line).await;
                last = Some(line);
              }
              Err(e) => warn!(id = %id, error = %e, "non-utf8 heartbeat payload"),
            }
          }

          _ = tick.tick() => {
            if let Some(line) = &last {
              send_all(&targets, &mut conns, line).await;
            }
          }
        }
      }
    }));
    Ok(())
  }

  async fn stop(&mut self) -> Result<(), HbError> {
    if let Some(cancel) = self.cancel.take() {
      cancel.cancel();
    }
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
    Ok(())
  }
}

async fn send_all(
  targets: &[(String, String)],
  conns: &mut HashMap<String, Framed<TcpStream, LinesCodec>>,
  line: &str,
) {
  for (node, addr) in targets {
    if !conns.contains_key(node) {
      let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await;
      match connect {
        Ok(Ok(stream)) => {
          conns.insert(node.clone(), Framed::new(stream, LinesCodec::new()));
        }
        Ok(Err(e)) => {
          debug!(peer = %node, addr = %addr, error = %e, "hb tx connect failed");
          continue;
        }
        Err(_) => {
          debug!(peer = %node, addr = %addr, "hb tx connect timeout");
          continue;
        }
      }
    }
    if let Some(framed) = conns.get_mut(node) {
      if let Err(e) = framed.send(line.to_string()).await {
        debug!(peer = %node, error = %e, "hb tx send failed, dropping connection");
        conns.remove(node);
      }
    }
  }
}

// ============================================================================
// Rx
// ============================================================================

pub struct UnicastRx {
  id: String,
  bind: String,
  cancel: Option<CancellationToken>,
  task: Option<JoinHandle<()>>,
}

#[async_trait]
impl HbReceiver for UnicastRx {
  fn id(&self) -> String {
    self.id.clone()
  }

  async fn start(
    &mut self,
    ctrl: CtrlHandle,
    read_tx: mpsc::Sender<Msg>,
    cancel: CancellationToken,
  ) -> Result<(), HbError> {
    // binding errors are start errors: the caller marks the driver failed
    let listener = TcpListener::bind(&self.bind).await?;
    let id = self.id.clone();
    self.cancel = Some(cancel.clone());
    self.task = Some(tokio::spawn(async move {
      info!(id = %id, bind = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "hb rx listening");
      loop {
        tokio::select! {
          biased;

          _ = cancel.cancelled() => {
            info!(id = %id, "hb rx stopped");
            return;
          }

          accepted = listener.accept() => {
            match accepted {
              Ok((stream, peer_addr)) => {
                debug!(id = %id, peer = %peer_addr, "hb rx connection");
                let ctrl = ctrl.clone();
                let read_tx = read_tx.clone();
                let conn_cancel = cancel.clone();
                let conn_id = id.clone();
                tokio::spawn(read_conn(conn_id, stream, ctrl, read_tx, conn_cancel));
              }
              Err(e) => {
                // normal shutdown closes the socket under us; anything
                // else is transient, keep accepting
                if cancel.is_cancelled() {
                  return;
                }
                warn!(id = %id, error = %e, "hb rx accept error");
              }
            }
          }
        }
      }
    }));
    Ok(())
  }

  async fn stop(&mut self) -> Result<(), HbError> {
    if let Some(cancel) = self.cancel.take() {
      cancel.cancel();
    }
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
    Ok(())
  }
}

async fn read_conn(
  id: String,
  stream: TcpStream,
  ctrl: CtrlHandle,
  read_tx: mpsc::Sender<Msg>,
  cancel: CancellationToken,
) {
  let mut lines = FramedRead::new(stream, LinesCodec::new());
  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => return,

      line = lines.next() => {
        let Some(line) = line else { return };
        let line = match line {
          Ok(line) => line,
          Err(e) => {
            debug!(id = %id, error = %e, "hb rx read error");
            return;
          }
        };
        match serde_json::from_str::<Msg>(&line) {
          Ok(msg) => {
            ctrl.peer_seen(msg.nodename());
            if read_tx.send(msg).await.is_err() {
              return;
            }
          }
          // unknown kinds and corrupt payloads are logged and dropped
          Err(e) => warn!(id = %id, error = %e, "hb rx message parse error"),
        }
      }
    }
  }
}
