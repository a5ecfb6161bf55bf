//! Heartbeat layer.
//!
//! Keeps the cluster data store of every node synchronised by exchanging
//! `full`/`patch`/`ping` messages with peers through pluggable transport
//! drivers.
//!
//! One [`Heartbeats`] component runs per daemon. It owns:
//! - the **dispatcher**: fans every outgoing payload out to the registered
//!   tx driver queues;
//! - the **reader**: drains the shared receive queue and applies messages
//!   to the store by kind;
//! - the **janitor**: reconciles running drivers against the cluster
//!   configuration (rescan) and executes operator driver controls.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bus::{Bus, Event, EventKind, Label};
use hive_core::config::ClusterConfig;
use hive_core::path::ObjectPath;
use store::{Msg, StoreHandle};

pub mod ctrl;
pub mod driver;
mod unicast;

pub use ctrl::{CtrlHandle, DriverState};
pub use driver::{DefaultFactory, DriverFactory, HbConfigurer, HbReceiver, HbTransmitter};
pub use unicast::UnicastConfigurer;

/// Per-tx queue bound between the dispatcher and a driver.
const TX_QUEUE_SIZE: usize = 64;

/// Shared receive queue bound.
const READ_QUEUE_SIZE: usize = 64;

/// Peer staleness threshold when no driver declares one.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum HbError {
  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("unknown heartbeat driver type {0}")]
  UnknownDriver(String),

  #[error(transparent)]
  Config(#[from] hive_core::config::ConfigError),

  #[error("stop heartbeat {rid} failed for {}", .failing.join(", "))]
  Stop { rid: String, failing: Vec<String> },

  #[error("heartbeat rescan errors: {}", .0.join("; "))]
  Rescan(Vec<String>),
}

enum DispatchCmd {
  Register { id: String, queue: mpsc::Sender<Vec<u8>> },
  Unregister { id: String },
}

/// The heartbeat component. Constructed with [`Heartbeats::new`], driven by
/// [`Heartbeats::run`].
pub struct Heartbeats {
  localnode: String,
  conf_path: PathBuf,
  bus: Bus,
  store: StoreHandle,
  factory: Arc<dyn DriverFactory>,
  ctrl: CtrlHandle,
  cancel: CancellationToken,

  txs: HashMap<String, Box<dyn HbTransmitter>>,
  rxs: HashMap<String, Box<dyn HbReceiver>>,
  rid_signature: BTreeMap<String, String>,

  dispatch_tx: mpsc::UnboundedSender<DispatchCmd>,
  read_tx: mpsc::Sender<Msg>,
}

impl Heartbeats {
  /// Wire the component: spawns the controller, the dispatcher consuming
  /// `hb_recv`, and the reader feeding `store`. Drivers are started by the
  /// first rescan, from [`Heartbeats::run`].
  pub fn new(
    localnode: impl Into<String>,
    conf_path: PathBuf,
    bus: Bus,
    store: StoreHandle,
    hb_recv: mpsc::Receiver<Vec<u8>>,
    factory: Arc<dyn DriverFactory>,
    cancel: CancellationToken,
  ) -> Self {
    let localnode = localnode.into();
    let ctrl = ctrl::start(DEFAULT_STALE_AFTER, bus.clone(), cancel.child_token());

    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    tokio::spawn(dispatcher(hb_recv, dispatch_rx, cancel.child_token()));

    let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_SIZE);
    tokio::spawn(reader(
      localnode.clone(),
      read_rx,
      store.clone(),
      ctrl.clone(),
      cancel.child_token(),
    ));

    Self {
      localnode,
      conf_path,
      bus,
      store,
      factory,
      ctrl,
      cancel,
      txs: HashMap::new(),
      rxs: HashMap::new(),
      rid_signature: BTreeMap::new(),
      dispatch_tx,
      read_tx,
    }
  }

  pub fn ctrl_handle(&self) -> CtrlHandle {
    self.ctrl.clone()
  }

  /// Run the janitor: initial rescan, then rescan on local cluster config
  /// change and operator driver controls, until cancellation.
  pub async fn run(mut self) {
    let sub = self.bus.sub("hb.janitor");
    sub.add_filter(
      EventKind::CfgUpdated,
      vec![Label::node(&self.localnode), Label::path(&ObjectPath::cluster())],
    );
    sub.add_filter(EventKind::DaemonCtl, vec![]);
    sub.add_filter(EventKind::PeerStale, vec![]);
    sub.start();

    if let Err(e) = self.rescan().await {
      error!(error = %e, "initial heartbeat rescan");
    }

    let cancel = self.cancel.clone();
    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          self.stop_all().await;
          info!("heartbeats stopped");
          return;
        }

        ev = sub.recv() => {
          match ev {
            Some(Event::CfgUpdated { .. }) => {
              info!("rescan heartbeat configurations (local cluster config changed)");
              if let Err(e) = self.rescan().await {
                error!(error = %e, "rescan after cluster config change");
              }
            }
            Some(Event::DaemonCtl { component, action }) => {
              if component.starts_with("hb#") {
                self.daemon_ctl(&component, &action).await;
              }
            }
            Some(Event::PeerStale { node }) => {
              // the peer state is dropped; the next message from that peer
              // leaves a generation gap, flags need-full, and a full
              // snapshot rebuilds it
              warn!(peer = %node, "peer heartbeat stale, dropping peer state");
              if let Err(e) = self.store.drop_peer(&node).await {
                error!(peer = %node, error = %e, "drop stale peer");
              }
            }
            Some(_) => {}
            None => return,
          }
        }
      }
    }
  }

  // ==========================================================================
  // Rescan
  // ==========================================================================

  /// Reconcile running drivers with the configured ones.
  ///
  /// Order matters, so two drivers never hold the same port at once:
  /// 1. stop drivers whose rid disappeared;
  /// 2. stop drivers whose signature changed;
  /// 3. start the drivers stopped in 2 with their new signature;
  /// 4. start drivers whose rid is new.
  pub async fn rescan(&mut self) -> Result<(), HbError> {
    let cluster = ClusterConfig::load(&self.conf_path)?;
    let mut errs: Vec<String> = Vec::new();

    let mut desired: BTreeMap<String, Box<dyn HbConfigurer>> = BTreeMap::new();
    for (rid, section) in cluster.hb_sections() {
      match self.factory.configure(&rid, &section, &self.localnode, &cluster) {
        Ok(configurer) => {
          desired.insert(rid, configurer);
        }
        Err(e) => errs.push(format!("{rid}: {e}")),
      }
    }
    let new_signatures: BTreeMap<String, String> =
      desired.iter().map(|(rid, c)| (rid.clone(), c.signature())).collect();

    // 1. drivers gone from configuration
    let gone: Vec<String> = self
      .rid_signature
      .keys()
      .filter(|rid| !new_signatures.contains_key(*rid))
      .cloned()
      .collect();
    for rid in gone {
      info!(rid = %rid, "heartbeat config deleted, stopping");
      match self.stop_rid(&rid).await {
        Ok(()) => {
          self.rid_signature.remove(&rid);
        }
        Err(e) => errs.push(e.to_string()),
      }
    }

    // 2. drivers whose parameters changed
    let mut stopped: Vec<String> = Vec::new();
    for (rid, new_sig) in &new_signatures {
      if let Some(sig) = self.rid_signature.get(rid) {
        if sig != new_sig {
          info!(rid = %rid, "heartbeat config changed, stopping");
          match self.stop_rid(rid).await {
            Ok(()) => stopped.push(rid.clone()),
            Err(e) => errs.push(e.to_string()),
          }
        }
      }
    }

    // 3. restart them with the new parameters
    for rid in stopped {
      info!(rid = %rid, "heartbeat config changed, starting");
      if let Err(e) = self.start_driver(desired[&rid].as_ref()).await {
        errs.push(format!("{rid}: {e}"));
      }
      self.rid_signature.insert(rid.clone(), new_signatures[&rid].clone());
    }

    // 4. new drivers
    for (rid, sig) in &new_signatures {
      if !self.rid_signature.contains_key(rid) {
        info!(rid = %rid, "heartbeat config new, starting");
        if let Err(e) = self.start_driver(desired[rid].as_ref()).await {
          errs.push(format!("{rid}: {e}"));
          continue;
        }
        self.rid_signature.insert(rid.clone(), sig.clone());
      }
    }

    if errs.is_empty() {
      Ok(())
    } else {
      Err(HbError::Rescan(errs))
    }
  }

  async fn start_driver(&mut self, configurer: &dyn HbConfigurer) -> Result<(), HbError> {
    self.start_rx(configurer).await?;
    self.start_tx(configurer).await?;
    Ok(())
  }

  async fn start_rx(&mut self, configurer: &dyn HbConfigurer) -> Result<(), HbError> {
    let mut rx = configurer.rx();
    let id = rx.id();
    self.ctrl.register(&id);
    match rx
      .start(self.ctrl.clone(), self.read_tx.clone(), self.cancel.child_token())
      .await
    {
      Ok(()) => {
        self.ctrl.set_state(&id, DriverState::Running);
        self.rxs.insert(configurer.name(), rx);
        Ok(())
      }
      Err(e) => {
        error!(id = %id, error = %e, "starting heartbeat rx");
        self.ctrl.set_state(&id, DriverState::Failed);
        Err(e)
      }
    }
  }

  async fn start_tx(&mut self, configurer: &dyn HbConfigurer) -> Result<(), HbError> {
    let mut tx = configurer.tx();
    let id = tx.id();
    self.ctrl.register(&id);
    let (queue_tx, queue_rx) = mpsc::channel(TX_QUEUE_SIZE);
    match tx
      .start(self.ctrl.clone(), queue_rx, self.cancel.child_token())
      .await
    {
      Ok(()) => {
        self.ctrl.set_state(&id, DriverState::Running);
        let _ = self.dispatch_tx.send(DispatchCmd::Register { id, queue: queue_tx });
        self.txs.insert(configurer.name(), tx);
        Ok(())
      }
      Err(e) => {
        error!(id = %id, error = %e, "starting heartbeat tx");
        self.ctrl.set_state(&id, DriverState::Failed);
        Err(e)
      }
    }
  }

  /// Stop both halves of a driver. The error lists the failing sub-ids.
  async fn stop_rid(&mut self, rid: &str) -> Result<(), HbError> {
    let mut failing: Vec<String> = Vec::new();
    if let Some(mut tx) = self.txs.remove(rid) {
      let id = tx.id();
      let _ = self.dispatch_tx.send(DispatchCmd::Unregister { id: id.clone() });
      match tx.stop().await {
        Ok(()) => self.ctrl.unregister(&id),
        Err(e) => {
          warn!(id = %id, error = %e, "stopping heartbeat tx");
          failing.push(id);
          self.txs.insert(rid.to_string(), tx);
        }
      }
    }
    if let Some(mut rx) = self.rxs.remove(rid) {
      let id = rx.id();
      match rx.stop().await {
        Ok(()) => self.ctrl.unregister(&id),
        Err(e) => {
          warn!(id = %id, error = %e, "stopping heartbeat rx");
          failing.push(id);
          self.rxs.insert(rid.to_string(), rx);
        }
      }
    }
    if failing.is_empty() {
      Ok(())
    } else {
      Err(HbError::Stop {
        rid: rid.to_string(),
        failing,
      })
    }
  }

  async fn stop_all(&mut self) {
    let rids: Vec<String> = self
      .rid_signature
      .keys()
      .cloned()
      .collect();
    for rid in rids {
      if let Err(e) = self.stop_rid(&rid).await {
        error!(error = %e, "stopping heartbeat");
      }
    }
  }

  // ==========================================================================
  // Operator controls
  // ==========================================================================

  async fn daemon_ctl(&mut self, component: &str, action: &str) {
    info!(component = %component, action = %action, "heartbeat daemon control");
    match action {
      "stop" => self.daemon_ctl_stop(component).await,
      "start" => self.daemon_ctl_start(component).await,
      other => warn!(component = %component, action = %other, "unsupported heartbeat control"),
    }
  }

  async fn daemon_ctl_stop(&mut self, component: &str) {
    if let Some(rid) = component.strip_suffix(".tx") {
      let Some(mut tx) = self.txs.remove(rid) else {
        info!(component = %component, "no running tx component");
        return;
      };
      let id = tx.id();
      let _ = self.dispatch_tx.send(DispatchCmd::Unregister { id: id.clone() });
      match tx.stop().await {
        Ok(()) => self.ctrl.set_state(&id, DriverState::Stopped),
        Err(e) => error!(id = %id, error = %e, "heartbeat control stop failure"),
      }
    } else if let Some(rid) = component.strip_suffix(".rx") {
      let Some(mut rx) = self.rxs.remove(rid) else {
        info!(component = %component, "no running rx component");
        return;
      };
      let id = rx.id();
      match rx.stop().await {
        Ok(()) => self.ctrl.set_state(&id, DriverState::Stopped),
        Err(e) => error!(id = %id, error = %e, "heartbeat control stop failure"),
      }
    } else if let Err(e) = self.stop_rid(component).await {
      error!(component = %component, error = %e, "heartbeat control stop failure");
    }
  }

  async fn daemon_ctl_start(&mut self, component: &str) {
    let rid = component
      .strip_suffix(".tx")
      .or_else(|| component.strip_suffix(".rx"))
      .unwrap_or(component);
    let configurer = match self.configured_component(rid) {
      Ok(Some(c)) => c,
      Ok(None) => {
        info!(component = %component, "no configured component");
        return;
      }
      Err(e) => {
        error!(component = %component, error = %e, "heartbeat control start failure");
        return;
      }
    };
    let result = if component.ends_with(".tx") {
      self.start_tx(configurer.as_ref()).await
    } else if component.ends_with(".rx") {
      self.start_rx(configurer.as_ref()).await
    } else {
      self.start_driver(configurer.as_ref()).await
    };
    if let Err(e) = result {
      error!(component = %component, error = %e, "heartbeat control start failure");
    } else {
      self.rid_signature.insert(rid.to_string(), configurer.signature());
    }
  }

  fn configured_component(&self, rid: &str) -> Result<Option<Box<dyn HbConfigurer>>, HbError> {
    let cluster = ClusterConfig::load(&self.conf_path)?;
    for (section_rid, section) in cluster.hb_sections() {
      if section_rid == rid {
        return self
          .factory
          .configure(&section_rid, &section, &self.localnode, &cluster)
          .map(Some);
      }
    }
    Ok(None)
  }
}

// ============================================================================
// Dispatcher and reader tasks
// ============================================================================

/// Fan every outgoing payload out to the registered tx queues. A full tx
/// queue drops the payload for that tx only; the next payload carries the
/// same generations again.
async fn dispatcher(
  mut data_rx: mpsc::Receiver<Vec<u8>>,
  mut cmd_rx: mpsc::UnboundedReceiver<DispatchCmd>,
  cancel: CancellationToken,
) {
  let mut queues: HashMap<String, mpsc::Sender<Vec<u8>>> = HashMap::new();
  debug!("hb dispatcher started");
  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => {
        debug!("hb dispatcher stopped");
        return;
      }

      cmd = cmd_rx.recv() => {
        match cmd {
          Some(DispatchCmd::Register { id, queue }) => {
            debug!(id = %id, "add to hb transmitters");
            queues.insert(id, queue);
          }
          Some(DispatchCmd::Unregister { id }) => {
            debug!(id = %id, "remove from hb transmitters");
            queues.remove(&id);
          }
          None => return,
        }
      }

      payload = data_rx.recv() => {
        let Some(payload) = payload else { return };
        for (id, queue) in &queues {
          if queue.try_send(payload.clone()).is_err() {
            debug!(id = %id, "tx queue full, payload skipped");
          }
        }
      }
    }
  }
}

/// Drain the shared receive queue and apply each message to the store by
/// kind. Self-originated messages are filtered out first.
async fn reader(
  localnode: String,
  mut read_rx: mpsc::Receiver<Msg>,
  store: StoreHandle,
  ctrl: CtrlHandle,
  cancel: CancellationToken,
) {
  debug!("hb reader started");
  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => {
        debug!("hb reader stopped");
        return;
      }

      msg = read_rx.recv() => {
        let Some(msg) = msg else { return };
        let peer = msg.nodename().to_string();
        if peer == localnode {
          continue;
        }
        ctrl.peer_seen(&peer);
        debug!(peer = %peer, kind = msg.kind_str(), "received heartbeat message");
        match msg {
          Msg::Patch { gen, from_gen, deltas, .. } => {
            if let Err(e) = store.apply_patch(&peer, gen, from_gen, deltas).await {
              // a gap flags the peer for a full; the next full resyncs
              info!(peer = %peer, error = %e, "apply patch");
            }
          }
          Msg::Full { full, .. } => {
            if let Err(e) = store.apply_full(&peer, *full).await {
              error!(peer = %peer, error = %e, "apply full");
            }
          }
          Msg::Ping { .. } => {
            if let Err(e) = store.apply_ping(&peer).await {
              error!(peer = %peer, error = %e, "apply ping");
            }
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::Mutex;

  use hive_core::config::HbSection;
  use hive_core::node::NodeState;

  struct RecordingFactory {
    log: Arc<Mutex<Vec<String>>>,
  }

  impl DriverFactory for RecordingFactory {
    fn configure(
      &self,
      rid: &str,
      section: &HbSection,
      localnode: &str,
      cluster: &ClusterConfig,
    ) -> Result<Box<dyn HbConfigurer>, HbError> {
      let peers = cluster.peers(localnode);
      Ok(Box::new(FakeConfigurer {
        rid: rid.to_string(),
        signature: driver::section_signature(rid, section, &peers),
        log: self.log.clone(),
      }))
    }
  }

  struct FakeConfigurer {
    rid: String,
    signature: String,
    log: Arc<Mutex<Vec<String>>>,
  }

  impl HbConfigurer for FakeConfigurer {
    fn name(&self) -> String {
      self.rid.clone()
    }

    fn signature(&self) -> String {
      self.signature.clone()
    }

    fn tx(&self) -> Box<dyn HbTransmitter> {
      Box::new(FakeHalf {
        id: format!("{}.tx", self.rid),
        log: self.log.clone(),
      })
    }

    fn rx(&self) -> Box<dyn HbReceiver> {
      Box::new(FakeHalf {
        id: format!("{}.rx", self.rid),
        log: self.log.clone(),
      })
    }
  }

  struct FakeHalf {
    id: String,
    log: Arc<Mutex<Vec<String>>>,
  }

  impl FakeHalf {
    fn record(&self, what: &str) {
      self.log.lock().unwrap().push(format!("{what} {}", self.id));
    }
  }

  #[async_trait]
  impl HbTransmitter for FakeHalf {
    fn id(&self) -> String {
      self.id.clone()
    }

    async fn start(
      &mut self,
      _ctrl: CtrlHandle,
      _msg_rx: mpsc::Receiver<Vec<u8>>,
      _cancel: CancellationToken,
    ) -> Result<(), HbError> {
      self.record("start");
      Ok(())
    }

    async fn stop(&mut self) -> Result<(), HbError> {
      self.record("stop");
      Ok(())
    }
  }

  #[async_trait]
  impl HbReceiver for FakeHalf {
    fn id(&self) -> String {
      self.id.clone()
    }

    async fn start(
      &mut self,
      _ctrl: CtrlHandle,
      _read_tx: mpsc::Sender<Msg>,
      _cancel: CancellationToken,
    ) -> Result<(), HbError> {
      self.record("start");
      Ok(())
    }

    async fn stop(&mut self) -> Result<(), HbError> {
      self.record("stop");
      Ok(())
    }
  }

  struct TestHb {
    hb: Heartbeats,
    log: Arc<Mutex<Vec<String>>>,
    store: StoreHandle,
    conf_path: PathBuf,
    _dir: tempfile::TempDir,
    cancel: CancellationToken,
  }

  impl TestHb {
    fn ops(&self) -> Vec<String> {
      self.log.lock().unwrap().clone()
    }

    fn clear(&self) {
      self.log.lock().unwrap().clear();
    }
  }

  fn write_conf(path: &PathBuf, body: &str) {
    std::fs::write(path, body).unwrap();
  }

  fn test_hb(initial_conf: &str) -> TestHb {
    let dir = tempfile::tempdir().unwrap();
    let conf_path = dir.path().join("cluster.conf");
    write_conf(&conf_path, initial_conf);

    let bus = Bus::new("test");
    let (hb_tx, hb_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let store = store::spawn("n1", bus.clone(), hb_tx, cancel.clone());
    let log = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(RecordingFactory { log: log.clone() });
    let hb = Heartbeats::new(
      "n1",
      conf_path.clone(),
      bus,
      store.clone(),
      hb_rx,
      factory,
      cancel.clone(),
    );
    TestHb {
      hb,
      log,
      store,
      conf_path,
      _dir: dir,
      cancel,
    }
  }

  const CONF_V1: &str = r#"
[cluster]
name = "c1"
nodes = ["n1", "n2"]

[hb.1]
port = 10001
"#;

  const CONF_V2: &str = r#"
[cluster]
name = "c1"
nodes = ["n1", "n2"]

[hb.1]
port = 10002

[hb.2]
port = 10003
"#;

  #[tokio::test]
  async fn rescan_stops_before_starting() {
    let mut t = test_hb(CONF_V1);
    t.hb.rescan().await.unwrap();
    assert_eq!(t.ops(), vec!["start hb#1.rx", "start hb#1.tx"]);

    // no change: no transitions
    t.clear();
    t.hb.rescan().await.unwrap();
    assert!(t.ops().is_empty(), "{:?}", t.ops());

    // hb#1 changed, hb#2 new
    t.clear();
    write_conf(&t.conf_path, CONF_V2);
    t.hb.rescan().await.unwrap();
    assert_eq!(
      t.ops(),
      vec![
        "stop hb#1.tx",
        "stop hb#1.rx",
        "start hb#1.rx",
        "start hb#1.tx",
        "start hb#2.rx",
        "start hb#2.tx",
      ]
    );
    t.cancel.cancel();
  }

  #[tokio::test]
  async fn rescan_stops_removed_drivers() {
    let mut t = test_hb(CONF_V2);
    t.hb.rescan().await.unwrap();
    t.clear();

    write_conf(&t.conf_path, CONF_V1);
    t.hb.rescan().await.unwrap();
    // hb#2 disappeared, hb#1 changed back
    assert_eq!(
      t.ops(),
      vec![
        "stop hb#2.tx",
        "stop hb#2.rx",
        "stop hb#1.tx",
        "stop hb#1.rx",
        "start hb#1.rx",
        "start hb#1.tx",
      ]
    );
    t.cancel.cancel();
  }

  #[tokio::test]
  async fn reader_applies_full_once() {
    let t = test_hb(CONF_V1);
    let mut state = NodeState::new("n2");
    state.gen.insert("n2".to_string(), 4);
    state.status.agent = "test".to_string();

    t.hb
      .read_tx
      .send(Msg::Full {
        nodename: "n2".to_string(),
        gen: state.gen.clone(),
        full: Box::new(state),
      })
      .await
      .unwrap();

    // wait for the reader to drain and the store to apply
    let mut merged = None;
    for _ in 0..50 {
      tokio::time::sleep(Duration::from_millis(10)).await;
      let gens = t.store.gens().await.unwrap();
      if let Some(g) = gens.merged_from_peer.get("n2") {
        merged = Some(*g);
        break;
      }
    }
    assert_eq!(merged, Some(4));
    t.cancel.cancel();
  }

  #[tokio::test]
  async fn reader_filters_self_messages() {
    let t = test_hb(CONF_V1);
    t.hb
      .read_tx
      .send(Msg::Ping {
        nodename: "n1".to_string(),
        gen: Default::default(),
      })
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // the local node never becomes its own peer
    let state = t.store.get_node_state("n1").await.unwrap().unwrap();
    assert_eq!(state.gen.len(), 1);
    t.cancel.cancel();
  }
}
