//! Discovery: object configuration lifecycle.
//!
//! Owns the per-object configuration watchers and the remote configuration
//! fetchers. Local configuration files get a watcher; configurations
//! announced by peers for objects in the local scope get fetched into
//! place, which in turn creates the file the watcher machinery picks up.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bus::{Bus, Event, EventKind, Label};
use hive_core::config::ClusterConfig;
use hive_core::instance::InstanceConfig;
use hive_core::path::ObjectPath;
use hive_core::paths::Layout;
use store::StoreHandle;

use crate::client::ApiClient;
use crate::fetcher;
use crate::instcfg;

pub struct Discover {
  localnode: String,
  bus: Bus,
  store: StoreHandle,
  layout: Layout,
  client: ApiClient,
  cluster: Arc<RwLock<ClusterConfig>>,
  cancel: CancellationToken,

  /// Paths with a running per-object watcher.
  moncfg: HashSet<String>,
  /// In-flight remote fetches, keyed by path string.
  fetcher_from: HashMap<String, String>,
  fetcher_updated: HashMap<String, DateTime<Utc>>,
  fetcher_cancel: HashMap<String, CancellationToken>,
  /// Per-peer index so a whole peer can be cut off in bulk.
  fetcher_node_cancel: HashMap<String, HashMap<String, CancellationToken>>,
}

impl Discover {
  pub fn new(
    localnode: String,
    bus: Bus,
    store: StoreHandle,
    layout: Layout,
    client: ApiClient,
    cluster: Arc<RwLock<ClusterConfig>>,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      localnode,
      bus,
      store,
      layout,
      client,
      cluster,
      cancel,
      moncfg: HashSet::new(),
      fetcher_from: HashMap::new(),
      fetcher_updated: HashMap::new(),
      fetcher_cancel: HashMap::new(),
      fetcher_node_cancel: HashMap::new(),
    }
  }

  pub async fn run(mut self) {
    let sub = self.bus.sub("discover.cfg");
    let local = Label::node(&self.localnode);
    sub.add_filter(EventKind::CfgFileUpdated, vec![local.clone()]);
    sub.add_filter(EventKind::ConfigWatcherDone, vec![local.clone()]);
    sub.add_filter(EventKind::RemoteFileConfig, vec![local]);
    // remote announcements come labeled with the emitting peer
    sub.add_filter(EventKind::CfgUpdated, vec![]);
    sub.add_filter(EventKind::CfgDeleted, vec![]);
    sub.add_filter(EventKind::PeerStale, vec![]);
    sub.start();

    self.startup_scan().await;
    info!("discovery started");

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!("discovery stopped");
          return;
        }

        ev = sub.recv() => {
          match ev {
            Some(Event::CfgFileUpdated { path, filename }) => {
              self.on_local_cfg_file(path, filename).await;
            }
            Some(Event::ConfigWatcherDone { path, filename }) => {
              self.on_watcher_done(path, filename).await;
            }
            Some(Event::CfgUpdated { path, node, config }) => {
              if node != self.localnode {
                self.on_remote_cfg_updated(path, node, config).await;
              }
            }
            Some(Event::CfgDeleted { path, node }) => {
              if node != self.localnode {
                self.on_remote_cfg_deleted(path, node);
              }
            }
            Some(Event::RemoteFileConfig { path, node, filename, cancel, reply, .. }) => {
              self.on_remote_cfg_fetched(path, node, filename, cancel, reply).await;
            }
            Some(Event::PeerStale { node }) => {
              self.cancel_fetcher_node(&node);
            }
            Some(_) => {}
            None => return,
          }
        }
      }
    }
  }

  /// Pick up configuration files that existed before the daemon started.
  async fn startup_scan(&mut self) {
    let etc = self.layout.etc();
    let mut files = Vec::new();
    scan_conf_files(&etc, &mut files);
    for file in files {
      if let Some(path) = self.layout.object_from_conf(&file) {
        self.on_local_cfg_file(path, file).await;
      }
    }
  }

  async fn on_local_cfg_file(&mut self, path: ObjectPath, filename: PathBuf) {
    let s = path.to_string();
    if self.moncfg.contains(&s) {
      return;
    }
    let started = instcfg::start(
      self.cancel.child_token(),
      path.clone(),
      filename,
      self.localnode.clone(),
      self.bus.clone(),
      self.store.clone(),
      self.layout.clone(),
      self.cluster.clone(),
    )
    .await;
    match started {
      Ok(()) => {
        debug!(object = %s, "started config watcher");
        self.moncfg.insert(s);
        self.write_lists();
      }
      Err(e) => debug!(object = %s, error = %e, "config watcher not started"),
    }
  }

  /// A watcher ended. If the file still exists the object was renamed or
  /// rewritten in place: start a fresh watcher.
  async fn on_watcher_done(&mut self, path: ObjectPath, filename: PathBuf) {
    let s = path.to_string();
    self.moncfg.remove(&s);
    self.write_lists();
    if filename.exists() {
      self.on_local_cfg_file(path, filename).await;
    }
  }

  async fn on_remote_cfg_updated(&mut self, path: ObjectPath, node: String, config: InstanceConfig) {
    let s = path.to_string();
    if self.moncfg.contains(&s) {
      // the local watcher owns this configuration
      return;
    }
    if let Some(in_flight) = self.fetcher_updated.get(&s) {
      let newer = match config.updated {
        Some(updated) => updated > *in_flight,
        None => false,
      };
      if newer {
        info!(object = %s, node = %node, "cancel pending fetch, newer config available");
        self.cancel_fetcher(&s);
      } else {
        debug!(object = %s, node = %node, "ignore remote config, not newer than in-flight fetch");
        return;
      }
    }
    if !instcfg::fetch_regardless_of_scope(&path) && !config.scope.iter().any(|n| n == &self.localnode) {
      debug!(object = %s, node = %node, "ignore remote config, local node not in scope");
      return;
    }
    let Some(updated) = config.updated else {
      debug!(object = %s, node = %node, "ignore remote config without update time");
      return;
    };
    self.fetch_from_remote(path, node, updated);
  }

  fn on_remote_cfg_deleted(&mut self, path: ObjectPath, node: String) {
    let s = path.to_string();
    if self.fetcher_from.get(&s) == Some(&node) {
      info!(object = %s, node = %node, "cancel pending fetch, config no longer present on peer");
      self.cancel_fetcher(&s);
    }
  }

  async fn on_remote_cfg_fetched(
    &mut self,
    path: ObjectPath,
    node: String,
    filename: PathBuf,
    cancel: CancellationToken,
    reply: tokio::sync::mpsc::Sender<Result<(), String>>,
  ) {
    let s = path.to_string();
    if cancel.is_cancelled() {
      let _ = reply.send(Ok(())).await;
      return;
    }
    let target = self.layout.object_conf(&path);
    let result = install_fetched(&filename, &target);
    match &result {
      Ok(()) => info!(object = %s, node = %node, file = %target.display(), "installed fetched config"),
      Err(e) => error!(object = %s, node = %node, error = %e, "install fetched config"),
    }
    let _ = reply.send(result.map_err(|e| e.to_string())).await;
    self.cancel_fetcher(&s);
  }

  fn fetch_from_remote(&mut self, path: ObjectPath, node: String, updated: DateTime<Utc>) {
    let s = path.to_string();
    if let Some(from) = self.fetcher_from.get(&s) {
      error!(object = %s, from = %from, "fetch already in progress");
      return;
    }
    let cancel = self.cancel.child_token();
    self.fetcher_cancel.insert(s.clone(), cancel.clone());
    self.fetcher_from.insert(s.clone(), node.clone());
    self.fetcher_updated.insert(s.clone(), updated);
    self
      .fetcher_node_cancel
      .entry(node.clone())
      .or_default()
      .insert(s.clone(), cancel.clone());

    info!(object = %s, node = %node, "fetch remote config");
    tokio::spawn(fetcher::fetch(
      self.client.clone(),
      self.layout.clone(),
      self.bus.clone(),
      path,
      node,
      updated,
      self.localnode.clone(),
      cancel,
    ));
  }

  fn cancel_fetcher(&mut self, s: &str) {
    if let Some(cancel) = self.fetcher_cancel.remove(s) {
      cancel.cancel();
    }
    if let Some(node) = self.fetcher_from.remove(s) {
      if let Some(per_node) = self.fetcher_node_cancel.get_mut(&node) {
        per_node.remove(s);
        if per_node.is_empty() {
          self.fetcher_node_cancel.remove(&node);
        }
      }
    }
    self.fetcher_updated.remove(s);
  }

  /// Cut off every in-flight fetch from one peer, on heartbeat staleness.
  fn cancel_fetcher_node(&mut self, node: &str) {
    let paths: Vec<String> = self
      .fetcher_node_cancel
      .get(node)
      .map(|m| m.keys().cloned().collect())
      .unwrap_or_default();
    if !paths.is_empty() {
      info!(node = %node, count = paths.len(), "cancel pending fetches from stale peer");
    }
    for s in paths {
      self.cancel_fetcher(&s);
    }
  }

  /// Rewrite the shell completion lists.
  fn write_lists(&self) {
    let mut objects: Vec<&String> = self.moncfg.iter().collect();
    objects.sort();
    let body = objects.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("\n");
    if let Err(e) = std::fs::write(self.layout.list_objects(), body + "\n") {
      warn!(error = %e, "write object list");
    }
    let nodes = self.cluster.read().expect("cluster config lock").cluster.nodes.clone();
    if let Err(e) = std::fs::write(self.layout.list_nodes(), nodes.join("\n") + "\n") {
      warn!(error = %e, "write node list");
    }
  }
}

fn scan_conf_files(dir: &Path, out: &mut Vec<PathBuf>) {
  let Ok(entries) = std::fs::read_dir(dir) else { return };
  for entry in entries.flatten() {
    let path = entry.path();
    if path.is_dir() {
      scan_conf_files(&path, out);
    } else if path.extension().map(|e| e == "conf").unwrap_or(false) {
      out.push(path);
    }
  }
}

fn install_fetched(tmp: &Path, target: &Path) -> std::io::Result<()> {
  if let Some(parent) = target.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::rename(tmp, target)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use tokio::sync::mpsc;

  struct TestDiscover {
    d: Discover,
    cancel: CancellationToken,
    _hb_rx: mpsc::Receiver<Vec<u8>>,
    _dir: tempfile::TempDir,
  }

  fn test_discover() -> TestDiscover {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    let bus = Bus::new("test");
    let (hb_tx, hb_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let store = store::spawn("n1", bus.clone(), hb_tx, cancel.clone());
    let d = Discover::new(
      "n1".to_string(),
      bus,
      store,
      layout,
      ApiClient::new(0),
      Arc::new(RwLock::new(ClusterConfig::default())),
      cancel.clone(),
    );
    TestDiscover {
      d,
      cancel,
      _hb_rx: hb_rx,
      _dir: dir,
    }
  }

  fn remote_config(scope: &[&str], updated: DateTime<Utc>) -> InstanceConfig {
    InstanceConfig {
      path: None,
      nodename: String::new(),
      scope: scope.iter().map(|s| s.to_string()).collect(),
      checksum: "c".to_string(),
      updated: Some(updated),
      schedules: Vec::new(),
    }
  }

  #[tokio::test]
  async fn newer_remote_config_supersedes_in_flight_fetch() {
    let mut t = test_discover();
    let path = ObjectPath::parse("ns1/svc/x").unwrap();
    let s = path.to_string();
    let t1 = Utc::now();

    t.d
      .on_remote_cfg_updated(path.clone(), "na".to_string(), remote_config(&["n1"], t1))
      .await;
    assert_eq!(t.d.fetcher_from.get(&s), Some(&"na".to_string()));
    let first_cancel = t.d.fetcher_cancel.get(&s).unwrap().clone();

    // an older announcement from another peer is ignored
    t.d
      .on_remote_cfg_updated(path.clone(), "nc".to_string(), remote_config(&["n1"], t1 - Duration::seconds(5)))
      .await;
    assert_eq!(t.d.fetcher_from.get(&s), Some(&"na".to_string()));

    // a strictly newer one cancels the in-flight fetch and starts over
    let t2 = t1 + Duration::seconds(5);
    t.d
      .on_remote_cfg_updated(path.clone(), "nb".to_string(), remote_config(&["n1"], t2))
      .await;
    assert!(first_cancel.is_cancelled());
    assert_eq!(t.d.fetcher_from.get(&s), Some(&"nb".to_string()));
    assert_eq!(t.d.fetcher_updated.get(&s), Some(&t2));
    t.cancel.cancel();
  }

  #[tokio::test]
  async fn out_of_scope_configs_are_ignored_except_secrets() {
    let mut t = test_discover();
    let svc = ObjectPath::parse("ns1/svc/x").unwrap();
    let sec = ObjectPath::parse("ns1/sec/tls").unwrap();
    let now = Utc::now();

    t.d
      .on_remote_cfg_updated(svc.clone(), "na".to_string(), remote_config(&["n9"], now))
      .await;
    assert!(t.d.fetcher_from.is_empty());

    t.d
      .on_remote_cfg_updated(sec.clone(), "na".to_string(), remote_config(&["n9"], now))
      .await;
    assert_eq!(t.d.fetcher_from.get(&sec.to_string()), Some(&"na".to_string()));
    t.cancel.cancel();
  }

  #[tokio::test]
  async fn stale_peer_cancels_all_its_fetches() {
    let mut t = test_discover();
    let now = Utc::now();
    let p1 = ObjectPath::parse("ns1/svc/x").unwrap();
    let p2 = ObjectPath::parse("ns1/svc/y").unwrap();
    let p3 = ObjectPath::parse("ns1/svc/z").unwrap();

    t.d
      .on_remote_cfg_updated(p1.clone(), "na".to_string(), remote_config(&["n1"], now))
      .await;
    t.d
      .on_remote_cfg_updated(p2.clone(), "na".to_string(), remote_config(&["n1"], now))
      .await;
    t.d
      .on_remote_cfg_updated(p3.clone(), "nb".to_string(), remote_config(&["n1"], now))
      .await;
    assert_eq!(t.d.fetcher_from.len(), 3);

    t.d.cancel_fetcher_node("na");
    // only the fetch from the healthy peer survives
    assert_eq!(t.d.fetcher_from.len(), 1);
    assert_eq!(t.d.fetcher_from.get(&p3.to_string()), Some(&"nb".to_string()));
    assert!(!t.d.fetcher_node_cancel.contains_key("na"));
    t.cancel.cancel();
  }

  #[tokio::test]
  async fn peer_deletion_cancels_its_fetch_only() {
    let mut t = test_discover();
    let path = ObjectPath::parse("ns1/svc/x").unwrap();
    let s = path.to_string();

    t.d
      .on_remote_cfg_updated(path.clone(), "na".to_string(), remote_config(&["n1"], Utc::now()))
      .await;
    // deletion on an unrelated peer changes nothing
    t.d.on_remote_cfg_deleted(path.clone(), "nb".to_string());
    assert!(t.d.fetcher_from.contains_key(&s));
    // deletion on the fetched-from peer cancels
    t.d.on_remote_cfg_deleted(path.clone(), "na".to_string());
    assert!(!t.d.fetcher_from.contains_key(&s));
    assert!(t.d.fetcher_updated.is_empty());
    assert!(t.d.fetcher_cancel.is_empty());
    t.cancel.cancel();
  }

  #[tokio::test]
  async fn fetched_file_is_installed_in_place() {
    let mut t = test_discover();
    let path = ObjectPath::parse("ns1/svc/x").unwrap();
    let tmp = t.d.layout.tmp();
    std::fs::create_dir_all(&tmp).unwrap();
    let fetched = tmp.join("fetch.tmp");
    std::fs::write(&fetched, "[default]\nnodes = [\"n1\"]\n").unwrap();

    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel(1);
    t.d
      .on_remote_cfg_fetched(
        path.clone(),
        "na".to_string(),
        fetched.clone(),
        CancellationToken::new(),
        reply_tx,
      )
      .await;
    assert!(reply_rx.recv().await.unwrap().is_ok());
    assert!(t.d.layout.object_conf(&path).exists());
    assert!(!fetched.exists());
    t.cancel.cancel();
  }
}
