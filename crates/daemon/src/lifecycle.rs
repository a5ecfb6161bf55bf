//! Daemon lifecycle: startup order, signal handling, ordered shutdown,
//! pid file, running probes.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bus::Bus;
use hive_core::config::{ClusterConfig, NodeConf};
use hive_core::node::{NodeMonitor, NodeMonitorState};
use hive_core::paths::Layout;
use hive_core::SessionId;

use crate::client::{ApiClient, DEFAULT_API_PORT};
use crate::discover::Discover;
use crate::fswatch::{FsWatchError, FsWatcher};
use crate::sched::{CmdRunner, Scheduler};

/// Queue between the store and the heartbeat dispatcher.
const HB_SEND_QUEUE_SIZE: usize = 64;

/// Running probe used after a start: `(20 s, 500 ms)`.
pub const START_PROBE: (Duration, Duration) = (Duration::from_secs(20), Duration::from_millis(500));

/// Stopped probe used after a stop: `(4 s, 250 ms)`.
pub const STOP_PROBE: (Duration, Duration) = (Duration::from_secs(4), Duration::from_millis(250));

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
  /// Bootstrap failures abort the daemon start with a distinct exit code.
  #[error("bootstrap: {0}")]
  Bootstrap(String),

  #[error(transparent)]
  Store(#[from] store::StoreError),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl From<FsWatchError> for DaemonError {
  fn from(e: FsWatchError) -> Self {
    DaemonError::Bootstrap(e.to_string())
  }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
  pub layout: Layout,
  pub localnode: String,
  pub session: SessionId,
  pub api_port: u16,
}

impl DaemonConfig {
  pub fn load() -> Self {
    Self {
      layout: Layout::from_env(),
      localnode: crate::hostname(),
      session: SessionId::from_env_or_new(),
      api_port: DEFAULT_API_PORT,
    }
  }
}

pub struct Daemon {
  config: DaemonConfig,
}

impl Daemon {
  pub fn new(config: DaemonConfig) -> Self {
    Self { config }
  }

  /// Run the daemon until SIGINT/SIGTERM.
  ///
  /// Startup order: store, heartbeats, discovery, fs watcher, scheduler.
  /// Shutdown cancels the leaves first and the store last.
  pub async fn run(self) -> Result<(), DaemonError> {
    let cfg = self.config;
    for dir in cfg.layout.mandatory_dirs() {
      std::fs::create_dir_all(&dir)
        .map_err(|e| DaemonError::Bootstrap(format!("create {}: {e}", dir.display())))?;
    }
    // a stale pid file does not prevent start
    std::fs::write(cfg.layout.pid_file(), format!("{}\n", std::process::id()))?;
    info!(node = %cfg.localnode, session = %cfg.session, "daemon starting");

    let root = CancellationToken::new();
    let leaves = root.child_token();
    let store_cancel = CancellationToken::new();

    let bus = Bus::new("daemon");
    let (hb_tx, hb_rx) = mpsc::channel(HB_SEND_QUEUE_SIZE);
    let store = store::spawn(&cfg.localnode, bus.clone(), hb_tx, store_cancel.clone());

    if cfg.layout.node_conf().exists() {
      match NodeConf::load(&cfg.layout.node_conf()) {
        Ok(conf) => store.set_node_config(conf).await?,
        Err(e) => warn!(error = %e, "load node config"),
      }
    }
    let cluster_conf = match ClusterConfig::load(&cfg.layout.cluster_conf()) {
      Ok(conf) => conf,
      Err(e) => {
        warn!(error = %e, "load cluster config, starting with defaults");
        ClusterConfig::default()
      }
    };
    let cluster = Arc::new(RwLock::new(cluster_conf));

    let heartbeats = hb::Heartbeats::new(
      cfg.localnode.clone(),
      cfg.layout.cluster_conf(),
      bus.clone(),
      store.clone(),
      hb_rx,
      Arc::new(hb::DefaultFactory),
      leaves.child_token(),
    );
    let hb_task = tokio::spawn(heartbeats.run());

    let client = ApiClient::new(cfg.api_port);
    let discover = Discover::new(
      cfg.localnode.clone(),
      bus.clone(),
      store.clone(),
      cfg.layout.clone(),
      client,
      cluster.clone(),
      leaves.child_token(),
    );
    let discover_task = tokio::spawn(discover.run());

    let fswatch = FsWatcher::new(
      cfg.layout.clone(),
      cfg.localnode.clone(),
      bus.clone(),
      store.clone(),
      leaves.child_token(),
    )?;
    let fswatch_task = tokio::spawn(fswatch.run());

    let runner = Arc::new(CmdRunner::new(cfg.session));
    let collector_alive = Arc::new(AtomicBool::new(false));
    let (scheduler, sched_handle) = Scheduler::new(
      cfg.localnode.clone(),
      bus.clone(),
      store.clone(),
      runner,
      collector_alive,
      leaves.child_token(),
    );
    let sched_task = tokio::spawn(scheduler.run());

    // all components are listening: enable scheduling
    store
      .set_node_monitor(NodeMonitor {
        state: NodeMonitorState::Idle,
        updated: Some(Utc::now()),
      })
      .await?;
    info!("daemon started");

    wait_for_signal().await;
    info!("daemon shutdown requested");

    // announce, then cancel leaves first and the store last
    if let Err(e) = store
      .set_node_monitor(NodeMonitor {
        state: NodeMonitorState::Shutting,
        updated: Some(Utc::now()),
      })
      .await
    {
      error!(error = %e, "announce shutdown");
    }
    let armed = sched_handle.jobs().await.len();
    if armed > 0 {
      info!(jobs = armed, "cancelling armed jobs");
    }
    leaves.cancel();
    for task in [sched_task, fswatch_task, discover_task, hb_task] {
      let _ = task.await;
    }
    store_cancel.cancel();
    root.cancel();

    if let Err(e) = std::fs::remove_file(cfg.layout.pid_file()) {
      warn!(error = %e, "remove pid file");
    }
    info!("daemon stopped");
    Ok(())
  }
}

async fn wait_for_signal() {
  use tokio::signal::unix::{signal, SignalKind};
  let mut term = match signal(SignalKind::terminate()) {
    Ok(term) => term,
    Err(e) => {
      error!(error = %e, "install SIGTERM handler");
      std::future::pending::<()>().await;
      unreachable!()
    }
  };
  tokio::select! {
    _ = tokio::signal::ctrl_c() => {}
    _ = term.recv() => {}
  }
}

// ============================================================================
// Probes
// ============================================================================

/// True when the pid file names a live process.
pub fn daemon_running(layout: &Layout) -> bool {
  let Ok(content) = std::fs::read_to_string(layout.pid_file()) else {
    return false;
  };
  let Ok(pid) = content.trim().parse::<u32>() else {
    return false;
  };
  std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// The pid recorded by a running daemon.
pub fn daemon_pid(layout: &Layout) -> Option<u32> {
  std::fs::read_to_string(layout.pid_file())
    .ok()
    .and_then(|s| s.trim().parse().ok())
}

/// Poll until the daemon is seen running, with the start probe timing.
pub async fn wait_running(layout: &Layout) -> bool {
  poll(layout, true, START_PROBE).await
}

/// Poll until the daemon is seen stopped, with the stop probe timing.
pub async fn wait_stopped(layout: &Layout) -> bool {
  poll(layout, false, STOP_PROBE).await
}

async fn poll(layout: &Layout, want_running: bool, (timeout, delay): (Duration, Duration)) -> bool {
  let deadline = std::time::Instant::now() + timeout;
  loop {
    if daemon_running(layout) == want_running {
      return true;
    }
    if std::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(delay).await;
  }
}
