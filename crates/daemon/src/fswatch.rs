//! Filesystem observer over the configuration directory.
//!
//! Bridges notify's sync callbacks into the async world through a channel,
//! debounces per file, then publishes `CfgFileUpdated`/`CfgFileRemoved` for
//! object configuration files and reloads the node configuration into the
//! store when `node.conf` changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use bus::{Bus, Label};
use hive_core::config::NodeConf;
use hive_core::paths::Layout;
use store::StoreHandle;

#[derive(Debug, thiserror::Error)]
pub enum FsWatchError {
  #[error("initialize watcher: {0}")]
  Init(#[source] notify::Error),

  #[error("watch {path}: {source}")]
  Watch {
    path: String,
    #[source]
    source: notify::Error,
  },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChangeKind {
  Updated,
  Removed,
}

struct PendingChange {
  kind: ChangeKind,
  last_event: Instant,
}

/// Async task watching `<etc>` for configuration file changes.
pub struct FsWatcher {
  layout: Layout,
  localnode: String,
  bus: Bus,
  store: StoreHandle,
  cancel: CancellationToken,
  debounce: Duration,
  // held to keep the notify backend alive
  _watcher: RecommendedWatcher,
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
}

impl FsWatcher {
  pub fn new(
    layout: Layout,
    localnode: String,
    bus: Bus,
    store: StoreHandle,
    cancel: CancellationToken,
  ) -> Result<Self, FsWatchError> {
    let etc = layout.etc();
    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);
    let mut watcher = RecommendedWatcher::new(
      move |res| {
        // notify's thread: a full or closed channel drops the event, the
        // per-object watcher re-reads on the next event anyway
        let _ = event_tx.blocking_send(res);
      },
      Config::default(),
    )
    .map_err(FsWatchError::Init)?;
    watcher
      .watch(&etc, RecursiveMode::Recursive)
      .map_err(|source| FsWatchError::Watch {
        path: etc.display().to_string(),
        source,
      })?;
    info!(dir = %etc.display(), "config watcher initialized");
    Ok(Self {
      layout,
      localnode,
      bus,
      store,
      cancel,
      debounce: Duration::from_millis(100),
      _watcher: watcher,
      event_rx,
    })
  }

  pub async fn run(mut self) {
    let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();
    let mut flush = tokio::time::interval(self.debounce);
    info!("config watcher started");
    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!("config watcher stopped");
          return;
        }

        event = self.event_rx.recv() => {
          match event {
            Some(Ok(event)) => self.note_event(&mut pending, event),
            Some(Err(e)) => warn!(error = %e, "config watcher error"),
            None => {
              info!("config watcher stopped (channel closed)");
              return;
            }
          }
        }

        _ = flush.tick() => {
          self.flush_settled(&mut pending).await;
        }
      }
    }
  }

  fn note_event(&self, pending: &mut HashMap<PathBuf, PendingChange>, event: Event) {
    let kind = match event.kind {
      EventKind::Create(_) | EventKind::Modify(_) => ChangeKind::Updated,
      EventKind::Remove(_) => ChangeKind::Removed,
      EventKind::Access(_) | EventKind::Any | EventKind::Other => return,
    };
    for path in event.paths {
      if path.extension().map(|e| e != "conf").unwrap_or(true) {
        trace!(file = %path.display(), "ignoring non-conf file");
        continue;
      }
      // rename shows up as remove+create; a later event wins
      pending.insert(
        path,
        PendingChange {
          kind,
          last_event: Instant::now(),
        },
      );
    }
  }

  async fn flush_settled(&self, pending: &mut HashMap<PathBuf, PendingChange>) {
    let now = Instant::now();
    let settled: Vec<PathBuf> = pending
      .iter()
      .filter(|(_, change)| now.duration_since(change.last_event) >= self.debounce)
      .map(|(path, _)| path.clone())
      .collect();
    for file in settled {
      let Some(change) = pending.remove(&file) else { continue };
      self.emit(&file, change.kind).await;
    }
  }

  async fn emit(&self, file: &PathBuf, kind: ChangeKind) {
    if *file == self.layout.node_conf() {
      if kind == ChangeKind::Updated {
        match NodeConf::load(file) {
          Ok(conf) => {
            debug!("node configuration changed");
            if let Err(e) = self.store.set_node_config(conf).await {
              warn!(error = %e, "push node config");
            }
          }
          Err(e) => warn!(error = %e, "reload node config"),
        }
      }
      return;
    }
    let Some(path) = self.layout.object_from_conf(file) else {
      trace!(file = %file.display(), "not an object config file");
      return;
    };
    let labels = vec![Label::node(&self.localnode), Label::path(&path)];
    let event = match kind {
      ChangeKind::Updated => {
        debug!(object = %path, file = %file.display(), "config file updated");
        bus::Event::CfgFileUpdated {
          path,
          filename: file.clone(),
        }
      }
      ChangeKind::Removed => {
        debug!(object = %path, file = %file.display(), "config file removed");
        bus::Event::CfgFileRemoved {
          path,
          filename: file.clone(),
        }
      }
    };
    self.bus.publish(event, labels);
  }
}
