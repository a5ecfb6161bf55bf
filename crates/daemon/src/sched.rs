//! Event-driven local scheduler.
//!
//! Materialises declared schedules into one-shot timers. Scheduling is
//! gated by the node monitor state and, per object, by the provisioning
//! state published with object status updates. Completed jobs are fed back
//! into the loop so they reschedule from their recorded begin time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bus::{Bus, Event, EventKind, Label};
use hive_core::path::ObjectPath;
use hive_core::schedule::Entry;
use hive_core::SessionId;
use store::StoreHandle;

/// Begin times closer to the planned fire time than this are recorded as
/// the planned time, so reschedules do not drift.
const DRIFT_TOLERANCE_MS: i64 = 500;

// ============================================================================
// Action runners
// ============================================================================

/// The seam between the scheduler and whatever executes actions.
#[async_trait]
pub trait ActionRunner: Send + Sync {
  async fn run(&self, entry: &Entry) -> Result<(), String>;
}

/// Logs the action without executing anything.
pub struct LogRunner;

#[async_trait]
impl ActionRunner for LogRunner {
  async fn run(&self, entry: &Entry) -> Result<(), String> {
    info!(entry = %entry, action = %entry.def.action, "run action");
    Ok(())
  }
}

/// Spawns the entry command through the shell, propagating the session id
/// so sub-processes share their parent's output cache.
pub struct CmdRunner {
  session: SessionId,
}

impl CmdRunner {
  pub fn new(session: SessionId) -> Self {
    Self { session }
  }
}

#[async_trait]
impl ActionRunner for CmdRunner {
  async fn run(&self, entry: &Entry) -> Result<(), String> {
    let Some(command) = &entry.def.command else {
      info!(entry = %entry, action = %entry.def.action, "no command, action recorded only");
      return Ok(());
    };
    let status = tokio::process::Command::new("/bin/sh")
      .arg("-c")
      .arg(command)
      .env(hive_core::session::SESSION_ENV, self.session.to_string())
      .status()
      .await
      .map_err(|e| e.to_string())?;
    if status.success() {
      Ok(())
    } else {
      Err(format!("exit status {status}"))
    }
  }
}

// ============================================================================
// Jobs
// ============================================================================

struct Job {
  queued_at: DateTime<Utc>,
  entry: Entry,
  cancel: CancellationToken,
}

#[derive(Default)]
struct Jobs {
  map: HashMap<String, Job>,
}

impl Jobs {
  fn add(&mut self, entry: Entry, cancel: CancellationToken) {
    self.map.insert(
      entry.key(),
      Job {
        queued_at: Utc::now(),
        entry,
        cancel,
      },
    );
  }

  fn del(&mut self, entry: &Entry) {
    if let Some(job) = self.map.remove(&entry.key()) {
      job.cancel.cancel();
    }
  }

  fn del_path(&mut self, path: Option<&ObjectPath>) {
    let keys: Vec<String> = self
      .map
      .iter()
      .filter(|(_, job)| job.entry.path.as_ref() == path)
      .map(|(k, _)| k.clone())
      .collect();
    for key in keys {
      if let Some(job) = self.map.remove(&key) {
        job.cancel.cancel();
      }
    }
  }

  fn purge(&mut self) {
    for (_, job) in self.map.drain() {
      job.cancel.cancel();
    }
  }

  fn has_path(&self, path: &ObjectPath) -> bool {
    self.map.values().any(|job| job.entry.path.as_ref() == Some(path))
  }
}

/// Armed job description, for status queries.
#[derive(Debug, Clone)]
pub struct JobView {
  pub key: String,
  pub queued_at: DateTime<Utc>,
  pub next_run_at: Option<DateTime<Utc>>,
  pub last_run_at: Option<DateTime<Utc>>,
  pub last_success_at: Option<DateTime<Utc>>,
}

struct JobDone {
  entry: Entry,
  begin: DateTime<Utc>,
  ok: bool,
}

enum Query {
  Jobs { reply: oneshot::Sender<Vec<JobView>> },
  Enabled { reply: oneshot::Sender<bool> },
}

/// Query handle on a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
  tx: mpsc::Sender<Query>,
}

impl SchedulerHandle {
  pub async fn jobs(&self) -> Vec<JobView> {
    let (reply, rx) = oneshot::channel();
    if self.tx.send(Query::Jobs { reply }).await.is_err() {
      return Vec::new();
    }
    rx.await.unwrap_or_default()
  }

  pub async fn enabled(&self) -> bool {
    let (reply, rx) = oneshot::channel();
    if self.tx.send(Query::Enabled { reply }).await.is_err() {
      return false;
    }
    rx.await.unwrap_or(false)
  }
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler {
  localnode: String,
  bus: Bus,
  store: StoreHandle,
  runner: Arc<dyn ActionRunner>,
  collector_alive: Arc<AtomicBool>,
  cancel: CancellationToken,

  enabled: bool,
  provisioned: HashMap<ObjectPath, bool>,
  jobs: Jobs,

  done_tx: mpsc::Sender<JobDone>,
  done_rx: mpsc::Receiver<JobDone>,
  query_rx: mpsc::Receiver<Query>,
}

impl Scheduler {
  pub fn new(
    localnode: String,
    bus: Bus,
    store: StoreHandle,
    runner: Arc<dyn ActionRunner>,
    collector_alive: Arc<AtomicBool>,
    cancel: CancellationToken,
  ) -> (Self, SchedulerHandle) {
    let (done_tx, done_rx) = mpsc::channel(64);
    let (query_tx, query_rx) = mpsc::channel(16);
    (
      Self {
        localnode,
        bus,
        store,
        runner,
        collector_alive,
        cancel,
        enabled: false,
        provisioned: HashMap::new(),
        jobs: Jobs::default(),
        done_tx,
        done_rx,
        query_rx,
      },
      SchedulerHandle { tx: query_tx },
    )
  }

  pub async fn run(mut self) {
    let sub = self.bus.sub("scheduler");
    let local = Label::node(&self.localnode);
    sub.add_filter(EventKind::InstanceConfigUpdated, vec![local.clone()]);
    sub.add_filter(EventKind::InstanceStatusDeleted, vec![local.clone()]);
    sub.add_filter(EventKind::ObjectStatusUpdated, vec![local.clone()]);
    sub.add_filter(EventKind::ObjectStatusDeleted, vec![local.clone()]);
    sub.add_filter(EventKind::NodeConfigUpdated, vec![local.clone()]);
    sub.add_filter(EventKind::NodeMonitorUpdated, vec![local]);
    sub.start();
    info!("scheduler started");

    let cancel = self.cancel.clone();
    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          self.jobs.purge();
          info!("scheduler stopped");
          return;
        }

        done = self.done_rx.recv() => {
          if let Some(JobDone { mut entry, begin, ok }) = done {
            entry.last_run_at = Some(begin);
            if ok {
              entry.last_success_at = Some(begin);
            }
            self.create_job(entry);
          }
        }

        query = self.query_rx.recv() => {
          match query {
            Some(Query::Jobs { reply }) => {
              let views = self
                .jobs
                .map
                .values()
                .map(|job| JobView {
                  key: job.entry.key(),
                  queued_at: job.queued_at,
                  next_run_at: job.entry.next_run_at,
                  last_run_at: job.entry.last_run_at,
                  last_success_at: job.entry.last_success_at,
                })
                .collect();
              let _ = reply.send(views);
            }
            Some(Query::Enabled { reply }) => {
              let _ = reply.send(self.enabled);
            }
            None => {}
          }
        }

        ev = sub.recv() => {
          match ev {
            Some(Event::NodeMonitorUpdated { monitor, .. }) => self.on_node_monitor(monitor.state).await,
            Some(Event::ObjectStatusUpdated { path, status, .. }) => {
              self.on_object_status(path, status.provisioned.is_usable()).await;
            }
            Some(Event::ObjectStatusDeleted { path, .. }) => {
              self.provisioned.remove(&path);
              self.unschedule(&path, "object deleted");
            }
            Some(Event::InstanceConfigUpdated { path, .. }) => {
              if self.enabled {
                info!(object = %path, "update schedules");
                self.unschedule(&path, "config updated");
                self.schedule_object(&path).await;
              }
            }
            Some(Event::NodeConfigUpdated { .. }) => {
              if self.enabled {
                info!("update node schedules");
                self.jobs.del_path(None);
                self.schedule_node().await;
              }
            }
            Some(Event::InstanceStatusDeleted { path, .. }) => {
              self.unschedule(&path, "instance deleted");
            }
            Some(_) => {}
            None => return,
          }
        }
      }
    }
  }

  async fn on_node_monitor(&mut self, state: hive_core::node::NodeMonitorState) {
    let incompatible = state.blocks_scheduling();
    if incompatible && self.enabled {
      info!(state = ?state, "disable scheduling");
      self.jobs.purge();
      self.enabled = false;
    } else if !incompatible && !self.enabled {
      info!(state = ?state, "enable scheduling");
      self.enabled = true;
      self.schedule_all().await;
    }
  }

  async fn on_object_status(&mut self, path: ObjectPath, is_provisioned: bool) {
    self.provisioned.insert(path.clone(), is_provisioned);
    let has_any = self.jobs.has_path(&path);
    if is_provisioned && !has_any {
      self.schedule_object(&path).await;
    } else if !is_provisioned && has_any {
      self.unschedule(&path, "no longer provisioned");
    }
  }

  async fn schedule_all(&mut self) {
    let paths = match self.store.instance_paths().await {
      Ok(paths) => paths,
      Err(e) => {
        error!(error = %e, "list instance paths");
        return;
      }
    };
    for path in paths {
      self.schedule_object(&path).await;
    }
    self.schedule_node().await;
  }

  async fn schedule_object(&mut self, path: &ObjectPath) {
    if !self.enabled {
      return;
    }
    match self.provisioned.get(path) {
      None => {
        debug!(object = %path, "provisioned state not discovered yet");
        return;
      }
      Some(false) => {
        info!(object = %path, "not provisioned, not scheduling");
        return;
      }
      Some(true) => {}
    }
    let config = match self.store.get_instance_config(path).await {
      Ok(Some(config)) => config,
      Ok(None) => return,
      Err(e) => {
        error!(object = %path, error = %e, "read instance config");
        return;
      }
    };
    for def in config.schedules {
      self.create_job(Entry::new(Some(path.clone()), def));
    }
  }

  async fn schedule_node(&mut self) {
    if !self.enabled {
      return;
    }
    let state = match self.store.get_node_state(&self.localnode).await {
      Ok(Some(state)) => state,
      Ok(None) => return,
      Err(e) => {
        error!(error = %e, "read node state");
        return;
      }
    };
    for def in state.config.schedule_defs() {
      self.create_job(Entry::new(None, def));
    }
  }

  fn unschedule(&mut self, path: &ObjectPath, reason: &str) {
    if self.jobs.has_path(path) {
      info!(object = %path, "unschedule jobs ({reason})");
      self.jobs.del_path(Some(path));
    }
  }

  /// Arm a one-shot timer for one entry.
  fn create_job(&mut self, mut entry: Entry) {
    self.jobs.del(&entry);
    if !self.enabled {
      return;
    }
    let now = Utc::now();
    let next = match entry.next_after(now) {
      Ok(Some(next)) => next,
      Ok(None) => return,
      Err(e) => {
        warn!(entry = %entry, definition = %entry.def.schedule, error = %e, "unusable schedule");
        return;
      }
    };
    if next < now {
      return;
    }
    entry.next_run_at = Some(next);
    let delay = (next - now).to_std().unwrap_or_default();
    debug!(entry = %entry, next = %next, delay = ?delay, "armed");

    let cancel = CancellationToken::new();
    let job_cancel = cancel.clone();
    let runner = self.runner.clone();
    let collector_alive = self.collector_alive.clone();
    let done_tx = self.done_tx.clone();
    let job_entry = entry.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = job_cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
      }
      let mut begin = Utc::now();
      if begin - next < Duration::milliseconds(DRIFT_TOLERANCE_MS) {
        begin = next;
      }
      // a skipped action records a run, never a success
      let ok = if job_entry.def.require_collector && !collector_alive.load(Ordering::Relaxed) {
        debug!(entry = %job_entry, "collector not alive, action skipped");
        false
      } else {
        match runner.run(&job_entry).await {
          Ok(()) => true,
          Err(e) => {
            error!(entry = %job_entry, error = %e, "action failed");
            false
          }
        }
      };
      let _ = done_tx
        .send(JobDone {
          entry: job_entry,
          begin,
          ok,
        })
        .await;
    });
    self.jobs.add(entry, cancel);
  }
}
