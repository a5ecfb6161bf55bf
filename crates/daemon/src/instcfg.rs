//! Per-object configuration watcher.
//!
//! One watcher runs per local object configuration file. It keeps the
//! store's InstanceConfig in sync with the file: on each trigger it checks
//! the mtime, checksums the content, reloads the cluster sections when it
//! watches the cluster config itself, resolves the scope, and pushes the
//! result into the store.
//!
//! The worker terminates when the file disappears, when the local node
//! leaves the object scope, or on parent cancellation. On exit it deletes
//! its instance config and status from the store and announces completion
//! so discovery can restart a watcher if the file reappeared.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bus::{Bus, Event, EventKind, Label};
use hive_core::config::{ClusterConfig, ObjectConfig};
use hive_core::instance::{InstanceConfig, InstanceStatus};
use hive_core::path::{Kind, ObjectPath};
use hive_core::paths::Layout;
use store::StoreHandle;

#[derive(Debug, thiserror::Error)]
#[error("config file check failed for {0}")]
pub struct ConfigCheckError(pub String);

/// Outcome of one `config_file_check` pass.
enum Check {
  /// Store updated, or nothing to do.
  Ok,
  /// File changed mid-read; re-evaluate on the next trigger.
  Again,
}

pub struct InstCfg {
  path: ObjectPath,
  filename: PathBuf,
  localnode: String,
  bus: Bus,
  store: StoreHandle,
  layout: Layout,
  cluster: Arc<RwLock<ClusterConfig>>,

  last_mtime: Option<SystemTime>,
  force_refresh: bool,
  last_config: Option<InstanceConfig>,
  seeded_status: bool,
}

/// Start a watcher for one object. The first check runs before the worker
/// is spawned: a file that does not parse or does not include the local
/// node never gets a watcher.
#[allow(clippy::too_many_arguments)]
pub async fn start(
  parent: CancellationToken,
  path: ObjectPath,
  filename: PathBuf,
  localnode: String,
  bus: Bus,
  store: StoreHandle,
  layout: Layout,
  cluster: Arc<RwLock<ClusterConfig>>,
) -> Result<(), ConfigCheckError> {
  let mut watcher = InstCfg {
    path: path.clone(),
    filename,
    localnode,
    bus,
    store,
    layout,
    cluster,
    last_mtime: None,
    force_refresh: false,
    last_config: None,
    seeded_status: false,
  };
  match watcher.config_file_check().await {
    Ok(_) => {}
    Err(e) => {
      debug!(object = %path, error = %e, "not starting config watcher");
      return Err(e);
    }
  }
  tokio::spawn(async move {
    watcher.worker(parent).await;
  });
  Ok(())
}

impl InstCfg {
  async fn worker(&mut self, parent: CancellationToken) {
    let sub = self.bus.sub(format!("instcfg.{}", self.path));
    let own_labels = vec![Label::node(&self.localnode), Label::path(&self.path)];
    sub.add_filter(EventKind::CfgFileUpdated, own_labels.clone());
    sub.add_filter(EventKind::CfgFileRemoved, own_labels);
    let cluster_path = ObjectPath::cluster();
    if self.path != cluster_path {
      sub.add_filter(
        EventKind::CfgUpdated,
        vec![Label::node(&self.localnode), Label::path(&cluster_path)],
      );
    }
    sub.start();
    debug!(object = %self.path, "config watcher started");

    loop {
      tokio::select! {
        biased;

        _ = parent.cancelled() => break,

        ev = sub.recv() => {
          match ev {
            Some(Event::CfgFileUpdated { .. }) => {
              if self.config_file_check().await.is_err() {
                break;
              }
            }
            Some(Event::CfgFileRemoved { .. }) => {
              info!(object = %self.path, "config file removed");
              break;
            }
            Some(Event::CfgUpdated { .. }) => {
              // local cluster config changed: scopes may resolve differently
              debug!(object = %self.path, "cluster config changed, refreshing");
              self.force_refresh = true;
              if self.config_file_check().await.is_err() {
                break;
              }
            }
            Some(_) => {}
            None => break,
          }
        }
      }
    }
    self.delete().await;
    debug!(object = %self.path, "config watcher done");
  }

  /// Verify the config file and push changes to the store.
  ///
  /// Skips silently when the mtime did not move and no refresh is forced.
  /// Fails (ending the worker) when the file is gone, does not parse,
  /// resolves to an empty scope, or no longer includes the local node.
  async fn config_file_check(&mut self) -> Result<Check, ConfigCheckError> {
    let fail = || ConfigCheckError(self.path.to_string());

    let mtime = file_mtime(&self.filename).ok_or_else(fail)?;
    if Some(mtime) == self.last_mtime && !self.force_refresh {
      debug!(object = %self.path, "same mtime, skip");
      return Ok(Check::Ok);
    }

    let content = std::fs::read(&self.filename).map_err(|_| fail())?;
    let checksum = format!("{:x}", Md5::new_with_prefix(&content).finalize());

    if self.path == ObjectPath::cluster() {
      match ClusterConfig::load(&self.filename) {
        Ok(conf) => *self.cluster.write().expect("cluster config lock") = conf,
        Err(e) => {
          warn!(error = %e, "reload cluster config sections");
          return Err(fail());
        }
      }
    }

    let config = ObjectConfig::load(&self.filename).map_err(|e| {
      warn!(object = %self.path, error = %e, "parse object config");
      fail()
    })?;
    let cluster_nodes = self.cluster.read().expect("cluster config lock").cluster.nodes.clone();
    let scope = config.scope(&cluster_nodes);
    if scope.is_empty() {
      info!(object = %self.path, "empty scope");
      return Err(fail());
    }

    // the file may have been rewritten while we were reading it; trust
    // nothing and re-evaluate on the next trigger
    let mtime_after = file_mtime(&self.filename).ok_or_else(fail)?;
    if mtime_after != mtime {
      info!(object = %self.path, "config file changed during read, waiting next evaluation");
      return Ok(Check::Again);
    }

    if !scope.iter().any(|n| n == &self.localnode) {
      info!(object = %self.path, "local node no longer in scope");
      return Err(fail());
    }

    self.force_refresh = false;
    self.last_mtime = Some(mtime);
    let updated: DateTime<Utc> = mtime.into();
    let instance_config = InstanceConfig {
      path: Some(self.path.clone()),
      nodename: self.localnode.clone(),
      scope,
      checksum,
      updated: Some(updated),
      schedules: config.schedule_defs(),
    };
    if self.last_config.as_ref() == Some(&instance_config) {
      debug!(object = %self.path, "no config change");
      return Ok(Check::Ok);
    }
    if let Err(e) = self.store.set_instance_config(&self.path, instance_config.clone()).await {
      warn!(object = %self.path, error = %e, "push instance config");
      return Err(fail());
    }
    self.last_config = Some(instance_config);

    // seed an instance status so the object becomes schedulable before any
    // monitor reports a real one
    if !self.seeded_status {
      self.seeded_status = true;
      if let Err(e) = self.store.set_instance_status(&self.path, InstanceStatus::default()).await {
        warn!(object = %self.path, error = %e, "seed instance status");
      }
    }
    Ok(Check::Ok)
  }

  async fn delete(&self) {
    if let Err(e) = self.store.del_instance_config(&self.path).await {
      warn!(object = %self.path, error = %e, "delete instance config");
    }
    if let Err(e) = self.store.del_instance_status(&self.path).await {
      warn!(object = %self.path, error = %e, "delete instance status");
    }
    self.bus.publish(
      Event::ConfigWatcherDone {
        path: self.path.clone(),
        filename: self.filename.clone(),
      },
      vec![Label::node(&self.localnode), Label::path(&self.path)],
    );
  }
}

fn file_mtime(path: &PathBuf) -> Option<SystemTime> {
  std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Secrets are fetched on every node regardless of scope; everything else
/// is only fetched by nodes inside the object scope.
pub fn fetch_regardless_of_scope(path: &ObjectPath) -> bool {
  path.kind() == Kind::Sec
}
