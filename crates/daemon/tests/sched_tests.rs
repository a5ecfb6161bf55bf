//! Scheduler integration tests: node monitor gating, provisioning gating,
//! reschedule after completion.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bus::Bus;
use daemon::sched::{ActionRunner, Scheduler, SchedulerHandle};
use hive_core::instance::{InstanceConfig, InstanceStatus, Provisioned};
use hive_core::node::{NodeMonitor, NodeMonitorState};
use hive_core::path::ObjectPath;
use hive_core::schedule::{Entry, ScheduleDef};
use store::StoreHandle;

struct TestRunner {
  runs: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ActionRunner for TestRunner {
  async fn run(&self, entry: &Entry) -> Result<(), String> {
    self.runs.lock().unwrap().push(entry.key());
    Ok(())
  }
}

struct TestContext {
  store: StoreHandle,
  sched: SchedulerHandle,
  runs: Arc<Mutex<Vec<String>>>,
  cancel: CancellationToken,
  _hb_rx: mpsc::Receiver<Vec<u8>>,
}

fn spawn_scheduler() -> TestContext {
  let bus = Bus::new("test");
  let (hb_tx, hb_rx) = mpsc::channel(64);
  let cancel = CancellationToken::new();
  let store = store::spawn("n1", bus.clone(), hb_tx, cancel.clone());
  let runs = Arc::new(Mutex::new(Vec::new()));
  let runner = Arc::new(TestRunner { runs: runs.clone() });
  let (scheduler, handle) = Scheduler::new(
    "n1".to_string(),
    bus,
    store.clone(),
    runner,
    Arc::new(AtomicBool::new(false)),
    cancel.clone(),
  );
  tokio::spawn(scheduler.run());
  TestContext {
    store,
    sched: handle,
    runs,
    cancel,
    _hb_rx: hb_rx,
  }
}

fn sched_def(key: &str, schedule: &str) -> ScheduleDef {
  ScheduleDef {
    key: key.to_string(),
    action: key.to_string(),
    schedule: schedule.to_string(),
    ..Default::default()
  }
}

fn object_config(path: &ObjectPath, defs: Vec<ScheduleDef>) -> InstanceConfig {
  InstanceConfig {
    path: Some(path.clone()),
    nodename: "n1".to_string(),
    scope: vec!["n1".to_string()],
    checksum: "x".to_string(),
    updated: Some(Utc::now()),
    schedules: defs,
  }
}

async fn set_monitor(store: &StoreHandle, state: NodeMonitorState) {
  store
    .set_node_monitor(NodeMonitor {
      state,
      updated: Some(Utc::now()),
    })
    .await
    .unwrap();
}

async fn settle() {
  tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn monitor_state_gates_scheduling() {
  let t = spawn_scheduler();
  let path = ObjectPath::parse("s1").unwrap();

  // three declared schedules, object provisioned
  t.store
    .set_instance_config(
      &path,
      object_config(
        &path,
        vec![
          sched_def("status", "@1h"),
          sched_def("compliance", "@2h"),
          sched_def("pushasset", "@1d"),
        ],
      ),
    )
    .await
    .unwrap();
  t.store
    .set_instance_status(&path, InstanceStatus::default())
    .await
    .unwrap();
  settle().await;

  // still disabled: no jobs, whatever is known
  assert!(!t.sched.enabled().await);
  assert!(t.sched.jobs().await.is_empty());

  set_monitor(&t.store, NodeMonitorState::Idle).await;
  settle().await;
  assert!(t.sched.enabled().await);
  let jobs = t.sched.jobs().await;
  assert_eq!(jobs.len(), 3, "{jobs:?}");
  for job in &jobs {
    assert!(job.next_run_at.unwrap() >= job.queued_at, "{job:?}");
  }
  // entries with no last run fire immediately, then re-arm
  assert!(t.runs.lock().unwrap().len() >= 3);

  // maintenance purges everything
  set_monitor(&t.store, NodeMonitorState::Maintenance).await;
  settle().await;
  assert!(!t.sched.enabled().await);
  assert!(t.sched.jobs().await.is_empty());

  // back to idle: re-armed with fresh next_run_at
  set_monitor(&t.store, NodeMonitorState::Idle).await;
  settle().await;
  assert_eq!(t.sched.jobs().await.len(), 3);
  t.cancel.cancel();
}

#[tokio::test]
async fn provisioning_gates_object_jobs() {
  let t = spawn_scheduler();
  let path = ObjectPath::parse("s2").unwrap();

  t.store
    .set_instance_config(&path, object_config(&path, vec![sched_def("status", "@1h")]))
    .await
    .unwrap();
  set_monitor(&t.store, NodeMonitorState::Idle).await;
  settle().await;
  // provisioned state not discovered yet: nothing armed
  assert!(t.sched.jobs().await.is_empty());

  // n/a provisioned state does not forbid scheduling
  t.store
    .set_instance_status(&path, InstanceStatus::default())
    .await
    .unwrap();
  settle().await;
  assert_eq!(t.sched.jobs().await.len(), 1);

  // explicitly unprovisioned: jobs removed
  t.store
    .set_instance_status(
      &path,
      InstanceStatus {
        provisioned: Provisioned::False,
        ..Default::default()
      },
    )
    .await
    .unwrap();
  settle().await;
  assert!(t.sched.jobs().await.is_empty());

  // provisioned again: re-armed
  t.store
    .set_instance_status(
      &path,
      InstanceStatus {
        provisioned: Provisioned::True,
        ..Default::default()
      },
    )
    .await
    .unwrap();
  settle().await;
  assert_eq!(t.sched.jobs().await.len(), 1);
  t.cancel.cancel();
}

#[tokio::test]
async fn instance_deletion_unschedules() {
  let t = spawn_scheduler();
  let path = ObjectPath::parse("s3").unwrap();

  t.store
    .set_instance_config(&path, object_config(&path, vec![sched_def("status", "@1h")]))
    .await
    .unwrap();
  t.store
    .set_instance_status(&path, InstanceStatus::default())
    .await
    .unwrap();
  set_monitor(&t.store, NodeMonitorState::Idle).await;
  settle().await;
  assert_eq!(t.sched.jobs().await.len(), 1);

  t.store.del_instance_status(&path).await.unwrap();
  settle().await;
  assert!(t.sched.jobs().await.is_empty());
  t.cancel.cancel();
}

#[tokio::test]
async fn collector_gated_actions_record_run_but_not_success() {
  // spawn_scheduler wires collector_alive = false
  let t = spawn_scheduler();
  let path = ObjectPath::parse("s5").unwrap();

  let mut def = sched_def("pushstats", "@1h");
  def.require_collector = true;
  t.store
    .set_instance_config(&path, object_config(&path, vec![def]))
    .await
    .unwrap();
  t.store
    .set_instance_status(&path, InstanceStatus::default())
    .await
    .unwrap();
  set_monitor(&t.store, NodeMonitorState::Idle).await;
  settle().await;

  // the action was skipped, not run
  assert!(t.runs.lock().unwrap().is_empty());
  // the run is recorded so the entry does not re-fire immediately, but a
  // skipped action never counts as a success
  let jobs = t.sched.jobs().await;
  assert_eq!(jobs.len(), 1);
  assert!(jobs[0].last_run_at.is_some());
  assert!(jobs[0].last_success_at.is_none());
  t.cancel.cancel();
}

#[tokio::test]
async fn completed_jobs_reschedule_from_begin_time() {
  let t = spawn_scheduler();
  let path = ObjectPath::parse("s4").unwrap();

  t.store
    .set_instance_config(&path, object_config(&path, vec![sched_def("status", "@1h")]))
    .await
    .unwrap();
  t.store
    .set_instance_status(&path, InstanceStatus::default())
    .await
    .unwrap();
  set_monitor(&t.store, NodeMonitorState::Idle).await;
  settle().await;

  // the first run happened and the entry re-armed one interval out
  assert_eq!(t.runs.lock().unwrap().as_slice(), ["s4:status"]);
  let jobs = t.sched.jobs().await;
  assert_eq!(jobs.len(), 1);
  assert!(jobs[0].last_run_at.is_some());
  assert_eq!(jobs[0].last_success_at, jobs[0].last_run_at);
  let next = jobs[0].next_run_at.unwrap();
  assert!(next > Utc::now() + chrono::Duration::minutes(55), "{next}");
  t.cancel.cancel();
}
