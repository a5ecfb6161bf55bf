//! Per-object config watcher integration tests.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use filetime::FileTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bus::{Bus, Event, Label};
use daemon::instcfg;
use hive_core::config::ClusterConfig;
use hive_core::path::ObjectPath;
use hive_core::paths::Layout;
use store::StoreHandle;

struct TestContext {
  layout: Layout,
  bus: Bus,
  store: StoreHandle,
  cluster: Arc<RwLock<ClusterConfig>>,
  cancel: CancellationToken,
  _hb_rx: mpsc::Receiver<Vec<u8>>,
  _dir: tempfile::TempDir,
}

fn test_context() -> TestContext {
  let dir = tempfile::tempdir().unwrap();
  let layout = Layout::new(dir.path());
  std::fs::create_dir_all(layout.etc()).unwrap();
  let bus = Bus::new("test");
  let (hb_tx, hb_rx) = mpsc::channel(64);
  let cancel = CancellationToken::new();
  let store = store::spawn("n1", bus.clone(), hb_tx, cancel.clone());
  TestContext {
    layout,
    bus,
    store,
    cluster: Arc::new(RwLock::new(ClusterConfig::default())),
    cancel,
    _hb_rx: hb_rx,
    _dir: dir,
  }
}

fn write_object_conf(t: &TestContext, path: &ObjectPath, nodes: &[&str]) -> PathBuf {
  let file = t.layout.object_conf(path);
  std::fs::create_dir_all(file.parent().unwrap()).unwrap();
  let nodes = nodes
    .iter()
    .map(|n| format!("\"{n}\""))
    .collect::<Vec<_>>()
    .join(", ");
  std::fs::write(&file, format!("[default]\nnodes = [{nodes}]\n")).unwrap();
  file
}

async fn start_watcher(t: &TestContext, path: &ObjectPath, file: &PathBuf) -> Result<(), instcfg::ConfigCheckError> {
  instcfg::start(
    t.cancel.child_token(),
    path.clone(),
    file.clone(),
    "n1".to_string(),
    t.bus.clone(),
    t.store.clone(),
    t.layout.clone(),
    t.cluster.clone(),
  )
  .await
}

fn bump_mtime(file: &PathBuf) {
  let mtime = FileTime::from_unix_time(FileTime::now().unix_seconds() + 2, 0);
  filetime::set_file_mtime(file, mtime).unwrap();
}

async fn settle() {
  tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn pushes_instance_config_into_the_store() {
  let t = test_context();
  let path = ObjectPath::parse("foo").unwrap();
  let file = write_object_conf(&t, &path, &["n2", "n1"]);

  start_watcher(&t, &path, &file).await.unwrap();

  let config = t.store.get_instance_config(&path).await.unwrap().unwrap();
  assert_eq!(config.nodename, "n1");
  assert_eq!(config.scope, vec!["n1".to_string(), "n2".to_string()]);
  assert!(!config.checksum.is_empty());
  assert!(config.updated.is_some());

  // an instance status is seeded so the object becomes schedulable
  let state = t.store.get_node_state("n1").await.unwrap().unwrap();
  assert!(state.instances["foo"].status.is_some());
  t.cancel.cancel();
}

#[tokio::test]
async fn refuses_objects_out_of_scope() {
  let t = test_context();
  let path = ObjectPath::parse("bar").unwrap();
  let file = write_object_conf(&t, &path, &["n2", "n3"]);

  assert!(start_watcher(&t, &path, &file).await.is_err());
  assert!(t.store.get_instance_config(&path).await.unwrap().is_none());
  t.cancel.cancel();
}

#[tokio::test]
async fn unchanged_mtime_does_not_mutate_the_store() {
  let t = test_context();
  let path = ObjectPath::parse("baz").unwrap();
  let file = write_object_conf(&t, &path, &["n1"]);

  start_watcher(&t, &path, &file).await.unwrap();
  settle().await;
  let before = t.store.gens().await.unwrap().gen;

  // file event without an mtime change: checked, skipped, no mutation
  t.bus.publish(
    Event::CfgFileUpdated {
      path: path.clone(),
      filename: file.clone(),
    },
    vec![Label::node("n1"), Label::path(&path)],
  );
  settle().await;
  assert_eq!(t.store.gens().await.unwrap().gen, before);
  t.cancel.cancel();
}

#[tokio::test]
async fn scope_exit_ends_the_watcher_and_cleans_up() {
  let t = test_context();
  let path = ObjectPath::parse("qux").unwrap();
  let file = write_object_conf(&t, &path, &["n1"]);

  start_watcher(&t, &path, &file).await.unwrap();
  settle().await;
  assert!(t.store.get_instance_config(&path).await.unwrap().is_some());

  let done_sub = t.bus.sub("test.done");
  done_sub.add_filter(bus::EventKind::ConfigWatcherDone, vec![Label::path(&path)]);
  done_sub.start();

  // rewrite the scope without the local node
  write_object_conf(&t, &path, &["n2"]);
  bump_mtime(&file);
  t.bus.publish(
    Event::CfgFileUpdated {
      path: path.clone(),
      filename: file.clone(),
    },
    vec![Label::node("n1"), Label::path(&path)],
  );

  match done_sub.recv().await.unwrap() {
    Event::ConfigWatcherDone { path: p, .. } => assert_eq!(p, path),
    other => panic!("unexpected event {other:?}"),
  }
  assert!(t.store.get_instance_config(&path).await.unwrap().is_none());
  t.cancel.cancel();
}

#[tokio::test]
async fn file_removal_ends_the_watcher() {
  let t = test_context();
  let path = ObjectPath::parse("gone").unwrap();
  let file = write_object_conf(&t, &path, &["n1"]);

  start_watcher(&t, &path, &file).await.unwrap();
  settle().await;

  let done_sub = t.bus.sub("test.done");
  done_sub.add_filter(bus::EventKind::ConfigWatcherDone, vec![Label::path(&path)]);
  done_sub.start();

  std::fs::remove_file(&file).unwrap();
  t.bus.publish(
    Event::CfgFileRemoved {
      path: path.clone(),
      filename: file.clone(),
    },
    vec![Label::node("n1"), Label::path(&path)],
  );

  assert!(matches!(done_sub.recv().await, Some(Event::ConfigWatcherDone { .. })));
  assert!(t.store.get_instance_config(&path).await.unwrap().is_none());
  t.cancel.cancel();
}
