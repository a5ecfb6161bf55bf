//! Filesystem layout of the daemon.
//!
//! Everything lives under a single root (default `/var/lib/hived`,
//! overridable with `$HIVE_ROOT`): configuration under `etc/`, runtime
//! state under `var/`, locks under `tmp/locks/`.

use std::path::{Path, PathBuf};

use crate::path::ObjectPath;

pub const ROOT_ENV: &str = "HIVE_ROOT";

#[derive(Debug, Clone)]
pub struct Layout {
  root: PathBuf,
}

impl Layout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn from_env() -> Self {
    match std::env::var_os(ROOT_ENV) {
      Some(root) => Self::new(PathBuf::from(root)),
      None => Self::new("/var/lib/hived"),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn etc(&self) -> PathBuf {
    self.root.join("etc")
  }

  pub fn var(&self) -> PathBuf {
    self.root.join("var")
  }

  pub fn tmp(&self) -> PathBuf {
    self.root.join("tmp")
  }

  pub fn lock_dir(&self) -> PathBuf {
    self.tmp().join("locks")
  }

  pub fn main_lock(&self) -> PathBuf {
    self.lock_dir().join("main")
  }

  pub fn cli_lock(&self) -> PathBuf {
    self.lock_dir().join("cli")
  }

  pub fn pid_file(&self) -> PathBuf {
    self.var().join("hived.pid")
  }

  pub fn list_objects(&self) -> PathBuf {
    self.var().join("list.objects")
  }

  pub fn list_nodes(&self) -> PathBuf {
    self.var().join("list.nodes")
  }

  pub fn node_conf(&self) -> PathBuf {
    self.etc().join("node.conf")
  }

  pub fn cluster_conf(&self) -> PathBuf {
    self.object_conf(&ObjectPath::cluster())
  }

  /// Configuration file of an object: `<etc>/<kind>/<name>.conf` in the
  /// root namespace, `<etc>/<ns>/<kind>/<name>.conf` elsewhere.
  pub fn object_conf(&self, path: &ObjectPath) -> PathBuf {
    let mut p = self.etc();
    if path.namespace() != "root" {
      p.push(path.namespace());
    }
    p.push(path.kind().as_str());
    p.push(format!("{}.conf", path.name()));
    p
  }

  /// The object path a configuration file belongs to, if any.
  pub fn object_from_conf(&self, file: &Path) -> Option<ObjectPath> {
    let rel = file.strip_prefix(self.etc()).ok()?;
    if rel.extension()?.to_str()? != "conf" {
      return None;
    }
    let name = rel.file_stem()?.to_str()?;
    let parts: Vec<&str> = rel
      .parent()?
      .components()
      .filter_map(|c| c.as_os_str().to_str())
      .collect();
    match parts.as_slice() {
      [kind] => ObjectPath::new(name, "root", kind).ok(),
      [namespace, kind] => ObjectPath::new(name, namespace, kind).ok(),
      _ => None,
    }
  }

  /// The directories that must exist before the daemon can run.
  pub fn mandatory_dirs(&self) -> Vec<PathBuf> {
    vec![self.etc(), self.var(), self.tmp(), self.lock_dir()]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn object_conf_layout() {
    let layout = Layout::new("/r");
    let p = ObjectPath::parse("foo").unwrap();
    assert_eq!(layout.object_conf(&p), PathBuf::from("/r/etc/svc/foo.conf"));
    let p = ObjectPath::parse("ns1/vol/v1").unwrap();
    assert_eq!(layout.object_conf(&p), PathBuf::from("/r/etc/ns1/vol/v1.conf"));
    assert_eq!(layout.cluster_conf(), PathBuf::from("/r/etc/ccfg/cluster.conf"));
  }

  #[test]
  fn conf_file_round_trip() {
    let layout = Layout::new("/r");
    for s in ["foo", "ns1/svc/s1", "cfg/c1", "cluster"] {
      let p = ObjectPath::parse(s).unwrap();
      let file = layout.object_conf(&p);
      assert_eq!(layout.object_from_conf(&file), Some(p), "{s}");
    }
  }

  #[test]
  fn ignores_foreign_files() {
    let layout = Layout::new("/r");
    assert_eq!(layout.object_from_conf(Path::new("/r/etc/node.conf")), None);
    assert_eq!(layout.object_from_conf(Path::new("/r/etc/svc/foo.bak")), None);
    assert_eq!(layout.object_from_conf(Path::new("/elsewhere/svc/foo.conf")), None);
  }
}
