//! Object paths.
//!
//! Every managed object is identified by a `(namespace, kind, name)` triplet
//! with a canonical lowercase string form. The default namespace is `root`
//! and the default kind is `svc`, both elided from the string form, so
//! `ns1/svc/s1`, `cfg/c1` and `s1` are all canonical.
//!
//! Parsing and formatting are inverses: any path produced by [`ObjectPath::parse`]
//! renders back to the string it was parsed from.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Separator between the namespace, kind and name parts.
pub const SEPARATOR: char = '/';

// RFC 952 hostname grammar, the validity rule for names and namespaces.
static HOSTNAME_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[a-z]([a-z0-9-]+\.?)*[a-z0-9]$").expect("hostname regex"));

// ============================================================================
// Kind
// ============================================================================

/// The closed set of object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
  /// A service orchestrated across its scope.
  Svc,
  /// A persistent volume claimable by services.
  Vol,
  /// A configmap-like key/value object.
  Cfg,
  /// A secret key/value object, fetched on every node.
  Sec,
  /// A user object holding credentials and grants.
  Usr,
  /// The cluster configuration object.
  Ccfg,
  /// A namespace configuration object.
  Nscfg,
}

impl Kind {
  pub const ALL: [Kind; 7] = [
    Kind::Svc,
    Kind::Vol,
    Kind::Cfg,
    Kind::Sec,
    Kind::Usr,
    Kind::Ccfg,
    Kind::Nscfg,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Kind::Svc => "svc",
      Kind::Vol => "vol",
      Kind::Cfg => "cfg",
      Kind::Sec => "sec",
      Kind::Usr => "usr",
      Kind::Ccfg => "ccfg",
      Kind::Nscfg => "nscfg",
    }
  }
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Kind {
  type Err = PathError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "svc" => Ok(Kind::Svc),
      "vol" => Ok(Kind::Vol),
      "cfg" => Ok(Kind::Cfg),
      "sec" => Ok(Kind::Sec),
      "usr" => Ok(Kind::Usr),
      "ccfg" => Ok(Kind::Ccfg),
      "nscfg" => Ok(Kind::Nscfg),
      _ => Err(PathError::InvalidKind(s.to_string())),
    }
  }
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons a path can not be allocated.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PathError {
  #[error("invalid path: invalid kind {0}")]
  InvalidKind(String),

  #[error("invalid path: name is empty")]
  EmptyName,

  #[error("invalid path: invalid name {0} (rfc952)")]
  InvalidName(String),

  #[error("invalid path: invalid namespace {0} (rfc952)")]
  InvalidNamespace(String),

  #[error("invalid path: reserved name {0}")]
  ReservedName(String),

  #[error("invalid path: {0}")]
  Malformed(String),
}

// ============================================================================
// ObjectPath
// ============================================================================

/// A namespaced object identifier. Ex: `ns1/svc/s1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPath {
  namespace: String,
  kind: Kind,
  name: String,
}

impl ObjectPath {
  /// Allocate a path from its elements, applying defaults and validity rules.
  ///
  /// Empty kind defaults to `svc`, empty namespace to `root`. Both the name
  /// and the namespace must satisfy the RFC 952 hostname grammar. Kind
  /// keywords and `node` are reserved and can not be used as names.
  /// `kind=nscfg` forces `name=namespace`.
  pub fn new(name: &str, namespace: &str, kind: &str) -> Result<Self, PathError> {
    let mut name = name.to_lowercase();
    let namespace = if namespace.is_empty() {
      "root".to_string()
    } else {
      namespace.to_lowercase()
    };
    let kind = if kind.is_empty() { "svc" } else { kind };
    let kind: Kind = kind.to_lowercase().parse()?;

    if kind == Kind::Nscfg {
      name = "namespace".to_string();
    }
    if name.is_empty() {
      return Err(PathError::EmptyName);
    }
    if !HOSTNAME_RE.is_match(&name) {
      return Err(PathError::InvalidName(name));
    }
    if !HOSTNAME_RE.is_match(&namespace) {
      return Err(PathError::InvalidNamespace(namespace));
    }
    if name == "node" || Kind::ALL.iter().any(|k| k.as_str() == name) {
      return Err(PathError::ReservedName(name));
    }
    Ok(Self { namespace, kind, name })
  }

  /// Parse a path string representation.
  pub fn parse(s: &str) -> Result<Self, PathError> {
    let s = s.to_lowercase();
    let l: Vec<&str> = s.split(SEPARATOR).collect();
    match l.as_slice() {
      [namespace, kind, name] => Self::new(name, namespace, kind),
      [namespace, ""] => Self::new("namespace", namespace, "nscfg"),
      [kind, name] => Self::new(name, "root", kind),
      ["cluster"] => Self::new("cluster", "root", "ccfg"),
      [name] => Self::new(name, "root", "svc"),
      _ => Err(PathError::Malformed(s.clone())),
    }
  }

  /// The cluster configuration object path, `root/ccfg/cluster`.
  pub fn cluster() -> Self {
    Self {
      namespace: "root".to_string(),
      kind: Kind::Ccfg,
      name: "cluster".to_string(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn kind(&self) -> Kind {
    self.kind
  }

  /// True if the object matches the pattern, using fnmatch semantics with
  /// case folding and `/`-separator awareness, plus the masks hiding the
  /// root namespace and the svc default kind:
  ///
  /// - `**` matches every path;
  /// - `*` matches all svc objects in all namespaces, and all root-namespace
  ///   short forms;
  /// - `svc/foo` also matches the root-namespace `foo`;
  /// - `*/svc/foo` also matches the root-namespace `foo`.
  pub fn matches(&self, pattern: &str) -> bool {
    let s = self.to_string();
    let l: Vec<&str> = pattern.split(SEPARATOR).collect();
    match l.as_slice() {
      ["**"] => true,
      ["*"] => fnmatch("*/svc/*", &s) || fnmatch("*", &s),
      [_] => fnmatch(pattern, &s),
      [first, last] => {
        if *first == "svc" && fnmatch(last, &s) {
          return true;
        }
        let pattern = pattern.replacen("**", "*/*", 1);
        fnmatch(&pattern, &s)
      }
      [first, mid, last] => {
        if *first == "*" && *mid == "svc" && fnmatch(last, &s) {
          return true;
        }
        fnmatch(pattern, &s)
      }
      _ => false,
    }
  }
}

impl fmt::Display for ObjectPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut s = String::new();
    if self.namespace != "root" {
      s.push_str(&self.namespace);
      s.push(SEPARATOR);
    }
    // The svc kind is elided in the root namespace, and so is ccfg for the
    // cluster object. Other ccfg names keep their kind so the string parses
    // back to the same path.
    let elide_kind = s.is_empty()
      && (self.kind == Kind::Svc || (self.kind == Kind::Ccfg && self.name == "cluster"));
    if !elide_kind {
      s.push_str(self.kind.as_str());
      s.push(SEPARATOR);
    }
    s.push_str(&self.name);
    f.write_str(&s)
  }
}

impl FromStr for ObjectPath {
  type Err = PathError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl Serialize for ObjectPath {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for ObjectPath {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Self::parse(&s).map_err(serde::de::Error::custom)
  }
}

// ============================================================================
// Matching helpers
// ============================================================================

// fnmatch with FNM_IGNORECASE|FNM_PATHNAME semantics: `*` and `?` do not
// cross `/`, matching is case folded. Invalid patterns match nothing.
fn fnmatch(pattern: &str, s: &str) -> bool {
  globset::GlobBuilder::new(pattern)
    .case_insensitive(true)
    .literal_separator(true)
    .build()
    .map(|g| g.compile_matcher().is_match(s))
    .unwrap_or(false)
}

/// Merge an explicit selector with a kind restriction and a default.
///
/// An explicit selector wins. Without one, a kind restriction selects every
/// object of that kind, and an empty kind falls back to the default pattern.
pub fn merge_selector(selector: &str, kind: &str, default: &str) -> String {
  if !selector.is_empty() {
    selector.to_string()
  } else if !kind.is_empty() {
    format!("*/{kind}/*")
  } else {
    default.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_three_part() {
    let p = ObjectPath::parse("ns1/svc/s1").unwrap();
    assert_eq!(p.namespace(), "ns1");
    assert_eq!(p.kind(), Kind::Svc);
    assert_eq!(p.name(), "s1");
    assert_eq!(p.to_string(), "ns1/svc/s1");
  }

  #[test]
  fn parse_cluster_shortcut() {
    let p = ObjectPath::parse("cluster").unwrap();
    assert_eq!(p.namespace(), "root");
    assert_eq!(p.kind(), Kind::Ccfg);
    assert_eq!(p.name(), "cluster");
    assert_eq!(p.to_string(), "cluster");
  }

  #[test]
  fn parse_defaults() {
    let p = ObjectPath::parse("foo").unwrap();
    assert_eq!(p.namespace(), "root");
    assert_eq!(p.kind(), Kind::Svc);
    assert_eq!(p.to_string(), "foo");

    let p = ObjectPath::parse("cfg/c1").unwrap();
    assert_eq!(p.kind(), Kind::Cfg);
    assert_eq!(p.to_string(), "cfg/c1");
  }

  #[test]
  fn parse_namespace_config() {
    let p = ObjectPath::parse("ns1/").unwrap();
    assert_eq!(p.kind(), Kind::Nscfg);
    assert_eq!(p.name(), "namespace");
  }

  #[test]
  fn rejects_invalid() {
    assert!(ObjectPath::parse("ns1/bad-kind/s1").is_err());
    assert!(ObjectPath::new("", "", "").is_err());
    assert!(ObjectPath::new("-leading", "", "").is_err());
    assert!(ObjectPath::new("Node_", "", "").is_err());
  }

  #[test]
  fn rejects_reserved_names() {
    assert!(ObjectPath::parse("node").is_err());
    for kind in Kind::ALL {
      assert!(
        ObjectPath::new(kind.as_str(), "", "svc").is_err(),
        "{kind} should be reserved"
      );
    }
  }

  #[test]
  fn round_trips() {
    for s in ["ns1/svc/s1", "foo", "cfg/c1", "cluster", "ns2/vol/v1", "sec/s2", "ccfg/c9"] {
      let p = ObjectPath::parse(s).unwrap();
      assert_eq!(ObjectPath::parse(&p.to_string()).unwrap(), p, "round trip {s}");
    }
  }

  #[test]
  fn case_folds() {
    let p = ObjectPath::parse("NS1/SVC/S1").unwrap();
    assert_eq!(p.to_string(), "ns1/svc/s1");
  }

  #[test]
  fn match_masks() {
    let p = ObjectPath::parse("foo").unwrap();
    assert!(p.matches("**"));
    assert!(p.matches("*"));
    assert!(p.matches("svc/foo"));
    assert!(p.matches("*/svc/foo"));
    assert!(!p.matches("bar"));

    let p = ObjectPath::parse("ns1/svc/s1").unwrap();
    assert!(p.matches("**"));
    assert!(p.matches("*"));
    assert!(p.matches("ns1/svc/*"));
    assert!(p.matches("*/svc/s1"));
    assert!(!p.matches("s1"));

    let p = ObjectPath::parse("cfg/c1").unwrap();
    assert!(p.matches("**"));
    assert!(p.matches("cfg/*"));
    assert!(!p.matches("*/svc/*"));
  }

  #[test]
  fn match_is_case_insensitive() {
    let p = ObjectPath::parse("ns1/svc/s1").unwrap();
    assert!(p.matches("NS1/SVC/*"));
  }

  #[test]
  fn everything_matches_double_star() {
    for s in ["a1", "ns1/svc/s1", "cfg/c1", "cluster", "ns9/sec/tls"] {
      assert!(ObjectPath::parse(s).unwrap().matches("**"), "{s} should match **");
    }
  }

  #[test]
  fn json_form_is_the_string() {
    let p = ObjectPath::parse("ns1/svc/s1").unwrap();
    assert_eq!(serde_json::to_string(&p).unwrap(), "\"ns1/svc/s1\"");
    let q: ObjectPath = serde_json::from_str("\"ns1/svc/s1\"").unwrap();
    assert_eq!(p, q);
  }

  #[test]
  fn merge_selector_contract() {
    assert_eq!(merge_selector("ns1/**", "svc", "**"), "ns1/**");
    assert_eq!(merge_selector("", "vol", "**"), "*/vol/*");
    assert_eq!(merge_selector("", "", "**"), "**");
  }
}
