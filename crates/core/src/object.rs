//! Object-level status, aggregated from instance statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::{Avail, InstanceStatus, Provisioned};

/// The aggregate status of an object across its instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectStatus {
  #[serde(default)]
  pub avail: Avail,
  #[serde(default)]
  pub provisioned: Provisioned,
  pub updated: Option<DateTime<Utc>>,
}

impl ObjectStatus {
  /// Aggregate instance statuses into an object status.
  ///
  /// Avail is up if any instance is up, down if all are down, warn
  /// otherwise. Provisioned is the unanimous value, mixed when instances
  /// disagree, n/a when no instance reports one.
  pub fn aggregate<'a>(statuses: impl Iterator<Item = &'a InstanceStatus>, now: DateTime<Utc>) -> Self {
    let mut avails = Vec::new();
    let mut provs = Vec::new();
    for status in statuses {
      avails.push(status.avail);
      provs.push(status.provisioned);
    }
    let avail = if avails.is_empty() || avails.iter().all(|a| matches!(a, Avail::Undef | Avail::NotApplicable)) {
      Avail::Undef
    } else if avails.contains(&Avail::Up) {
      Avail::Up
    } else if avails.iter().all(|a| *a == Avail::Down) {
      Avail::Down
    } else {
      Avail::Warn
    };
    let provs: Vec<Provisioned> = provs
      .into_iter()
      .filter(|p| *p != Provisioned::NotApplicable)
      .collect();
    let provisioned = if provs.is_empty() {
      Provisioned::NotApplicable
    } else if provs.iter().all(|p| *p == Provisioned::True) {
      Provisioned::True
    } else if provs.iter().all(|p| *p == Provisioned::False) {
      Provisioned::False
    } else {
      Provisioned::Mixed
    };
    Self {
      avail,
      provisioned,
      updated: Some(now),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn status(avail: Avail, provisioned: Provisioned) -> InstanceStatus {
    InstanceStatus {
      avail,
      provisioned,
      updated: None,
    }
  }

  #[test]
  fn aggregates_avail() {
    let now = Utc::now();
    let up = status(Avail::Up, Provisioned::True);
    let down = status(Avail::Down, Provisioned::True);

    let agg = ObjectStatus::aggregate([&up, &down].into_iter(), now);
    assert_eq!(agg.avail, Avail::Up);

    let agg = ObjectStatus::aggregate([&down, &down].into_iter(), now);
    assert_eq!(agg.avail, Avail::Down);

    let agg = ObjectStatus::aggregate([].into_iter(), now);
    assert_eq!(agg.avail, Avail::Undef);
  }

  #[test]
  fn aggregates_provisioned() {
    let now = Utc::now();
    let t = status(Avail::Up, Provisioned::True);
    let f = status(Avail::Up, Provisioned::False);
    let na = status(Avail::Up, Provisioned::NotApplicable);

    assert_eq!(
      ObjectStatus::aggregate([&t, &t].into_iter(), now).provisioned,
      Provisioned::True
    );
    assert_eq!(
      ObjectStatus::aggregate([&t, &f].into_iter(), now).provisioned,
      Provisioned::Mixed
    );
    assert_eq!(
      ObjectStatus::aggregate([&t, &na].into_iter(), now).provisioned,
      Provisioned::True
    );
    assert_eq!(
      ObjectStatus::aggregate([&na].into_iter(), now).provisioned,
      Provisioned::NotApplicable
    );
  }
}
