//! Schedule entries and the schedule expression grammar.
//!
//! An expression is either empty (never runs), an interval form `@<n>[smhd]`
//! (bare `@<n>` is minutes), or a daily `HH:MM` form. The scheduler
//! materialises entries into one-shot timers with
//! [`Entry::next_after`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::path::ObjectPath;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
  #[error("invalid schedule expression {0:?}")]
  InvalidExpression(String),
}

// ============================================================================
// Expression
// ============================================================================

/// A parsed schedule expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expr {
  /// Never fires.
  Never,
  /// Fires every interval, measured from the last run.
  Interval(Duration),
  /// Fires daily at a fixed UTC time.
  Daily(NaiveTime),
}

impl FromStr for Expr {
  type Err = ScheduleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if s.is_empty() {
      return Ok(Expr::Never);
    }
    if let Some(rest) = s.strip_prefix('@') {
      let (digits, unit) = match rest.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
      };
      let n: i64 = digits
        .parse()
        .map_err(|_| ScheduleError::InvalidExpression(s.to_string()))?;
      if n == 0 {
        return Ok(Expr::Never);
      }
      let interval = match unit {
        "s" => Duration::seconds(n),
        "" | "m" => Duration::minutes(n),
        "h" => Duration::hours(n),
        "d" => Duration::days(n),
        _ => return Err(ScheduleError::InvalidExpression(s.to_string())),
      };
      return Ok(Expr::Interval(interval));
    }
    if let Some((h, m)) = s.split_once(':') {
      let hour: u32 = h.parse().map_err(|_| ScheduleError::InvalidExpression(s.to_string()))?;
      let minute: u32 = m.parse().map_err(|_| ScheduleError::InvalidExpression(s.to_string()))?;
      let time =
        NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| ScheduleError::InvalidExpression(s.to_string()))?;
      return Ok(Expr::Daily(time));
    }
    Err(ScheduleError::InvalidExpression(s.to_string()))
  }
}

impl Expr {
  /// The next fire time at or after `now`, given the last run time.
  pub fn next_after(&self, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match self {
      Expr::Never => None,
      Expr::Interval(interval) => match last_run {
        Some(last) => {
          let due = last + *interval;
          Some(if due > now { due } else { now })
        }
        None => Some(now),
      },
      Expr::Daily(time) => {
        let today = Utc.from_utc_datetime(&now.date_naive().and_time(*time));
        if today > now {
          Some(today)
        } else {
          Some(today + Duration::days(1))
        }
      }
    }
  }
}

// ============================================================================
// Definitions and entries
// ============================================================================

/// A schedule definition as declared in an object or node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDef {
  pub key: String,
  pub action: String,
  #[serde(default)]
  pub schedule: String,
  #[serde(default)]
  pub require_collector: bool,
  #[serde(default)]
  pub require_provisioned: bool,
  /// Command line to run, for action runners that spawn processes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub command: Option<String>,
}

/// A materialised schedule entry, owned by the scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
  /// None for node-level entries.
  pub path: Option<ObjectPath>,
  pub def: ScheduleDef,
  pub last_run_at: Option<DateTime<Utc>>,
  pub last_success_at: Option<DateTime<Utc>>,
  pub next_run_at: Option<DateTime<Utc>>,
}

impl Entry {
  pub fn new(path: Option<ObjectPath>, def: ScheduleDef) -> Self {
    Self {
      path,
      def,
      ..Default::default()
    }
  }

  /// The map key of the entry, `<path>:<key>` with an empty path part for
  /// node entries.
  pub fn key(&self) -> String {
    match &self.path {
      Some(p) => format!("{}:{}", p, self.def.key),
      None => format!(":{}", self.def.key),
    }
  }

  /// Compute the next fire time at or after `now`.
  pub fn next_after(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let expr: Expr = self.def.schedule.parse()?;
    Ok(expr.next_after(now, self.last_run_at))
  }
}

impl fmt::Display for Entry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.path {
      Some(p) => write!(f, "object {} {}", p, self.def.key),
      None => write!(f, "node {}", self.def.key),
    }
  }
}
