//! Cooperative file locks for daemon lifecycle operations.
//!
//! A lock is a file created with `O_EXCL`; acquisition polls until the
//! file can be created or the timeout elapses. Dropping the guard removes
//! the file.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
  #[error("lock {path} not acquired within {timeout:?}")]
  Timeout { path: String, timeout: Duration },

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub struct FileLock {
  path: PathBuf,
}

impl FileLock {
  /// Acquire the lock at `path`, polling every `delay` up to `timeout`.
  pub async fn acquire(path: PathBuf, timeout: Duration, delay: Duration) -> Result<Self, LockError> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
      match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
          let _ = writeln!(file, "{}", std::process::id());
          return Ok(Self { path });
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
          if std::time::Instant::now() >= deadline {
            return Err(LockError::Timeout {
              path: path.display().to_string(),
              timeout,
            });
          }
          tokio::time::sleep(delay).await;
        }
        Err(e) => return Err(e.into()),
      }
    }
  }
}

impl Drop for FileLock {
  fn drop(&mut self) {
    if let Err(e) = std::fs::remove_file(&self.path) {
      warn!(path = %self.path.display(), error = %e, "release lock");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn acquires_and_releases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main");
    {
      let _lock = FileLock::acquire(path.clone(), Duration::from_secs(1), Duration::from_millis(10))
        .await
        .unwrap();
      assert!(path.exists());
    }
    assert!(!path.exists());
  }

  #[tokio::test]
  async fn second_acquire_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main");
    let _held = FileLock::acquire(path.clone(), Duration::from_secs(1), Duration::from_millis(10))
      .await
      .unwrap();
    let err = FileLock::acquire(path.clone(), Duration::from_millis(50), Duration::from_millis(10)).await;
    assert!(matches!(err, Err(LockError::Timeout { .. })));
  }
}
