//! Remote configuration fetcher.
//!
//! Downloads an object configuration file from a peer into a temp file,
//! then hands it to discovery through a `RemoteFileConfig` event. Discovery
//! renames the temp file into the canonical location and replies on the
//! embedded channel.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bus::{Bus, Event, Label};
use hive_core::path::ObjectPath;
use hive_core::paths::Layout;
use hive_core::SessionId;

use crate::client::ApiClient;

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Fetch `path` from `node`. Runs until done or cancelled; transient
/// download errors are retried a few times.
#[allow(clippy::too_many_arguments)]
pub async fn fetch(
  client: ApiClient,
  layout: Layout,
  bus: Bus,
  path: ObjectPath,
  node: String,
  updated: DateTime<Utc>,
  localnode: String,
  cancel: CancellationToken,
) {
  let mut attempt = 0;
  let data = loop {
    attempt += 1;
    tokio::select! {
      _ = cancel.cancelled() => {
        debug!(object = %path, node = %node, "fetch cancelled");
        return;
      }
      fetched = client.get_object_config(&node, &path) => {
        match fetched {
          Ok(data) => break data,
          Err(e) if attempt < FETCH_ATTEMPTS => {
            warn!(object = %path, node = %node, error = %e, "fetch config, retrying");
            tokio::time::sleep(FETCH_RETRY_DELAY).await;
          }
          Err(e) => {
            warn!(object = %path, node = %node, error = %e, "fetch config failed");
            return;
          }
        }
      }
    }
  };

  let tmp = layout.tmp().join(format!("fetch.{}.{}", path.to_string().replace('/', "_"), SessionId::new()));
  if let Err(e) = tokio::fs::write(&tmp, &data).await {
    warn!(object = %path, error = %e, "write fetched config");
    return;
  }

  let (reply_tx, mut reply_rx) = mpsc::channel(1);
  bus.publish(
    Event::RemoteFileConfig {
      path: path.clone(),
      node: node.clone(),
      filename: tmp.clone(),
      updated,
      cancel: cancel.clone(),
      reply: reply_tx,
    },
    vec![Label::node(&localnode), Label::path(&path)],
  );
  match reply_rx.recv().await {
    Some(Ok(())) => info!(object = %path, node = %node, "fetched config installed"),
    Some(Err(e)) => {
      warn!(object = %path, node = %node, error = %e, "install fetched config");
      let _ = tokio::fs::remove_file(&tmp).await;
    }
    None => {
      // discovery dropped the request (shutdown or superseded)
      let _ = tokio::fs::remove_file(&tmp).await;
    }
  }
}
