//! Heartbeat driver contract.
//!
//! A driver is a `(tx, rx)` pair built by a config-level
//! [`HbConfigurer`]. The controller only needs `{id, start, stop}` on each
//! half plus `{name, signature, tx, rx}` on the configurer, so transports
//! can be added without touching the rescan algorithm: they plug into a
//! [`DriverFactory`] keyed by the section `type`.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hive_core::config::{ClusterConfig, HbSection};
use store::Msg;

use crate::ctrl::CtrlHandle;
use crate::unicast::UnicastConfigurer;
use crate::HbError;

/// The transmitting half of a driver. `start` consumes a queue of
/// serialized messages fanned out by the dispatcher.
#[async_trait]
pub trait HbTransmitter: Send {
  /// Stable id, `<rid>.tx`.
  fn id(&self) -> String;

  async fn start(
    &mut self,
    ctrl: CtrlHandle,
    msg_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
  ) -> Result<(), HbError>;

  async fn stop(&mut self) -> Result<(), HbError>;
}

/// The receiving half of a driver. `start` feeds parsed messages into the
/// shared read queue.
#[async_trait]
pub trait HbReceiver: Send {
  /// Stable id, `<rid>.rx`.
  fn id(&self) -> String;

  async fn start(
    &mut self,
    ctrl: CtrlHandle,
    read_tx: mpsc::Sender<Msg>,
    cancel: CancellationToken,
  ) -> Result<(), HbError>;

  async fn stop(&mut self) -> Result<(), HbError>;
}

/// A configured driver, able to mint its tx and rx halves.
pub trait HbConfigurer: Send + Sync {
  /// The driver rid, `hb#<n>`.
  fn name(&self) -> String;

  /// Content hash of the driver parameters, compared on rescan.
  fn signature(&self) -> String;

  fn tx(&self) -> Box<dyn HbTransmitter>;

  fn rx(&self) -> Box<dyn HbReceiver>;
}

/// Builds configurers from cluster config sections.
pub trait DriverFactory: Send + Sync {
  fn configure(
    &self,
    rid: &str,
    section: &HbSection,
    localnode: &str,
    cluster: &ClusterConfig,
  ) -> Result<Box<dyn HbConfigurer>, HbError>;
}

/// The built-in driver set.
pub struct DefaultFactory;

impl DriverFactory for DefaultFactory {
  fn configure(
    &self,
    rid: &str,
    section: &HbSection,
    localnode: &str,
    cluster: &ClusterConfig,
  ) -> Result<Box<dyn HbConfigurer>, HbError> {
    match section.kind.as_str() {
      "unicast" => Ok(Box::new(UnicastConfigurer::new(rid, section, localnode, cluster))),
      other => Err(HbError::UnknownDriver(other.to_string())),
    }
  }
}

/// Signature of a driver section: a hash of the rid, the section content
/// and the peer set it binds to.
pub fn section_signature(rid: &str, section: &HbSection, peers: &[String]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(rid.as_bytes());
  hasher.update(toml::to_string(section).unwrap_or_default().as_bytes());
  for peer in peers {
    hasher.update(peer.as_bytes());
  }
  format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn signature_tracks_parameters() {
    let peers = vec!["n2".to_string()];
    let mut section = HbSection::default();
    let a = section_signature("hb#1", &section, &peers);
    assert_eq!(a, section_signature("hb#1", &section, &peers));

    section.port = 12345;
    let b = section_signature("hb#1", &section, &peers);
    assert_ne!(a, b);

    let c = section_signature("hb#2", &section, &peers);
    assert_ne!(b, c);
  }
}
