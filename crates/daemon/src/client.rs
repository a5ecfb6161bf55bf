//! Client for the peer daemon API endpoints the control plane consumes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hive_core::instance::Instance;
use hive_core::path::ObjectPath;

/// Default daemon API port.
pub const DEFAULT_API_PORT: u16 = 1215;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error(transparent)]
  Http(#[from] reqwest::Error),

  #[error("{url}: unexpected status {status}")]
  Status { url: String, status: u16 },
}

/// Body of the object config file PUT.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFilePut {
  pub data: Vec<u8>,
  pub mtime: DateTime<Utc>,
}

/// Envelope of the object GET: the instances of the object per node.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ObjectEnvelope {
  #[serde(default)]
  pub instances: BTreeMap<String, Instance>,
}

#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  port: u16,
}

impl ApiClient {
  pub fn new(port: u16) -> Self {
    Self {
      http: reqwest::Client::new(),
      port,
    }
  }

  fn url(&self, node: &str, path: &str) -> String {
    format!("http://{node}:{}{path}", self.port)
  }

  fn object_url(&self, node: &str, path: &ObjectPath, tail: &str) -> String {
    self.url(
      node,
      &format!(
        "/object/{}/{}/{}{tail}",
        path.namespace(),
        path.kind(),
        path.name()
      ),
    )
  }

  /// `GET /daemon/running`
  pub async fn daemon_running(&self, node: &str) -> Result<bool, ApiError> {
    let url = self.url(node, "/daemon/running");
    let resp = self.http.get(&url).send().await?;
    if !resp.status().is_success() {
      return Err(ApiError::Status {
        url,
        status: resp.status().as_u16(),
      });
    }
    Ok(resp.json().await?)
  }

  /// `POST /daemon/stop/{node}`
  pub async fn daemon_stop(&self, node: &str) -> Result<(), ApiError> {
    let url = self.url(node, &format!("/daemon/stop/{node}"));
    let resp = self.http.post(&url).send().await?;
    if !resp.status().is_success() {
      return Err(ApiError::Status {
        url,
        status: resp.status().as_u16(),
      });
    }
    Ok(())
  }

  /// `GET /object/{ns}/{kind}/{name}`, the per-node instance envelope.
  pub async fn get_object(&self, node: &str, path: &ObjectPath) -> Result<ObjectEnvelope, ApiError> {
    let url = self.object_url(node, path, "");
    let resp = self.http.get(&url).send().await?;
    if !resp.status().is_success() {
      return Err(ApiError::Status {
        url,
        status: resp.status().as_u16(),
      });
    }
    Ok(resp.json().await?)
  }

  /// `GET /object/{ns}/{kind}/{name}/config/file`, the raw config bytes.
  pub async fn get_object_config(&self, node: &str, path: &ObjectPath) -> Result<Vec<u8>, ApiError> {
    let url = self.object_url(node, path, "/config/file");
    let resp = self.http.get(&url).send().await?;
    if !resp.status().is_success() {
      return Err(ApiError::Status {
        url,
        status: resp.status().as_u16(),
      });
    }
    Ok(resp.bytes().await?.to_vec())
  }

  /// `PUT /object/{ns}/{kind}/{name}/config/file`
  pub async fn put_object_config(
    &self,
    node: &str,
    path: &ObjectPath,
    data: Vec<u8>,
    mtime: DateTime<Utc>,
  ) -> Result<(), ApiError> {
    let url = self.object_url(node, path, "/config/file");
    let resp = self
      .http
      .put(&url)
      .json(&ConfigFilePut { data, mtime })
      .send()
      .await?;
    if !resp.status().is_success() {
      return Err(ApiError::Status {
        url,
        status: resp.status().as_u16(),
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn object_urls() {
    let client = ApiClient::new(1215);
    let path = ObjectPath::parse("ns1/svc/s1").unwrap();
    assert_eq!(
      client.object_url("n2", &path, "/config/file"),
      "http://n2:1215/object/ns1/svc/s1/config/file"
    );
  }
}
