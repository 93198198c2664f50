use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use url::Url;

use super::{RemoteError, RemoteStore};
use crate::Digest;

/// Remote store speaking the plain HTTP cache protocol:
///
/// ```text
/// GET|PUT|HEAD {base}/cas/{sha256}   blob bytes
/// GET|PUT      {base}/ac/{sha256}    JSON-encoded result digest
/// ```
pub struct HttpRemoteStore {
  client: Client,
  base: Url,
  concurrency: usize,
}

impl HttpRemoteStore {
  /// Create a client for the cache at `base_url`.
  pub fn new(
    base_url: &str,
    request_timeout: Duration,
    concurrency: usize,
  ) -> Result<Self, RemoteError> {
    let mut base =
      Url::parse(base_url).map_err(|e| RemoteError::Rejected(format!("{}: {}", base_url, e)))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    let client = Client::builder()
      .timeout(request_timeout)
      .build()
      .map_err(|e| RemoteError::Rejected(e.to_string()))?;
    Ok(Self {
      client,
      base,
      concurrency: concurrency.max(1),
    })
  }

  fn url(&self, kind: &str, digest: Digest) -> Result<Url, RemoteError> {
    self
      .base
      .join(&format!("{}/{}", kind, digest.hash.to_hex()))
      .map_err(|e| RemoteError::Rejected(e.to_string()))
  }

  async fn get(&self, kind: &str, digest: Digest) -> Result<Option<Bytes>, RemoteError> {
    let response = self
      .client
      .get(self.url(kind, digest)?)
      .send()
      .await
      .map_err(classify_transport)?;

    match response.status() {
      StatusCode::NOT_FOUND => Ok(None),
      status if status.is_success() => {
        let body = response.bytes().await.map_err(classify_transport)?;
        Ok(Some(body))
      }
      status => Err(classify_status(status)),
    }
  }

  async fn put(&self, kind: &str, digest: Digest, body: Bytes) -> Result<(), RemoteError> {
    let response = self
      .client
      .put(self.url(kind, digest)?)
      .body(body)
      .send()
      .await
      .map_err(classify_transport)?;

    if response.status().is_success() {
      Ok(())
    } else {
      Err(classify_status(response.status()))
    }
  }

  async fn head(&self, digest: Digest) -> Result<bool, RemoteError> {
    let response = self
      .client
      .head(self.url("cas", digest)?)
      .send()
      .await
      .map_err(classify_transport)?;

    match response.status() {
      StatusCode::NOT_FOUND => Ok(false),
      status if status.is_success() => Ok(true),
      status => Err(classify_status(status)),
    }
  }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
  async fn load(&self, digest: Digest) -> Result<Option<Bytes>, RemoteError> {
    self.get("cas", digest).await
  }

  async fn store(&self, digest: Digest, bytes: Bytes) -> Result<(), RemoteError> {
    self.put("cas", digest, bytes).await
  }

  async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, RemoteError> {
    let checked: Vec<(Digest, bool)> = futures::stream::iter(digests.iter().copied())
      .map(|digest| async move { self.head(digest).await.map(|present| (digest, present)) })
      .buffer_unordered(self.concurrency)
      .try_collect()
      .await?;

    Ok(
      checked
        .into_iter()
        .filter(|(_, present)| !present)
        .map(|(digest, _)| digest)
        .collect(),
    )
  }

  async fn get_action(&self, action: Digest) -> Result<Option<Digest>, RemoteError> {
    match self.get("ac", action).await? {
      Some(body) => serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| RemoteError::InvalidResponse(format!("action cache entry: {}", e))),
      None => Ok(None),
    }
  }

  async fn put_action(&self, action: Digest, result: Digest) -> Result<(), RemoteError> {
    let body =
      serde_json::to_vec(&result).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
    self.put("ac", action, Bytes::from(body)).await
  }
}

fn classify_transport(error: reqwest::Error) -> RemoteError {
  if error.is_timeout() || error.is_connect() || error.is_request() {
    RemoteError::Unavailable(error.to_string())
  } else {
    RemoteError::InvalidResponse(error.to_string())
  }
}

fn classify_status(status: StatusCode) -> RemoteError {
  match status {
    StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
      RemoteError::Unavailable(status.to_string())
    }
    StatusCode::TOO_MANY_REQUESTS | StatusCode::INSUFFICIENT_STORAGE => {
      RemoteError::ResourceExhausted(status.to_string())
    }
    status => RemoteError::Rejected(status.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_urls_are_joined_under_base_path() {
    let store = HttpRemoteStore::new("http://cache.local/kiln", Duration::from_secs(1), 4).unwrap();
    let digest = Digest::of_bytes(b"x");
    let url = store.url("cas", digest).unwrap();
    assert_eq!(
      url.as_str(),
      format!("http://cache.local/kiln/cas/{}", digest.hash.to_hex())
    );
  }

  #[test]
  fn test_status_classification() {
    assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE).is_transient());
    assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).is_transient());
    assert!(!classify_status(StatusCode::FORBIDDEN).is_transient());
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(HttpRemoteStore::new("not a url", Duration::from_secs(1), 1).is_err());
  }
}
