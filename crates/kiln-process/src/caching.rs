use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use kiln_store::{ActionCache, Digest, Store};
use tracing::{debug, info, instrument, warn};

use crate::{
  CommandRunner, FallibleProcessResult, ProcessError, ProcessRequest, ResultSource, RunContext,
};

/// Puts the persistent action cache, and the remote action cache when the
/// store has a remote tier, in front of another runner.
///
/// A hit is only served if every blob the result references can still be
/// loaded. Timeouts and other errors are never cached.
pub struct CachingRunner {
  inner: Arc<dyn CommandRunner>,
  store: Store,
  actions: Option<Arc<dyn ActionCache>>,
}

impl CachingRunner {
  /// `actions` is the local action cache; `None` disables local caching but
  /// keeps the remote one.
  pub fn new(
    inner: Arc<dyn CommandRunner>,
    store: Store,
    actions: Option<Arc<dyn ActionCache>>,
  ) -> Self {
    Self {
      inner,
      store,
      actions,
    }
  }

  async fn lookup(&self, action: Digest) -> Result<Option<FallibleProcessResult>, ProcessError> {
    if let Some(actions) = &self.actions
      && let Some(entry) = actions.get(action).await?
    {
      match self.load_result(entry.result).await? {
        Some(result) => return Ok(Some(result.with_source(ResultSource::HitLocally))),
        None => {
          warn!(action = %action, "cached result incomplete, dropping entry");
          actions.remove(action).await?;
        }
      }
    }

    let Some(remote) = self.store.remote().filter(|r| r.can_read()) else {
      return Ok(None);
    };
    let result_digest = {
      let _permit = remote.permit().await.map_err(kiln_store::StoreError::from)?;
      remote.store().get_action(action).await
    };
    let result_digest = match result_digest {
      Ok(Some(digest)) => digest,
      Ok(None) => return Ok(None),
      Err(e) => {
        warn!(action = %action, error = %e, "remote action cache lookup failed");
        return Ok(None);
      }
    };

    let Some(result) = self.load_result(result_digest).await? else {
      return Ok(None);
    };
    if let Some(actions) = &self.actions {
      actions.put(action, result_digest).await?;
    }
    Ok(Some(result.with_source(ResultSource::HitRemotely)))
  }

  async fn load_result(&self, digest: Digest) -> Result<Option<FallibleProcessResult>, ProcessError> {
    let Some(bytes) = self.store.load_bytes(digest).await? else {
      return Ok(None);
    };
    let result: FallibleProcessResult = match serde_json::from_slice(&bytes) {
      Ok(result) => result,
      Err(e) => {
        warn!(digest = %digest, error = %e, "cached result undecodable");
        return Ok(None);
      }
    };
    for referenced in result.digests() {
      if self.store.load_bytes(referenced).await?.is_none() {
        return Ok(None);
      }
    }
    Ok(Some(result))
  }

  async fn record(&self, action: Digest, result: &FallibleProcessResult) -> Result<(), ProcessError> {
    let encoded = Bytes::from(serde_json::to_vec(result)?);
    let result_digest = self.store.store_bytes(encoded).await?;
    if let Some(actions) = &self.actions {
      actions.put(action, result_digest).await?;
    }

    if let Some(remote) = self.store.remote().filter(|r| r.can_write()) {
      let mut roots = vec![result_digest];
      roots.extend(result.digests());
      let uploaded = match self.store.ensure_remote_has(&roots).await {
        Ok(_) => {
          let _permit = remote.permit().await.map_err(kiln_store::StoreError::from)?;
          remote.store().put_action(action, result_digest).await
        }
        Err(e) => Err(kiln_store::RemoteError::Unavailable(e.to_string())),
      };
      if let Err(e) = uploaded {
        warn!(action = %action, error = %e, "remote cache write failed");
      }
    }
    Ok(())
  }
}

#[async_trait]
impl CommandRunner for CachingRunner {
  #[instrument(
    name = "process_cached",
    skip(self, request, context),
    fields(description = %request.description)
  )]
  async fn run(
    &self,
    request: &ProcessRequest,
    context: RunContext,
  ) -> Result<FallibleProcessResult, ProcessError> {
    if !request.is_persistable() {
      return self.inner.run(request, context).await;
    }

    let action = request.digest()?;
    if let Some(result) = self.lookup(action).await? {
      info!(
        source = %result.metadata.source,
        exit_code = result.exit_code,
        "process cache hit"
      );
      return Ok(result);
    }

    let result = self.inner.run(request, context).await?;
    if request.cache_scope.persists(result.exit_code) {
      self.record(action, &result).await?;
      debug!(action = %action, "process result cached");
    }
    Ok(result)
  }
}
