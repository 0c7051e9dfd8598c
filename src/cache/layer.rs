//! Retrying request execution with cache fallback.

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use tracing::{debug, info, warn};

use super::storage::CacheStore;
use super::traits::{CacheResult, QueryKey};
use crate::api::{ApiError, ErrorKind};

/// How many attempts a request gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub attempts: u32,
  pub base_delay: std::time::Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 3,
      base_delay: std::time::Duration::from_millis(1000),
    }
  }
}

impl RetryPolicy {
  /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt - 1)`.
  pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
    let exp = attempt.saturating_sub(1).min(16);
    self.base_delay.saturating_mul(1 << exp)
  }
}

/// Runs backend calls with exponential backoff and falls back to the cache.
///
/// Retryable failures are retried up to the policy's attempt count. Terminal
/// failures stop immediately and propagate. When retries are exhausted and a
/// cache key was given, a live cached payload is returned instead, marked
/// [`CacheSource::Offline`](super::traits::CacheSource::Offline).
#[derive(Clone)]
pub struct RequestExecutor {
  cache: CacheStore,
  policy: RetryPolicy,
  /// How long a cached response may be served after it was stored
  max_age: Duration,
}

impl RequestExecutor {
  pub fn new(cache: CacheStore) -> Self {
    Self {
      cache,
      policy: RetryPolicy::default(),
      max_age: Duration::minutes(5),
    }
  }

  pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = max_age;
    self
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  /// Execute `operation` with retries. Nothing is cached.
  pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<CacheResult<T>, ApiError>
  where
    T: Serialize + DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    self.run(None, operation).await
  }

  /// Execute `operation` with retries, caching a success under `key` and
  /// falling back to the cached payload once retries are exhausted.
  pub async fn execute_cached<T, F, Fut>(
    &self,
    key: &dyn QueryKey,
    operation: F,
  ) -> Result<CacheResult<T>, ApiError>
  where
    T: Serialize + DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    self.run(Some(key), operation).await
  }

  async fn run<T, F, Fut>(
    &self,
    key: Option<&dyn QueryKey>,
    mut operation: F,
  ) -> Result<CacheResult<T>, ApiError>
  where
    T: Serialize + DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    let attempts = self.policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
      match operation().await {
        Ok(data) => {
          debug!(attempt, "request succeeded");
          if let Some(key) = key {
            if let Err(e) = self.cache.put(key, &data) {
              warn!(key = %key.description(), error = %e, "failed to cache response");
            }
          }
          return Ok(CacheResult::from_network(data));
        }
        Err(err) => {
          let retryable = err.is_retryable();
          warn!(attempt, attempts, kind = %err.kind, retryable, "request failed");
          last_error = Some(err);

          if !retryable {
            break;
          }
          if attempt < attempts {
            let delay = self.policy.delay_after(attempt);
            debug!(?delay, "backing off before retry");
            tokio::time::sleep(delay).await;
          }
        }
      }
    }

    let err = last_error.unwrap_or_else(|| ApiError::new(ErrorKind::Unknown, "No attempt made"));

    if !err.is_retryable() {
      return Err(err);
    }

    if let Some(key) = key {
      match self.cache.get::<T>(key, self.max_age) {
        Ok(Some(hit)) => {
          info!(
            key = %key.description(),
            cached_at = %hit.cached_at,
            "request failed, serving cached data"
          );
          return Ok(CacheResult::offline(hit.entity, hit.cached_at));
        }
        Ok(None) => debug!(key = %key.description(), "no cached data to fall back on"),
        Err(e) => warn!(key = %key.description(), error = %e, "cache read failed"),
      }
    }

    Err(err)
  }

  /// Make exactly one attempt, logging the outcome. No retry, no cache.
  pub async fn attempt<T, Fut>(&self, operation: Fut) -> Result<T, ApiError>
  where
    Fut: Future<Output = Result<T, ApiError>>,
  {
    let result = operation.await;
    match &result {
      Ok(_) => debug!("single attempt succeeded"),
      Err(err) => warn!(kind = %err.kind, "single attempt failed"),
    }
    result
  }
}
