//! Retry with exponential backoff, layered over a store.
//!
//! The engines never retry on their own; transient-failure policy lives
//! entirely in this wrapper.

use async_trait::async_trait;
use bytes::Bytes;
use coffre_core::store::ObjectWrite;
use coffre_core::{AccessMode, ObjectId, ObjectStore, ObjectType, Result};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_duration = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let duration_ms = base_duration.min(self.max_backoff.as_millis() as f64) as u64;
        let mut duration = Duration::from_millis(duration_ms);

        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4).max(1));
            duration += Duration::from_millis(jitter_ms);
        }

        duration
    }
}

/// Whether an error is worth retrying.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for coffre_core::Error {
    fn is_retryable(&self) -> bool {
        match self {
            coffre_core::Error::Io(_) => true,
            // Transient backend conditions only; corruption, validation
            // and permission errors fail immediately.
            coffre_core::Error::Backend(msg) => {
                msg.contains("timeout")
                    || msg.contains("rate limit")
                    || msg.contains("throttle")
                    || msg.contains("temporarily unavailable")
                    || msg.contains("try again")
                    || msg.contains("503")
                    || msg.contains("429")
            }
            _ => false,
        }
    }
}

/// Retry a fallible async operation with exponential backoff.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut last_error = None;
    let max_attempts = config.max_attempts.max(1);

    for attempt in 0..max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if !error.is_retryable() {
                    return Err(error);
                }

                if attempt < max_attempts - 1 {
                    let backoff = config.backoff_duration(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts,
                        backoff_ms = backoff.as_millis(),
                        "operation failed, retrying after backoff: {error}"
                    );
                    sleep(backoff).await;
                }

                last_error = Some(error);
            }
        }
    }

    // max_attempts >= 1, so at least one error was recorded.
    match last_error {
        Some(error) => {
            warn!(
                operation = operation_name,
                max_attempts,
                "operation failed after all retry attempts: {error}"
            );
            Err(error)
        }
        None => unreachable!("retry loop ran zero attempts"),
    }
}

/// Store wrapper that retries transient failures of the inner store.
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    config: RetryConfig,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ObjectStore for RetryingStore {
    async fn read_object(&self, id: &ObjectId) -> Result<(ObjectType, Bytes)> {
        retry_with_backoff(&self.config, "read_object", || self.inner.read_object(id)).await
    }

    async fn write_object(&self, kind: ObjectType, data: &[u8]) -> Result<ObjectWrite> {
        retry_with_backoff(&self.config, "write_object", || {
            self.inner.write_object(kind, data)
        })
        .await
    }

    async fn list_tags(&self) -> Result<Vec<ObjectId>> {
        retry_with_backoff(&self.config, "list_tags", || self.inner.list_tags()).await
    }

    async fn tag_snapshot(&self, id: &ObjectId, name: &str) -> Result<()> {
        retry_with_backoff(&self.config, "tag_snapshot", || {
            self.inner.tag_snapshot(id, name)
        })
        .await
    }

    fn mode(&self) -> AccessMode {
        self.inner.mode()
    }
}
