//! Configuration for the replication engine.

use crate::error::{ReplicationError, ReplicationResult};
use crate::handler::ReplicationHandler;
use forkline_protocol::{ConflictHandler, Document, ReplicationMetaRow};
use forkline_storage::StorageInstance;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Default number of documents per pull and per push.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Hook awaited before a batch is persisted.
pub type WaitBeforePersist = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Checkpoints written before the engines start, if none was persisted yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialCheckpoint {
    /// Initial fork checkpoint of the upstream.
    pub upstream: Option<serde_json::Value>,
    /// Initial master checkpoint of the downstream.
    pub downstream: Option<serde_json::Value>,
}

/// Configuration for a replication.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Replication identifier; scopes all meta rows.
    pub identifier: String,
    /// Maximum number of documents per master pull.
    pub pull_batch_size: usize,
    /// Maximum number of rows per master write.
    pub push_batch_size: usize,
    /// Retry configuration for retryable failures.
    pub retry: RetryConfig,
    /// Checkpoints used on the very first start.
    pub initial_checkpoint: InitialCheckpoint,
}

impl ReplicationConfig {
    /// Creates a new replication configuration.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            pull_batch_size: DEFAULT_BATCH_SIZE,
            push_batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryConfig::default(),
            initial_checkpoint: InitialCheckpoint::default(),
        }
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the initial checkpoints.
    pub fn with_initial_checkpoint(mut self, initial_checkpoint: InitialCheckpoint) -> Self {
        self.initial_checkpoint = initial_checkpoint;
        self
    }

    /// Checks the configuration before a replication starts.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.identifier.is_empty() {
            return Err(ReplicationError::Contract(
                "replication identifier must not be empty".into(),
            ));
        }
        if self.pull_batch_size == 0 || self.push_batch_size == 0 {
            return Err(ReplicationError::Contract(
                "batch sizes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for retry behavior.
///
/// A retryable failure aborts the current batch; the direction schedules a
/// fresh checkpoint-driven batch after [`RetryConfig::delay_for_attempt`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of consecutive attempts before the direction gives up.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25%
            let jitter = delay_secs * 0.25 * clock_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

fn clock_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Everything a replication needs at start.
pub struct ReplicationInput<T: Document, C> {
    /// Replication configuration.
    pub config: ReplicationConfig,
    /// The local fork.
    pub fork: Arc<dyn StorageInstance<T>>,
    /// The replication meta store.
    pub meta: Arc<dyn StorageInstance<ReplicationMetaRow<T>>>,
    /// The master side adapter.
    pub handler: Arc<dyn ReplicationHandler<T, C>>,
    /// Resolves push conflicts and decides document equality.
    pub conflict_handler: Arc<dyn ConflictHandler<T>>,
    /// Optional hook awaited before every persisted batch.
    pub wait_before_persist: Option<WaitBeforePersist>,
}

impl<T: Document, C> ReplicationInput<T, C> {
    /// Creates the input of a replication.
    pub fn new(
        config: ReplicationConfig,
        fork: Arc<dyn StorageInstance<T>>,
        meta: Arc<dyn StorageInstance<ReplicationMetaRow<T>>>,
        handler: Arc<dyn ReplicationHandler<T, C>>,
        conflict_handler: Arc<dyn ConflictHandler<T>>,
    ) -> Self {
        Self {
            config,
            fork,
            meta,
            handler,
            conflict_handler,
            wait_before_persist: None,
        }
    }

    /// Sets the hook awaited before every persisted batch.
    pub fn with_wait_before_persist<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.wait_before_persist = Some(Arc::new(
            move || -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(hook()) },
        ));
        self
    }

    pub(crate) async fn wait_before_persist(&self) {
        if let Some(hook) = &self.wait_before_persist {
            hook().await;
        }
    }
}

impl<T: Document, C> Clone for ReplicationInput<T, C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            fork: Arc::clone(&self.fork),
            meta: Arc::clone(&self.meta),
            handler: Arc::clone(&self.handler),
            conflict_handler: Arc::clone(&self.conflict_handler),
            wait_before_persist: self.wait_before_persist.clone(),
        }
    }
}

impl<T: Document, C> fmt::Debug for ReplicationInput<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationInput")
            .field("config", &self.config)
            .field("wait_before_persist", &self.wait_before_persist.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = ReplicationConfig::new("todos")
            .with_pull_batch_size(50)
            .with_push_batch_size(25)
            .with_initial_checkpoint(InitialCheckpoint {
                upstream: None,
                downstream: Some(serde_json::json!({"sequence": 3})),
            });

        assert_eq!(config.identifier, "todos");
        assert_eq!(config.pull_batch_size, 50);
        assert_eq!(config.push_batch_size, 25);
        assert!(config.initial_checkpoint.upstream.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_defaults() {
        let config = ReplicationConfig::new("todos");
        assert_eq!(config.pull_batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.push_batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn config_validation() {
        assert!(ReplicationConfig::new("").validate().is_err());
        assert!(ReplicationConfig::new("x")
            .with_pull_batch_size(0)
            .validate()
            .is_err());
        assert!(ReplicationConfig::new("x")
            .with_push_batch_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert!(config.should_retry(0));
        assert!(!config.should_retry(1));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
