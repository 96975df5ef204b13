//! Redis connection pool with retry and health checking
//!
//! One multiplexed connection is shared by all callers; a semaphore caps
//! the number of commands in flight. Failed commands are retried with
//! exponential backoff when the failure looks transient.
//!
//! # Example
//!
//! ```rust,no_run
//! use kuba_cohort::store::redis::{RedisConfig, RedisPool};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::with_url("redis://localhost:6379")
//!     .pool_size(32)
//!     .command_timeout(Duration::from_millis(500));
//!
//! let pool = RedisPool::new(config).await?;
//! let pong: String = pool
//!     .execute("PING", |mut conn| async move {
//!         redis::cmd("PING").query_async(&mut conn).await
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use super::util::store_error;
use crate::error::StoreError;
use crate::metrics;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

/// Configuration for the Redis connection pool
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis server URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of commands in flight
    /// Default: 16
    pub pool_size: u32,

    /// Timeout for establishing the connection
    /// Default: 5 seconds
    pub connection_timeout: Duration,

    /// Timeout for a single command
    /// Default: 1 second
    pub command_timeout: Duration,

    /// Retry policy for transient failures
    pub retry_policy: RetryPolicy,

    /// Use TLS (`rediss://`)
    /// Default: false
    pub tls_enabled: bool,

    /// Minimum interval between health checks
    /// Default: 30 seconds
    pub health_check_interval: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            tls_enabled: false,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl RedisConfig {
    /// Create a config for `url` with default settings
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the pool size
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Enable or disable TLS
    ///
    /// Requires the `redis-tls` feature and a `rediss://` URL.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.pool_size == 0 || self.pool_size > 1000 {
            return Err(format!(
                "Pool size must be between 1 and 1000, got {}",
                self.pool_size
            ));
        }
        if self.command_timeout.is_zero() {
            return Err("Command timeout must be greater than 0".to_string());
        }

        #[cfg(not(feature = "redis-tls"))]
        if self.tls_enabled {
            return Err(
                "TLS is enabled but the 'redis-tls' feature is not compiled. \
                 Enable it with: cargo build --features redis-tls"
                    .to_string(),
            );
        }

        let tls_scheme = self.url.starts_with("rediss://");
        if self.tls_enabled && !tls_scheme {
            return Err("TLS is enabled but URL doesn't use the 'rediss://' scheme".to_string());
        }
        if !self.tls_enabled && tls_scheme {
            return Err("URL uses 'rediss://' but TLS is not enabled".to_string());
        }

        Ok(())
    }
}

/// Retry policy with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    /// Default: 3
    pub max_retries: u32,

    /// Delay before the first retry
    /// Default: 100ms
    pub initial_delay: Duration,

    /// Upper bound on any delay
    /// Default: 5 seconds
    pub max_delay: Duration,

    /// Backoff multiplier
    /// Default: 2.0
    pub multiplier: f64,

    /// Add up to 25% random jitter
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.jitter {
            capped * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Check whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Health of the Redis connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// PING answered quickly
    Healthy,
    /// PING answered, but slowly
    Degraded,
    /// PING failed
    Unhealthy,
    /// Not checked yet
    Unknown,
}

impl HealthStatus {
    /// Gauge value exported to metrics
    pub fn as_gauge(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy | HealthStatus::Unknown => 0.0,
        }
    }
}

/// Shared Redis connection with bounded concurrency
pub struct RedisPool {
    client: Client,

    /// Multiplexed connection, re-established after transport errors
    connection: RwLock<Option<MultiplexedConnection>>,

    config: RedisConfig,

    /// Caps commands in flight at `pool_size`
    semaphore: Arc<Semaphore>,

    health_status: parking_lot::RwLock<HealthStatus>,

    last_health_check: parking_lot::RwLock<Option<Instant>>,
}

impl RedisPool {
    /// Validate `config`, open a client and establish the first connection
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        config.validate().map_err(StoreError::ConnectionError)?;

        let client =
            Client::open(config.url.as_str()).map_err(|e| store_error(&config.url, &e))?;
        let semaphore = Arc::new(Semaphore::new(config.pool_size as usize));

        let pool = Self {
            client,
            connection: RwLock::new(None),
            config,
            semaphore,
            health_status: parking_lot::RwLock::new(HealthStatus::Unknown),
            last_health_check: parking_lot::RwLock::new(None),
        };

        pool.connect().await?;
        debug!(pool_size = pool.config.pool_size, "Redis pool initialized");
        Ok(pool)
    }

    async fn connect(&self) -> Result<MultiplexedConnection, StoreError> {
        let start = Instant::now();

        let conn = tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::ConnectionError("Connection timeout".to_string()))?
        .map_err(|e| store_error(&self.config.url, &e))?;

        *self.connection.write().await = Some(conn.clone());
        *self.health_status.write() = HealthStatus::Healthy;

        debug!("Redis connection established in {:?}", start.elapsed());
        Ok(conn)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let existing = self.connection.read().await.clone();
        match existing {
            Some(conn) => Ok(conn),
            None => self.connect().await,
        }
    }

    /// Run `f` on a pooled connection, retrying transient failures
    ///
    /// `command` labels logs and metrics.
    pub async fn execute<F, Fut, T>(&self, command: &'static str, f: F) -> Result<T, StoreError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| StoreError::ConnectionError("Pool closed".to_string()))?;

        let policy = &self.config.retry_policy;
        let mut attempt = 0;

        loop {
            let conn = self.connection().await?;
            let start = Instant::now();
            let result = tokio::time::timeout(self.config.command_timeout, f(conn)).await;
            let elapsed = start.elapsed();

            let retriable = match result {
                Ok(Ok(value)) => {
                    metrics::record_store_command(command, elapsed, true);
                    return Ok(value);
                },
                Ok(Err(e)) => {
                    metrics::record_store_command(command, elapsed, false);
                    if !(policy.should_retry(attempt) && is_retriable_error(&e)) {
                        return Err(store_error(&self.config.url, &e));
                    }
                    if is_connection_error(&e) {
                        *self.connection.write().await = None;
                    }
                    format!("{} failed: {}", command, super::util::error_kind_name(&e))
                },
                Err(_) => {
                    metrics::record_store_command(command, elapsed, false);
                    if !policy.should_retry(attempt) {
                        return Err(StoreError::ConnectionError(format!(
                            "{} timed out after {:?}",
                            command, self.config.command_timeout
                        )));
                    }
                    format!("{} timed out", command)
                },
            };

            let delay = policy.delay_for_attempt(attempt);
            warn!(
                attempt = attempt + 1,
                ?delay,
                "Redis {}, retrying",
                retriable
            );
            metrics::record_store_retry(command);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// PING the server and update the health status
    pub async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();
        let result = self
            .execute("PING", |mut conn| async move {
                redis::cmd("PING").query_async::<String>(&mut conn).await
            })
            .await;

        let status = match result {
            Ok(_) if start.elapsed() > Duration::from_millis(100) => HealthStatus::Degraded,
            Ok(_) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };

        *self.health_status.write() = status;
        *self.last_health_check.write() = Some(Instant::now());
        metrics::update_store_health(status.as_gauge());
        status
    }

    /// Last observed health status
    pub fn health_status(&self) -> HealthStatus {
        *self.health_status.read()
    }

    /// Check whether the health check interval has elapsed
    pub fn needs_health_check(&self) -> bool {
        match *self.last_health_check.read() {
            None => true,
            Some(at) => at.elapsed() > self.config.health_check_interval,
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

/// Transient failures worth another attempt
fn is_retriable_error(e: &RedisError) -> bool {
    e.is_connection_dropped()
        || e.is_timeout()
        || e.is_io_error()
        || matches!(
            e.kind(),
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
        )
}

/// Failures that invalidate the shared connection
fn is_connection_error(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisConfig::default();
        assert_eq!(config.pool_size, 16);
        assert_eq!(config.command_timeout, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(RedisConfig::with_url("").validate().is_err());
        assert!(RedisConfig::default().pool_size(0).validate().is_err());
        assert!(RedisConfig::default().pool_size(1001).validate().is_err());
        assert!(RedisConfig::default()
            .command_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RedisConfig::with_url("redis://cache:6379")
            .pool_size(64)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_tls_scheme_mismatch() {
        let err = RedisConfig::with_url("rediss://cache:6380")
            .tls(false)
            .validate()
            .unwrap_err();
        assert!(err.contains("rediss://"));
    }

    #[cfg(not(feature = "redis-tls"))]
    #[test]
    fn test_tls_requires_feature() {
        let err = RedisConfig::with_url("rediss://cache:6380")
            .tls(true)
            .validate()
            .unwrap_err();
        assert!(err.contains("redis-tls"));
    }

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(50),
            multiplier: 3.0,
            max_delay: Duration::from_secs(1),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(150));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(450));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_jitter_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..20 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(0));
    }

    #[test]
    fn test_retriable_errors() {
        let io = RedisError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert!(is_retriable_error(&io));
        assert!(is_connection_error(&io));

        let busy = RedisError::from((redis::ErrorKind::BusyLoadingError, "LOADING"));
        assert!(is_retriable_error(&busy));
        assert!(!is_connection_error(&busy));

        let wrong = RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(!is_retriable_error(&wrong));
    }

    #[test]
    fn test_health_gauge() {
        assert_eq!(HealthStatus::Healthy.as_gauge(), 1.0);
        assert_eq!(HealthStatus::Degraded.as_gauge(), 0.5);
        assert_eq!(HealthStatus::Unknown.as_gauge(), 0.0);
    }
}
