//! Redis-backed counter store.
//!
//! Counters are plain Redis integers, so every instance of the service that
//! points at the same Redis shares the same buckets:
//!
//! - `get` is `GET`
//! - `set_if_absent` is `SET key value NX EX ttl`
//! - `increment_by` is `INCRBY`
//! - `expire` is `EXPIRE`
//!
//! Every command is bounded by the configured response timeout. A command that
//! times out or fails surfaces as a [`StoreError`]; the limiter decides what to
//! do with it. Reconnection after a dropped connection is handled by
//! `redis::aio::ConnectionManager`.

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CounterStore, StoreError, StoreResult};
use crate::config::StoreConfig;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Connection settings for [`RedisCounterStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreSettings {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379/0`)
    pub url: String,
    /// Upper bound on establishing the initial connection
    pub connect_timeout: Duration,
    /// Upper bound on any single command
    pub response_timeout: Duration,
    /// Connection attempts after the first one
    pub max_retries: u32,
    /// Longest pause between connection attempts
    pub retry_backoff_cap: Duration,
}

impl RedisStoreSettings {
    /// Pause before connection attempt `attempt` (1-based): 200ms steps, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(200 * attempt as u64).min(self.retry_backoff_cap);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 10);
        base + Duration::from_millis(jitter_ms)
    }
}

impl Default for RedisStoreSettings {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for RedisStoreSettings {
    fn from(config: &StoreConfig) -> Self {
        Self {
            url: config.connection_url(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            max_retries: config.max_retries,
            retry_backoff_cap: Duration::from_millis(config.retry_backoff_cap_ms),
        }
    }
}

/// Counter store shared through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    settings: RedisStoreSettings,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("response_timeout", &self.settings.response_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis, retrying with capped backoff.
    ///
    /// # Errors
    /// Returns the last connection error once `max_retries` is exhausted.
    pub async fn connect(settings: RedisStoreSettings) -> StoreResult<Self> {
        let client = Client::open(settings.url.as_str())?;
        let mut attempt = 0;

        loop {
            let error = match tokio::time::timeout(
                settings.connect_timeout,
                ConnectionManager::new(client.clone()),
            )
            .await
            {
                Ok(Ok(connection)) => {
                    info!(attempt = attempt + 1, "Connected to Redis counter store");
                    return Ok(Self {
                        connection,
                        settings,
                    });
                }
                Ok(Err(e)) => StoreError::from(e),
                Err(_) => StoreError::Timeout {
                    op: "CONNECT",
                    after: settings.connect_timeout,
                },
            };

            if attempt >= settings.max_retries {
                return Err(error);
            }
            attempt += 1;

            let delay = settings.backoff(attempt);
            warn!(
                error = %error,
                attempt = attempt,
                retry_in_ms = delay.as_millis() as u64,
                "Redis connection failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run one command under the response timeout.
    async fn run<T, F>(&self, op: &'static str, command: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        bounded(op, self.settings.response_timeout, command).await
    }
}

/// Await a Redis command for at most `after`.
async fn bounded<T, F>(op: &'static str, after: Duration, command: F) -> StoreResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(after, command).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => {
            debug!(op = op, "Redis command timed out");
            Err(StoreError::Timeout { op, after })
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = self.run("GET", async move { conn.get(key).await }).await?;

        raw.map(|value| super::parse_counter(key, &value)).transpose()
    }

    async fn set_if_absent(&self, key: &str, value: u64, ttl_secs: u64) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = self
            .run("SET", async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(reply.is_some())
    }

    async fn increment_by(&self, key: &str, delta: u64) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        let delta = i64::try_from(delta).unwrap_or(i64::MAX);
        let next: i64 = self
            .run("INCRBY", async move { conn.incr(key, delta).await })
            .await?;

        u64::try_from(next).map_err(|_| StoreError::MalformedValue {
            key: key.to_string(),
            value: next.to_string(),
        })
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        self.run("EXPIRE", async move { conn.expire(key, ttl).await })
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _pong: String = self
            .run("PING", async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(cap_ms: u64) -> RedisStoreSettings {
        RedisStoreSettings {
            url: "redis://127.0.0.1:1/".to_string(),
            connect_timeout: Duration::from_millis(50),
            response_timeout: Duration::from_millis(50),
            max_retries: 0,
            retry_backoff_cap: Duration::from_millis(cap_ms),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let settings = settings(1000);
        let first = settings.backoff(1);
        assert!(first >= Duration::from_millis(200) && first <= Duration::from_millis(220));

        let late = settings.backoff(50);
        assert!(late >= Duration::from_millis(1000) && late <= Duration::from_millis(1100));
    }

    #[test]
    fn test_settings_from_config() {
        let config = StoreConfig::default();
        let settings = RedisStoreSettings::from(&config);
        assert_eq!(settings.url, "redis://localhost:6379/0");
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.response_timeout, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_stalled_command_times_out() {
        let after = Duration::from_millis(20);
        let result: StoreResult<i64> =
            bounded("INCRBY", after, std::future::pending::<RedisResult<i64>>()).await;

        let err = result.unwrap_err();
        assert_eq!(err, StoreError::Timeout { op: "INCRBY", after });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_command_error_is_unavailable() {
        let failed: RedisResult<i64> = Err(RedisError::from((
            redis::ErrorKind::IoError,
            "connection reset",
        )));
        let result = bounded("GET", Duration::from_secs(1), async { failed }).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        let ok = bounded("GET", Duration::from_secs(1), async { RedisResult::Ok(7_i64) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test]
    async fn test_connect_failure_is_store_error() {
        // Nothing listens on port 1.
        let result = RedisCounterStore::connect(settings(10)).await;
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    #[ignore] // Requires Redis at redis://127.0.0.1/
    async fn test_redis_counter_lifecycle() {
        let mut settings = settings(10);
        settings.url = "redis://127.0.0.1/".to_string();
        settings.connect_timeout = Duration::from_secs(2);
        settings.response_timeout = Duration::from_secs(2);
        let store = RedisCounterStore::connect(settings).await.unwrap();

        let key = "tollgate:test:lifecycle";
        let _ = store.expire(key, 1).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(store.get(key).await.unwrap(), None);
        assert!(store.set_if_absent(key, 0, 5).await.unwrap());
        assert!(!store.set_if_absent(key, 0, 5).await.unwrap());
        assert_eq!(store.increment_by(key, 25).await.unwrap(), 25);
        assert_eq!(store.get(key).await.unwrap(), Some(25));
        store.ping().await.unwrap();
    }
}
