//! Redis/KeyDB membership store: RedisBloom `BF.*` for the filter, a plain set for exact checks.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Cmd, FromRedisValue, RedisError, RedisResult};
use async_trait::async_trait;
use rand::Rng;
use tracing::{error, info, warn};

use super::MembershipStore;
use crate::config::StoreConfig;
use crate::error::StoreError;

const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Membership store backed by a Redis server with the RedisBloom module loaded.
#[derive(Clone)]
pub struct RedisMembershipStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisMembershipStore {
    /// Connect, retrying with exponential backoff. Each attempt is verified with `PING`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;
        let op_timeout = config.op_timeout();
        let mut last_err = None;

        for attempt in 1..=config.connect_retries {
            match try_connect(&client, op_timeout).await {
                Ok(conn) => {
                    info!(url = %redacted(&config.url), attempt, "connected to redis");
                    return Ok(Self { conn, op_timeout });
                }
                Err(e) => {
                    error!(
                        attempt,
                        max_attempts = config.connect_retries,
                        error = %e,
                        "redis connection failed"
                    );
                    last_err = Some(e);
                    if attempt < config.connect_retries {
                        let backoff = with_jitter(connect_backoff(config.retry_interval(), attempt));
                        warn!(?backoff, "retrying redis connection");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| StoreError::Connection("no connection attempts made".into())))
    }

    async fn run<T: FromRedisValue>(&self, op: &'static str, cmd: Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<T> = tokio::time::timeout(self.op_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout {
                op,
                after: self.op_timeout,
            })?;
        result.map_err(classify)
    }
}

async fn try_connect(client: &Client, timeout: Duration) -> Result<ConnectionManager, StoreError> {
    let attempt = async {
        let mut conn = client.get_connection_manager().await?;
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok::<_, RedisError>(conn)
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| StoreError::Timeout {
            op: "PING",
            after: timeout,
        })?
        .map_err(|e| StoreError::Connection(e.to_string()))
}

/// `interval * 2^(attempt-1)`, capped at 30 seconds.
pub fn connect_backoff(interval: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    interval.saturating_mul(factor).min(MAX_CONNECT_BACKOFF)
}

/// Add up to 50% random jitter to `delay`.
fn with_jitter(delay: Duration) -> Duration {
    let max_ms = (delay.as_millis() / 2) as u64;
    if max_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Map a Redis error onto the store taxonomy.
pub fn classify(err: RedisError) -> StoreError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("item exists") || lower.contains("already exists") {
        StoreError::AlreadyExists
    } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StoreError::Connection(msg)
    } else {
        StoreError::Backend(msg)
    }
}

fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}***{}", &url[..scheme + 3], &url[at..]),
        _ => url.to_string(),
    }
}

#[async_trait]
impl MembershipStore for RedisMembershipStore {
    async fn filter_add_many(&self, key: &str, codes: &[String]) -> Result<usize, StoreError> {
        if codes.is_empty() {
            return Ok(0);
        }
        let mut cmd = ::redis::cmd("BF.MADD");
        cmd.arg(key).arg(codes);
        let flags: Vec<i64> = self.run("BF.MADD", cmd).await?;
        Ok(flags.into_iter().filter(|f| *f == 1).count())
    }

    async fn set_add_many(&self, key: &str, codes: &[String]) -> Result<usize, StoreError> {
        if codes.is_empty() {
            return Ok(0);
        }
        let mut cmd = ::redis::cmd("SADD");
        cmd.arg(key).arg(codes);
        self.run("SADD", cmd).await
    }

    async fn filter_contains(&self, key: &str, code: &str) -> Result<bool, StoreError> {
        let mut cmd = ::redis::cmd("BF.EXISTS");
        cmd.arg(key).arg(code);
        self.run("BF.EXISTS", cmd).await
    }

    async fn set_contains(&self, key: &str, code: &str) -> Result<bool, StoreError> {
        let mut cmd = ::redis::cmd("SISMEMBER");
        cmd.arg(key).arg(code);
        self.run("SISMEMBER", cmd).await
    }
}
