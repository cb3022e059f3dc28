//! Queue input
//!
//! The pipeline only depends on [`MessageSource`]: a blocking pop that
//! yields one raw JSON payload, or `None` on idle. The shipped transport is
//! a Redis list consumed with BLPOP.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;

/// A blocking message source for the produce pipeline.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Pops one payload, returning `None` when the block timeout elapses
    /// without a message.
    async fn pop(&mut self) -> Result<Option<Vec<u8>>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Configures the Redis list consumer.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
    pub key: String,
    pub block_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: String::new(),
            db: 0,
            key: "sysmon_events".to_string(),
            block_timeout: Duration::from_secs(5),
        }
    }
}

/// Pops payloads from a Redis list.
pub struct RedisQueueConsumer {
    conn: redis::aio::MultiplexedConnection,
    key: String,
    block_timeout: Duration,
}

impl RedisQueueConsumer {
    pub async fn connect(mut cfg: QueueConfig) -> Result<Self> {
        if cfg.addr.is_empty() {
            cfg.addr = "127.0.0.1:6379".to_string();
        }
        if cfg.key.is_empty() {
            anyhow::bail!("queue key is required");
        }
        if cfg.block_timeout.is_zero() {
            cfg.block_timeout = Duration::from_secs(5);
        }

        let url = if cfg.password.is_empty() {
            format!("redis://{}/{}", cfg.addr, cfg.db)
        } else {
            format!("redis://:{}@{}/{}", cfg.password, cfg.addr, cfg.db)
        };
        let client = redis::Client::open(url).context("invalid redis address")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("connect to redis")?;

        Ok(Self {
            conn,
            key: cfg.key,
            block_timeout: cfg.block_timeout,
        })
    }
}

#[async_trait]
impl MessageSource for RedisQueueConsumer {
    async fn pop(&mut self) -> Result<Option<Vec<u8>>> {
        let timeout = self.block_timeout.as_secs_f64();
        let reply: Option<(String, Vec<u8>)> = self
            .conn
            .blpop(&self.key, timeout)
            .await
            .context("blpop failed")?;
        Ok(reply.map(|(_, payload)| payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_a_key() {
        let err = RedisQueueConsumer::connect(QueueConfig {
            key: String::new(),
            ..Default::default()
        })
        .await;
        assert!(err.is_err());
    }
}
