//! Redis pub/sub backend

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tracing::{debug, error};

use crate::{
    error::{MeshError, MeshResult},
    transport::{FrameStream, PubSub},
    types::Channel,
};

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Maximum number of pooled publish connections
    pub pool_size: usize,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            connect_timeout_secs: 5,
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }
}

/// Redis-backed [`PubSub`]
///
/// Publishes through a deadpool connection pool. Each subscription opens its
/// own dedicated pub/sub connection, which lives as long as the stream.
pub struct RedisPubSub {
    pool: deadpool_redis::Pool,
    client: redis::Client,
    config: RedisConfig,
}

impl RedisPubSub {
    /// Connect with default settings
    pub async fn new(url: impl Into<String>) -> MeshResult<Self> {
        Self::with_config(RedisConfig::new(url)).await
    }

    /// Connect and verify the server answers PING
    pub async fn with_config(config: RedisConfig) -> MeshResult<Self> {
        let mut pool_config = deadpool_redis::Config::from_url(&config.url);
        pool_config.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size.max(1)));

        let pool = pool_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| MeshError::ConnectionFailed(e.to_string()))?;

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| MeshError::InvalidConfig(e.to_string()))?;

        let timeout = std::time::Duration::from_secs(config.connect_timeout_secs);
        let mut conn = tokio::time::timeout(timeout, pool.get())
            .await
            .map_err(|_| MeshError::ConnectionFailed(format!("timed out after {timeout:?}")))?
            .map_err(|e| MeshError::ConnectionFailed(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| MeshError::ConnectionFailed(format!("PING failed: {}", e)))?;

        debug!(url = %config.url, "Redis pub/sub connected");

        Ok(Self {
            pool,
            client,
            config,
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Redis channel name for a courier channel
    fn channel_key(channel: &Channel) -> String {
        format!("courier:{}", channel)
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &Channel, frame: String) -> MeshResult<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| MeshError::ConnectionFailed(e.to_string()))?;
        let key = Self::channel_key(channel);

        let receivers: usize = conn
            .publish(&key, frame)
            .await
            .map_err(|e| MeshError::PublishFailed(e.to_string()))?;

        debug!(channel = %key, receivers, "Published frame");
        Ok(())
    }

    async fn subscribe(&self, channel: &Channel) -> MeshResult<FrameStream> {
        let key = Self::channel_key(channel);

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| MeshError::ConnectionFailed(e.to_string()))?;

        pubsub
            .subscribe(&key)
            .await
            .map_err(|e| MeshError::SubscribeFailed(e.to_string()))?;

        debug!(channel = %key, "Subscribed to Redis channel");

        let stream = pubsub.into_on_message().map(|msg| {
            msg.get_payload::<String>().map_err(|e| {
                error!("Failed to get frame payload: {}", e);
                MeshError::ReceiveFailed(e.to_string())
            })
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig::new("redis://cache:6379")
            .with_pool_size(4)
            .with_connect_timeout(2);

        assert_eq!(config.url, "redis://cache:6379");
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.connect_timeout_secs, 2);
    }

    #[test]
    fn test_channel_key() {
        let key = RedisPubSub::channel_key(&Channel::default());
        assert_eq!(key, "courier:courier.envelopes");
    }
}
