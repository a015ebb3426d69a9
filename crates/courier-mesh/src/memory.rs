//! In-process pub/sub backend
//!
//! One `tokio::sync::broadcast` channel per pub/sub channel. Used by tests and
//! by single-process deployments that run the bridge and receivers together.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use crate::{
    error::{MeshError, MeshResult},
    transport::{FrameStream, PubSub},
    types::Channel,
};

/// Frames buffered per subscriber before it starts lagging
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast-channel pub/sub
///
/// Publishing to a channel nobody subscribes to succeeds and drops the frame,
/// as a broker would. A subscriber that falls more than `capacity` frames
/// behind receives one `MeshError::ReceiveFailed` item and then continues
/// from the oldest retained frame.
pub struct InMemoryPubSub {
    channels: RwLock<HashMap<Channel, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with a custom per-subscriber buffer
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions on `channel`
    pub async fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }

    async fn sender(&self, channel: &Channel) -> broadcast::Sender<String> {
        if let Some(tx) = self.channels.read().await.get(channel) {
            return tx.clone();
        }
        self.channels
            .write()
            .await
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, channel: &Channel, frame: String) -> MeshResult<()> {
        let tx = self.sender(channel).await;
        match tx.send(frame) {
            Ok(receivers) => debug!(channel = %channel, receivers, "Published frame"),
            Err(_) => debug!(channel = %channel, "Published frame with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &Channel) -> MeshResult<FrameStream> {
        let mut rx = self.sender(channel).await.subscribe();
        let name = channel.clone();
        debug!(channel = %name, "Subscribed to in-memory channel");

        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(frame) => yield Ok(frame),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Subscriber lagged, frames dropped");
                        yield Err(MeshError::ReceiveFailed(format!(
                            "lagged behind by {skipped} frames"
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
