//! Transport ports: the pub/sub socket and the point-to-point sender
//!
//! Both are capability traits so the receive loop and the bridge never
//! depend on a concrete backend.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{
    envelope::Envelope,
    error::{MeshResult, TransportError},
    types::Channel,
};

/// Stream of raw frames from a subscription
///
/// Frames are undecoded; the [`Receiver`](crate::Receiver) owns decoding so
/// malformed frames are reported as decode failures.
pub type FrameStream = Pin<Box<dyn Stream<Item = MeshResult<String>> + Send + 'static>>;

/// Opaque publish/subscribe socket
///
/// # Example
///
/// ```rust,no_run
/// use courier_mesh::{Channel, Envelope, InMemoryPubSub, PubSub};
///
/// async fn example(bus: &InMemoryPubSub) -> Result<(), Box<dyn std::error::Error>> {
///     let channel = Channel::default();
///     let _frames = bus.subscribe(&channel).await?;
///
///     let envelope = Envelope::parse("Agent1", "ALL", "hello", "HELO")?;
///     bus.publish(&channel, envelope.to_frame()?).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a frame to every current subscriber of `channel`
    ///
    /// # Errors
    ///
    /// Returns `MeshError` if the backend is unreachable or rejects the frame.
    async fn publish(&self, channel: &Channel, frame: String) -> MeshResult<()>;

    /// Subscribe to `channel`
    ///
    /// The returned stream receives frames published after the subscription
    /// is established. It ends when the backend connection closes.
    ///
    /// # Errors
    ///
    /// Returns `MeshError` if the subscription cannot be established.
    async fn subscribe(&self, channel: &Channel) -> MeshResult<FrameStream>;
}

/// Transport-level outcome of a point-to-point send
///
/// Passed through to the caller uninterpreted: a 4xx or 5xx status is still
/// a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Status code reported by the remote endpoint
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl Delivery {
    /// Check if the remote endpoint reported success (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Point-to-point delivery capability
///
/// Implementations perform exactly one request per call and never retry.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Deliver `envelope` to the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns `TransportError` when the request cannot be completed
    /// (connection refused, timeout, DNS failure).
    async fn send(&self, envelope: &Envelope) -> Result<Delivery, TransportError>;
}

/// Publish an envelope on `channel`
pub async fn publish_envelope(
    bus: &dyn PubSub,
    channel: &Channel,
    envelope: &Envelope,
) -> MeshResult<()> {
    let frame = envelope.to_frame()?;
    bus.publish(channel, frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingBus {
        frames: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PubSub for RecordingBus {
        async fn publish(&self, channel: &Channel, frame: String) -> MeshResult<()> {
            self.frames
                .lock()
                .unwrap()
                .push((channel.to_string(), frame));
            Ok(())
        }

        async fn subscribe(&self, _channel: &Channel) -> MeshResult<FrameStream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[tokio::test]
    async fn test_publish_envelope_encodes_frame() {
        let bus = RecordingBus {
            frames: Mutex::new(Vec::new()),
        };
        let envelope = Envelope::parse("Agent1", "Agent2", "hi", "CHAT").unwrap();

        publish_envelope(&bus, &Channel::default(), &envelope)
            .await
            .unwrap();

        let frames = bus.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, "courier.envelopes");
        assert_eq!(Envelope::from_frame(&frames[0].1).unwrap(), envelope);
    }

    #[test]
    fn test_delivery_is_success() {
        let ok = Delivery {
            status: 204,
            body: String::new(),
        };
        let rejected = Delivery {
            status: 422,
            body: "{}".into(),
        };
        assert!(ok.is_success());
        assert!(!rejected.is_success());
    }
}
