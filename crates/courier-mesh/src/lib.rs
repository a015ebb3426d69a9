//! # Courier Mesh
//!
//! Envelope model and pub/sub receive side of the courier message fabric.
//!
//! Agents exchange [`Envelope`]s: a validated record naming a source agent, a
//! recipient (`"ALL"` for broadcast), free-form content and a
//! [`MessageType`]. Envelopes travel over an opaque [`PubSub`] socket; a
//! [`Receiver`] subscribes to one channel and fans each envelope out to every
//! registered [`Subscriber`] whose predicate accepts it.
//!
//! ## Features
//!
//! - **Strict envelopes**: malformed payloads are rejected before any side effect
//! - **Concurrent fan-out**: one task per matching subscriber, failures isolated
//! - **Pluggable transport**: in-memory bus built in, Redis behind the `redis` feature
//! - **Observability**: tracing spans and dispatch counters
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_mesh::{
//!     AgentId, ChannelSubscriber, Envelope, InMemoryPubSub, Receiver, ReceiverConfig,
//!     publish_envelope,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(InMemoryPubSub::new());
//!     let config = ReceiverConfig::default();
//!     let channel = config.channel.clone();
//!
//!     let receiver = Receiver::new(bus.clone(), config);
//!     let (agent2, mut inbox) = ChannelSubscriber::new(AgentId::parse("Agent2")?);
//!     receiver.register_subscriber(Arc::new(agent2)).await;
//!     receiver.start().await?;
//!
//!     let envelope = Envelope::parse("Agent1", "Agent2", "hello", "HELO")?;
//!     publish_envelope(bus.as_ref(), &channel, &envelope).await?;
//!
//!     let received = inbox.recv().await;
//!     assert_eq!(received.as_ref().map(Envelope::content), Some("hello"));
//!
//!     receiver.stop().await;
//!     Ok(())
//! }
//! ```

pub mod envelope;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod receiver;
pub mod subscriber;
pub mod transport;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis;

pub use envelope::{Envelope, MessageType};
pub use error::{
    DecodeError, DispatchFailure, MeshError, MeshResult, SubscriberError, TransportError,
    ValidationError,
};
pub use memory::InMemoryPubSub;
pub use metrics::{DispatchMetrics, DispatchMetricsCollector};
pub use receiver::{Receiver, ReceiverConfig};
pub use subscriber::{ChannelSubscriber, Subscriber, SubscriberRegistry, SubscriptionId};
pub use transport::{Delivery, FrameStream, PubSub, Sender, publish_envelope};
pub use types::{AgentId, BROADCAST, Channel, DEFAULT_CHANNEL, IdValidationError, Recipient};

#[cfg(feature = "redis")]
pub use redis::{RedisConfig, RedisPubSub};
