//! Subscribers and the registry the receive loop dispatches from

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::{envelope::Envelope, types::AgentId};

/// An in-process party interested in envelopes
///
/// The receive loop calls [`is_intended_for_me`](Subscriber::is_intended_for_me)
/// synchronously for every envelope, in registration order, and schedules
/// [`handle_message`](Subscriber::handle_message) as its own task when the
/// predicate holds. An `Err` or a panic from either method is isolated to
/// this subscriber.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use courier_mesh::{Envelope, MessageType, Subscriber};
///
/// struct SensorLogger;
///
/// #[async_trait]
/// impl Subscriber for SensorLogger {
///     fn is_intended_for_me(&self, envelope: &Envelope) -> bool {
///         envelope.message_type() == MessageType::Sensor
///     }
///
///     async fn handle_message(&self, envelope: Envelope) -> Result<(), String> {
///         println!("{}: {}", envelope.source(), envelope.content());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    /// Delivery predicate
    fn is_intended_for_me(&self, envelope: &Envelope) -> bool;

    /// Handle a matching envelope
    async fn handle_message(&self, envelope: Envelope) -> Result<(), String>;

    /// Name used in logs and failure reports
    fn label(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A named agent that receives its envelopes on a channel
///
/// Matches envelopes addressed to its name or broadcast. Handling fails once
/// the receiving half has been dropped.
pub struct ChannelSubscriber {
    agent: AgentId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelSubscriber {
    /// Create a subscriber for `agent` and the receiving half of its inbox
    pub fn new(agent: AgentId) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { agent, tx }, rx)
    }

    /// The agent this subscriber stands for
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn is_intended_for_me(&self, envelope: &Envelope) -> bool {
        envelope.is_addressed_to(&self.agent)
    }

    async fn handle_message(&self, envelope: Envelope) -> Result<(), String> {
        self.tx
            .send(envelope)
            .map_err(|_| format!("inbox for {} is closed", self.agent))
    }

    fn label(&self) -> &str {
        self.agent.as_str()
    }
}

/// Handle returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Registration {
    id: SubscriptionId,
    subscriber: Arc<dyn Subscriber>,
}

/// Ordered set of registered subscribers
///
/// Holds shared references, not ownership. Entries keep insertion order and
/// are never deduplicated: registering the same subscriber twice delivers
/// to it twice. Readers take a [`snapshot`](SubscriberRegistry::snapshot),
/// so a dispatch never observes a half-applied mutation.
pub struct SubscriberRegistry {
    entries: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a subscriber
    pub async fn register(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write().await;
        info!(subscription = %id, subscriber = subscriber.label(), "Registering subscriber");
        entries.push(Registration { id, subscriber });
        id
    }

    /// Remove a subscriber by its registration handle
    ///
    /// Returns `false` if the handle is unknown (already removed or cleared).
    pub async fn unregister(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|r| r.id != id);
        let removed = entries.len() != before;
        if removed {
            debug!(subscription = %id, "Unregistered subscriber");
        }
        removed
    }

    /// Copy of the current subscribers, in registration order
    pub async fn snapshot(&self) -> Vec<Arc<dyn Subscriber>> {
        self.entries
            .read()
            .await
            .iter()
            .map(|r| Arc::clone(&r.subscriber))
            .collect()
    }

    /// Drop every registration
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        debug!(count = entries.len(), "Clearing subscriber registry");
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
