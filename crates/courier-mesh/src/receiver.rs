//! Pub/sub receive loop with subscriber fan-out
//!
//! For every frame taken off the subscription the loop:
//!
//! 1. decodes it into an [`Envelope`], dropping and reporting it if that fails;
//! 2. snapshots the registry and evaluates each predicate in registration order;
//! 3. spawns `handle_message` for every match without waiting in between;
//! 4. waits for those handlers (up to the handler timeout) before taking the
//!    next frame.
//!
//! Handlers still running at the timeout are detached while fewer than
//! `max_detached` handler tasks are in flight, and aborted otherwise.
//! Failures never leave the loop; they are logged and sent to the optional
//! failure sink.

use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    envelope::Envelope,
    error::{DispatchFailure, MeshError, MeshResult, SubscriberError},
    metrics::{DispatchMetrics, DispatchMetricsCollector},
    subscriber::{Subscriber, SubscriberRegistry, SubscriptionId},
    transport::{FrameStream, PubSub},
    types::Channel,
};

/// Receive loop configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Channel to subscribe to
    pub channel: Channel,
    /// How long the loop waits for one envelope's handlers
    pub handler_timeout: Duration,
    /// Upper bound on handler tasks left running past their timeout
    pub max_detached: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            channel: Channel::default(),
            handler_timeout: Duration::from_secs(30),
            max_detached: 64,
        }
    }
}

impl ReceiverConfig {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            ..Default::default()
        }
    }

    /// Set the per-envelope handler timeout
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the detached handler limit (0 aborts every late handler)
    pub fn with_max_detached(mut self, max_detached: usize) -> Self {
        self.max_detached = max_detached;
        self
    }
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Pub/sub receiver that fans envelopes out to local subscribers
///
/// # Example
///
/// ```rust,no_run
/// use courier_mesh::{AgentId, ChannelSubscriber, InMemoryPubSub, Receiver, ReceiverConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = Arc::new(InMemoryPubSub::new());
/// let receiver = Receiver::new(bus, ReceiverConfig::default());
///
/// let (agent, mut inbox) = ChannelSubscriber::new(AgentId::parse("Agent2")?);
/// receiver.register_subscriber(Arc::new(agent)).await;
/// receiver.start().await?;
///
/// while let Some(envelope) = inbox.recv().await {
///     println!("{} says {}", envelope.source(), envelope.content());
/// }
///
/// receiver.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Receiver {
    transport: Arc<dyn PubSub>,
    config: ReceiverConfig,
    registry: Arc<SubscriberRegistry>,
    metrics: DispatchMetricsCollector,
    failure_sink: Option<mpsc::UnboundedSender<DispatchFailure>>,
    running: Mutex<Option<RunningLoop>>,
}

impl Receiver {
    /// Create a stopped receiver with an empty registry
    pub fn new(transport: Arc<dyn PubSub>, config: ReceiverConfig) -> Self {
        Self {
            transport,
            config,
            registry: Arc::new(SubscriberRegistry::new()),
            metrics: DispatchMetricsCollector::new(),
            failure_sink: None,
            running: Mutex::new(None),
        }
    }

    /// Report loop failures to `sink` in addition to logging them
    pub fn with_failure_sink(mut self, sink: mpsc::UnboundedSender<DispatchFailure>) -> Self {
        self.failure_sink = Some(sink);
        self
    }

    /// Append a subscriber to the registry
    ///
    /// Registering the same subscriber twice yields two deliveries per
    /// matching envelope.
    pub async fn register_subscriber(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        self.registry.register(subscriber).await
    }

    /// Remove a subscriber; later envelopes are not delivered to it
    pub async fn unregister_subscriber(&self, id: SubscriptionId) -> bool {
        self.registry.unregister(id).await
    }

    /// Number of registered subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.registry.len().await
    }

    pub fn channel(&self) -> &Channel {
        &self.config.channel
    }

    /// Current dispatch counters
    pub async fn metrics(&self) -> DispatchMetrics {
        self.metrics.snapshot().await
    }

    /// Check whether the receive loop is running
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Subscribe and spawn the receive loop
    ///
    /// Returns once the subscription is established, so frames published
    /// afterwards are seen by the loop.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AlreadyRunning` if the loop is active, or the
    /// transport's error if subscribing fails.
    pub async fn start(&self) -> MeshResult<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(MeshError::AlreadyRunning);
        }

        let frames = self.transport.subscribe(&self.config.channel).await?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let dispatcher = Dispatcher {
            registry: Arc::clone(&self.registry),
            metrics: self.metrics.clone(),
            failure_sink: self.failure_sink.clone(),
            handler_timeout: self.config.handler_timeout,
            max_detached: self.config.max_detached,
            in_flight: JoinSet::new(),
            next_seq: 0,
        };

        let handle = tokio::spawn(receive_loop(frames, stop_rx, dispatcher));
        *running = Some(RunningLoop { stop_tx, handle });

        info!(channel = %self.config.channel, "Receiver started");
        Ok(())
    }

    /// Stop the receive loop and clear the registry
    ///
    /// An envelope already taken off the subscription is dispatched to
    /// completion first; handlers previously detached are cancelled.
    /// Stopping a receiver that is not running is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            error!(error = %e, "Receive loop terminated abnormally");
        }

        self.registry.clear().await;
        info!(channel = %self.config.channel, "Receiver stopped");
    }
}

async fn receive_loop(
    mut frames: FrameStream,
    mut stop_rx: watch::Receiver<bool>,
    mut dispatcher: Dispatcher,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => dispatcher.dispatch_frame(&frame).await,
            Some(Err(e)) => dispatcher.report_transport(e).await,
            None => {
                warn!("Subscription stream ended, receive loop exiting");
                break;
            }
        }
    }

    dispatcher.shutdown().await;
}

struct HandlerOutcome {
    seq: u64,
    slot: usize,
    result: Result<(), SubscriberError>,
}

struct Dispatcher {
    registry: Arc<SubscriberRegistry>,
    metrics: DispatchMetricsCollector,
    failure_sink: Option<mpsc::UnboundedSender<DispatchFailure>>,
    handler_timeout: Duration,
    max_detached: usize,
    in_flight: JoinSet<HandlerOutcome>,
    next_seq: u64,
}

impl Dispatcher {
    async fn dispatch_frame(&mut self, frame: &str) {
        self.metrics.record_frame().await;
        self.reap_finished().await;

        match Envelope::from_frame(frame) {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(e) => {
                warn!(error = %e, frame_len = frame.len(), "Dropping undecodable frame");
                self.metrics.record_decode_failure().await;
                self.report(DispatchFailure::Decode(e));
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let subscribers = self.registry.snapshot().await;
        let mut scheduled: Vec<(AbortHandle, String)> = Vec::new();

        for subscriber in subscribers {
            let matched = panic::catch_unwind(AssertUnwindSafe(|| {
                subscriber.is_intended_for_me(&envelope)
            }));

            match matched {
                Ok(true) => {
                    let slot = scheduled.len();
                    let label = subscriber.label().to_string();
                    let handle = self.in_flight.spawn(run_handler(
                        seq,
                        slot,
                        subscriber,
                        envelope.clone(),
                    ));
                    scheduled.push((handle, label));
                }
                Ok(false) => {}
                Err(payload) => {
                    let err = SubscriberError::PredicatePanicked {
                        subscriber: subscriber.label().to_string(),
                        reason: panic_message(payload.as_ref()),
                    };
                    self.report_subscriber(err).await;
                }
            }
        }

        self.metrics.record_dispatch(scheduled.len()).await;
        debug!(
            source = %envelope.source(),
            to = %envelope.to(),
            message_type = %envelope.message_type(),
            deliveries = scheduled.len(),
            "Dispatched envelope"
        );

        self.await_handlers(seq, scheduled).await;
    }

    /// Wait for one envelope's handlers, collecting other outcomes on the way
    async fn await_handlers(&mut self, seq: u64, scheduled: Vec<(AbortHandle, String)>) {
        let mut done = vec![false; scheduled.len()];
        let mut pending = scheduled.len();
        // A timeout too large to represent means waiting without a deadline
        let deadline = Instant::now().checked_add(self.handler_timeout);

        while pending > 0 {
            let joined = match deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline, self.in_flight.join_next()).await
                }
                None => Ok(self.in_flight.join_next().await),
            };
            match joined {
                Ok(Some(Ok(outcome))) => {
                    if outcome.seq == seq && !done[outcome.slot] {
                        done[outcome.slot] = true;
                        pending -= 1;
                    }
                    self.record_outcome(outcome).await;
                }
                Ok(Some(Err(e))) => log_join_error(e),
                Ok(None) => break,
                Err(_) => {
                    self.handle_timeout(&scheduled, &done).await;
                    break;
                }
            }
        }
    }

    async fn handle_timeout(&mut self, scheduled: &[(AbortHandle, String)], done: &[bool]) {
        let detach = self.in_flight.len() < self.max_detached;
        let action = if detach { "detached" } else { "aborted" };

        for ((handle, label), _) in scheduled.iter().zip(done).filter(|(_, done)| !**done) {
            if !detach {
                handle.abort();
            }
            let err = SubscriberError::TimedOut {
                subscriber: label.clone(),
                timeout: self.handler_timeout,
                action,
            };
            warn!(error = %err, "Subscriber handler timed out");
            self.metrics.record_handler_timeout().await;
            self.report(DispatchFailure::Subscriber(err));
        }
    }

    /// Collect outcomes of detached handlers that have since finished
    async fn reap_finished(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            match joined {
                Ok(outcome) => self.record_outcome(outcome).await,
                Err(e) => log_join_error(e),
            }
        }
    }

    async fn record_outcome(&mut self, outcome: HandlerOutcome) {
        if let Err(err) = outcome.result {
            self.report_subscriber(err).await;
        }
    }

    async fn report_subscriber(&mut self, err: SubscriberError) {
        warn!(error = %err, "Subscriber failed, isolating");
        self.metrics.record_subscriber_failure().await;
        self.report(DispatchFailure::Subscriber(err));
    }

    async fn report_transport(&mut self, err: MeshError) {
        error!(error = %err, "Subscription yielded an error");
        self.metrics.record_transport_failure().await;
        self.report(DispatchFailure::Transport(err.to_string()));
    }

    fn report(&self, failure: DispatchFailure) {
        if let Some(sink) = &self.failure_sink {
            // A dropped sink only means nobody is listening
            let _ = sink.send(failure);
        }
    }

    async fn shutdown(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(count = self.in_flight.len(), "Cancelling detached handlers");
        }
        self.in_flight.shutdown().await;
    }
}

async fn run_handler(
    seq: u64,
    slot: usize,
    subscriber: Arc<dyn Subscriber>,
    envelope: Envelope,
) -> HandlerOutcome {
    let result = match AssertUnwindSafe(subscriber.handle_message(envelope))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(SubscriberError::HandlerFailed {
            subscriber: subscriber.label().to_string(),
            reason,
        }),
        Err(payload) => Err(SubscriberError::HandlerPanicked {
            subscriber: subscriber.label().to_string(),
            reason: panic_message(payload.as_ref()),
        }),
    };

    HandlerOutcome { seq, slot, result }
}

fn log_join_error(err: tokio::task::JoinError) {
    if err.is_cancelled() {
        debug!("Aborted handler task reaped");
    } else {
        error!(error = %err, "Handler task failed outside the subscriber");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_config_defaults() {
        let config = ReceiverConfig::default();
        assert_eq!(config.channel.as_str(), "courier.envelopes");
        assert_eq!(config.handler_timeout, Duration::from_secs(30));
        assert_eq!(config.max_detached, 64);
    }

    #[test]
    fn test_receiver_config_builder() {
        let config = ReceiverConfig::new(Channel::parse("lab").unwrap())
            .with_handler_timeout(Duration::from_millis(50))
            .with_max_detached(0);
        assert_eq!(config.channel.as_str(), "lab");
        assert_eq!(config.handler_timeout, Duration::from_millis(50));
        assert_eq!(config.max_detached, 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
