//! Receive loop behaviour over the in-memory bus

use async_trait::async_trait;
use courier_mesh::{
    AgentId, Channel, ChannelSubscriber, DispatchFailure, Envelope, FrameStream, InMemoryPubSub,
    MeshError, MeshResult, MessageType, PubSub, Receiver, ReceiverConfig, Subscriber,
    SubscriberError, publish_envelope,
};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

fn agent(name: &str) -> AgentId {
    AgentId::parse(name).unwrap()
}

async fn started(
    bus: Arc<InMemoryPubSub>,
    config: ReceiverConfig,
) -> (Receiver, mpsc::UnboundedReceiver<DispatchFailure>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let receiver = Receiver::new(bus, config).with_failure_sink(tx);
    receiver.start().await.unwrap();
    (receiver, rx)
}

async fn publish(bus: &InMemoryPubSub, envelope: &Envelope) {
    publish_envelope(bus, &Channel::default(), envelope)
        .await
        .unwrap();
}

async fn expect_envelope(inbox: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    timeout(WAIT, inbox.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("inbox closed")
}

async fn expect_nothing<T: std::fmt::Debug>(inbox: &mut mpsc::UnboundedReceiver<T>) {
    let res = timeout(QUIET, inbox.recv()).await;
    assert!(res.is_err(), "unexpected item: {:?}", res);
}

async fn expect_failure(failures: &mut mpsc::UnboundedReceiver<DispatchFailure>) -> DispatchFailure {
    timeout(WAIT, failures.recv())
        .await
        .expect("timed out waiting for failure report")
        .expect("failure sink closed")
}

/// Subscriber whose handler always fails or panics
struct Faulty {
    panic: bool,
}

#[async_trait]
impl Subscriber for Faulty {
    fn is_intended_for_me(&self, _envelope: &Envelope) -> bool {
        true
    }

    async fn handle_message(&self, _envelope: Envelope) -> Result<(), String> {
        if self.panic {
            panic!("handler exploded");
        }
        Err("cannot handle".to_string())
    }

    fn label(&self) -> &str {
        if self.panic { "panicky" } else { "failing" }
    }
}

/// Subscriber whose predicate panics
struct BrokenPredicate;

#[async_trait]
impl Subscriber for BrokenPredicate {
    fn is_intended_for_me(&self, _envelope: &Envelope) -> bool {
        panic!("predicate exploded");
    }

    async fn handle_message(&self, _envelope: Envelope) -> Result<(), String> {
        Ok(())
    }

    fn label(&self) -> &str {
        "broken-predicate"
    }
}

/// Subscriber that records when its predicate is asked
struct OrderRecorder {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Subscriber for OrderRecorder {
    fn is_intended_for_me(&self, _envelope: &Envelope) -> bool {
        self.log.lock().unwrap().push(self.name);
        false
    }

    async fn handle_message(&self, _envelope: Envelope) -> Result<(), String> {
        Ok(())
    }
}

/// Subscriber that blocks until every peer has entered its handler
struct Rendezvous {
    barrier: Arc<Barrier>,
    done: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl Subscriber for Rendezvous {
    fn is_intended_for_me(&self, _envelope: &Envelope) -> bool {
        true
    }

    async fn handle_message(&self, _envelope: Envelope) -> Result<(), String> {
        self.barrier.wait().await;
        let _ = self.done.send(());
        Ok(())
    }
}

/// Subscriber that sleeps longer than any test timeout
struct Sluggish;

#[async_trait]
impl Subscriber for Sluggish {
    fn is_intended_for_me(&self, envelope: &Envelope) -> bool {
        envelope.message_type() == MessageType::Sensor
    }

    async fn handle_message(&self, _envelope: Envelope) -> Result<(), String> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }

    fn label(&self) -> &str {
        "sluggish"
    }
}

#[tokio::test]
async fn test_direct_envelope_reaches_only_its_recipient() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, _failures) = started(bus.clone(), ReceiverConfig::default()).await;

    let (agent2, mut inbox2) = ChannelSubscriber::new(agent("Agent2"));
    let (agent3, mut inbox3) = ChannelSubscriber::new(agent("Agent3"));
    receiver.register_subscriber(Arc::new(agent2)).await;
    receiver.register_subscriber(Arc::new(agent3)).await;

    let envelope = Envelope::parse("Agent1", "Agent2", "Hello, Agent2!", "HELO").unwrap();
    publish(&bus, &envelope).await;

    assert_eq!(expect_envelope(&mut inbox2).await, envelope);
    expect_nothing(&mut inbox3).await;

    receiver.stop().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_agent() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, _failures) = started(bus.clone(), ReceiverConfig::default()).await;

    let mut inboxes = Vec::new();
    for name in ["Agent1", "Agent2", "Agent3"] {
        let (sub, inbox) = ChannelSubscriber::new(agent(name));
        receiver.register_subscriber(Arc::new(sub)).await;
        inboxes.push(inbox);
    }

    let envelope = Envelope::parse("Agent1", "ALL", "shutting down at noon", "SYSTEM").unwrap();
    publish(&bus, &envelope).await;

    for inbox in &mut inboxes {
        assert_eq!(expect_envelope(inbox).await.content(), "shutting down at noon");
    }

    receiver.stop().await;
}

#[tokio::test]
async fn test_failing_handlers_are_isolated() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, mut failures) = started(bus.clone(), ReceiverConfig::default()).await;

    receiver
        .register_subscriber(Arc::new(Faulty { panic: false }))
        .await;
    receiver
        .register_subscriber(Arc::new(Faulty { panic: true }))
        .await;
    let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
    receiver.register_subscriber(Arc::new(agent2)).await;

    let envelope = Envelope::parse("Agent1", "Agent2", "still here?", "CHAT").unwrap();
    publish(&bus, &envelope).await;
    assert_eq!(expect_envelope(&mut inbox).await, envelope);

    let mut reported = Vec::new();
    for _ in 0..2 {
        match expect_failure(&mut failures).await {
            DispatchFailure::Subscriber(err) => reported.push(err),
            other => panic!("unexpected failure: {other}"),
        }
    }
    reported.sort_by(|a, b| a.subscriber().cmp(b.subscriber()));
    assert!(matches!(&reported[0], SubscriberError::HandlerFailed { reason, .. } if reason == "cannot handle"));
    assert!(matches!(&reported[1], SubscriberError::HandlerPanicked { reason, .. } if reason == "handler exploded"));

    // The loop survives and keeps delivering
    let next = Envelope::parse("Agent1", "Agent2", "yes", "CHAT").unwrap();
    publish(&bus, &next).await;
    assert_eq!(expect_envelope(&mut inbox).await, next);

    let metrics = receiver.metrics().await;
    assert!(metrics.subscriber_failures_total >= 2);
    receiver.stop().await;
}

#[tokio::test]
async fn test_predicate_panic_is_isolated() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, mut failures) = started(bus.clone(), ReceiverConfig::default()).await;

    receiver.register_subscriber(Arc::new(BrokenPredicate)).await;
    let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
    receiver.register_subscriber(Arc::new(agent2)).await;

    publish(&bus, &Envelope::parse("Agent1", "ALL", "ping", "INFO").unwrap()).await;

    assert_eq!(expect_envelope(&mut inbox).await.content(), "ping");
    match expect_failure(&mut failures).await {
        DispatchFailure::Subscriber(SubscriberError::PredicatePanicked { subscriber, reason }) => {
            assert_eq!(subscriber, "broken-predicate");
            assert_eq!(reason, "predicate exploded");
        }
        other => panic!("unexpected failure: {other}"),
    }

    receiver.stop().await;
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, mut failures) = started(bus.clone(), ReceiverConfig::default()).await;

    let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
    receiver.register_subscriber(Arc::new(agent2)).await;

    let channel = Channel::default();
    bus.publish(&channel, "not json".into()).await.unwrap();
    bus.publish(
        &channel,
        r#"{"source":"Agent1","to":"Agent2","content":"x","message_type":"GOSSIP"}"#.into(),
    )
    .await
    .unwrap();

    let good = Envelope::parse("Agent1", "Agent2", "valid", "CHAT").unwrap();
    publish(&bus, &good).await;

    assert_eq!(expect_envelope(&mut inbox).await, good);
    expect_nothing(&mut inbox).await;

    for _ in 0..2 {
        assert!(matches!(
            expect_failure(&mut failures).await,
            DispatchFailure::Decode(_)
        ));
    }

    let metrics = receiver.metrics().await;
    assert_eq!(metrics.frames_received_total, 3);
    assert_eq!(metrics.decode_failures_total, 2);
    assert_eq!(metrics.envelopes_dispatched_total, 1);
    assert_eq!(metrics.deliveries_scheduled_total, 1);

    receiver.stop().await;
}

#[tokio::test]
async fn test_predicates_run_in_registration_order() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, _failures) = started(bus.clone(), ReceiverConfig::default()).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
        receiver
            .register_subscriber(Arc::new(OrderRecorder {
                name,
                log: Arc::clone(&log),
            }))
            .await;
    }
    let (tail, mut inbox) = ChannelSubscriber::new(agent("Tail"));
    receiver.register_subscriber(Arc::new(tail)).await;

    publish(&bus, &Envelope::parse("Agent1", "ALL", "order", "INFO").unwrap()).await;
    expect_envelope(&mut inbox).await;

    assert_eq!(*log.lock().unwrap(), ["first", "second", "third"]);
    receiver.stop().await;
}

#[tokio::test]
async fn test_handlers_run_concurrently() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, _failures) = started(bus.clone(), ReceiverConfig::default()).await;

    // Each handler waits for the other; sequential dispatch would never finish
    let barrier = Arc::new(Barrier::new(2));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    for _ in 0..2 {
        receiver
            .register_subscriber(Arc::new(Rendezvous {
                barrier: Arc::clone(&barrier),
                done: done_tx.clone(),
            }))
            .await;
    }

    publish(&bus, &Envelope::parse("Agent1", "ALL", "together", "CHAT").unwrap()).await;

    for _ in 0..2 {
        timeout(WAIT, done_rx.recv())
            .await
            .expect("handlers did not run concurrently");
    }
    receiver.stop().await;
}

#[tokio::test]
async fn test_slow_handler_is_detached_after_timeout() {
    let bus = Arc::new(InMemoryPubSub::new());
    let config = ReceiverConfig::default().with_handler_timeout(Duration::from_millis(50));
    let (receiver, mut failures) = started(bus.clone(), config).await;

    receiver.register_subscriber(Arc::new(Sluggish)).await;
    let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
    receiver.register_subscriber(Arc::new(agent2)).await;

    publish(&bus, &Envelope::parse("Sensor1", "ALL", "21.5C", "SENSOR").unwrap()).await;
    expect_envelope(&mut inbox).await;

    match expect_failure(&mut failures).await {
        DispatchFailure::Subscriber(SubscriberError::TimedOut {
            subscriber, action, ..
        }) => {
            assert_eq!(subscriber, "sluggish");
            assert_eq!(action, "detached");
        }
        other => panic!("unexpected failure: {other}"),
    }

    // The next envelope is not held up by the detached handler
    let next = Envelope::parse("Agent1", "Agent2", "after", "CHAT").unwrap();
    publish(&bus, &next).await;
    assert_eq!(expect_envelope(&mut inbox).await, next);

    assert_eq!(receiver.metrics().await.handler_timeouts_total, 1);
    timeout(WAIT, receiver.stop())
        .await
        .expect("stop waited on a detached handler");
}

#[tokio::test]
async fn test_late_handlers_are_aborted_beyond_detached_limit() {
    let bus = Arc::new(InMemoryPubSub::new());
    let config = ReceiverConfig::default()
        .with_handler_timeout(Duration::from_millis(50))
        .with_max_detached(0);
    let (receiver, mut failures) = started(bus.clone(), config).await;

    receiver.register_subscriber(Arc::new(Sluggish)).await;
    publish(&bus, &Envelope::parse("Sensor1", "ALL", "21.5C", "SENSOR").unwrap()).await;

    match expect_failure(&mut failures).await {
        DispatchFailure::Subscriber(SubscriberError::TimedOut { action, .. }) => {
            assert_eq!(action, "aborted");
        }
        other => panic!("unexpected failure: {other}"),
    }
    receiver.stop().await;
}

#[tokio::test]
async fn test_unregister_and_duplicate_registration() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, _failures) = started(bus.clone(), ReceiverConfig::default()).await;

    let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
    let agent2: Arc<dyn Subscriber> = Arc::new(agent2);
    let first = receiver.register_subscriber(Arc::clone(&agent2)).await;
    receiver.register_subscriber(Arc::clone(&agent2)).await;
    assert_eq!(receiver.subscriber_count().await, 2);

    publish(&bus, &Envelope::parse("Agent1", "Agent2", "twice", "CHAT").unwrap()).await;
    expect_envelope(&mut inbox).await;
    expect_envelope(&mut inbox).await;

    assert!(receiver.unregister_subscriber(first).await);
    publish(&bus, &Envelope::parse("Agent1", "Agent2", "once", "CHAT").unwrap()).await;
    assert_eq!(expect_envelope(&mut inbox).await.content(), "once");
    expect_nothing(&mut inbox).await;

    receiver.stop().await;
}

#[tokio::test]
async fn test_start_stop_lifecycle() {
    let bus = Arc::new(InMemoryPubSub::new());
    let receiver = Receiver::new(bus.clone(), ReceiverConfig::default());

    // Stopping before starting is a no-op
    receiver.stop().await;
    assert!(!receiver.is_running().await);

    receiver.start().await.unwrap();
    assert!(receiver.is_running().await);
    assert!(matches!(
        receiver.start().await,
        Err(MeshError::AlreadyRunning)
    ));

    let (agent2, _inbox) = ChannelSubscriber::new(agent("Agent2"));
    receiver.register_subscriber(Arc::new(agent2)).await;

    receiver.stop().await;
    assert!(!receiver.is_running().await);
    assert_eq!(receiver.subscriber_count().await, 0);
    assert_eq!(bus.subscriber_count(&Channel::default()).await, 0);

    // A stopped receiver can be started again
    receiver.start().await.unwrap();
    let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
    receiver.register_subscriber(Arc::new(agent2)).await;
    publish(&bus, &Envelope::parse("Agent1", "Agent2", "again", "ACK").unwrap()).await;
    assert_eq!(expect_envelope(&mut inbox).await.content(), "again");
    receiver.stop().await;
}

/// Bus whose subscription yields one transport error before a frame
struct FlakyBus {
    frame: String,
}

#[async_trait]
impl PubSub for FlakyBus {
    async fn publish(&self, _channel: &Channel, _frame: String) -> MeshResult<()> {
        Ok(())
    }

    async fn subscribe(&self, _channel: &Channel) -> MeshResult<FrameStream> {
        let items = vec![
            Err(MeshError::ReceiveFailed("connection reset".into())),
            Ok(self.frame.clone()),
        ];
        Ok(Box::pin(
            futures::stream::iter(items).chain(futures::stream::pending()),
        ))
    }
}

#[tokio::test]
async fn test_transport_errors_do_not_stop_the_loop() {
    let envelope = Envelope::parse("Agent1", "Agent2", "survived", "CHAT").unwrap();
    let bus = Arc::new(FlakyBus {
        frame: envelope.to_frame().unwrap(),
    });

    let (tx, mut failures) = mpsc::unbounded_channel();
    let receiver = Receiver::new(bus, ReceiverConfig::default()).with_failure_sink(tx);
    let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
    receiver.register_subscriber(Arc::new(agent2)).await;
    receiver.start().await.unwrap();

    assert!(matches!(
        expect_failure(&mut failures).await,
        DispatchFailure::Transport(reason) if reason.contains("connection reset")
    ));
    assert_eq!(expect_envelope(&mut inbox).await, envelope);
    assert_eq!(receiver.metrics().await.transport_failures_total, 1);

    receiver.stop().await;
}

#[test]
fn test_receiver_runs_on_current_thread_runtime() {
    tokio_test::block_on(async {
        let bus = Arc::new(InMemoryPubSub::new());
        let receiver = Receiver::new(bus.clone(), ReceiverConfig::default());
        receiver.start().await.unwrap();

        let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
        receiver.register_subscriber(Arc::new(agent2)).await;
        publish(&bus, &Envelope::parse("Agent1", "Agent2", "hi", "CHAT").unwrap()).await;

        assert_eq!(inbox.recv().await.map(|e| e.content().to_string()).as_deref(), Some("hi"));
        receiver.stop().await;
    });
}

#[tokio::test]
async fn test_envelopes_arrive_in_transport_order() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, _failures) = started(bus.clone(), ReceiverConfig::default()).await;
    let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
    receiver.register_subscriber(Arc::new(agent2)).await;

    for i in 0..20 {
        let envelope = Envelope::parse("Agent1", "Agent2", i.to_string(), "CHAT").unwrap();
        publish(&bus, &envelope).await;
    }

    for i in 0..20 {
        assert_eq!(expect_envelope(&mut inbox).await.content(), i.to_string());
    }

    receiver.stop().await;
}

/// Handler that takes a while and records when it has finished
struct Deliberate {
    started: mpsc::UnboundedSender<()>,
    finished: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl Subscriber for Deliberate {
    fn is_intended_for_me(&self, _envelope: &Envelope) -> bool {
        true
    }

    async fn handle_message(&self, _envelope: Envelope) -> Result<(), String> {
        let _ = self.started.send(());
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_stop_completes_in_flight_dispatch() {
    let bus = Arc::new(InMemoryPubSub::new());
    let (receiver, _failures) = started(bus.clone(), ReceiverConfig::default()).await;

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
    receiver
        .register_subscriber(Arc::new(Deliberate {
            started: started_tx,
            finished: Arc::clone(&finished),
        }))
        .await;

    let envelope = Envelope::parse("Agent1", "ALL", "slow", "INFO").unwrap();
    publish(&bus, &envelope).await;

    timeout(WAIT, started_rx.recv())
        .await
        .expect("handler never started");
    receiver.stop().await;

    assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
    assert!(!receiver.is_running().await);
}

#[tokio::test]
async fn test_unrepresentable_handler_timeout_waits_without_deadline() {
    let bus = Arc::new(InMemoryPubSub::new());
    let config = ReceiverConfig::default().with_handler_timeout(Duration::MAX);
    let (receiver, mut failures) = started(bus.clone(), config).await;
    let (agent2, mut inbox) = ChannelSubscriber::new(agent("Agent2"));
    receiver.register_subscriber(Arc::new(agent2)).await;

    for content in ["first", "second"] {
        let envelope = Envelope::parse("Agent1", "Agent2", content, "CHAT").unwrap();
        publish(&bus, &envelope).await;
        assert_eq!(expect_envelope(&mut inbox).await.content(), content);
    }

    assert!(receiver.is_running().await);
    expect_nothing(&mut failures).await;
    receiver.stop().await;
}
