//! Counters for the receive loop
//!
//! Cardinality-safe: no per-agent or per-subscriber labels.

use std::sync::Arc;
use tokio::sync::RwLock;

/// Snapshot of receive loop counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    /// Frames taken off the subscription
    pub frames_received_total: u64,
    /// Frames that decoded into an envelope and were dispatched
    pub envelopes_dispatched_total: u64,
    /// Handler tasks scheduled (one per matching subscriber per envelope)
    pub deliveries_scheduled_total: u64,
    /// Frames dropped because they did not decode
    pub decode_failures_total: u64,
    /// Predicate or handler failures, timeouts included
    pub subscriber_failures_total: u64,
    /// Handlers that outlived the handler timeout
    pub handler_timeouts_total: u64,
    /// Errors yielded by the subscription stream
    pub transport_failures_total: u64,
}

/// Shared collector updated by the receive loop
#[derive(Debug, Clone, Default)]
pub struct DispatchMetricsCollector {
    metrics: Arc<RwLock<DispatchMetrics>>,
}

impl DispatchMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_frame(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.frames_received_total = metrics.frames_received_total.saturating_add(1);
    }

    /// Record a dispatched envelope and how many handlers it scheduled
    pub async fn record_dispatch(&self, deliveries: usize) {
        let mut metrics = self.metrics.write().await;
        metrics.envelopes_dispatched_total = metrics.envelopes_dispatched_total.saturating_add(1);
        metrics.deliveries_scheduled_total = metrics
            .deliveries_scheduled_total
            .saturating_add(deliveries as u64);
    }

    pub async fn record_decode_failure(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.decode_failures_total = metrics.decode_failures_total.saturating_add(1);
    }

    pub async fn record_subscriber_failure(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.subscriber_failures_total = metrics.subscriber_failures_total.saturating_add(1);
    }

    /// A timeout also counts as a subscriber failure
    pub async fn record_handler_timeout(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.handler_timeouts_total = metrics.handler_timeouts_total.saturating_add(1);
        metrics.subscriber_failures_total = metrics.subscriber_failures_total.saturating_add(1);
    }

    pub async fn record_transport_failure(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.transport_failures_total = metrics.transport_failures_total.saturating_add(1);
    }

    /// Current counter values
    pub async fn snapshot(&self) -> DispatchMetrics {
        self.metrics.read().await.clone()
    }
}
