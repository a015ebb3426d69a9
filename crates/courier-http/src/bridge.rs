//! Inbound HTTP endpoint that republishes envelopes on pub/sub
//!
//! `POST /messages` is the only place `created_at` is stamped. The body is
//! parsed and validated in full before anything is published, so a rejected
//! request never produces a frame.

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    middleware,
    routing::{get, post},
};
use chrono::Utc;
use courier_mesh::{Channel, Envelope, PubSub, publish_envelope};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::debug;

use crate::{
    config::BridgeConfig,
    error::{BridgeError, BridgeErrorKind, RequestIdExtension, request_id_middleware},
};

/// Request counters for the inbound endpoint
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    published: AtomicU64,
    invalid_json: AtomicU64,
    validation_failures: AtomicU64,
    publish_failures: AtomicU64,
}

/// Point-in-time copy of [`BridgeMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeCounters {
    pub published: u64,
    pub invalid_json: u64,
    pub validation_failures: u64,
    pub publish_failures: u64,
}

impl BridgeMetrics {
    pub fn snapshot(&self) -> BridgeCounters {
        BridgeCounters {
            published: self.published.load(Ordering::Relaxed),
            invalid_json: self.invalid_json.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &Result<Envelope, BridgeErrorKind>) {
        let counter = match outcome {
            Ok(_) => &self.published,
            Err(BridgeErrorKind::InvalidJson(_)) => &self.invalid_json,
            Err(BridgeErrorKind::Validation(_)) => &self.validation_failures,
            Err(BridgeErrorKind::Publish(_)) => &self.publish_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Context shared by every bridge request
///
/// Built once at startup and handed to axum as router state.
#[derive(Clone)]
pub struct BridgeState {
    publisher: Arc<dyn PubSub>,
    channel: Channel,
    metrics: Arc<BridgeMetrics>,
    started_at: Instant,
}

impl BridgeState {
    pub fn new(publisher: Arc<dyn PubSub>, channel: Channel) -> Self {
        Self {
            publisher,
            channel,
            metrics: Arc::new(BridgeMetrics::default()),
            started_at: Instant::now(),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    /// Validate, stamp and publish one inbound payload
    ///
    /// Returns the envelope exactly as published.
    pub async fn accept(&self, body: &[u8]) -> Result<Envelope, BridgeErrorKind> {
        let outcome = self.validate_and_publish(body).await;
        self.metrics.record(&outcome);
        outcome
    }

    async fn validate_and_publish(&self, body: &[u8]) -> Result<Envelope, BridgeErrorKind> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| BridgeErrorKind::InvalidJson(e.to_string()))?;
        let mut envelope = Envelope::from_value(value)?;

        let stamped = envelope.stamp_created_at(Utc::now());
        publish_envelope(self.publisher.as_ref(), &self.channel, &envelope).await?;

        debug!(
            source = %envelope.source(),
            to = %envelope.to(),
            message_type = %envelope.message_type(),
            stamped,
            "Republished envelope"
        );
        Ok(envelope)
    }
}

/// Build the bridge router with its middleware stack
pub fn router(state: BridgeState, config: &BridgeConfig) -> Router {
    let mut router = Router::new()
        .route("/messages", post(accept_message))
        .route("/health", get(health_check))
        .with_state(state)
        // The configured limit replaces the extractor's built-in default
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_body_size))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware));

    if config.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

/// POST /messages - accept an envelope and republish it
async fn accept_message(
    State(state): State<BridgeState>,
    Extension(RequestIdExtension(request_id)): Extension<RequestIdExtension>,
    body: Bytes,
) -> Result<Json<Envelope>, BridgeError> {
    state
        .accept(&body)
        .await
        .map(Json)
        .map_err(|kind| BridgeError::new(kind, request_id))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    channel: String,
    uptime_secs: u64,
    counters: BridgeCounters,
}

/// GET /health - liveness and request counters
async fn health_check(State(state): State<BridgeState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "courier-bridge",
        version: env!("CARGO_PKG_VERSION"),
        channel: state.channel.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        counters: state.metrics.snapshot(),
    })
}
