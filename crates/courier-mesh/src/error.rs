//! Error types for envelope handling and transport operations

use std::time::Duration;
use thiserror::Error;

use crate::types::IdValidationError;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors raised by the pub/sub side of the fabric
#[derive(Error, Debug)]
pub enum MeshError {
    /// Connection to messaging backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a frame
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Failed to subscribe to a channel
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Failed to receive a frame from an active subscription
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Envelope serialization failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The receive loop is already running
    #[error("Receiver is already running")]
    AlreadyRunning,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationFailed(err.to_string())
    }
}

/// A malformed envelope, rejected before any side effect
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The payload is not a JSON object
    #[error("envelope must be a JSON object")]
    NotAnObject,

    /// A required field is absent or null
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field has the wrong JSON type
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    /// A field has the right type but an unacceptable value
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// `message_type` is outside the closed set
    #[error("unknown message_type `{0}`")]
    UnknownMessageType(String),
}

impl ValidationError {
    /// Name of the offending field
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::NotAnObject => None,
            Self::MissingField(field) => Some(field),
            Self::WrongType { field, .. } | Self::InvalidField { field, .. } => Some(field),
            Self::UnknownMessageType(_) => Some("message_type"),
        }
    }

    pub(crate) fn invalid_id(field: &'static str, err: IdValidationError) -> Self {
        Self::InvalidField {
            field,
            reason: err.to_string(),
        }
    }
}

/// A pub/sub frame that could not be turned into an envelope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame is not valid JSON
    #[error("frame is not valid JSON: {0}")]
    Json(String),

    /// The frame is JSON but not a valid envelope
    #[error("frame is not a valid envelope: {0}")]
    Envelope(#[from] ValidationError),
}

/// A registered subscriber failed while handling an envelope
///
/// These are contained by the receive loop: logged, reported to the
/// failure sink, never propagated to sibling subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    /// `is_intended_for_me` panicked
    #[error("subscriber `{subscriber}` predicate panicked: {reason}")]
    PredicatePanicked { subscriber: String, reason: String },

    /// `handle_message` returned an error
    #[error("subscriber `{subscriber}` handler failed: {reason}")]
    HandlerFailed { subscriber: String, reason: String },

    /// `handle_message` panicked
    #[error("subscriber `{subscriber}` handler panicked: {reason}")]
    HandlerPanicked { subscriber: String, reason: String },

    /// `handle_message` did not finish within the handler timeout
    #[error("subscriber `{subscriber}` handler still running after {timeout:?} ({action})")]
    TimedOut {
        subscriber: String,
        timeout: Duration,
        action: &'static str,
    },
}

impl SubscriberError {
    /// Label of the subscriber that failed
    pub fn subscriber(&self) -> &str {
        match self {
            Self::PredicatePanicked { subscriber, .. }
            | Self::HandlerFailed { subscriber, .. }
            | Self::HandlerPanicked { subscriber, .. }
            | Self::TimedOut { subscriber, .. } => subscriber,
        }
    }
}

/// Point-to-point delivery failed below the protocol level
///
/// Carries the endpoint and the underlying cause. Never retried internally.
#[derive(Error, Debug)]
#[error("transport to {endpoint} failed: {source}")]
pub struct TransportError {
    pub endpoint: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl TransportError {
    /// Wrap a cause for the given endpoint
    pub fn new(
        endpoint: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }
}

/// A failure observed by the receive loop
#[derive(Debug, Clone)]
pub enum DispatchFailure {
    /// A frame was dropped because it did not decode
    Decode(DecodeError),
    /// A subscriber raised
    Subscriber(SubscriberError),
    /// The subscription stream yielded a transport error
    Transport(String),
}

impl std::fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode failure: {}", e),
            Self::Subscriber(e) => write!(f, "subscriber failure: {}", e),
            Self::Transport(e) => write!(f, "transport failure: {}", e),
        }
    }
}
