//! The envelope: the unit of communication between agents.
//!
//! An envelope is a value object. Once constructed, the only permitted
//! mutation is the one-time `created_at` stamp applied at publication.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "source": "Agent1",
//!   "to": "Agent2",
//!   "content": "hi",
//!   "created_at": "2026-01-01T12:00:00Z",
//!   "message_type": "CHAT"
//! }
//! ```
//!
//! `created_at` is `null` until stamped. `to` may be the broadcast token
//! [`BROADCAST`](crate::types::BROADCAST).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{DecodeError, ValidationError};
use crate::types::{AgentId, Recipient};

/// Closed set of envelope kinds
///
/// The type never drives routing; it is there for subscribers that dispatch
/// on message semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Helo,
    Ack,
    Chat,
    System,
    Sensor,
    Error,
    Info,
}

impl MessageType {
    /// Every variant, in declaration order
    pub const ALL: [MessageType; 7] = [
        MessageType::Helo,
        MessageType::Ack,
        MessageType::Chat,
        MessageType::System,
        MessageType::Sensor,
        MessageType::Error,
        MessageType::Info,
    ];

    /// Wire name of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ack => "ACK",
            Self::Chat => "CHAT",
            Self::System => "SYSTEM",
            Self::Sensor => "SENSOR",
            Self::Error => "ERROR",
            Self::Info => "INFO",
        }
    }
}

impl FromStr for MessageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownMessageType(s.to_string()))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message exchanged between agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Envelope {
    source: AgentId,
    to: Recipient,
    content: String,
    created_at: Option<DateTime<Utc>>,
    message_type: MessageType,
}

impl Envelope {
    /// Create an unstamped envelope
    pub fn new(
        source: AgentId,
        to: impl Into<Recipient>,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            source,
            to: to.into(),
            content: content.into(),
            created_at: None,
            message_type,
        }
    }

    /// Create an envelope from raw string fields, validating each one
    pub fn parse(
        source: &str,
        to: &str,
        content: impl Into<String>,
        message_type: &str,
    ) -> Result<Self, ValidationError> {
        let source =
            AgentId::parse(source).map_err(|e| ValidationError::invalid_id("source", e))?;
        let to = Recipient::parse(to).map_err(|e| ValidationError::invalid_id("to", e))?;
        let message_type = message_type.parse()?;
        Ok(Self::new(source, to, content, message_type))
    }

    /// Set an explicit creation time
    ///
    /// Used by producers that already know when the message was created.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Validate a JSON value as an envelope
    ///
    /// Unknown fields are ignored. `created_at` may be absent or `null`.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut fields) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let source = take_string(&mut fields, "source")?;
        let to = take_string(&mut fields, "to")?;
        let content = take_string(&mut fields, "content")?;
        let message_type = take_string(&mut fields, "message_type")?;

        let created_at = match fields.remove("created_at") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| ValidationError::InvalidField {
                        field: "created_at",
                        reason: e.to_string(),
                    })?
                    .with_timezone(&Utc),
            ),
            Some(_) => {
                return Err(ValidationError::WrongType {
                    field: "created_at",
                    expected: "an RFC 3339 string or null",
                });
            }
        };

        let mut envelope = Self::parse(&source, &to, content, &message_type)?;
        envelope.created_at = created_at;
        Ok(envelope)
    }

    /// Decode a pub/sub frame
    pub fn from_frame(frame: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| DecodeError::Json(e.to_string()))?;
        Ok(Self::from_value(value)?)
    }

    /// Encode as a pub/sub frame
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Stamp `created_at` if it is still unset
    ///
    /// Returns `true` when the stamp was applied. An existing timestamp is
    /// never overwritten.
    pub fn stamp_created_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.created_at.is_some() {
            return false;
        }
        self.created_at = Some(now);
        true
    }

    /// Check whether this envelope is addressed to `agent`, directly or by broadcast
    pub fn is_addressed_to(&self, agent: &AgentId) -> bool {
        self.to.includes(agent)
    }

    pub fn source(&self) -> &AgentId {
        &self.source
    }

    pub fn to(&self) -> &Recipient {
        &self.to
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Check if this envelope is addressed to every subscriber
    pub fn is_broadcast(&self) -> bool {
        self.to.is_broadcast()
    }
}

impl TryFrom<Value> for Envelope {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

fn take_string(fields: &mut Map<String, Value>, field: &'static str) -> Result<String, ValidationError> {
    match fields.remove(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "a string",
        }),
    }
}
