//! Identifier types for envelope routing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reserved recipient value that addresses every subscriber.
pub const BROADCAST: &str = "ALL";

/// Why a name was rejected as an agent id, recipient or channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    #[error("name is empty")]
    Empty,
    #[error("name is blank")]
    WhitespaceOnly,
    #[error("name has surrounding whitespace")]
    LeadingTrailingWhitespace,
    #[error("name contains disallowed characters")]
    InvalidCharacters,
    #[error("'ALL' is reserved for broadcast")]
    Reserved,
}

fn validate_id(s: &str) -> Result<(), IdValidationError> {
    if s.is_empty() {
        return Err(IdValidationError::Empty);
    }

    if s.trim().is_empty() {
        return Err(IdValidationError::WhitespaceOnly);
    }

    if s != s.trim() {
        return Err(IdValidationError::LeadingTrailingWhitespace);
    }

    // Control characters would let a sender forge log lines
    if s.chars().any(char::is_control) {
        return Err(IdValidationError::InvalidCharacters);
    }

    Ok(())
}

/// Identifier of an agent taking part in the fabric
///
/// ## Validation
/// Valid IDs:
/// - Non-empty
/// - No leading/trailing whitespace
/// - No control characters
/// - Not the broadcast token `ALL`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Parse and validate an agent ID from a string
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_mesh::AgentId;
    ///
    /// assert!(AgentId::parse("Agent1").is_ok());
    /// assert!(AgentId::parse("weather station 4").is_ok());
    ///
    /// assert!(AgentId::parse("").is_err());      // Empty
    /// assert!(AgentId::parse(" agent").is_err()); // Leading whitespace
    /// assert!(AgentId::parse("ALL").is_err());    // Broadcast token
    /// ```
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();
        validate_id(s)?;

        if s == BROADCAST {
            return Err(IdValidationError::Reserved);
        }

        Ok(Self(s.to_string()))
    }

    /// Get the agent ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AgentId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = IdValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate_id(&s)?;
        if s == BROADCAST {
            return Err(IdValidationError::Reserved);
        }
        Ok(Self(s))
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Intended recipient of an envelope
///
/// On the wire this is a plain string; the broadcast token maps to
/// [`Recipient::Broadcast`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    /// Every subscriber
    Broadcast,
    /// A single named agent
    Agent(AgentId),
}

impl Recipient {
    /// Parse a recipient, mapping the broadcast token to `Broadcast`
    pub fn parse(to: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = to.as_ref();
        if s == BROADCAST {
            return Ok(Recipient::Broadcast);
        }
        AgentId::parse(s).map(Recipient::Agent)
    }

    /// Check whether this recipient addresses the given agent
    pub fn includes(&self, agent: &AgentId) -> bool {
        match self {
            Recipient::Broadcast => true,
            Recipient::Agent(id) => id == agent,
        }
    }

    /// Check if this is the broadcast recipient
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast)
    }

    /// Get the recipient as it appears on the wire
    pub fn as_str(&self) -> &str {
        match self {
            Recipient::Broadcast => BROADCAST,
            Recipient::Agent(id) => id.as_str(),
        }
    }
}

impl From<AgentId> for Recipient {
    fn from(id: AgentId) -> Self {
        Recipient::Agent(id)
    }
}

impl FromStr for Recipient {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Recipient {
    type Error = IdValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<Recipient> for String {
    fn from(recipient: Recipient) -> Self {
        match recipient {
            Recipient::Broadcast => BROADCAST.to_string(),
            Recipient::Agent(id) => id.into(),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pub/sub channel name
///
/// Valid channels are non-empty and contain only alphanumeric characters,
/// hyphens, underscores, dots and colons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

/// Channel used when none is configured
pub const DEFAULT_CHANNEL: &str = "courier.envelopes";

impl Channel {
    /// Parse and validate a channel name
    ///
    /// ```
    /// use courier_mesh::Channel;
    ///
    /// assert!(Channel::parse("courier.envelopes").is_ok());
    /// assert!(Channel::parse("").is_err());
    /// assert!(Channel::parse("a b").is_err());
    /// ```
    pub fn parse(name: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = name.as_ref();
        validate_id(s)?;

        if !s
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(IdValidationError::InvalidCharacters);
        }

        Ok(Self(s.to_string()))
    }

    /// Get the channel name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self(DEFAULT_CHANNEL.to_string())
    }
}

impl FromStr for Channel {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Channel {
    type Error = IdValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
