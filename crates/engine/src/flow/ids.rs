//! Client and flow identifiers

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Request identifier, unique within a single flow (1-based, monotonic)
pub type RequestId = u64;

/// Error returned when parsing an identifier fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Client id does not match `C.` followed by 16 hex digits
    #[error("invalid client id: {0:?}")]
    InvalidClientId(String),

    /// Flow id is not 8 hex digits
    #[error("invalid flow id: {0:?}")]
    InvalidFlowId(String),
}

/// Identifier of a remote agent, e.g. `C.1000000000000000`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    const PREFIX: &'static str = "C.";
    const HEX_LEN: usize = 16;

    /// Parse and validate a client id
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        let valid = id
            .strip_prefix(Self::PREFIX)
            .map(|hex| {
                hex.len() == Self::HEX_LEN
                    && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
            })
            .unwrap_or(false);

        if valid {
            Ok(Self(id))
        } else {
            Err(IdError::InvalidClientId(id))
        }
    }

    /// Build the client id for a numeric index (`C.1000000000000000` + index)
    ///
    /// Handy for fixtures that need a handful of distinct clients.
    pub fn from_index(index: u32) -> Self {
        Self(format!("{}{:016x}", Self::PREFIX, 0x1000_0000_0000_0000u64 + index as u64))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Identifier of a flow, unique within its client, e.g. `ABCDEF12`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(String);

impl FlowId {
    const LEN: usize = 8;

    /// Parse and validate a flow id (case-insensitive, normalized to uppercase)
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.len() == Self::LEN && id.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(id.to_ascii_uppercase()))
        } else {
            Err(IdError::InvalidFlowId(id))
        }
    }

    /// Generate a random flow id
    ///
    /// Uniqueness within a client is enforced by the store on creation.
    pub fn random() -> Self {
        let value: u32 = rand::thread_rng().gen();
        Self(format!("{:08X}", value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FlowId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for FlowId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FlowId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Fully qualified flow identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub client_id: ClientId,
    pub flow_id: FlowId,
}

impl FlowKey {
    pub fn new(client_id: ClientId, flow_id: FlowId) -> Self {
        Self { client_id, flow_id }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.flow_id)
    }
}
