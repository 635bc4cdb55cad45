//! Document identifiers.
//!
//! Every document carries a 24-character lowercase hex `_id`, the object-id
//! format of the backing document database. Identifiers are validated before
//! any query is issued so a malformed id never reaches storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("Invalid identifier '{0}': expected 24 hexadecimal characters")]
    Malformed(String),
}

/// Validated entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub const LEN: usize = 24;

    /// Parse and normalise an identifier.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let trimmed = raw.trim();
        if trimmed.len() != Self::LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdError::Malformed(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Generate a fresh identifier from 12 random bytes.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..Self::LEN / 2]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl From<&EntityId> for Value {
    fn from(id: &EntityId) -> Self {
        Value::String(id.0.clone())
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        Value::String(id.0)
    }
}
