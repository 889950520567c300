//! Entity identifiers.
//!
//! Every entity is addressed by an [`EntityId`]: the [`EntityKind`] plus a
//! `namespace:name` key that is unique within that kind. The kind travels
//! with the id so a thing and a policy may share the same key without
//! colliding in the journal or in the actor map.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Position of an entity in its own event log.
///
/// Revision 0 is the empty entity; the first persisted event carries
/// revision 1.
pub type Revision = u64;

/// Errors produced when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The kind segment is not one of the known entity kinds.
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    /// The key is not of the form `namespace:name`.
    #[error("malformed entity key '{key}': {reason}")]
    MalformedKey {
        /// The offending key.
        key: String,
        /// Why the key was rejected.
        reason: &'static str,
    },
}

/// The kinds of event-sourced entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A connection to an external messaging system.
    Connection,
    /// An authorization policy (modeled as state only).
    Policy,
    /// A digital twin.
    Thing,
}

impl EntityKind {
    /// All kinds, in a stable order.
    pub const ALL: [Self; 3] = [Self::Connection, Self::Policy, Self::Thing];

    /// Lowercase name used in storage columns, subjects and stream ids.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Policy => "policy",
            Self::Thing => "thing",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connection" => Ok(Self::Connection),
            "policy" => Ok(Self::Policy),
            "thing" => Ok(Self::Thing),
            other => Err(IdError::UnknownKind(other.to_owned())),
        }
    }
}

/// Identifier of a single entity: kind plus unique key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    /// The entity kind.
    pub kind: EntityKind,
    /// The `namespace:name` key, unique within the kind.
    pub key: String,
}

impl EntityId {
    /// Build an identifier without validating the key.
    ///
    /// Keys are validated by the create strategies; lookups for keys that
    /// were never created simply find nothing.
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    /// Shorthand for a connection id.
    pub fn connection(key: impl Into<String>) -> Self {
        Self::new(EntityKind::Connection, key)
    }

    /// Shorthand for a policy id.
    pub fn policy(key: impl Into<String>) -> Self {
        Self::new(EntityKind::Policy, key)
    }

    /// Shorthand for a thing id.
    pub fn thing(key: impl Into<String>) -> Self {
        Self::new(EntityKind::Thing, key)
    }

    /// Check that the key has the `namespace:name` shape.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::MalformedKey`] describing the first violation.
    pub fn validate(&self) -> Result<(), IdError> {
        validate_key(&self.key)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

impl FromStr for EntityId {
    type Err = IdError;

    /// Parse the `kind:namespace:name` form produced by [`Display`](fmt::Display).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, key) = s.split_once(':').ok_or_else(|| IdError::MalformedKey {
            key: s.to_owned(),
            reason: "missing kind prefix",
        })?;
        let id = Self::new(kind.parse()?, key);
        id.validate()?;
        Ok(id)
    }
}

/// Validate a `namespace:name` key.
///
/// # Errors
///
/// Returns [`IdError::MalformedKey`] if either segment is empty or the key
/// contains whitespace or `/`.
pub fn validate_key(key: &str) -> Result<(), IdError> {
    let malformed = |reason| IdError::MalformedKey {
        key: key.to_owned(),
        reason,
    };
    let (namespace, name) = key
        .split_once(':')
        .ok_or_else(|| malformed("expected namespace:name"))?;
    if namespace.is_empty() {
        return Err(malformed("empty namespace"));
    }
    if name.is_empty() {
        return Err(malformed("empty name"));
    }
    if key.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(malformed("whitespace or '/' not allowed"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        let id = EntityId::thing("org.example:sensor-1");
        assert_eq!(id.to_string(), "thing:org.example:sensor-1");
        let parsed: EntityId = "thing:org.example:sensor-1".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn unknown_kind_rejected() {
        let err = "device:org.example:x".parse::<EntityId>().unwrap_err();
        assert_eq!(err, IdError::UnknownKind("device".to_owned()));
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("ns:name").is_ok());
        assert!(validate_key("ns:name:with:colons").is_ok());
        assert!(validate_key("no-separator").is_err());
        assert!(validate_key(":name").is_err());
        assert!(validate_key("ns:").is_err());
        assert!(validate_key("ns:has space").is_err());
        assert!(validate_key("ns:a/b").is_err());
    }

    #[test]
    fn same_key_different_kind_differs() {
        assert_ne!(EntityId::thing("a:b"), EntityId::policy("a:b"));
    }
}
