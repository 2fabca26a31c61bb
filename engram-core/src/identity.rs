//! Identity types for Engram entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// TYPED ID SYSTEM
// ============================================================================

/// Trait implemented by every strongly-typed Engram ID.
///
/// Each record type gets its own newtype so IDs cannot be mixed up at
/// compile time.
pub trait IdType:
    Copy
    + Clone
    + Eq
    + PartialEq
    + Hash
    + fmt::Debug
    + fmt::Display
    + FromStr
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Name of the record type (e.g. "entry", "tag").
    const RECORD_NAME: &'static str;

    /// Wrap a raw UUID.
    fn from_uuid(uuid: Uuid) -> Self;

    /// The underlying UUID.
    fn as_uuid(&self) -> Uuid;

    /// All-zeros ID.
    fn nil() -> Self {
        Self::from_uuid(Uuid::nil())
    }

    /// New timestamp-sortable UUIDv7 ID.
    fn now_v7() -> Self {
        Self::from_uuid(Uuid::now_v7())
    }
}

/// Error returned when a typed ID fails to parse from a string.
#[derive(Debug, Clone)]
pub struct IdParseError {
    pub record_name: &'static str,
    pub input: String,
    pub source: uuid::Error,
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to parse {} id from '{}': {}",
            self.record_name, self.input, self.source
        )
    }
}

impl std::error::Error for IdParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

macro_rules! define_id {
    ($name:ident, $record:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl IdType for $name {
            const RECORD_NAME: &'static str = $record;

            fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s)
                    .map(Self::from_uuid)
                    .map_err(|e| IdParseError {
                        record_name: Self::RECORD_NAME,
                        input: s.to_string(),
                        source: e,
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                // Transparent UUID string on the wire
                self.0.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                Uuid::deserialize(deserializer).map(Self::from_uuid)
            }
        }
    };
}

define_id!(EntryId, "entry", "Type-safe ID for memory entries.");
define_id!(VersionId, "version", "Type-safe ID for entry versions.");
define_id!(TagId, "tag", "Type-safe ID for tags.");
define_id!(RelationId, "relation", "Type-safe ID for entry relations.");
define_id!(LockId, "lock", "Type-safe ID for file locks.");
define_id!(ConflictId, "conflict", "Type-safe ID for conflict records.");
define_id!(AuditId, "audit", "Type-safe ID for audit records.");
define_id!(OrgId, "org", "Type-safe ID for organizations.");
define_id!(ProjectId, "project", "Type-safe ID for projects.");
define_id!(SessionId, "session", "Type-safe ID for sessions.");
define_id!(GrantId, "grant", "Type-safe ID for permission grants.");
define_id!(VoteId, "vote", "Type-safe ID for votes.");

// ============================================================================
// AGENT IDENTITY
// ============================================================================

/// Maximum accepted length for an agent identifier.
pub const MAX_AGENT_ID_LEN: usize = 128;

/// Opaque agent identity.
///
/// Agents self-identify over the tool protocol with a caller-chosen string
/// (for example `"claude-session-4f2a"`). The string is validated but never
/// interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Validate and wrap an agent identifier.
    ///
    /// Rejects empty, overlong, and control-character identifiers.
    pub fn new(raw: impl Into<String>) -> Result<Self, AgentIdError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AgentIdError::Empty);
        }
        if trimmed.len() > MAX_AGENT_ID_LEN {
            return Err(AgentIdError::TooLong {
                len: trimmed.len(),
                max: MAX_AGENT_ID_LEN,
            });
        }
        if trimmed.chars().any(|c| c.is_control()) {
            return Err(AgentIdError::ControlCharacter);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// System actor used for internal mutations (migrations, imports).
    pub fn system() -> Self {
        Self("system".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentId {
    type Err = AgentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Validation failure for agent identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentIdError {
    #[error("agent id must not be empty")]
    Empty,

    #[error("agent id is {len} bytes, maximum is {max}")]
    TooLong { len: usize, max: usize },

    #[error("agent id must not contain control characters")]
    ControlCharacter,
}

// ============================================================================
// OTHER IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash, hex-encoded.
pub type ContentFingerprint = String;

/// Compute the SHA-256 fingerprint of a text payload.
pub fn content_fingerprint(text: &str) -> ContentFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let entry_id = EntryId::now_v7();
        let tag_id = TagId::now_v7();

        // This would not compile if uncommented:
        // let _: EntryId = tag_id;

        assert_ne!(entry_id.as_uuid(), tag_id.as_uuid());
    }

    #[test]
    fn test_id_display_and_parse() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id: EntryId = uuid_str.parse().expect("valid UUID should parse");
        assert_eq!(id.to_string(), uuid_str);
        assert_eq!(
            format!("{:?}", EntryId::nil()),
            "EntryId(00000000-0000-0000-0000-000000000000)"
        );
    }

    #[test]
    fn test_id_parse_error_names_record() {
        let result: Result<TagId, _> = "not-a-uuid".parse();
        let err = result.unwrap_err();
        assert_eq!(err.record_name, "tag");
        assert_eq!(err.input, "not-a-uuid");
    }

    #[test]
    fn test_id_serde_transparent() {
        let id = EntryId::now_v7();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with('"') && json.ends_with('"'));
        let back: EntryId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_agent_id_validation() {
        assert!(AgentId::new("claude-session-1").is_ok());
        assert_eq!(AgentId::new("  padded  ").unwrap().as_str(), "padded");
        assert_eq!(AgentId::new(""), Err(AgentIdError::Empty));
        assert_eq!(AgentId::new("   "), Err(AgentIdError::Empty));
        assert_eq!(
            AgentId::new("bad\nagent"),
            Err(AgentIdError::ControlCharacter)
        );
        assert!(matches!(
            AgentId::new("x".repeat(200)),
            Err(AgentIdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_content_fingerprint_is_stable() {
        let a = content_fingerprint("use parameterized queries");
        let b = content_fingerprint("use parameterized queries");
        let c = content_fingerprint("use prepared statements");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Fingerprints are 64 hex chars for any input and equal inputs
        /// always agree.
        #[test]
        fn prop_fingerprint_shape(text in ".*") {
            let a = content_fingerprint(&text);
            prop_assert_eq!(a.len(), 64);
            prop_assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
            prop_assert_eq!(a.clone(), content_fingerprint(&text));
        }

        /// Agent id validation never panics, and accepted ids are
        /// trimmed, bounded, and control-free.
        #[test]
        fn prop_agent_id_accepts_only_clean_input(raw in ".{0,200}") {
            match AgentId::new(raw.clone()) {
                Ok(agent) => {
                    let s = agent.as_str();
                    prop_assert!(!s.is_empty());
                    prop_assert!(s.len() <= MAX_AGENT_ID_LEN);
                    prop_assert!(!s.chars().any(|c| c.is_control()));
                    prop_assert_eq!(s, s.trim());
                }
                Err(_) => {
                    let trimmed = raw.trim();
                    prop_assert!(
                        trimmed.is_empty()
                            || trimmed.len() > MAX_AGENT_ID_LEN
                            || trimmed.chars().any(|c| c.is_control())
                    );
                }
            }
        }

        /// Typed ids round-trip through their string form.
        #[test]
        fn prop_id_string_roundtrip(bytes in any::<[u8; 16]>()) {
            let id = EntryId::from_uuid(Uuid::from_bytes(bytes));
            let parsed: EntryId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
