//! Tag records and their wire encoding.
//!
//! Clients exchange tags as strings in one of two forms:
//!
//! ```text
//! key:value                   untimed, stamped by the server
//! 1705318245123456789|key:value   explicit nanosecond timestamp
//! ```
//!
//! Strings are parsed once at the boundary into [`TagMutation`]; the engine
//! only ever stores typed [`TagVersion`] records.

use crate::error::{Result, TagError};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// Per-entity monotonic counter that orders versions sharing a timestamp.
pub type Sequence = u64;

/// Separator between the timestamp prefix and the tag body.
const TIMESTAMP_SEPARATOR: char = '|';

/// Separator between tag key and value.
const KEY_VALUE_SEPARATOR: char = ':';

/// Returns the current wall-clock time in nanoseconds.
pub fn current_timestamp_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Immutable identifier of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(Uuid);

impl EntityId {
    /// The smallest possible id; used as a lower bound in ordered scans.
    pub const MIN: EntityId = EntityId(Uuid::from_bytes([0x00; 16]));

    /// The largest possible id; used as an upper bound in ordered scans.
    pub const MAX: EntityId = EntityId(Uuid::from_bytes([0xff; 16]));

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds an id from its 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Stable hash used to route the entity to a shard.
    pub fn shard_hash(&self) -> u64 {
        xxhash_rust::xxh64::xxh64(self.as_bytes(), 0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EntityId {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|err| TagError::InvalidTag(format!("invalid entity id '{}': {}", s, err)))
    }
}

/// Kind of mutation a version records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TagOp {
    /// The key takes the version's value.
    Set = 1,
    /// The key is removed from the current view.
    Delete = 2,
}

impl TagOp {
    /// Converts an on-disk byte back into an op.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Set),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One version of one key on an entity's timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagVersion {
    /// When the version took effect.
    pub timestamp: Timestamp,
    /// Tag key.
    pub key: String,
    /// Tag value; empty for deletes.
    pub value: String,
    /// Set or delete.
    pub op: TagOp,
    /// Per-entity sequence assigned on append.
    pub sequence: Sequence,
}

impl TagVersion {
    /// Returns the `(timestamp, sequence)` pair that totally orders versions
    /// within an entity.
    pub fn order_key(&self) -> (Timestamp, Sequence) {
        (self.timestamp, self.sequence)
    }

    /// Returns true for `Set` versions.
    pub fn is_set(&self) -> bool {
        self.op == TagOp::Set
    }

    /// Returns the value if this version sets the key.
    pub fn set_value(&self) -> Option<&str> {
        self.is_set().then_some(self.value.as_str())
    }

    /// Encodes the version as an explicit temporal tag.
    pub fn to_wire(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.timestamp, TIMESTAMP_SEPARATOR, self.key, KEY_VALUE_SEPARATOR, self.value
        )
    }
}

/// Retention cut of one key: every version of `key` ordered at or before
/// `through` is pruned, except the key's newest version.
///
/// Retention only ever removes a prefix of a key's stream, so one mark per
/// key describes a whole prune. Marks are logged with the write that caused
/// them and replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneMark {
    /// Pruned key.
    pub key: String,
    /// Order key of the newest pruned version.
    pub through: (Timestamp, Sequence),
}

/// Reference to a version returned by an append.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionHandle {
    /// Entity the version belongs to.
    pub entity_id: EntityId,
    /// Tag key.
    pub key: String,
    /// Timestamp the version was recorded at.
    pub timestamp: Timestamp,
    /// Server-assigned sequence.
    pub sequence: Sequence,
}

impl VersionHandle {
    /// Builds the handle for a stored version.
    pub fn new(entity_id: EntityId, version: &TagVersion) -> Self {
        Self {
            entity_id,
            key: version.key.clone(),
            timestamp: version.timestamp,
            sequence: version.sequence,
        }
    }
}

/// A requested change to one key, before the server assigns a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMutation {
    /// Tag key.
    pub key: String,
    /// New value; ignored for deletes.
    pub value: String,
    /// Set or delete.
    pub op: TagOp,
    /// Explicit timestamp; `None` means "now".
    pub timestamp: Option<Timestamp>,
}

impl TagMutation {
    /// Creates an untimed set mutation.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            op: TagOp::Set,
            timestamp: None,
        }
    }

    /// Creates an untimed delete mutation.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            op: TagOp::Delete,
            timestamp: None,
        }
    }

    /// Pins the mutation to an explicit timestamp.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Parses a wire tag (`key:value` or `timestampNanos|key:value`).
    ///
    /// A `|` only introduces a timestamp when the text before it contains no
    /// `:`; otherwise it is part of the value. A body without `:` yields an
    /// empty value.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidTimestamp`] if the prefix is not a
    /// non-negative integer, and [`TagError::InvalidTag`] if the key is empty.
    pub fn parse(wire: &str) -> Result<Self> {
        let wire = wire.trim();

        let (timestamp, body) = match wire.split_once(TIMESTAMP_SEPARATOR) {
            Some((prefix, body)) if !prefix.contains(KEY_VALUE_SEPARATOR) => {
                let key = body.split(KEY_VALUE_SEPARATOR).next().unwrap_or_default();
                let ts = prefix.trim().parse::<i64>().map_err(|_| {
                    TagError::invalid_timestamp(key, format!("'{}' is not a nanosecond timestamp", prefix))
                })?;
                if ts < 0 {
                    return Err(TagError::invalid_timestamp(key, "timestamp is negative"));
                }
                (Some(ts), body)
            }
            _ => (None, wire),
        };

        let (key, value) = body.split_once(KEY_VALUE_SEPARATOR).unwrap_or((body, ""));
        validate_key(key)?;

        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
            op: TagOp::Set,
            timestamp,
        })
    }

    /// Encodes the mutation back to its wire form. Deletes have no wire form
    /// and encode as an empty value.
    pub fn to_wire(&self) -> String {
        match self.timestamp {
            Some(ts) => format!(
                "{}{}{}{}{}",
                ts, TIMESTAMP_SEPARATOR, self.key, KEY_VALUE_SEPARATOR, self.value
            ),
            None => format!("{}{}{}", self.key, KEY_VALUE_SEPARATOR, self.value),
        }
    }
}

impl FromStr for TagMutation {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Rejects keys that cannot round-trip through the wire encoding.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(TagError::InvalidTag("tag key is empty".to_string()));
    }
    if key.contains(TIMESTAMP_SEPARATOR) || key.contains(KEY_VALUE_SEPARATOR) {
        return Err(TagError::InvalidTag(format!(
            "tag key '{}' contains a reserved separator",
            key
        )));
    }
    Ok(())
}
