//! Core value types for the brook storage engine.
//!
//! This module defines stream identity, absolute positions and range
//! addressing. All string components use smart constructors so that a
//! constructed key is always valid and can be rendered as a partition key
//! without further checks.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Delimiter used when rendering composite keys into partition keys.
pub const KEY_DELIMITER: char = '|';

fn no_key_delimiter(value: &str) -> bool {
    !value.contains(KEY_DELIMITER)
}

/// The type component of a stream key (for example `"order"`).
///
/// Trimmed, non-empty, at most 255 characters and free of the key delimiter.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255, predicate = no_key_delimiter),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct StreamType(String);

/// The entity component of a stream key (for example an order number).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255, predicate = no_key_delimiter),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct EntityId(String);

/// Name of the projection or aggregate a snapshot stream materializes.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255, predicate = no_key_delimiter),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct SnapshotType(String);

/// Errors produced when a composite key cannot be constructed or parsed.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The stream type component was rejected.
    #[error("invalid stream type: {0}")]
    StreamType(#[from] StreamTypeError),

    /// The entity id component was rejected.
    #[error("invalid entity id: {0}")]
    EntityId(#[from] EntityIdError),

    /// The snapshot type component was rejected.
    #[error("invalid snapshot type: {0}")]
    SnapshotType(#[from] SnapshotTypeError),

    /// A rendered key did not have the expected number of components.
    #[error("malformed key '{0}'")]
    Malformed(String),
}

/// Identifies one event stream (brook).
///
/// The rendered partition key `"{type}|{id}"` scopes every document that
/// belongs to the stream: events, the committed cursor and the pending cursor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    stream_type: StreamType,
    entity_id: EntityId,
}

impl StreamKey {
    /// Creates a key from already validated components.
    pub const fn new(stream_type: StreamType, entity_id: EntityId) -> Self {
        Self {
            stream_type,
            entity_id,
        }
    }

    /// Validates both raw components and builds a key.
    pub fn try_new(
        stream_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Result<Self, KeyError> {
        Ok(Self {
            stream_type: StreamType::try_new(stream_type.into())?,
            entity_id: EntityId::try_new(entity_id.into())?,
        })
    }

    /// The stream type component.
    pub const fn stream_type(&self) -> &StreamType {
        &self.stream_type
    }

    /// The entity id component.
    pub const fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Renders the partition key shared by all documents of this stream.
    pub fn partition_key(&self) -> String {
        format!("{}{KEY_DELIMITER}{}", self.stream_type, self.entity_id)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_DELIMITER}{}", self.stream_type, self.entity_id)
    }
}

impl FromStr for StreamKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(KEY_DELIMITER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(stream_type), Some(entity_id), None) => Self::try_new(stream_type, entity_id),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

/// An absolute, zero-based position of an event within its stream.
///
/// Only valid positions are representable. "Not set" (no events yet) is
/// modelled as `Option<Position>::None` and written as `-1` on the wire.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize
))]
pub struct Position(u64);

impl Position {
    /// Wire value of a cursor that has no committed events.
    pub const NOT_SET_WIRE: i64 = -1;

    /// The first position of every stream.
    pub fn first() -> Self {
        Self::new(0)
    }

    /// The position immediately after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// Offsets this position by `count` positions.
    #[must_use]
    pub fn offset(self, count: u64) -> Self {
        Self::new(self.into_inner().saturating_add(count))
    }

    /// The position following an optional cursor: `0` for an empty stream.
    pub fn after(cursor: Option<Self>) -> Self {
        cursor.map_or_else(Self::first, Self::next)
    }

    /// Encodes an optional position using the `-1` "not set" sentinel.
    pub fn to_wire(position: Option<Self>) -> i64 {
        position.map_or(Self::NOT_SET_WIRE, |p| {
            i64::try_from(p.into_inner()).unwrap_or(i64::MAX)
        })
    }

    /// Decodes a wire value; every negative value means "not set".
    pub fn from_wire(value: i64) -> Option<Self> {
        u64::try_from(value).ok().map(Self::new)
    }

    /// The document id under which the event at this position is stored.
    pub fn document_id(self) -> String {
        self.into_inner().to_string()
    }
}

/// A contiguous, inclusive range `[start, start + count - 1]` of one stream.
///
/// Used to address one slice of a stream for caching and parallel reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeKey {
    stream: StreamKey,
    start: Position,
    count: u64,
}

impl RangeKey {
    /// Creates a range of `count` positions starting at `start`.
    pub const fn new(stream: StreamKey, start: Position, count: u64) -> Self {
        Self {
            stream,
            start,
            count,
        }
    }

    /// Creates the inclusive range `[from, to]`; empty when `to < from`.
    pub fn inclusive(stream: StreamKey, from: Position, to: Position) -> Self {
        let count = to
            .into_inner()
            .checked_sub(from.into_inner())
            .map_or(0, |span| span.saturating_add(1));
        Self::new(stream, from, count)
    }

    /// The stream this range belongs to.
    pub const fn stream(&self) -> &StreamKey {
        &self.stream
    }

    /// First position of the range.
    pub const fn start(&self) -> Position {
        self.start
    }

    /// Number of positions covered.
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Last position of the range, or `None` for an empty range.
    pub fn end(&self) -> Option<Position> {
        self.count
            .checked_sub(1)
            .map(|last_offset| self.start.offset(last_offset))
    }

    /// Whether the range covers no positions.
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether `position` falls inside the range.
    pub fn contains(&self, position: Position) -> bool {
        self.end()
            .is_some_and(|end| position >= self.start && position <= end)
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_DELIMITER}{}{KEY_DELIMITER}{}",
            self.stream, self.start, self.count
        )
    }
}

/// Identifies the snapshot stream of one projection built from one brook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotStreamKey {
    brook: StreamKey,
    snapshot_type: SnapshotType,
}

impl SnapshotStreamKey {
    /// Creates a snapshot stream key.
    pub const fn new(brook: StreamKey, snapshot_type: SnapshotType) -> Self {
        Self {
            brook,
            snapshot_type,
        }
    }

    /// The brook the snapshots are derived from.
    pub const fn brook(&self) -> &StreamKey {
        &self.brook
    }

    /// The projection the snapshots materialize.
    pub const fn snapshot_type(&self) -> &SnapshotType {
        &self.snapshot_type
    }

    /// Partition key under which all versions of this snapshot stream live.
    pub fn partition_key(&self) -> String {
        format!(
            "{}{KEY_DELIMITER}{}",
            self.brook.partition_key(),
            self.snapshot_type
        )
    }
}

impl fmt::Display for SnapshotStreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.partition_key())
    }
}

/// Addresses one snapshot revision, built from the brook up to `version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    stream: SnapshotStreamKey,
    version: u64,
}

impl SnapshotKey {
    /// Creates a snapshot key.
    pub const fn new(stream: SnapshotStreamKey, version: u64) -> Self {
        Self { stream, version }
    }

    /// The snapshot stream.
    pub const fn stream(&self) -> &SnapshotStreamKey {
        &self.stream
    }

    /// The version this snapshot was built up to.
    pub const fn version(&self) -> u64 {
        self.version
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_DELIMITER}{}", self.stream, self.version)
    }
}

/// A timestamp for when an event occurred.
///
/// Ordering within a stream never depends on it; it is carried as metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
