//! Records flowing from the edge stream into per-entity spools.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw entity identifier from the source domain (a cluster id in the edge stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Which side of an edge an entity sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The entity is the edge's `dst`.
    Inbound,
    /// The entity is the edge's `src`.
    Outbound,
}

impl Direction {
    pub const ALL: [Self; 2] = [Self::Inbound, Self::Outbound];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }

    #[must_use]
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Inbound => 1,
            Self::Outbound => 2,
        }
    }
}

/// One parsed row of the edge stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub src: EntityId,
    pub dst: EntityId,
    /// Monotonic-ish transaction id, used as the temporal key.
    pub tx_id: u64,
    pub features: Vec<f32>,
}

/// A qualifying edge row together with its position in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRow {
    /// 0-based data-row number in the edge stream (header excluded).
    pub ordinal: u64,
    pub record: EdgeRecord,
}

/// One record appended to an entity's spool.
///
/// `ordinal` identifies the stream row the entry came from; a row replayed after
/// a resume carries the same ordinal and is dropped on read.
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolEntry {
    pub ordinal: u64,
    pub tx_id: u64,
    pub features: Vec<f32>,
}

impl SpoolEntry {
    #[must_use]
    pub fn from_row(row: StreamRow) -> Self {
        Self {
            ordinal: row.ordinal,
            tx_id: row.record.tx_id,
            features: row.record.features,
        }
    }
}

/// Why a stream row was not routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    Blank,
    InvalidUtf8,
    FieldCount { expected: usize, found: usize },
    InvalidEntityId,
    InvalidTxId,
    InvalidFeature { column: usize },
    NonFiniteFeature { column: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blank => f.write_str("blank row"),
            Self::InvalidUtf8 => f.write_str("row is not valid UTF-8"),
            Self::FieldCount { expected, found } => {
                write!(f, "expected {expected} fields, found {found}")
            }
            Self::InvalidEntityId => f.write_str("unparseable entity id"),
            Self::InvalidTxId => f.write_str("unparseable txId"),
            Self::InvalidFeature { column } => write!(f, "unparseable feature in column {column}"),
            Self::NonFiniteFeature { column } => write!(f, "non-finite feature in column {column}"),
        }
    }
}

/// Result of parsing one stream row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Parsed(EdgeRecord),
    /// Parsed far enough to know neither endpoint is a target entity.
    Irrelevant,
    Skipped(SkipReason),
}
