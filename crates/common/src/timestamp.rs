//! Cluster timestamps and replication optimes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical cluster timestamp in microseconds since the Unix epoch.
///
/// Zero is the null timestamp and never refers to a real oplog position.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The null timestamp.
    pub const NULL: Timestamp = Timestamp(0);

    /// Create a timestamp from microseconds since the Unix epoch.
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Get microseconds since the Unix epoch.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Whether this is the null timestamp.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self(micros)
    }

    /// This timestamp advanced by the given number of microseconds.
    pub fn add_micros(&self, micros: u64) -> Self {
        Self(self.0 + micros)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Term value of an optime that was never assigned by a replication term.
pub const UNINITIALIZED_TERM: i64 = -1;

/// A position in the oplog: a cluster timestamp plus the replication term it
/// was issued in. Terms dominate timestamps when ordering optimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpTime {
    timestamp: Timestamp,
    term: i64,
}

impl OpTime {
    /// Create an optime from a timestamp and term.
    pub fn new(timestamp: Timestamp, term: i64) -> Self {
        Self { timestamp, term }
    }

    /// The null optime: null timestamp, uninitialized term.
    pub fn null() -> Self {
        Self {
            timestamp: Timestamp::NULL,
            term: UNINITIALIZED_TERM,
        }
    }

    /// Whether this is the null optime.
    pub fn is_null(&self) -> bool {
        self.timestamp.is_null()
    }

    /// The timestamp component.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The replication term component.
    pub fn term(&self) -> i64 {
        self.term
    }
}

impl Default for OpTime {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialOrd for OpTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.term, self.timestamp).cmp(&(other.term, other.timestamp))
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ts: {}, t: {} }}", self.timestamp, self.term)
    }
}
