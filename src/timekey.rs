//! Total order over (timestamp, record id).
//!
//! Sysmon timestamps frequently collide within a batch; the winlog record id
//! is a per-channel monotonic counter that breaks those ties. When either
//! side lacks a record id, equal timestamps compare as equal.

use chrono::{DateTime, Utc};

/// Ordering key for concurrent events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeKey {
    pub ts: DateTime<Utc>,
    pub rid: Option<i64>,
}

impl TimeKey {
    /// Builds a key from a timestamp and the raw record id string. A record
    /// id that does not parse as an integer is treated as absent.
    pub fn new(ts: DateTime<Utc>, record_id: &str) -> Self {
        Self {
            ts,
            rid: record_id.parse::<i64>().ok(),
        }
    }

    pub fn lt(&self, other: &TimeKey) -> bool {
        if self.ts < other.ts {
            return true;
        }
        if self.ts > other.ts {
            return false;
        }
        match (self.rid, other.rid) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    pub fn le(&self, other: &TimeKey) -> bool {
        if self.ts < other.ts {
            return true;
        }
        if self.ts > other.ts {
            return false;
        }
        match (self.rid, other.rid) {
            (Some(a), Some(b)) => a <= b,
            _ => true,
        }
    }

    pub fn ge(&self, other: &TimeKey) -> bool {
        if self.ts > other.ts {
            return true;
        }
        if self.ts < other.ts {
            return false;
        }
        match (self.rid, other.rid) {
            (Some(a), Some(b)) => a >= b,
            _ => true,
        }
    }
}
