use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::position::LogPosition;

/// Per-event markers the apply path needs to keep transactions whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFlags(u8);

impl EventFlags {
    pub const NONE: EventFlags = EventFlags(0);
    /// The event completes a transaction, or is a self-contained event.
    pub const TRANSACTION_END: EventFlags = EventFlags(0b0000_0001);
    /// Format description needed by the apply tool; neutral to transaction boundaries.
    pub const PREAMBLE: EventFlags = EventFlags(0b0000_0010);

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        EventFlags(bits & 0b0000_0011)
    }

    pub const fn contains(&self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn union(self, other: EventFlags) -> Self {
        EventFlags(self.0 | other.0)
    }
}

impl Display for EventFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (
            self.contains(EventFlags::TRANSACTION_END),
            self.contains(EventFlags::PREAMBLE),
        ) {
            (true, true) => write!(f, "txn_end|preamble"),
            (true, false) => write!(f, "txn_end"),
            (false, true) => write!(f, "preamble"),
            (false, false) => write!(f, "none"),
        }
    }
}

/// One raw binlog event as captured from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// Raw event bytes, exactly as the source produced them.
    pub data: Vec<u8>,
    /// Coordinate immediately after this event; resuming here skips it.
    pub next: LogPosition,
    /// Source commit timestamp, unix seconds.
    pub timestamp: u32,
    pub flags: EventFlags,
}

impl BinlogEvent {
    pub fn new(data: Vec<u8>, next: LogPosition, timestamp: u32, flags: EventFlags) -> Self {
        Self {
            data,
            next,
            timestamp,
            flags,
        }
    }

    pub fn ends_transaction(&self) -> bool {
        self.flags.contains(EventFlags::TRANSACTION_END)
    }

    pub fn is_preamble(&self) -> bool {
        self.flags.contains(EventFlags::PREAMBLE)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp as i64, 0)
    }
}
