use binlog_pitr_core::{BinlogEvent, LogPosition};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::frames::{decode_frames, encode_frames};

/// Segment object magic.
pub const SEGMENT_MAGIC: &[u8; 4] = b"PITR";
pub const SEGMENT_VERSION: u8 = 1;

/// Fixed header layout (little-endian), followed by the frame payload:
///
/// | bytes  | field                                   |
/// |--------|-----------------------------------------|
/// | 0..4   | magic `PITR`                            |
/// | 4      | version                                 |
/// | 5..8   | reserved                                |
/// | 8..16  | sequence                                |
/// | 16..32 | start position (file_seq, offset)       |
/// | 32..48 | end position (file_seq, offset)        |
/// | 48..64 | captured-from / captured-to, unix ms    |
/// | 64..68 | event count                             |
/// | 68..76 | payload length                          |
/// | 76..80 | payload crc32                           |
/// | 80..84 | header crc32 over bytes 0..80           |
pub const HEADER_SIZE: usize = 84;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported segment version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("header checksum mismatch")]
    HeaderChecksum,
    #[error("payload checksum mismatch")]
    PayloadChecksum,
    #[error("frame {index} checksum mismatch")]
    FrameChecksum { index: usize },
    #[error("inconsistent segment: {0}")]
    Inconsistent(String),
}

/// Segment metadata, readable without downloading the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub sequence: u64,
    /// Exclusive lower bound of the covered range.
    pub start: LogPosition,
    /// Inclusive upper bound of the covered range.
    pub end: LogPosition,
    pub captured_from: DateTime<Utc>,
    pub captured_to: DateTime<Utc>,
    pub event_count: u32,
    pub payload_len: u64,
    pub payload_crc: u32,
}

impl SegmentHeader {
    /// An idle-cycle segment: advances time coverage, claims no positions.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True if `pos` lies in `(start, end]`.
    pub fn covers(&self, pos: LogPosition) -> bool {
        self.start < pos && pos <= self.end
    }

    pub fn object_len(&self) -> u64 {
        HEADER_SIZE as u64 + self.payload_len
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(SEGMENT_MAGIC);
        buf[4] = SEGMENT_VERSION;
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..24].copy_from_slice(&self.start.file_seq.to_le_bytes());
        buf[24..32].copy_from_slice(&self.start.offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.end.file_seq.to_le_bytes());
        buf[40..48].copy_from_slice(&self.end.offset.to_le_bytes());
        buf[48..56].copy_from_slice(&self.captured_from.timestamp_millis().to_le_bytes());
        buf[56..64].copy_from_slice(&self.captured_to.timestamp_millis().to_le_bytes());
        buf[64..68].copy_from_slice(&self.event_count.to_le_bytes());
        buf[68..76].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[76..80].copy_from_slice(&self.payload_crc.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..80]);
        buf[80..84].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                need: HEADER_SIZE,
                have: buf.len(),
            });
        }
        if &buf[0..4] != SEGMENT_MAGIC {
            return Err(CodecError::BadMagic);
        }
        if buf[4] != SEGMENT_VERSION {
            return Err(CodecError::UnsupportedVersion(buf[4]));
        }
        if crc32fast::hash(&buf[0..80]) != u32_at(buf, 80) {
            return Err(CodecError::HeaderChecksum);
        }
        let header = SegmentHeader {
            sequence: u64_at(buf, 8),
            start: LogPosition::new(u64_at(buf, 16), u64_at(buf, 24)),
            end: LogPosition::new(u64_at(buf, 32), u64_at(buf, 40)),
            captured_from: millis_to_datetime(u64_at(buf, 48) as i64)?,
            captured_to: millis_to_datetime(u64_at(buf, 56) as i64)?,
            event_count: u32_at(buf, 64),
            payload_len: u64_at(buf, 68),
            payload_crc: u32_at(buf, 76),
        };
        if header.end < header.start {
            return Err(CodecError::Inconsistent(format!(
                "end {} precedes start {}",
                header.end, header.start
            )));
        }
        Ok(header)
    }
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, CodecError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CodecError::Inconsistent(format!("timestamp {} out of range", ms)))
}

fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// An immutable chunk of captured binlog events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: SegmentHeader,
    pub events: Vec<BinlogEvent>,
}

impl Segment {
    /// Assemble a segment from the events captured after `start`.
    ///
    /// Event coordinates must be non-decreasing and every non-preamble event
    /// must advance the position. `end` is the last event's `next`, or `start`
    /// when nothing was captured. Capture times are kept at millisecond
    /// precision, the resolution of the stored header.
    pub fn build(
        sequence: u64,
        start: LogPosition,
        captured_from: DateTime<Utc>,
        captured_to: DateTime<Utc>,
        events: Vec<BinlogEvent>,
    ) -> Result<Self, CodecError> {
        let mut prev = start;
        for (idx, event) in events.iter().enumerate() {
            let advances = event.next > prev || (event.is_preamble() && event.next == prev);
            if !advances {
                return Err(CodecError::Inconsistent(format!(
                    "event {} at {} does not follow {}",
                    idx, event.next, prev
                )));
            }
            prev = event.next;
        }
        let payload = encode_frames(&events);
        let header = SegmentHeader {
            sequence,
            start,
            end: prev,
            captured_from: truncate_millis(captured_from),
            captured_to: truncate_millis(captured_to),
            event_count: events.len() as u32,
            payload_len: payload.len() as u64,
            payload_crc: crc32fast::hash(&payload),
        };
        Ok(Self { header, events })
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload = encode_frames(&self.events);
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let header = SegmentHeader::decode(buf)?;
        let expected = header.object_len() as usize;
        if buf.len() != expected {
            return Err(CodecError::Truncated {
                need: expected,
                have: buf.len(),
            });
        }
        let payload = &buf[HEADER_SIZE..];
        if crc32fast::hash(payload) != header.payload_crc {
            return Err(CodecError::PayloadChecksum);
        }
        let events = decode_frames(payload)?;
        if events.len() != header.event_count as usize {
            return Err(CodecError::Inconsistent(format!(
                "header declares {} events, payload holds {}",
                header.event_count,
                events.len()
            )));
        }
        let last = events.last().map(|e| e.next).unwrap_or(header.start);
        if last != header.end {
            return Err(CodecError::Inconsistent(format!(
                "header end {} but last event ends at {}",
                header.end, last
            )));
        }
        Ok(Self { header, events })
    }

    pub fn payload_bytes(&self) -> u64 {
        self.header.payload_len
    }
}
