use binlog_pitr_core::{BinlogEvent, EventFlags, LogPosition};

use crate::segment::CodecError;

/// Fixed header size for an event frame:
/// [u64 next.file_seq][u64 next.offset][u32 timestamp][u8 flags][u32 len][u32 crc]
pub const FRAME_HEADER_SIZE: usize = 29;

pub fn frame_len(event: &BinlogEvent) -> usize {
    FRAME_HEADER_SIZE + event.data.len()
}

/// Append one event frame to `out`. The CRC covers the raw event bytes.
pub fn encode_frame(event: &BinlogEvent, out: &mut Vec<u8>) {
    out.extend_from_slice(&event.next.file_seq.to_le_bytes());
    out.extend_from_slice(&event.next.offset.to_le_bytes());
    out.extend_from_slice(&event.timestamp.to_le_bytes());
    out.push(event.flags.bits());
    out.extend_from_slice(&(event.data.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&event.data).to_le_bytes());
    out.extend_from_slice(&event.data);
}

pub fn encode_frames(events: &[BinlogEvent]) -> Vec<u8> {
    let total: usize = events.iter().map(frame_len).sum();
    let mut out = Vec::with_capacity(total);
    for event in events {
        encode_frame(event, &mut out);
    }
    out
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

/// Decode a payload made of concatenated frames.
///
/// Segments are immutable whole objects, so unlike a live log tail a partial
/// trailing frame or a CRC mismatch is corruption, not a stopping point.
pub fn decode_frames(buf: &[u8]) -> Result<Vec<BinlogEvent>, CodecError> {
    let mut idx = 0usize;
    let mut out = Vec::new();
    while idx < buf.len() {
        if idx + FRAME_HEADER_SIZE > buf.len() {
            return Err(CodecError::Truncated {
                need: idx + FRAME_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let next = LogPosition::new(read_u64(buf, idx), read_u64(buf, idx + 8));
        let timestamp = read_u32(buf, idx + 16);
        let flags = EventFlags::from_bits(buf[idx + 20]);
        let len = read_u32(buf, idx + 21) as usize;
        let crc = read_u32(buf, idx + 25);
        let start = idx + FRAME_HEADER_SIZE;
        let end = start + len;
        if end > buf.len() {
            return Err(CodecError::Truncated {
                need: end,
                have: buf.len(),
            });
        }
        let data = &buf[start..end];
        if crc32fast::hash(data) != crc {
            return Err(CodecError::FrameChecksum { index: out.len() });
        }
        out.push(BinlogEvent::new(data.to_vec(), next, timestamp, flags));
        idx = end;
    }
    Ok(out)
}
