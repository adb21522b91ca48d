//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a
//! header that identifies the chunk stream and message being sent.
//!
//! ```text
//! Chunk Format:
//! +-------------+-----------------+-------------------+
//! | Basic Header| Message Header  | Chunk Data        |
//! | (1-3 bytes) | (0,3,7,11 bytes)| (variable)        |
//! +-------------+-----------------+-------------------+
//!
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)        for csid 2-63
//! - 2 bytes: fmt(2) + 0 + csid(8)    for csid 64-319
//! - 3 bytes: fmt(2) + 1 + csid(16)   for csid 64-65599
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4 LE)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  (use previous chunk's values)
//!
//! Extended timestamp (4 bytes) is appended when the 24-bit field saturates.
//! ```
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// A complete RTMP message (reassembled from chunks)
#[derive(Debug, Clone)]
pub struct RtmpChunk {
    /// Chunk stream ID (for multiplexing)
    pub csid: u32,
    /// Message timestamp (milliseconds, absolute after delta accumulation)
    pub timestamp: u32,
    /// Message type ID
    pub message_type: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Message payload
    pub payload: Bytes,
}

/// Per-chunk-stream continuation state for reassembly
#[derive(Debug, Clone, Default)]
struct ChunkStreamState {
    /// Last absolute timestamp
    timestamp: u32,
    /// Last timestamp delta
    timestamp_delta: u32,
    /// Last message length
    message_length: u32,
    /// Last message type
    message_type: u8,
    /// Last message stream ID
    stream_id: u32,
    /// fmt of the last non-continuation header
    last_fmt: u8,
    /// Whether the last header carried an extended timestamp
    has_extended_timestamp: bool,
    /// Buffer for partial message reassembly
    partial_message: BytesMut,
    /// Expected total length of current message
    expected_length: u32,
}

/// Chunk stream decoder
///
/// Handles chunk demultiplexing and message reassembly.
pub struct ChunkDecoder {
    /// Maximum incoming chunk payload size
    chunk_size: u32,
    /// Per-chunk-stream state, keyed by CSID
    streams: HashMap<u32, ChunkStreamState>,
    /// Maximum message size (sanity limit)
    max_message_size: u32,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Set the chunk size (called when receiving Set Chunk Size)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.min(MAX_CHUNK_SIZE);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Try to decode a complete message from the buffer
    ///
    /// Returns Ok(Some(message)) if a complete message was assembled,
    /// Ok(None) if more data is needed, or Err on protocol error.
    /// Consumes nothing until a whole chunk is available.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpChunk>> {
        // Never consume anything until the whole chunk is buffered
        if !self.chunk_available(buf)? {
            return Ok(None);
        }

        let (fmt, csid, header_len) = match parse_basic_header(buf)? {
            Some(v) => v,
            None => return Ok(None),
        };

        let chunk_size = self.chunk_size;
        let max_message_size = self.max_message_size;
        let state = self.streams.entry(csid).or_default();

        let msg_header_size = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            3 => 0,
            _ => return Err(ProtocolError::InvalidChunkHeader.into()),
        };

        // Extended-timestamp presence: on fmt 0-2 the 24-bit field says so,
        // on fmt 3 it is inherited from the previous header on this CSID
        let needs_extended = if fmt == 3 {
            state.has_extended_timestamp
        } else if buf.len() >= header_len + 3 {
            let ts = u32::from(buf[header_len]) << 16
                | u32::from(buf[header_len + 1]) << 8
                | u32::from(buf[header_len + 2]);
            ts >= EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            return Ok(None);
        };

        let extended_size = if needs_extended { 4 } else { 0 };
        let total_header_size = header_len + msg_header_size + extended_size;

        if buf.len() < total_header_size {
            return Ok(None);
        }

        // Whether this chunk continues a partially assembled message
        let continuation = !state.partial_message.is_empty();

        buf.advance(header_len);

        let (timestamp_field, message_length, message_type, stream_id) = match fmt {
            0 => {
                let ts = buf.get_uint(3) as u32;
                let len = buf.get_uint(3) as u32;
                let typ = buf.get_u8();
                let sid = buf.get_u32_le(); // stream ID is little-endian
                (ts, len, typ, sid)
            }
            1 => {
                let ts = buf.get_uint(3) as u32;
                let len = buf.get_uint(3) as u32;
                let typ = buf.get_u8();
                (ts, len, typ, state.stream_id)
            }
            2 => {
                let ts = buf.get_uint(3) as u32;
                (ts, state.message_length, state.message_type, state.stream_id)
            }
            3 => (
                state.timestamp_delta,
                state.message_length,
                state.message_type,
                state.stream_id,
            ),
            _ => unreachable!(),
        };

        let timestamp_field = if needs_extended {
            buf.get_u32()
        } else {
            timestamp_field
        };

        // Absolute timestamp: fmt 0 carries it; fmt 1/2 add a delta; fmt 3
        // holds the timestamp mid-message and re-applies the delta when it
        // opens a new message after a fmt 1/2 header
        let absolute_timestamp = match fmt {
            0 => timestamp_field,
            1 | 2 => {
                if continuation {
                    state.timestamp
                } else {
                    state.timestamp.wrapping_add(timestamp_field)
                }
            }
            3 => {
                if continuation || state.last_fmt == 0 {
                    state.timestamp
                } else {
                    state.timestamp.wrapping_add(state.timestamp_delta)
                }
            }
            _ => unreachable!(),
        };

        if fmt != 3 {
            state.last_fmt = fmt;
            state.has_extended_timestamp = needs_extended;
        }
        if fmt == 1 || fmt == 2 {
            state.timestamp_delta = timestamp_field;
        }
        state.message_length = message_length;
        state.message_type = message_type;
        state.stream_id = stream_id;
        state.timestamp = absolute_timestamp;

        if message_length > max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: message_length,
                max: max_message_size,
            }
            .into());
        }

        if state.partial_message.is_empty() {
            state.expected_length = message_length;
            state.partial_message.reserve(message_length as usize);
        }

        // Each chunk carries at most chunk_size payload bytes
        let remaining = state.expected_length - state.partial_message.len() as u32;
        let chunk_data_len = remaining.min(chunk_size) as usize;

        if buf.len() < chunk_data_len {
            // chunk_available() guarantees this cannot happen
            return Err(ProtocolError::InvalidChunkHeader.into());
        }

        state.partial_message.put_slice(&buf[..chunk_data_len]);
        buf.advance(chunk_data_len);

        if state.partial_message.len() as u32 >= state.expected_length {
            let payload = state.partial_message.split().freeze();
            state.expected_length = 0;

            Ok(Some(RtmpChunk {
                csid,
                timestamp: state.timestamp,
                message_type: state.message_type,
                stream_id: state.stream_id,
                payload,
            }))
        } else {
            Ok(None)
        }
    }

    /// Whether a full chunk (headers + payload) is available without
    /// consuming anything
    pub fn chunk_available(&self, buf: &[u8]) -> Result<bool> {
        let (fmt, csid, header_len) = match parse_basic_header_slice(buf)? {
            Some(v) => v,
            None => return Ok(false),
        };
        let msg_header_size = match fmt {
            0 => 11usize,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < header_len + msg_header_size {
            return Ok(false);
        }

        let state = self.streams.get(&csid);
        let needs_extended = if fmt == 3 {
            state.map(|s| s.has_extended_timestamp).unwrap_or(false)
        } else {
            let ts = u32::from(buf[header_len]) << 16
                | u32::from(buf[header_len + 1]) << 8
                | u32::from(buf[header_len + 2]);
            ts >= EXTENDED_TIMESTAMP_THRESHOLD
        };
        let extended = if needs_extended { 4 } else { 0 };

        let partial = state
            .map(|s| (s.expected_length, s.partial_message.len() as u32, s.message_length))
            .unwrap_or((0, 0, 0));
        let message_length = match fmt {
            0 | 1 => {
                if buf.len() < header_len + 6 {
                    return Ok(false);
                }
                u32::from(buf[header_len + 3]) << 16
                    | u32::from(buf[header_len + 4]) << 8
                    | u32::from(buf[header_len + 5])
            }
            _ => {
                if partial.0 > 0 {
                    partial.0
                } else {
                    partial.2
                }
            }
        };
        let already = if partial.0 > 0 { partial.1 } else { 0 };
        let remaining = message_length.saturating_sub(already);
        let chunk_data_len = remaining.min(self.chunk_size) as usize;

        Ok(buf.len() >= header_len + msg_header_size + extended + chunk_data_len)
    }

    /// Abort a message on a chunk stream (Abort protocol control message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial_message.clear();
            state.expected_length = 0;
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse basic header and return (fmt, csid, header_length)
fn parse_basic_header(buf: &BytesMut) -> Result<Option<(u8, u32, usize)>> {
    parse_basic_header_slice(buf)
}

fn parse_basic_header_slice(buf: &[u8]) -> Result<Option<(u8, u32, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let first = buf[0];
    let fmt = (first >> 6) & 0x03;
    let csid_low = first & 0x3F;

    match csid_low {
        0 => {
            // 2-byte header: csid = 64 + second byte (64..=319)
            if buf.len() < 2 {
                return Ok(None);
            }
            Ok(Some((fmt, 64 + buf[1] as u32, 2)))
        }
        1 => {
            // 3-byte header: csid = 64 + second + third*256 (64..=65599)
            if buf.len() < 3 {
                return Ok(None);
            }
            Ok(Some((fmt, 64 + buf[1] as u32 + (buf[2] as u32) * 256, 3)))
        }
        _ => Ok(Some((fmt, csid_low as u32, 1))),
    }
}

/// Chunk stream encoder
///
/// The first chunk of a message always carries a full fmt-0 header;
/// continuation chunks are fmt-3.
pub struct ChunkEncoder {
    /// Outgoing chunk payload size
    chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the chunk size (announce with Set Chunk Size before using)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.min(MAX_CHUNK_SIZE);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Encode a message into chunks
    pub fn encode(&mut self, chunk: &RtmpChunk, buf: &mut BytesMut) {
        let needs_extended = chunk.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD;
        let timestamp_field = if needs_extended {
            EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            chunk.timestamp
        };

        let payload_len = chunk.payload.len();
        let mut offset = 0;
        let mut first_chunk = true;

        loop {
            let chunk_data_len = (payload_len - offset).min(self.chunk_size as usize);

            write_basic_header(chunk.csid, if first_chunk { 0 } else { 3 }, buf);

            if first_chunk {
                write_u24(timestamp_field, buf);
                write_u24(payload_len as u32, buf);
                buf.put_u8(chunk.message_type);
                buf.put_u32_le(chunk.stream_id);
            }

            // The extended field rides every chunk of a message that uses it
            if needs_extended {
                buf.put_u32(chunk.timestamp);
            }

            buf.put_slice(&chunk.payload[offset..offset + chunk_data_len]);
            offset += chunk_data_len;
            first_chunk = false;

            if offset >= payload_len {
                break;
            }
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Write basic header
fn write_basic_header(csid: u32, fmt: u8, buf: &mut BytesMut) {
    if csid >= 64 + 256 {
        buf.put_u8((fmt << 6) | 1);
        let csid_offset = csid - 64;
        buf.put_u8((csid_offset & 0xFF) as u8);
        buf.put_u8(((csid_offset >> 8) & 0xFF) as u8);
    } else if csid >= 64 {
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        buf.put_u8((fmt << 6) | (csid as u8));
    }
}

/// Write 24-bit big-endian value
fn write_u24(value: u32, buf: &mut BytesMut) {
    buf.put_u8(((value >> 16) & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8((value & 0xFF) as u8);
}
