//! RTMP wire protocol implementation
//!
//! This module handles the low-level protocol details:
//! - Handshake (simple and digest-validated complex C0C1C2/S0S1S2)
//! - Chunk stream multiplexing and demultiplexing
//! - Message framing and parsing

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
pub use message::RtmpMessage;
