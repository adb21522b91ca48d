//! Media handling for the relay
//!
//! This module provides:
//! - The common audio/video packet exchanged between ingest and fan-out
//! - FLV tag framing and tag-data parsing
//! - H.264/AVC configuration records and Annex-B conversion
//! - AAC AudioSpecificConfig parsing and ADTS framing

pub mod aac;
pub mod avc;
pub mod flv;
pub mod packet;

pub use aac::AudioSpecificConfig;
pub use avc::{AnnexBConverter, AvcConfig, NaluType};
pub use flv::{AudioTagData, FlvTagHeader, VideoTagData};
pub use packet::{AvPacket, PacketKind};
