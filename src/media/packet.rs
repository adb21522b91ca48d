//! The common audio/video packet
//!
//! The neutral currency between ingest and fan-out. The body layout matches
//! FLV tag-data, which makes FLV re-emission a plain copy.

use bytes::Bytes;

use super::flv;

/// Packet classification, mirroring the RTMP message type it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
    Metadata,
}

impl PacketKind {
    /// RTMP message type id for this packet kind (AMF0 for metadata)
    pub fn message_type(&self) -> u8 {
        match self {
            PacketKind::Audio => 8,
            PacketKind::Video => 9,
            PacketKind::Metadata => 18,
        }
    }

    pub fn from_message_type(type_id: u8) -> Option<Self> {
        match type_id {
            8 => Some(PacketKind::Audio),
            9 => Some(PacketKind::Video),
            18 | 15 => Some(PacketKind::Metadata),
            _ => None,
        }
    }
}

/// Common audio/video/metadata packet, one RTMP message worth of media
#[derive(Debug, Clone)]
pub struct AvPacket {
    pub kind: PacketKind,
    /// Milliseconds, wraps at u32
    pub timestamp: u32,
    pub stream_id: u32,
    /// Equals `body.len()`
    pub length: u32,
    pub body: Bytes,
}

impl AvPacket {
    pub fn new(kind: PacketKind, timestamp: u32, stream_id: u32, body: Bytes) -> Self {
        Self {
            kind,
            timestamp,
            stream_id,
            length: body.len() as u32,
            body,
        }
    }

    pub fn audio(timestamp: u32, body: Bytes) -> Self {
        Self::new(PacketKind::Audio, timestamp, 1, body)
    }

    pub fn video(timestamp: u32, body: Bytes) -> Self {
        Self::new(PacketKind::Video, timestamp, 1, body)
    }

    pub fn metadata(body: Bytes) -> Self {
        Self::new(PacketKind::Metadata, 0, 1, body)
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PacketKind::Audio
    }

    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }

    pub fn is_metadata(&self) -> bool {
        self.kind == PacketKind::Metadata
    }

    /// Video codec id, if this is a video packet with a body
    pub fn codec_id(&self) -> Option<u8> {
        if self.is_video() && !self.body.is_empty() {
            Some(self.body[0] & 0x0F)
        } else {
            None
        }
    }

    /// Audio sound format nibble, if this is an audio packet with a body
    pub fn sound_format(&self) -> Option<u8> {
        if self.is_audio() && !self.body.is_empty() {
            Some(self.body[0] >> 4)
        } else {
            None
        }
    }

    pub fn is_avc(&self) -> bool {
        self.codec_id() == Some(flv::CODEC_AVC)
    }

    pub fn is_hevc(&self) -> bool {
        self.codec_id() == Some(flv::CODEC_HEVC)
    }

    pub fn is_aac(&self) -> bool {
        self.sound_format() == Some(flv::SOUND_FORMAT_AAC)
    }

    /// AVC or HEVC sequence header (decoder configuration record)
    pub fn is_video_seq_header(&self) -> bool {
        self.is_video()
            && self.body.len() >= 2
            && self.body[0] >> 4 == flv::FRAME_KEY
            && (self.is_avc() || self.is_hevc())
            && self.body[1] == flv::AVC_SEQ_HEADER
    }

    /// Keyframe NALU packet (not the sequence header)
    pub fn is_keyframe(&self) -> bool {
        self.is_video()
            && self.body.len() >= 2
            && self.body[0] >> 4 == flv::FRAME_KEY
            && (self.is_avc() || self.is_hevc())
            && self.body[1] == flv::AVC_NALU
    }

    pub fn is_aac_seq_header(&self) -> bool {
        self.is_aac() && self.body.len() >= 2 && self.body[1] == flv::AAC_SEQ_HEADER
    }

    pub fn is_aac_raw(&self) -> bool {
        self.is_aac() && self.body.len() >= 2 && self.body[1] == flv::AAC_RAW
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let seq = AvPacket::video(0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00]));
        assert!(seq.is_video_seq_header());
        assert!(!seq.is_keyframe());
        assert!(seq.is_avc());

        let key = AvPacket::video(40, Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00]));
        assert!(key.is_keyframe());
        assert!(!key.is_video_seq_header());

        let inter = AvPacket::video(80, Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x00]));
        assert!(!inter.is_keyframe());

        let hevc_seq = AvPacket::video(0, Bytes::from_static(&[0x1C, 0x00]));
        assert!(hevc_seq.is_video_seq_header());
        assert!(hevc_seq.is_hevc());

        let aac_seq = AvPacket::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(aac_seq.is_aac_seq_header());
        assert!(!aac_seq.is_aac_raw());

        let aac_raw = AvPacket::audio(23, Bytes::from_static(&[0xAF, 0x01, 0x21]));
        assert!(aac_raw.is_aac_raw());
    }

    #[test]
    fn test_length_tracks_body() {
        let pkt = AvPacket::video(0, Bytes::from_static(&[0x17, 0x01, 0, 0, 0, 1, 2, 3]));
        assert_eq!(pkt.length, 8);
        assert_eq!(pkt.length as usize, pkt.body.len());
    }

    #[test]
    fn test_non_aac_audio_not_seq_header() {
        // MP3 audio never classifies as an AAC header
        let mp3 = AvPacket::audio(0, Bytes::from_static(&[0x2F, 0x00]));
        assert!(!mp3.is_aac_seq_header());
        assert!(!mp3.is_aac());
    }

    #[test]
    fn test_message_type_mapping() {
        assert_eq!(PacketKind::Audio.message_type(), 8);
        assert_eq!(PacketKind::Video.message_type(), 9);
        assert_eq!(PacketKind::Metadata.message_type(), 18);
        assert_eq!(PacketKind::from_message_type(15), Some(PacketKind::Metadata));
        assert_eq!(PacketKind::from_message_type(20), None);
    }
}
