//! FLV container primitives
//!
//! RTMP audio/video messages are FLV tag-data without the tag header, so the
//! relay's common packet body is already in FLV shape. This module supplies
//! the framing needed to turn packets back into a full FLV byte stream
//! (HTTP-FLV) and the tag-data views needed by the HLS and RTP paths.
//!
//! ```text
//! FLV file:   header(9) | prevTagSize0(4) | tag | prevTagSize | tag | ...
//! Tag:        type(1) | dataSize(3 BE) | ts(3 BE) | tsExt(1) | streamId(3) | data
//!
//! Video data: frameType(4b) codecId(4b) | avcPacketType(1) | cts(3 SI24) | body
//! Audio data: format(4b) rate(2b) size(1b) type(1b) | aacPacketType(1) | body
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

// Tag types
pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT: u8 = 18;

// Video frame types (upper nibble of video data byte 0)
pub const FRAME_KEY: u8 = 1;
pub const FRAME_INTER: u8 = 2;

// Video codec ids (lower nibble of video data byte 0)
pub const CODEC_AVC: u8 = 7;
pub const CODEC_HEVC: u8 = 12;

// AVC packet types (video data byte 1)
pub const AVC_SEQ_HEADER: u8 = 0;
pub const AVC_NALU: u8 = 1;
pub const AVC_END_OF_SEQ: u8 = 2;

// Audio formats (upper nibble of audio data byte 0)
pub const SOUND_FORMAT_AAC: u8 = 10;

// Audio rates / sizes / channel layouts for AAC emission
pub const SOUND_RATE_44KHZ: u8 = 3;
pub const SOUND_SIZE_16BIT: u8 = 1;
pub const SOUND_TYPE_STEREO: u8 = 1;

// AAC packet types (audio data byte 1)
pub const AAC_SEQ_HEADER: u8 = 0;
pub const AAC_RAW: u8 = 1;

/// The fixed 9-byte FLV signature: "FLV", version 1, audio+video flags,
/// header size 9
pub const FLV_SIGNATURE: [u8; 9] = [0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09];

/// FLV file header plus the initial zero previous-tag-size
pub fn file_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_slice(&FLV_SIGNATURE);
    buf.put_u32(0);
    buf.freeze()
}

/// Parsed 11-byte FLV tag header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTagHeader {
    pub tag_type: u8,
    pub data_size: u32,
    pub timestamp: u32,
    /// Always zero on the wire
    pub stream_id: u32,
}

impl FlvTagHeader {
    pub fn parse(p: &[u8]) -> Result<Self> {
        if p.len() < 11 {
            return Err(MediaError::InvalidFlvTag.into());
        }
        let tag_type = p[0];
        if tag_type != TAG_AUDIO && tag_type != TAG_VIDEO && tag_type != TAG_SCRIPT {
            return Err(MediaError::InvalidFlvTag.into());
        }
        let data_size = u32::from(p[1]) << 16 | u32::from(p[2]) << 8 | u32::from(p[3]);
        // 24-bit timestamp plus the extended high byte
        let timestamp =
            u32::from(p[7]) << 24 | u32::from(p[4]) << 16 | u32::from(p[5]) << 8 | u32::from(p[6]);
        Ok(Self {
            tag_type,
            data_size,
            timestamp,
            stream_id: 0,
        })
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag_type);
        buf.put_u8((self.data_size >> 16) as u8);
        buf.put_u8((self.data_size >> 8) as u8);
        buf.put_u8(self.data_size as u8);
        buf.put_u8((self.timestamp >> 16) as u8);
        buf.put_u8((self.timestamp >> 8) as u8);
        buf.put_u8(self.timestamp as u8);
        buf.put_u8((self.timestamp >> 24) as u8);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(0);
    }
}

/// Encode one complete tag: header, data, previous-tag-size
pub fn encode_tag(tag_type: u8, timestamp: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(11 + data.len() + 4);
    let header = FlvTagHeader {
        tag_type,
        data_size: data.len() as u32,
        timestamp,
        stream_id: 0,
    };
    header.write_to(&mut buf);
    buf.put_slice(data);
    buf.put_u32(11 + data.len() as u32);
    buf.freeze()
}

/// Parsed video tag-data (everything after the FLV tag header)
#[derive(Debug, Clone)]
pub struct VideoTagData {
    pub frame_type: u8,
    pub codec_id: u8,
    pub avc_packet_type: u8,
    /// Composition-time offset (signed 24-bit on the wire)
    pub composition_time: i32,
    pub data: Bytes,
}

impl VideoTagData {
    pub fn parse(body: &Bytes) -> Result<Self> {
        if body.len() < 5 {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let frame_type = body[0] >> 4;
        let codec_id = body[0] & 0x0F;
        if codec_id != CODEC_AVC && codec_id != CODEC_HEVC {
            return Err(MediaError::UnsupportedCodec(codec_id).into());
        }
        let avc_packet_type = body[1];
        let raw = i32::from(body[2]) << 16 | i32::from(body[3]) << 8 | i32::from(body[4]);
        // Sign extend from 24 bits
        let composition_time = if raw & 0x80_0000 != 0 {
            raw | !0xFF_FFFF
        } else {
            raw
        };
        Ok(Self {
            frame_type,
            codec_id,
            avc_packet_type,
            composition_time,
            data: body.slice(5..),
        })
    }

    pub fn bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.data.len());
        buf.put_u8(self.frame_type << 4 | self.codec_id);
        buf.put_u8(self.avc_packet_type);
        buf.put_u8((self.composition_time >> 16) as u8);
        buf.put_u8((self.composition_time >> 8) as u8);
        buf.put_u8(self.composition_time as u8);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// Parsed audio tag-data
#[derive(Debug, Clone)]
pub struct AudioTagData {
    pub sound_format: u8,
    pub sound_rate: u8,
    pub sound_size: u8,
    pub sound_type: u8,
    pub aac_packet_type: u8,
    pub data: Bytes,
}

impl AudioTagData {
    pub fn parse(body: &Bytes) -> Result<Self> {
        if body.len() < 2 {
            return Err(MediaError::InvalidAacPacket.into());
        }
        let sound_format = body[0] >> 4;
        if sound_format != SOUND_FORMAT_AAC {
            return Err(MediaError::InvalidAacPacket.into());
        }
        Ok(Self {
            sound_format,
            sound_rate: (body[0] >> 2) & 0x03,
            sound_size: (body[0] >> 1) & 0x01,
            sound_type: body[0] & 0x01,
            aac_packet_type: body[1],
            data: body.slice(2..),
        })
    }

    pub fn bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.data.len());
        buf.put_u8(
            self.sound_format << 4 | self.sound_rate << 2 | self.sound_size << 1 | self.sound_type,
        );
        buf.put_u8(self.aac_packet_type);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header() {
        let header = file_header();
        assert_eq!(header.len(), 13);
        assert_eq!(&header[..3], b"FLV");
        assert_eq!(header[3], 0x01);
        assert_eq!(header[4], 0x05);
        assert_eq!(&header[9..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_tag_header_roundtrip() {
        let header = FlvTagHeader {
            tag_type: TAG_VIDEO,
            data_size: 5000,
            timestamp: 0x0123_4567,
            stream_id: 0,
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), 11);

        let parsed = FlvTagHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_encode_tag_byte_identity() {
        let data = [0x17u8, 0x01, 0x00, 0x00, 0x00, 0xAA];
        let tag = encode_tag(TAG_VIDEO, 40, &data);
        assert_eq!(tag.len(), 11 + 6 + 4);

        let header = FlvTagHeader::parse(&tag).unwrap();
        assert_eq!(header.tag_type, TAG_VIDEO);
        assert_eq!(header.data_size, 6);
        assert_eq!(header.timestamp, 40);
        assert_eq!(&tag[11..17], &data);
        let prev = u32::from_be_bytes([tag[17], tag[18], tag[19], tag[20]]);
        assert_eq!(prev, 17);

        // re-encoding the parsed pieces reproduces the bytes
        let again = encode_tag(header.tag_type, header.timestamp, &tag[11..17]);
        assert_eq!(again, tag);
    }

    #[test]
    fn test_video_tag_data_roundtrip() {
        let body = Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x19, 0xDE, 0xAD]);
        let tag = VideoTagData::parse(&body).unwrap();
        assert_eq!(tag.frame_type, FRAME_INTER);
        assert_eq!(tag.codec_id, CODEC_AVC);
        assert_eq!(tag.avc_packet_type, AVC_NALU);
        assert_eq!(tag.composition_time, 0x19);
        assert_eq!(tag.bytes(), body);
    }

    #[test]
    fn test_video_negative_composition_time() {
        let body = Bytes::from_static(&[0x27, 0x01, 0xFF, 0xFF, 0xFF, 0x00]);
        let tag = VideoTagData::parse(&body).unwrap();
        assert_eq!(tag.composition_time, -1);
    }

    #[test]
    fn test_video_unknown_codec_rejected() {
        let body = Bytes::from_static(&[0x12, 0x01, 0x00, 0x00, 0x00]);
        assert!(VideoTagData::parse(&body).is_err());
    }

    #[test]
    fn test_audio_tag_data_roundtrip() {
        let body = Bytes::from_static(&[0xAF, 0x01, 0x21, 0x00, 0x49]);
        let tag = AudioTagData::parse(&body).unwrap();
        assert_eq!(tag.sound_format, SOUND_FORMAT_AAC);
        assert_eq!(tag.sound_rate, SOUND_RATE_44KHZ);
        assert_eq!(tag.sound_type, SOUND_TYPE_STEREO);
        assert_eq!(tag.aac_packet_type, AAC_RAW);
        assert_eq!(tag.bytes(), body);
    }
}
