//! RTP packet parsing
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |            contributing source (CSRC) identifiers             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       defined by profile      |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       header extension                        |
//! ```

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// Fixed header length before CSRC words
pub const RTP_HEADER_LEN: usize = 12;

/// Payload type carrying H.264
pub const PT_AVC: u8 = 96;

/// Payload type carrying AAC (MPEG4-GENERIC)
pub const PT_AAC: u8 = 97;

/// Parsed RTP fixed header (plus CSRC and extension, skipped over)
#[derive(Debug, Clone)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

impl RtpHeader {
    /// Parse the header, returning it and the payload offset
    pub fn parse(p: &[u8]) -> Result<(Self, usize)> {
        if p.len() < RTP_HEADER_LEN {
            return Err(ProtocolError::InvalidRtpPacket.into());
        }

        let version = p[0] >> 6;
        let padding = (p[0] >> 5) & 0x01 == 1;
        let extension = (p[0] >> 4) & 0x01 == 1;
        let csrc_count = (p[0] & 0x0F) as usize;
        let marker = p[1] >> 7 == 1;
        let payload_type = p[1] & 0x7F;
        let sequence = u16::from_be_bytes([p[2], p[3]]);
        let timestamp = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
        let ssrc = u32::from_be_bytes([p[8], p[9], p[10], p[11]]);

        let mut pos = RTP_HEADER_LEN;

        if p.len() < pos + csrc_count * 4 {
            return Err(ProtocolError::InvalidRtpPacket.into());
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(u32::from_be_bytes([p[pos], p[pos + 1], p[pos + 2], p[pos + 3]]));
            pos += 4;
        }

        if extension {
            if p.len() < pos + 4 {
                return Err(ProtocolError::InvalidRtpPacket.into());
            }
            let ext_words = u16::from_be_bytes([p[pos + 2], p[pos + 3]]) as usize;
            pos += 4 + ext_words * 4;
            if p.len() < pos {
                return Err(ProtocolError::InvalidRtpPacket.into());
            }
        }

        Ok((
            Self {
                version,
                padding,
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
                csrc,
            },
            pos,
        ))
    }
}

/// One RTP packet: parsed header plus the raw payload
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn parse(data: Bytes) -> Result<Self> {
        let (header, offset) = RtpHeader::parse(&data)?;
        if data.len() <= offset {
            return Err(ProtocolError::InvalidRtpPacket.into());
        }
        Ok(Self {
            payload: data.slice(offset..),
            header,
        })
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    pub(crate) fn build_packet(
        marker: bool,
        pt: u8,
        sequence: u16,
        timestamp: u32,
        ssrc: u32,
        payload: &[u8],
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80); // V=2
        buf.put_u8((u8::from(marker) << 7) | pt);
        buf.put_u16(sequence);
        buf.put_u32(timestamp);
        buf.put_u32(ssrc);
        buf.put_slice(payload);
        buf.freeze()
    }

    #[test]
    fn test_parse_fixed_header() {
        let data = build_packet(true, PT_AVC, 100, 90_000, 0xDEADBEEF, &[0x65, 0x01]);
        let packet = RtpPacket::parse(data).unwrap();
        assert_eq!(packet.header.version, 2);
        assert!(packet.header.marker);
        assert_eq!(packet.header.payload_type, PT_AVC);
        assert_eq!(packet.header.sequence, 100);
        assert_eq!(packet.header.timestamp, 90_000);
        assert_eq!(packet.header.ssrc, 0xDEADBEEF);
        assert_eq!(&packet.payload[..], &[0x65, 0x01]);
    }

    #[test]
    fn test_parse_with_csrc_and_extension() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x92); // V=2, X=1, CC=2
        buf.put_u8(PT_AAC);
        buf.put_u16(1);
        buf.put_u32(1000);
        buf.put_u32(42);
        buf.put_u32(0x11111111); // CSRC 1
        buf.put_u32(0x22222222); // CSRC 2
        buf.put_u16(0xABCD); // extension profile
        buf.put_u16(1); // one extension word
        buf.put_u32(0x33333333);
        buf.put_slice(&[0x00, 0x10, 0x01]);

        let packet = RtpPacket::parse(buf.freeze()).unwrap();
        assert_eq!(packet.header.csrc, vec![0x11111111, 0x22222222]);
        assert_eq!(&packet.payload[..], &[0x00, 0x10, 0x01]);
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(RtpPacket::parse(Bytes::from_static(&[0x80, 0x60])).is_err());

        // Header claims 2 CSRC words but carries none
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(PT_AVC);
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(RtpPacket::parse(buf.freeze()).is_err());
    }
}
