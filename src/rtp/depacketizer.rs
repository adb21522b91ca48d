//! H.264 and AAC RTP depacketization (RFC 6184, RFC 3640)
//!
//! Video: single NAL units, STAP-A aggregates and FU-A fragments are
//! reassembled into one avcC-shaped access unit per marker. Parameter sets
//! and SEI are cached aside instead of entering the access unit.
//!
//! Audio: each packet carries an AU-header section followed by the raw AAC
//! frames it describes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::media::avc::NaluType;

use super::packet::RtpPacket;

// RFC 6184 payload structure types
const NALU_STAP_A: u8 = 24;
const NALU_STAP_B: u8 = 25;
const NALU_MTAP16: u8 = 26;
const NALU_MTAP24: u8 = 27;
const NALU_FU_A: u8 = 28;
const NALU_FU_B: u8 = 29;

/// Reassembles H.264 access units from RTP payloads
#[derive(Debug, Default)]
pub struct AvcDepacketizer {
    /// FU-A fragments of the NAL being reassembled
    fragments: Vec<Bytes>,
    /// Restored NAL header for the fragment run
    fu_nal_header: u8,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    sei: Option<Bytes>,
    /// The access unit under construction, as (u32 length, NAL) pairs
    access_unit: BytesMut,
    /// An IDR NAL landed in the current access unit
    has_idr: bool,
}

impl AvcDepacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    pub fn sei(&self) -> Option<&Bytes> {
        self.sei.as_ref()
    }

    /// Feed one video packet; returns true when the marker bit closes the
    /// access unit
    pub fn push(&mut self, packet: &RtpPacket) -> Result<bool> {
        let payload = &packet.payload;
        if payload.is_empty() {
            return Err(ProtocolError::InvalidRtpPacket.into());
        }

        let indicator = payload[0];
        let nalu_type = indicator & 0x1F;

        match nalu_type {
            1..=23 => {
                // The payload is the NAL
                self.classify(payload.clone());
            }
            NALU_STAP_A => {
                self.parse_stap_a(payload.slice(1..))?;
            }
            NALU_FU_A => {
                if payload.len() < 2 {
                    return Err(ProtocolError::InvalidRtpPacket.into());
                }
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;

                if start {
                    self.fragments.clear();
                    self.fu_nal_header = (indicator & 0x60) | (fu_header & 0x1F);
                }
                self.fragments.push(payload.slice(2..));

                if end {
                    let mut nalu =
                        BytesMut::with_capacity(1 + self.fragments.iter().map(Bytes::len).sum::<usize>());
                    nalu.put_u8(self.fu_nal_header);
                    for fragment in self.fragments.drain(..) {
                        nalu.put_slice(&fragment);
                    }
                    self.classify(nalu.freeze());
                }
            }
            NALU_STAP_B | NALU_MTAP16 | NALU_MTAP24 | NALU_FU_B => {
                tracing::debug!(nalu_type = nalu_type, "unsupported RTP aggregation type");
            }
            _ => {
                tracing::debug!(nalu_type = nalu_type, "undefined RTP payload structure");
            }
        }

        Ok(packet.header.marker)
    }

    /// Parameter sets and SEI are cached (replacing the previous value);
    /// everything else joins the access unit
    fn classify(&mut self, nalu: Bytes) {
        if nalu.is_empty() {
            return;
        }
        match NaluType::from_byte(nalu[0]) {
            Some(NaluType::Sps) => self.sps = Some(nalu),
            Some(NaluType::Pps) => self.pps = Some(nalu),
            Some(NaluType::Sei) => self.sei = Some(nalu),
            other => {
                if other == Some(NaluType::Idr) {
                    self.has_idr = true;
                }
                self.access_unit.put_u32(nalu.len() as u32);
                self.access_unit.put_slice(&nalu);
            }
        }
    }

    /// Iterate the 2-byte-length-prefixed NALs of a STAP-A payload
    fn parse_stap_a(&mut self, mut payload: Bytes) -> Result<()> {
        while payload.has_remaining() {
            if payload.remaining() < 2 {
                return Err(ProtocolError::InvalidRtpPacket.into());
            }
            let len = payload.get_u16() as usize;
            if payload.remaining() < len {
                return Err(ProtocolError::InvalidRtpPacket.into());
            }
            let nalu = payload.copy_to_bytes(len);
            self.classify(nalu);
        }
        Ok(())
    }

    /// Take the finished access unit (length-prefixed NALs) and its
    /// keyframe flag, resetting for the next one
    pub fn take_access_unit(&mut self) -> (Bytes, bool) {
        let keyframe = self.has_idr;
        self.has_idr = false;
        (self.access_unit.split().freeze(), keyframe)
    }
}

/// One depacketized AAC frame
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// RTP clock units: the packet timestamp plus 1024 per preceding AU
    pub timestamp: u32,
    pub data: Bytes,
}

/// Parse an MPEG4-GENERIC payload into its AAC frames
pub fn depacketize_aac(packet: &RtpPacket) -> Result<Vec<AudioFrame>> {
    let payload = &packet.payload;
    if payload.len() < 2 {
        return Err(ProtocolError::InvalidRtpPacket.into());
    }

    // AU-headers-length is in bits; each AU header is 16 bits
    let au_headers_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let au_count = au_headers_bits / 16;
    if au_count == 0 {
        return Err(ProtocolError::InvalidRtpPacket.into());
    }

    let headers_end = 2 + au_count * 2;
    if payload.len() < headers_end {
        return Err(ProtocolError::InvalidRtpPacket.into());
    }

    let mut frames = Vec::with_capacity(au_count);
    let mut data_pos = headers_end;

    for k in 0..au_count {
        let header = u16::from_be_bytes([payload[2 + k * 2], payload[3 + k * 2]]);
        // High 13 bits size, low 3 bits AU-index-delta
        let size = (header >> 3) as usize;

        if payload.len() < data_pos + size {
            return Err(ProtocolError::InvalidRtpPacket.into());
        }
        frames.push(AudioFrame {
            timestamp: packet
                .header
                .timestamp
                .wrapping_add(k as u32 * 1024),
            data: payload.slice(data_pos..data_pos + size),
        });
        data_pos += size;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::packet::{RtpHeader, PT_AAC, PT_AVC};

    fn packet(marker: bool, pt: u8, timestamp: u32, payload: Vec<u8>) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                marker,
                payload_type: pt,
                sequence: 0,
                timestamp,
                ssrc: 1,
                csrc: Vec::new(),
            },
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn test_single_nal_caches_params() {
        let mut depack = AvcDepacketizer::new();

        let sps = vec![0x67, 0x64, 0x00, 0x1F];
        let pps = vec![0x68, 0xEF, 0x38];
        depack.push(&packet(false, PT_AVC, 0, sps.clone())).unwrap();
        depack.push(&packet(false, PT_AVC, 0, pps.clone())).unwrap();

        assert_eq!(depack.sps().unwrap().as_ref(), &sps[..]);
        assert_eq!(depack.pps().unwrap().as_ref(), &pps[..]);
        // Parameter sets never enter the access unit
        let (unit, keyframe) = depack.take_access_unit();
        assert!(unit.is_empty());
        assert!(!keyframe);
    }

    #[test]
    fn test_sps_overwritten_on_update() {
        let mut depack = AvcDepacketizer::new();
        depack.push(&packet(false, PT_AVC, 0, vec![0x67, 0x01])).unwrap();
        depack.push(&packet(false, PT_AVC, 0, vec![0x67, 0x02])).unwrap();
        assert_eq!(depack.sps().unwrap().as_ref(), &[0x67, 0x02]);
    }

    #[test]
    fn test_stap_a() {
        let mut depack = AvcDepacketizer::new();

        let mut payload = vec![24u8]; // STAP-A indicator
        for nal in [&[0x67u8, 0xAA][..], &[0x68, 0xBB], &[0x65, 0xCC, 0xDD]] {
            payload.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            payload.extend_from_slice(nal);
        }

        let marker = depack.push(&packet(true, PT_AVC, 0, payload)).unwrap();
        assert!(marker);
        assert!(depack.sps().is_some());
        assert!(depack.pps().is_some());

        let (unit, keyframe) = depack.take_access_unit();
        assert!(keyframe);
        assert_eq!(&unit[..4], &[0, 0, 0, 3]);
        assert_eq!(&unit[4..7], &[0x65, 0xCC, 0xDD]);
    }

    #[test]
    fn test_fu_a_reassembly() {
        // A 4200-byte IDR NAL in three fragments
        let mut nal_body = vec![0u8; 4199];
        for (i, byte) in nal_body.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        let indicator = 0x60 | NALU_FU_A; // NRI from the original NAL
        let fu_type = 5u8;
        let chunks = [&nal_body[..1400], &nal_body[1400..2800], &nal_body[2800..]];

        let mut depack = AvcDepacketizer::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut payload = vec![indicator];
            let mut fu_header = fu_type;
            if i == 0 {
                fu_header |= 0x80; // start
            }
            if i == chunks.len() - 1 {
                fu_header |= 0x40; // end
            }
            payload.push(fu_header);
            payload.extend_from_slice(chunk);

            let marker = depack
                .push(&packet(i == chunks.len() - 1, PT_AVC, 0, payload))
                .unwrap();
            assert_eq!(marker, i == chunks.len() - 1);
        }

        let (unit, keyframe) = depack.take_access_unit();
        assert!(keyframe);
        // u32 length 4200 then the restored header byte
        assert_eq!(&unit[..4], &[0x00, 0x00, 0x10, 0x68]);
        assert_eq!(unit[4], 0x65);
        assert_eq!(&unit[5..], &nal_body[..]);
    }

    #[test]
    fn test_aac_au_headers() {
        // Two AUs of 3 and 2 bytes
        let mut payload = Vec::new();
        payload.extend_from_slice(&32u16.to_be_bytes()); // two 16-bit headers
        payload.extend_from_slice(&((3u16) << 3).to_be_bytes());
        payload.extend_from_slice(&((2u16) << 3).to_be_bytes());
        payload.extend_from_slice(&[0xA1, 0xA2, 0xA3]);
        payload.extend_from_slice(&[0xB1, 0xB2]);

        let frames = depacketize_aac(&packet(true, PT_AAC, 44_100, payload)).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp, 44_100);
        assert_eq!(&frames[0].data[..], &[0xA1, 0xA2, 0xA3]);
        assert_eq!(frames[1].timestamp, 44_100 + 1024);
        assert_eq!(&frames[1].data[..], &[0xB1, 0xB2]);
    }

    #[test]
    fn test_aac_truncated() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&16u16.to_be_bytes());
        payload.extend_from_slice(&((10u16) << 3).to_be_bytes());
        payload.extend_from_slice(&[0x01]); // claims 10 bytes, has 1
        assert!(depacketize_aac(&packet(true, PT_AAC, 0, payload)).is_err());
    }
}
