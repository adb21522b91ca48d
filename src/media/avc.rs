//! H.264/AVC parsing and reformatting
//!
//! RTMP/FLV transports H.264 in avcC form (length-prefixed NAL units with an
//! AVCDecoderConfigurationRecord as the sequence header); MPEG-TS wants the
//! Annex-B byte stream (start codes, AUD, parameter sets in-band). This
//! module converts between the two.
//!
//! AVCDecoderConfigurationRecord (ISO/IEC 14496-15 5.2.4.1):
//! ```text
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
//! | AVCLevelIndication (1) | lengthSizeMinusOne (1, lower 2 bits)
//! | numOfSPS (1, lower 5 bits) | { spsLength (2) | spsNALUnit }*
//! | numOfPPS (1) | { ppsLength (2) | ppsNALUnit }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// 4-byte Annex-B start code
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Access-unit delimiter NAL emitted at the head of each converted unit
const AUD: [u8; 2] = [0x09, 0xF0];

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice = 1,
    /// IDR slice (keyframe)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }
}

/// AVC decoder configuration (from the video sequence header)
#[derive(Debug, Clone)]
pub struct AvcConfig {
    /// AVC profile (66=Baseline, 77=Main, 100=High, ...)
    pub profile: u8,
    /// Profile compatibility flags
    pub compatibility: u8,
    /// AVC level (e.g. 31 = 3.1)
    pub level: u8,
    /// NALU length prefix width in bytes (1, 2 or 4; the emitter uses 4)
    pub nalu_length_size: u8,
    /// Sequence parameter sets as parsed
    pub sps: Vec<Bytes>,
    /// Picture parameter sets as parsed
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse an AVCDecoderConfigurationRecord
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.len() < 5 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let version = data.get_u8();
        if version != 1 {
            return Err(MediaError::InvalidAvcPacket.into());
        }

        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let mut sps = Vec::new();
        if data.is_empty() {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let num_sps = (data.get_u8() & 0x1F) as usize;
        for _ in 0..num_sps {
            if data.len() < 2 {
                return Err(MediaError::InvalidAvcPacket.into());
            }
            let len = data.get_u16() as usize;
            if data.len() < len {
                return Err(MediaError::InvalidAvcPacket.into());
            }
            sps.push(data.copy_to_bytes(len));
        }

        if data.is_empty() {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let num_pps = data.get_u8() as usize;
        let mut pps = Vec::new();
        for _ in 0..num_pps {
            if data.len() < 2 {
                return Err(MediaError::InvalidAvcPacket.into());
            }
            let len = data.get_u16() as usize;
            if data.len() < len {
                return Err(MediaError::InvalidAvcPacket.into());
            }
            pps.push(data.copy_to_bytes(len));
        }

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
        })
    }

    /// Build a record from a bare SPS/PPS pair (the RTP ingest path);
    /// profile, compatibility and level are lifted out of the SPS
    pub fn from_parameter_sets(sps: Bytes, pps: Bytes) -> Result<Self> {
        if sps.len() < 4 {
            return Err(MediaError::InvalidNalu.into());
        }
        Ok(AvcConfig {
            profile: sps[1],
            compatibility: sps[2],
            level: sps[3],
            nalu_length_size: 4,
            sps: vec![sps],
            pps: vec![pps],
        })
    }

    /// Emit the record with the canonical single-SPS/single-PPS framing
    pub fn emit(&self) -> Result<Bytes> {
        let sps = self.sps.first().ok_or(MediaError::MissingSequenceHeader)?;
        let pps = self.pps.first().ok_or(MediaError::MissingSequenceHeader)?;

        let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
        buf.put_u8(0x01);
        buf.put_u8(self.profile);
        buf.put_u8(self.compatibility);
        buf.put_u8(self.level);
        buf.put_u8(0xFC | (self.nalu_length_size - 1));
        buf.put_u8(0xE1); // 1 SPS
        buf.put_u16(sps.len() as u16);
        buf.put_slice(sps);
        buf.put_u8(0x01); // 1 PPS
        buf.put_u16(pps.len() as u16);
        buf.put_slice(pps);
        Ok(buf.freeze())
    }

    /// Get profile name
    pub fn profile_name(&self) -> &'static str {
        match self.profile {
            66 => "Baseline",
            77 => "Main",
            88 => "Extended",
            100 => "High",
            110 => "High 10",
            122 => "High 4:2:2",
            244 => "High 4:4:4",
            _ => "Unknown",
        }
    }
}

/// avcC to Annex-B converter
///
/// Holds the last seen SPS/PPS so keyframes can be made self-contained:
/// an IDR without in-band parameter sets gets the cached ones injected
/// before it.
#[derive(Debug, Default)]
pub struct AnnexBConverter {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl AnnexBConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the parameter-set cache from a decoder configuration record
    pub fn set_extradata(&mut self, config: &AvcConfig) {
        if let Some(sps) = config.sps.first() {
            self.sps = Some(sps.clone());
        }
        if let Some(pps) = config.pps.first() {
            self.pps = Some(pps.clone());
        }
    }

    /// Convert one access unit from `(u32 length, NAL)` pairs to Annex-B
    ///
    /// Output starts with an access-unit delimiter; every NAL gets a 4-byte
    /// start code; SPS/PPS seen in the unit are cached; an IDR without a
    /// preceding SPS/PPS in the same unit gets the cached pair first.
    pub fn convert(&mut self, nalus: &Bytes, out: &mut BytesMut) -> Result<()> {
        out.put_slice(&START_CODE);
        out.put_slice(&AUD);

        let mut data = nalus.clone();
        let mut unit_has_params = false;

        while data.has_remaining() {
            if data.remaining() < 4 {
                return Err(MediaError::InvalidNalu.into());
            }
            let len = data.get_u32() as usize;
            if data.remaining() < len || len == 0 {
                return Err(MediaError::InvalidNalu.into());
            }
            let nalu = data.copy_to_bytes(len);

            match NaluType::from_byte(nalu[0]) {
                Some(NaluType::Sps) => {
                    self.sps = Some(nalu.clone());
                    unit_has_params = true;
                }
                Some(NaluType::Pps) => {
                    self.pps = Some(nalu.clone());
                    unit_has_params = true;
                }
                Some(NaluType::Idr) if !unit_has_params => {
                    // Make the keyframe decodable on its own
                    if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                        out.put_slice(&START_CODE);
                        out.put_slice(sps);
                        out.put_slice(&START_CODE);
                        out.put_slice(pps);
                    }
                    unit_has_params = true;
                }
                _ => {}
            }

            out.put_slice(&START_CODE);
            out.put_slice(&nalu);
        }

        Ok(())
    }
}
