//! AAC audio parsing and ADTS framing
//!
//! RTMP carries raw AAC frames with an AudioSpecificConfig sequence header;
//! MPEG-TS wants each frame wrapped in a 7-byte ADTS header.

use bytes::Bytes;

use crate::error::{MediaError, Result};

/// ADTS header length (no CRC)
pub const ADTS_HEADER_LEN: usize = 7;

/// AudioSpecificConfig (from the AAC sequence header)
///
/// Bit layout of the first two bytes:
/// ```text
/// audioObjectType          [5b]
/// samplingFrequencyIndex   [4b]
/// channelConfiguration     [4b]
/// frameLengthFlag          [1b]
/// dependsOnCoreCoder       [1b]
/// extensionFlag            [1b]
/// ```
#[derive(Debug, Clone)]
pub struct AudioSpecificConfig {
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    pub channel_configuration: u8,
    pub frame_length_flag: bool,
    pub depends_on_core_coder: bool,
    pub extension_flag: bool,
}

impl AudioSpecificConfig {
    /// Standard sampling frequencies by index
    const SAMPLING_FREQUENCIES: [u32; 13] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
    ];

    /// Parse from AAC sequence header data
    pub fn parse(data: &Bytes) -> Result<Self> {
        if data.len() < 2 {
            return Err(MediaError::InvalidAacPacket.into());
        }

        let b0 = data[0];
        let b1 = data[1];

        Ok(AudioSpecificConfig {
            audio_object_type: (b0 >> 3) & 0x1F,
            sampling_frequency_index: ((b0 & 0x07) << 1) | ((b1 >> 7) & 0x01),
            channel_configuration: (b1 >> 3) & 0x0F,
            frame_length_flag: (b1 & 0x04) != 0,
            depends_on_core_coder: (b1 & 0x02) != 0,
            extension_flag: (b1 & 0x01) != 0,
        })
    }

    /// Sampling frequency in Hz, if the index is a defined one
    pub fn sampling_frequency(&self) -> Option<u32> {
        Self::SAMPLING_FREQUENCIES
            .get(self.sampling_frequency_index as usize)
            .copied()
    }

    /// Samples per frame
    pub fn samples_per_frame(&self) -> u32 {
        if self.frame_length_flag {
            960
        } else {
            1024
        }
    }
}

/// Generate the 7-byte ADTS header for one raw AAC frame
///
/// Profile is `audio_object_type - 1`, frame length covers the header
/// itself, buffer fullness is pinned at 0x7FF (VBR).
pub fn adts_header(config: &AudioSpecificConfig, payload_len: usize) -> [u8; ADTS_HEADER_LEN] {
    let profile = config.audio_object_type.saturating_sub(1);
    let freq_idx = config.sampling_frequency_index;
    let channels = config.channel_configuration;
    let frame_len = payload_len + ADTS_HEADER_LEN;

    let mut header = [0u8; ADTS_HEADER_LEN];

    // Syncword (12) + ID (1, MPEG-4) + layer (2) + protection_absent (1)
    header[0] = 0xFF;
    header[1] = 0xF1;

    // Profile (2) + freq index (4) + private (1) + channel config high bit
    header[2] = ((profile & 0x03) << 6) | ((freq_idx & 0x0F) << 2) | ((channels >> 2) & 0x01);

    // Channel config low bits (2) + orig/home/copyright (4) + frame length high (2)
    header[3] = ((channels & 0x03) << 6) | ((frame_len >> 11) & 0x03) as u8;

    // Frame length middle (8)
    header[4] = ((frame_len >> 3) & 0xFF) as u8;

    // Frame length low (3) + buffer fullness high (5)
    header[5] = (((frame_len & 0x07) << 5) | 0x1F) as u8;

    // Buffer fullness low (6) + number of raw data blocks - 1 (2)
    header[6] = 0xFC;

    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_specific_config_parse() {
        // AAC-LC, 44100 Hz, stereo
        let data = Bytes::from_static(&[0x12, 0x10]);

        let config = AudioSpecificConfig::parse(&data).unwrap();
        assert_eq!(config.audio_object_type, 2);
        assert_eq!(config.sampling_frequency_index, 4);
        assert_eq!(config.sampling_frequency(), Some(44100));
        assert_eq!(config.channel_configuration, 2);
        assert_eq!(config.samples_per_frame(), 1024);
    }

    #[test]
    fn test_config_too_short() {
        assert!(AudioSpecificConfig::parse(&Bytes::from_static(&[0x12])).is_err());
    }

    #[test]
    fn test_adts_header_fields() {
        let config = AudioSpecificConfig {
            audio_object_type: 2,
            sampling_frequency_index: 4,
            channel_configuration: 2,
            frame_length_flag: false,
            depends_on_core_coder: false,
            extension_flag: false,
        };

        let header = adts_header(&config, 100);

        // Syncword and MPEG-4/no-CRC flags
        assert_eq!(header[0], 0xFF);
        assert_eq!(header[1], 0xF1);

        // Profile = AAC-LC (2) - 1 = 1; freq index 4
        assert_eq!(header[2] >> 6, 1);
        assert_eq!((header[2] >> 2) & 0x0F, 4);

        // Frame length = 107
        let frame_len =
            ((header[3] as usize & 0x03) << 11) | ((header[4] as usize) << 3) | (header[5] as usize >> 5);
        assert_eq!(frame_len, 107);

        // Buffer fullness all-ones
        assert_eq!(header[5] & 0x1F, 0x1F);
        assert_eq!(header[6], 0xFC);
    }

    #[test]
    fn test_adts_header_channels() {
        let config = AudioSpecificConfig {
            audio_object_type: 2,
            sampling_frequency_index: 3,
            channel_configuration: 6,
            frame_length_flag: false,
            depends_on_core_coder: false,
            extension_flag: false,
        };
        let header = adts_header(&config, 10);
        let channels = ((header[2] & 0x01) << 2) | (header[3] >> 6);
        assert_eq!(channels, 6);
    }
}
