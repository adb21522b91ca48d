//! Repack depacketized RTP media into RTMP-shaped common packets

use bytes::Bytes;

use crate::error::Result;
use crate::media::avc::AvcConfig;
use crate::media::flv::{self, AudioTagData, VideoTagData};
use crate::media::packet::AvPacket;

/// AudioSpecificConfig announced before the first AAC frame:
/// AAC-LC, 48 kHz index, stereo, with the sync-extension tail
const AAC_CONFIG: [u8; 5] = [0x11, 0x90, 0x56, 0xE5, 0x00];

/// AVC sequence-header packet built from cached parameter sets
pub fn video_seq_header(sps: &Bytes, pps: &Bytes) -> Result<AvPacket> {
    let config = AvcConfig::from_parameter_sets(sps.clone(), pps.clone())?;
    let tag = VideoTagData {
        frame_type: flv::FRAME_KEY,
        codec_id: flv::CODEC_AVC,
        avc_packet_type: flv::AVC_SEQ_HEADER,
        composition_time: 0,
        data: config.emit()?,
    };
    Ok(AvPacket::video(0, tag.bytes()))
}

/// AVC NALU packet from one access unit in avcC form
pub fn video_packet(timestamp: u32, composition_time: i32, keyframe: bool, nalus: Bytes) -> AvPacket {
    let tag = VideoTagData {
        frame_type: if keyframe { flv::FRAME_KEY } else { flv::FRAME_INTER },
        codec_id: flv::CODEC_AVC,
        avc_packet_type: flv::AVC_NALU,
        composition_time,
        data: nalus,
    };
    AvPacket::video(timestamp, tag.bytes())
}

/// AAC sequence-header packet with the fixed AudioSpecificConfig
pub fn audio_seq_header() -> AvPacket {
    let tag = AudioTagData {
        sound_format: flv::SOUND_FORMAT_AAC,
        sound_rate: flv::SOUND_RATE_44KHZ,
        sound_size: flv::SOUND_SIZE_16BIT,
        sound_type: flv::SOUND_TYPE_STEREO,
        aac_packet_type: flv::AAC_SEQ_HEADER,
        data: Bytes::from_static(&AAC_CONFIG),
    };
    AvPacket::audio(0, tag.bytes())
}

/// AAC raw packet from one depacketized frame
pub fn audio_packet(timestamp: u32, data: Bytes) -> AvPacket {
    let tag = AudioTagData {
        sound_format: flv::SOUND_FORMAT_AAC,
        sound_rate: flv::SOUND_RATE_44KHZ,
        sound_size: flv::SOUND_SIZE_16BIT,
        sound_type: flv::SOUND_TYPE_STEREO,
        aac_packet_type: flv::AAC_RAW,
        data,
    };
    AvPacket::audio(timestamp, tag.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn test_video_seq_header_packet() {
        let sps = Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]);
        let pps = Bytes::from_static(&[0x68, 0xEF, 0x38]);
        let packet = video_seq_header(&sps, &pps).unwrap();

        assert!(packet.is_video_seq_header());
        assert_eq!(packet.timestamp, 0);
        // FrameType=1 | CodecId=7, then SeqHeader and zero CTS
        assert_eq!(&packet.body[..5], &[0x17, 0x00, 0x00, 0x00, 0x00]);

        let config = AvcConfig::parse(packet.body.slice(5..)).unwrap();
        assert_eq!(config.profile, 0x64);
        assert_eq!(config.sps[0], sps);
        assert_eq!(config.pps[0], pps);
    }

    #[test]
    fn test_video_seq_header_requires_both_params() {
        let short = Bytes::from_static(&[0x67]);
        let pps = Bytes::from_static(&[0x68, 0xEF, 0x38]);
        assert!(video_seq_header(&short, &pps).is_err());
    }

    #[test]
    fn test_video_packet_body_layout() {
        // A 4200-byte NAL in avcC form
        let mut nalus = BytesMut::new();
        nalus.put_u32(4200);
        nalus.put_u8(0x65);
        nalus.put_slice(&vec![0u8; 4199]);

        let packet = video_packet(1234, 0, true, nalus.freeze());
        assert!(packet.is_keyframe());
        assert_eq!(packet.timestamp, 1234);
        // After the 5-byte video preamble: length 4200, restored header
        assert_eq!(&packet.body[5..9], &[0x00, 0x00, 0x10, 0x68]);
        assert_eq!(packet.body[9], 0x65);
    }

    #[test]
    fn test_audio_packets() {
        let header = audio_seq_header();
        assert!(header.is_aac_seq_header());
        assert_eq!(&header.body[..2], &[0xAF, 0x00]);
        assert_eq!(&header.body[2..], &AAC_CONFIG);

        let frame = audio_packet(555, Bytes::from_static(&[0x21, 0x00]));
        assert!(frame.is_aac_raw());
        assert_eq!(frame.timestamp, 555);
        assert_eq!(&frame.body[..2], &[0xAF, 0x01]);
    }
}
