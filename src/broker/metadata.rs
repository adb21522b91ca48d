//! Stream metadata: parsed from `@setDataFrame`/`onMetaData`, re-emitted
//! canonically to every subscriber

use std::collections::HashMap;

use bytes::Bytes;

use crate::amf::{amf0, AmfValue};
use crate::error::Result;
use crate::media::packet::AvPacket;
use crate::protocol::constants::{CMD_ON_METADATA, CMD_SET_DATA_FRAME};

/// The onMetaData property set the relay understands
///
/// Codec ids stay as raw AMF values: OBS sends strings, ffmpeg numbers.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub server: String,
    pub duration: Option<f64>,
    pub file_size: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub video_codec_id: Option<AmfValue>,
    pub video_data_rate: Option<f64>,
    pub frame_rate: Option<f64>,
    pub audio_codec_id: Option<AmfValue>,
    pub audio_sample_rate: Option<f64>,
    pub audio_sample_size: Option<f64>,
    pub audio_channels: Option<f64>,
    pub stereo: Option<bool>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            server: "livehub".to_string(),
            duration: None,
            file_size: None,
            width: None,
            height: None,
            video_codec_id: None,
            video_data_rate: None,
            frame_rate: None,
            audio_codec_id: None,
            audio_sample_rate: None,
            audio_sample_size: None,
            audio_channels: None,
            stereo: None,
        }
    }
}

impl Metadata {
    /// Parse an AMF0 metadata message body
    ///
    /// Accepts both `@setDataFrame` + `onMetaData` + object (publishers) and
    /// a bare `onMetaData` + object.
    pub fn parse(body: &Bytes) -> Result<Self> {
        let values = amf0::decode_all(body)?;
        let mut iter = values.iter();

        let mut current = iter.next();
        if matches!(current, Some(AmfValue::String(s)) if s == CMD_SET_DATA_FRAME) {
            current = iter.next();
        }
        if matches!(current, Some(AmfValue::String(s)) if s == CMD_ON_METADATA) {
            current = iter.next();
        }

        let mut metadata = Metadata::default();
        if let Some(props) = current.and_then(|v| v.as_object()) {
            metadata.duration = props.get("duration").and_then(|v| v.as_number());
            metadata.file_size = props.get("fileSize").and_then(|v| v.as_number());
            metadata.width = props.get("width").and_then(|v| v.as_number());
            metadata.height = props.get("height").and_then(|v| v.as_number());
            metadata.video_codec_id = props.get("videocodecid").cloned();
            metadata.video_data_rate = props.get("videodatarate").and_then(|v| v.as_number());
            metadata.frame_rate = props.get("framerate").and_then(|v| v.as_number());
            metadata.audio_codec_id = props.get("audiocodecid").cloned();
            metadata.audio_sample_rate = props.get("audiosamplerate").and_then(|v| v.as_number());
            metadata.audio_sample_size = props.get("audiosamplesize").and_then(|v| v.as_number());
            metadata.audio_channels = props.get("audiochannels").and_then(|v| v.as_number());
            metadata.stereo = props.get("stereo").and_then(|v| v.as_bool());
        }
        Ok(metadata)
    }

    /// Re-encode as a canonical `onMetaData` packet
    pub fn to_packet(&self) -> AvPacket {
        let mut props = HashMap::new();
        props.insert("server".to_string(), AmfValue::String(self.server.clone()));

        let mut put = |key: &str, value: Option<f64>| {
            if let Some(v) = value {
                props.insert(key.to_string(), AmfValue::Number(v));
            }
        };
        put("duration", self.duration);
        put("fileSize", self.file_size);
        put("width", self.width);
        put("height", self.height);
        put("videodatarate", self.video_data_rate);
        put("framerate", self.frame_rate);
        put("audiosamplerate", self.audio_sample_rate);
        put("audiosamplesize", self.audio_sample_size);
        put("audiochannels", self.audio_channels);

        if let Some(id) = &self.video_codec_id {
            props.insert("videocodecid".to_string(), id.clone());
        }
        if let Some(id) = &self.audio_codec_id {
            props.insert("audiocodecid".to_string(), id.clone());
        }
        if let Some(stereo) = self.stereo {
            props.insert("stereo".to_string(), AmfValue::Boolean(stereo));
        }

        let body = amf0::encode_all(&[
            AmfValue::String(CMD_ON_METADATA.to_string()),
            AmfValue::Object(props),
        ]);
        AvPacket::metadata(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::amf0::encode_all;

    fn sample_body(with_set_data_frame: bool) -> Bytes {
        let mut props = HashMap::new();
        props.insert("width".to_string(), AmfValue::Number(1920.0));
        props.insert("height".to_string(), AmfValue::Number(1080.0));
        props.insert("framerate".to_string(), AmfValue::Number(30.0));
        props.insert("videocodecid".to_string(), AmfValue::String("avc1".into()));
        props.insert("audiocodecid".to_string(), AmfValue::Number(10.0));
        props.insert("stereo".to_string(), AmfValue::Boolean(true));

        let mut values = Vec::new();
        if with_set_data_frame {
            values.push(AmfValue::String(CMD_SET_DATA_FRAME.into()));
        }
        values.push(AmfValue::String(CMD_ON_METADATA.into()));
        values.push(AmfValue::EcmaArray(props));
        encode_all(&values)
    }

    #[test]
    fn test_parse_with_set_data_frame() {
        let metadata = Metadata::parse(&sample_body(true)).unwrap();
        assert_eq!(metadata.width, Some(1920.0));
        assert_eq!(metadata.height, Some(1080.0));
        assert_eq!(metadata.frame_rate, Some(30.0));
        // OBS-style string codec id survives as-is
        assert_eq!(
            metadata.video_codec_id,
            Some(AmfValue::String("avc1".into()))
        );
        // ffmpeg-style numeric codec id too
        assert_eq!(metadata.audio_codec_id, Some(AmfValue::Number(10.0)));
        assert_eq!(metadata.stereo, Some(true));
    }

    #[test]
    fn test_parse_bare_on_metadata() {
        let metadata = Metadata::parse(&sample_body(false)).unwrap();
        assert_eq!(metadata.width, Some(1920.0));
    }

    #[test]
    fn test_canonical_packet_roundtrips() {
        let metadata = Metadata::parse(&sample_body(true)).unwrap();
        let packet = metadata.to_packet();
        assert!(packet.is_metadata());

        let again = Metadata::parse(&packet.body).unwrap();
        assert_eq!(again.width, Some(1920.0));
        assert_eq!(again.video_codec_id, Some(AmfValue::String("avc1".into())));
        assert_eq!(again.server, "livehub");
    }

    #[test]
    fn test_placeholder_when_absent() {
        let packet = Metadata::default().to_packet();
        let parsed = Metadata::parse(&packet.body).unwrap();
        assert_eq!(parsed.server, "livehub");
        assert_eq!(parsed.width, None);
    }
}
