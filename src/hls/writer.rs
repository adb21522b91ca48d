//! The HLS segment writer
//!
//! One task per published stream. Consumes common packets from the room's
//! hot path, converts them to PES (Annex-B video, ADTS audio), muxes into
//! 188-byte TS packets, cuts segment files on keyframes and rolls the
//! playlist.

use std::path::PathBuf;

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::m3u8::PlaylistRoller;
use super::pes::PesHeader;
use super::ts;
use crate::broker::PacketSink;
use crate::config::HlsConfig;
use crate::error::{Error, Result};
use crate::media::aac::{adts_header, AudioSpecificConfig};
use crate::media::avc::{AnnexBConverter, AvcConfig};
use crate::media::flv::{self, AudioTagData, VideoTagData};
use crate::media::packet::AvPacket;
use crate::protocol::constants::{MEDIA_QUEUE_CAPACITY, QUEUE_HEADROOM};

/// Stateful TS/M3U8 writer for one stream
pub struct HlsWriter {
    dir: PathBuf,
    roller: PlaylistRoller,
    file: File,
    video_cc: u8,
    audio_cc: u8,
    annexb: AnnexBConverter,
    aac_config: Option<AudioSpecificConfig>,
    /// Scratch for the PES being assembled
    pes_buf: BytesMut,
    /// Scratch for the TS packets of one PES
    ts_buf: BytesMut,
}

impl HlsWriter {
    /// Create the segment directory and open the first segment file
    pub async fn new(config: &HlsConfig, stream: &str) -> Result<Self> {
        let dir = PathBuf::from(&config.ts_path);
        tokio::fs::create_dir_all(&dir).await?;

        let roller = PlaylistRoller::new(
            &config.ts_prefix,
            stream,
            config.ts_duration,
            config.window_size(),
        );

        let file = open_segment(&dir, &roller.current_segment_name()).await?;

        Ok(Self {
            dir,
            roller,
            file,
            video_cc: 0,
            audio_cc: 0,
            annexb: AnnexBConverter::new(),
            aac_config: None,
            pes_buf: BytesMut::with_capacity(16 * 1024),
            ts_buf: BytesMut::with_capacity(32 * 1024),
        })
    }

    /// Mux one common packet
    pub async fn write_packet(&mut self, packet: &AvPacket) -> Result<()> {
        if packet.is_video() {
            self.write_video(packet).await
        } else if packet.is_audio() {
            self.write_audio(packet).await
        } else {
            Ok(())
        }
    }

    async fn write_video(&mut self, packet: &AvPacket) -> Result<()> {
        // Only H.264 goes into TS segments
        if !packet.is_avc() {
            tracing::trace!("skipping non-AVC video for HLS");
            return Ok(());
        }

        let tag = VideoTagData::parse(&packet.body)?;

        if tag.avc_packet_type == flv::AVC_SEQ_HEADER {
            let config = AvcConfig::parse(tag.data.clone())?;
            self.annexb.set_extradata(&config);
            return Ok(());
        }
        if tag.avc_packet_type != flv::AVC_NALU {
            return Ok(());
        }

        let keyframe = tag.frame_type == flv::FRAME_KEY;

        // A due keyframe opens the next segment before being written, so
        // every segment starts with one
        if keyframe && self.roller.should_cut(packet.timestamp) {
            self.cut(packet.timestamp).await?;
        }

        let dts = u64::from(packet.timestamp) * 90;
        let pts = (dts as i64 + i64::from(tag.composition_time) * 90).max(0) as u64;

        // PES: header, AUD, start-coded NALs
        self.pes_buf.clear();
        let mut payload = BytesMut::with_capacity(tag.data.len() + 64);
        self.annexb.convert(&tag.data, &mut payload)?;
        PesHeader::video(pts, dts, payload.len()).write_to(&mut self.pes_buf);
        self.pes_buf.extend_from_slice(&payload);

        self.ts_buf.clear();
        ts::write_pes(
            &mut self.ts_buf,
            ts::PID_VIDEO,
            keyframe,
            &mut self.video_cc,
            dts,
            &self.pes_buf,
        );
        self.file.write_all(&self.ts_buf).await?;

        Ok(())
    }

    async fn write_audio(&mut self, packet: &AvPacket) -> Result<()> {
        if !packet.is_aac() {
            return Ok(());
        }

        let tag = AudioTagData::parse(&packet.body)?;

        if tag.aac_packet_type == flv::AAC_SEQ_HEADER {
            self.aac_config = Some(AudioSpecificConfig::parse(&tag.data)?);
            return Ok(());
        }

        // Frames before the config cannot be framed into ADTS
        let Some(config) = self.aac_config.clone() else {
            tracing::trace!("dropping AAC frame before AudioSpecificConfig");
            return Ok(());
        };

        let pts = u64::from(packet.timestamp) * 90;

        self.pes_buf.clear();
        let payload_len = tag.data.len() + 7;
        PesHeader::audio(pts, payload_len).write_to(&mut self.pes_buf);
        self.pes_buf.extend_from_slice(&adts_header(&config, tag.data.len()));
        self.pes_buf.extend_from_slice(&tag.data);

        self.ts_buf.clear();
        ts::write_pes(
            &mut self.ts_buf,
            ts::PID_AUDIO,
            false,
            &mut self.audio_cc,
            pts,
            &self.pes_buf,
        );
        self.file.write_all(&self.ts_buf).await?;

        Ok(())
    }

    /// Close the finished segment, roll the playlist, open the next file
    async fn cut(&mut self, timestamp: u32) -> Result<()> {
        self.file.flush().await?;

        let finished = self.roller.cut(timestamp);
        self.roller.write_playlist(&self.dir).await?;
        tracing::debug!(
            segment = finished,
            media_sequence = self.roller.media_sequence(),
            "segment cut"
        );

        self.file = open_segment(&self.dir, &self.roller.current_segment_name()).await?;
        Ok(())
    }

    /// Flush on shutdown
    pub async fn finish(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Create a segment file and write the PAT/PMT preamble
async fn open_segment(dir: &std::path::Path, name: &str) -> Result<File> {
    let mut file = File::create(dir.join(name)).await?;
    file.write_all(&ts::pat_pmt_preamble()).await?;
    Ok(file)
}

/// The broker-facing handle: a bounded queue into the writer task
pub struct HlsSink {
    tx: mpsc::Sender<AvPacket>,
}

impl HlsSink {
    /// Spawn the writer task for one stream
    pub fn spawn(config: &HlsConfig, stream: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<AvPacket>(MEDIA_QUEUE_CAPACITY);
        let config = config.clone();
        let stream = stream.to_string();

        tokio::spawn(async move {
            let mut writer = match HlsWriter::new(&config, &stream).await {
                Ok(writer) => writer,
                Err(e) => {
                    tracing::error!(stream = %stream, error = %e, "HLS writer failed to start");
                    return;
                }
            };

            while let Some(packet) = rx.recv().await {
                if let Err(e) = writer.write_packet(&packet).await {
                    tracing::error!(stream = %stream, error = %e, "HLS write failed");
                    break;
                }
            }

            if let Err(e) = writer.finish().await {
                tracing::warn!(stream = %stream, error = %e, "HLS flush failed");
            }
            tracing::debug!(stream = %stream, "HLS writer stopped");
        });

        Ok(Self { tx })
    }
}

impl PacketSink for HlsSink {
    fn write_packet(&self, packet: &AvPacket) -> Result<()> {
        if self.tx.capacity() <= QUEUE_HEADROOM {
            return Err(Error::SubscriberLagging);
        }
        self.tx
            .try_send(packet.clone())
            .map_err(|_| Error::SubscriberLagging)
    }

    fn close(&self) {
        // Dropping the sink closes the queue and stops the writer task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    fn temp_config(dir: &std::path::Path) -> HlsConfig {
        HlsConfig {
            enable: true,
            port: 0,
            ts_path: dir.to_string_lossy().into_owned(),
            ts_prefix: String::new(),
            ts_duration: 2000,
            ts_window: 6000,
        }
    }

    fn avc_seq_header_packet() -> AvPacket {
        let record = [
            0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00,
            0x03, 0x68, 0xEF, 0x38,
        ];
        let mut body = BytesMut::new();
        body.put_slice(&[0x17, 0x00, 0x00, 0x00, 0x00]);
        body.put_slice(&record);
        AvPacket::video(0, body.freeze())
    }

    fn keyframe_packet(ts: u32) -> AvPacket {
        let mut body = BytesMut::new();
        body.put_slice(&[0x17, 0x01, 0x00, 0x00, 0x00]);
        body.put_u32(5); // one 5-byte IDR NAL
        body.put_slice(&[0x65, 0x11, 0x22, 0x33, 0x44]);
        AvPacket::video(ts, body.freeze())
    }

    fn aac_seq_header_packet() -> AvPacket {
        AvPacket::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]))
    }

    fn aac_frame_packet(ts: u32) -> AvPacket {
        AvPacket::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0x21, 0x10, 0x04]))
    }

    #[tokio::test]
    async fn test_segments_cut_and_playlist_rolls() {
        let dir = std::env::temp_dir().join(format!("livehub-hls-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let config = temp_config(&dir);

        let mut writer = HlsWriter::new(&config, "cam").await.unwrap();
        writer.write_packet(&avc_seq_header_packet()).await.unwrap();
        writer.write_packet(&aac_seq_header_packet()).await.unwrap();

        for ts in [0u32, 1500, 2100, 4300, 6500, 9000] {
            writer.write_packet(&keyframe_packet(ts)).await.unwrap();
            writer.write_packet(&aac_frame_packet(ts)).await.unwrap();
        }
        writer.finish().await.unwrap();

        // Four cuts: segments 0..=3 finished, segment 4 being written
        let playlist = tokio::fs::read_to_string(dir.join("cam.m3u8")).await.unwrap();
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:1"));
        assert!(playlist.contains("cam-1.ts"));
        assert!(playlist.contains("cam-2.ts"));
        assert!(playlist.contains("cam-3.ts"));
        assert!(!playlist.contains("cam-0.ts"));

        // Every finished segment starts with the PAT/PMT preamble
        for id in 0..=3 {
            let data = tokio::fs::read(dir.join(format!("cam-{}.ts", id))).await.unwrap();
            assert_eq!(data.len() % 188, 0, "segment {} not packet-aligned", id);
            assert_eq!(&data[..4], &[0x47, 0x40, 0x00, 0x10]);
            assert_eq!(data[188], 0x47);
            // More than just the preamble
            assert!(data.len() > 376, "segment {} has no payload", id);
        }

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_audio_waits_for_config() {
        let dir = std::env::temp_dir().join(format!("livehub-hls-a-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let config = temp_config(&dir);

        let mut writer = HlsWriter::new(&config, "cam").await.unwrap();
        // Raw frame before the config is dropped without error
        writer.write_packet(&aac_frame_packet(10)).await.unwrap();
        writer.write_packet(&aac_seq_header_packet()).await.unwrap();
        writer.write_packet(&aac_frame_packet(33)).await.unwrap();
        writer.finish().await.unwrap();

        let data = tokio::fs::read(dir.join("cam-0.ts")).await.unwrap();
        // Preamble plus exactly one audio PES packet
        assert_eq!(data.len(), 376 + 188);
        // Audio PID on the third packet
        let pid = (u16::from(data[376 + 1] & 0x1F) << 8) | u16::from(data[376 + 2]);
        assert_eq!(pid, 0x101);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
