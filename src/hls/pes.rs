//! PES (Packetized Elementary Stream) header emission
//!
//! ```text
//! +------------+------------------------+-----------------+
//! | pes header |  optional pes header   |   pes payload   |
//! +------------+------------------------+-----------------+
//!      6 bytes        3..259 bytes         max 65526 bytes
//! ```

use bytes::{BufMut, BytesMut};

/// PES stream id for video elementary streams
pub const STREAM_ID_VIDEO: u8 = 0xE0;

/// PES stream id for audio elementary streams
pub const STREAM_ID_AUDIO: u8 = 0xC0;

/// PES header with PTS and optional DTS, both in 90 kHz units
#[derive(Debug, Clone)]
pub struct PesHeader {
    pub stream_id: u8,
    pub pts: u64,
    /// Emitted only when it differs from the PTS
    pub dts: u64,
    /// Payload length the PES_packet_length field accounts for
    pub payload_len: usize,
}

impl PesHeader {
    pub fn video(pts: u64, dts: u64, payload_len: usize) -> Self {
        Self {
            stream_id: STREAM_ID_VIDEO,
            pts,
            dts,
            payload_len,
        }
    }

    pub fn audio(pts: u64, payload_len: usize) -> Self {
        Self {
            stream_id: STREAM_ID_AUDIO,
            pts,
            dts: pts,
            payload_len,
        }
    }

    fn has_dts(&self) -> bool {
        self.pts != self.dts
    }

    /// Emit the header: start code, stream id, length, flags, PTS (and DTS)
    pub fn write_to(&self, buf: &mut BytesMut) {
        let header_data_len: u8 = if self.has_dts() { 10 } else { 5 };

        // PES_packet_length counts everything after it; 0 means unbounded
        let total = self.payload_len + header_data_len as usize + 3;
        let packet_length = if total > 0xFFFF { 0 } else { total as u16 };

        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.put_u8(0x01);
        buf.put_u8(self.stream_id);
        buf.put_u16(packet_length);
        buf.put_u8(0x80); // marker bits
        buf.put_u8(if self.has_dts() { 0xC0 } else { 0x80 });
        buf.put_u8(header_data_len);

        write_timestamp(buf, if self.has_dts() { 0x03 } else { 0x02 }, self.pts);
        if self.has_dts() {
            write_timestamp(buf, 0x01, self.dts);
        }
    }
}

/// 33-bit timestamp in the 5-byte PES layout with marker bits
fn write_timestamp(buf: &mut BytesMut, flag: u8, ts: u64) {
    buf.put_u8((flag << 4) | ((ts >> 30) as u8 & 0x07) << 1 | 1);

    let mid = (((ts >> 15) & 0x7FFF) << 1) | 1;
    buf.put_u8((mid >> 8) as u8);
    buf.put_u8(mid as u8);

    let low = ((ts & 0x7FFF) << 1) | 1;
    buf.put_u8((low >> 8) as u8);
    buf.put_u8(low as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_timestamp(p: &[u8]) -> u64 {
        let high = ((p[0] >> 1) & 0x07) as u64;
        let mid = (u64::from(p[1]) << 8 | u64::from(p[2])) >> 1;
        let low = (u64::from(p[3]) << 8 | u64::from(p[4])) >> 1;
        (high << 30) | (mid << 15) | low
    }

    #[test]
    fn test_video_header_with_dts() {
        let pts = 90_000u64 + 3600;
        let dts = 90_000u64;
        let mut buf = BytesMut::new();
        PesHeader::video(pts, dts, 100).write_to(&mut buf);

        assert_eq!(&buf[0..3], &[0x00, 0x00, 0x01]);
        assert_eq!(buf[3], STREAM_ID_VIDEO);
        // length = 100 + 10 + 3
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 113);
        assert_eq!(buf[7], 0xC0);
        assert_eq!(buf[8], 10);
        assert_eq!(read_timestamp(&buf[9..14]), pts);
        assert_eq!(read_timestamp(&buf[14..19]), dts);
        assert_eq!(buf.len(), 19);
    }

    #[test]
    fn test_audio_header_pts_only() {
        let pts = 1234 * 90;
        let mut buf = BytesMut::new();
        PesHeader::audio(pts, 50).write_to(&mut buf);

        assert_eq!(buf[3], STREAM_ID_AUDIO);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 58);
        assert_eq!(buf[7], 0x80);
        assert_eq!(buf[8], 5);
        assert_eq!(read_timestamp(&buf[9..14]), pts);
        assert_eq!(buf.len(), 14);
    }

    #[test]
    fn test_oversized_payload_unbounded_length() {
        let mut buf = BytesMut::new();
        PesHeader::video(0, 0, 70_000).write_to(&mut buf);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 0);
    }

    #[test]
    fn test_timestamp_33bit_range() {
        let ts = 0x1_FFFF_FFFF;
        let mut buf = BytesMut::new();
        write_timestamp(&mut buf, 0x02, ts);
        assert_eq!(read_timestamp(&buf), ts);
    }
}
