//! Sequence-header and GOP cache
//!
//! A viewer joining mid-stream needs, in order: the AAC config, the video
//! decoder config, and every frame since the last keyframe. The cache keeps
//! exactly that and replays it to each new subscriber.

use crate::error::{MediaError, Result};
use crate::media::packet::AvPacket;

/// Hard bound on packets per GOP slot
const GOP_MAX_PACKETS: usize = 1024;

/// One group of pictures: a keyframe and its dependent frames
#[derive(Debug, Default)]
struct Gop {
    packets: Vec<AvPacket>,
}

impl Gop {
    fn reset(&mut self) {
        self.packets.clear();
    }

    fn write(&mut self, packet: AvPacket) -> Result<()> {
        if self.packets.len() >= GOP_MAX_PACKETS {
            return Err(MediaError::GopFull.into());
        }
        self.packets.push(packet);
        Ok(())
    }
}

/// Ring of GOPs
///
/// A keyframe advances the ring (resetting the oldest slot); everything else
/// appends to the current slot. Replay walks the ring oldest-first, starting
/// one past `current`.
#[derive(Debug)]
pub struct GopCache {
    capacity: u8,
    current: u8,
    gops: Vec<Option<Gop>>,
}

impl GopCache {
    pub fn new(capacity: u8) -> Self {
        let mut gops = Vec::with_capacity(capacity as usize);
        gops.resize_with(capacity as usize, || None);
        Self {
            capacity,
            current: 0,
            gops,
        }
    }

    /// Cache one AV packet; sequence headers never enter the ring
    pub fn write(&mut self, packet: &AvPacket) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        if packet.is_video_seq_header() {
            return Ok(());
        }

        if packet.is_keyframe() {
            self.current = (self.current + 1) % self.capacity;
            match &mut self.gops[self.current as usize] {
                Some(gop) => gop.reset(),
                slot @ None => *slot = Some(Gop::default()),
            }
        }

        if let Some(gop) = &mut self.gops[self.current as usize] {
            gop.write(packet.clone())?;
        }
        Ok(())
    }

    /// Replay every cached packet oldest-GOP-first through `write`
    pub fn write_to(&self, mut write: impl FnMut(&AvPacket) -> Result<()>) -> Result<()> {
        for idx in 0..self.capacity {
            let pos = (self.current + 1 + idx) % self.capacity;
            if let Some(gop) = &self.gops[pos as usize] {
                for packet in &gop.packets {
                    write(packet)?;
                }
            }
        }
        Ok(())
    }

    /// Total packets across all slots
    pub fn packet_count(&self) -> usize {
        self.gops
            .iter()
            .flatten()
            .map(|g| g.packets.len())
            .sum()
    }
}

/// The cache a publisher maintains for mid-stream joins
#[derive(Debug)]
pub struct AvCache {
    /// Last seen AAC sequence header
    audio_config: Option<AvPacket>,
    /// Last seen AVC/HEVC sequence header
    video_config: Option<AvPacket>,
    gops: GopCache,
}

impl AvCache {
    pub fn new(gop_size: u8) -> Self {
        Self {
            audio_config: None,
            video_config: None,
            gops: GopCache::new(gop_size),
        }
    }

    /// Classify and store one packet
    ///
    /// Sequence headers replace their slots; AAC raw and video frames enter
    /// the GOP ring; non-AAC audio is not cached at all.
    pub fn write(&mut self, packet: &AvPacket) -> Result<()> {
        if packet.is_aac_seq_header() {
            self.audio_config = Some(packet.clone());
            return Ok(());
        }
        if packet.is_video_seq_header() {
            self.video_config = Some(packet.clone());
            return Ok(());
        }
        if packet.is_audio() && !packet.is_aac() {
            return Ok(());
        }
        self.gops.write(packet)
    }

    /// Flush the whole cache in join order: audio config, video config,
    /// then the GOP ring oldest-first
    pub fn write_to(&self, mut write: impl FnMut(&AvPacket) -> Result<()>) -> Result<()> {
        if let Some(packet) = &self.audio_config {
            write(packet)?;
        }
        if let Some(packet) = &self.video_config {
            write(packet)?;
        }
        self.gops.write_to(write)
    }

    pub fn video_config(&self) -> Option<&AvPacket> {
        self.video_config.as_ref()
    }

    pub fn audio_config(&self) -> Option<&AvPacket> {
        self.audio_config.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn audio_seq() -> AvPacket {
        AvPacket::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]))
    }

    fn video_seq() -> AvPacket {
        AvPacket::video(0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00, 0x01]))
    }

    fn keyframe(ts: u32) -> AvPacket {
        AvPacket::video(ts, Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00, 0x65]))
    }

    fn inter(ts: u32) -> AvPacket {
        AvPacket::video(ts, Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x00, 0x41]))
    }

    fn aac(ts: u32) -> AvPacket {
        AvPacket::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0x21]))
    }

    fn collect(cache: &AvCache) -> Vec<u32> {
        let mut out = Vec::new();
        cache
            .write_to(|p| {
                out.push(p.timestamp);
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_flush_order() {
        let mut cache = AvCache::new(1);
        cache.write(&keyframe(10)).unwrap();
        cache.write(&aac(15)).unwrap();
        cache.write(&inter(20)).unwrap();
        cache.write(&audio_seq()).unwrap();
        cache.write(&video_seq()).unwrap();

        // audio config, video config, then the GOP in arrival order
        let mut kinds = Vec::new();
        cache
            .write_to(|p| {
                kinds.push((p.kind, p.timestamp));
                Ok(())
            })
            .unwrap();
        assert_eq!(kinds.len(), 5);
        assert!(matches!(kinds[0], (crate::media::packet::PacketKind::Audio, 0)));
        assert!(matches!(kinds[1], (crate::media::packet::PacketKind::Video, 0)));
        assert_eq!(kinds[2].1, 10);
        assert_eq!(kinds[3].1, 15);
        assert_eq!(kinds[4].1, 20);
    }

    #[test]
    fn test_keyframe_resets_single_slot() {
        let mut cache = AvCache::new(1);
        cache.write(&keyframe(0)).unwrap();
        cache.write(&inter(33)).unwrap();
        cache.write(&inter(66)).unwrap();
        assert_eq!(collect(&cache), vec![0, 33, 66]);

        cache.write(&keyframe(100)).unwrap();
        cache.write(&inter(133)).unwrap();
        assert_eq!(collect(&cache), vec![100, 133]);
    }

    #[test]
    fn test_two_slot_ring_keeps_previous_gop() {
        let mut cache = AvCache::new(2);
        cache.write(&keyframe(0)).unwrap();
        cache.write(&inter(33)).unwrap();
        cache.write(&keyframe(100)).unwrap();
        cache.write(&inter(133)).unwrap();

        // Oldest GOP first
        assert_eq!(collect(&cache), vec![0, 33, 100, 133]);

        // Third keyframe overwrites the oldest slot
        cache.write(&keyframe(200)).unwrap();
        assert_eq!(collect(&cache), vec![100, 133, 200]);
    }

    #[test]
    fn test_seq_headers_replaced_not_appended() {
        let mut cache = AvCache::new(1);
        cache.write(&audio_seq()).unwrap();
        let second = AvPacket::audio(99, Bytes::from_static(&[0xAF, 0x00, 0x11, 0x90]));
        cache.write(&second).unwrap();
        assert_eq!(cache.audio_config().unwrap().timestamp, 99);
        assert_eq!(cache.gops.packet_count(), 0);
    }

    #[test]
    fn test_non_aac_audio_not_cached() {
        let mut cache = AvCache::new(1);
        cache.write(&keyframe(0)).unwrap();
        let mp3 = AvPacket::audio(5, Bytes::from_static(&[0x2F, 0x01, 0x00]));
        cache.write(&mp3).unwrap();
        assert_eq!(cache.gops.packet_count(), 1);
    }

    #[test]
    fn test_gop_slot_overflow_fails() {
        let mut cache = AvCache::new(1);
        cache.write(&keyframe(0)).unwrap();
        for i in 1..GOP_MAX_PACKETS {
            cache.write(&inter(i as u32)).unwrap();
        }
        assert!(cache.write(&inter(99999)).is_err());
    }

    #[test]
    fn test_frames_before_first_keyframe_dropped() {
        // With no keyframe seen yet there is no open slot
        let mut cache = AvCache::new(1);
        cache.write(&inter(5)).unwrap();
        assert_eq!(cache.gops.packet_count(), 0);
    }
}
