//! Rolling M3U8 media playlist
//!
//! Keeps the sliding window of recent segments and decides when a keyframe
//! cuts a new one. Playlist writes are atomic (temp file + rename).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// One finished segment
#[derive(Debug, Clone)]
pub struct TsSegment {
    pub id: u64,
    pub duration: f64,
}

/// Segment naming and playlist state for one stream
#[derive(Debug)]
pub struct PlaylistRoller {
    prefix: String,
    stream: String,
    /// Timestamp of the last cut (ms)
    last_cut: u32,
    /// Serial number of the segment currently being written
    sn: u64,
    /// Minimum segment duration (ms)
    duration_ms: u64,
    /// Sliding window length in segments
    window_size: usize,
    segments: VecDeque<TsSegment>,
}

impl PlaylistRoller {
    pub fn new(prefix: &str, stream: &str, duration_ms: u64, window_size: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            stream: stream.to_string(),
            last_cut: 0,
            sn: 0,
            duration_ms,
            window_size: window_size.max(1),
            segments: VecDeque::new(),
        }
    }

    /// File name of segment `id`
    pub fn segment_name(&self, id: u64) -> String {
        format!("{}{}-{}.ts", self.prefix, self.stream, id)
    }

    /// File name of the segment currently being written
    pub fn current_segment_name(&self) -> String {
        self.segment_name(self.sn)
    }

    pub fn playlist_name(&self) -> String {
        format!("{}.m3u8", self.stream)
    }

    /// A keyframe at `timestamp` cuts once the minimum duration has passed
    pub fn should_cut(&self, timestamp: u32) -> bool {
        timestamp.wrapping_sub(self.last_cut) >= self.duration_ms as u32
    }

    /// Finish the current segment at `timestamp` and slide the window
    ///
    /// Returns the id of the finished segment; the next one starts at `sn`.
    pub fn cut(&mut self, timestamp: u32) -> u64 {
        let finished = self.sn;
        let duration = f64::from(timestamp.wrapping_sub(self.last_cut)) / 1000.0;

        self.segments.push_back(TsSegment {
            id: finished,
            duration,
        });
        while self.segments.len() > self.window_size {
            self.segments.pop_front();
        }

        self.sn += 1;
        self.last_cut = timestamp;
        finished
    }

    /// EXT-X-MEDIA-SEQUENCE: the first windowed segment id, 0 before any cut
    pub fn media_sequence(&self) -> u64 {
        self.segments.front().map(|s| s.id).unwrap_or(0)
    }

    /// EXT-X-TARGETDURATION: the longest EXTINF in the window
    pub fn target_duration(&self) -> f64 {
        self.segments
            .iter()
            .map(|s| s.duration)
            .fold(0.0, f64::max)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Render the playlist text
    pub fn playlist(&self) -> String {
        let mut text = String::with_capacity(256);
        text.push_str("#EXTM3U\n");
        text.push_str("#EXT-X-VERSION:3\n");
        text.push_str("#EXT-X-ALLOW-CACHE:NO\n");
        text.push_str(&format!("#EXT-X-TARGETDURATION:{:.3}\n", self.target_duration()));
        text.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n\n", self.media_sequence()));

        for segment in &self.segments {
            text.push_str(&format!(
                "#EXTINF:{:.3},\n{}\n",
                segment.duration,
                self.segment_name(segment.id)
            ));
        }
        text
    }

    /// Write the playlist atomically next to the segments
    pub async fn write_playlist(&self, dir: &Path) -> std::io::Result<()> {
        let tmp: PathBuf = dir.join(format!("{}.m3u8.tmp", self.stream));
        let target: PathBuf = dir.join(self.playlist_name());
        tokio::fs::write(&tmp, self.playlist()).await?;
        tokio::fs::rename(&tmp, &target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The segmenting scenario: ts_duration 2000 ms, window 6000 ms
    #[test]
    fn test_cut_timing_and_sequence() {
        let mut roller = PlaylistRoller::new("", "cam", 2000, 3);

        let mut cuts = Vec::new();
        for keyframe_ts in [0u32, 1500, 2100, 4300, 6500, 9000] {
            if roller.should_cut(keyframe_ts) && keyframe_ts != 0 {
                cuts.push(keyframe_ts);
                roller.cut(keyframe_ts);
            }
        }

        assert_eq!(cuts, vec![2100, 4300, 6500, 9000]);
        assert_eq!(roller.segment_count(), 3);
        assert_eq!(roller.media_sequence(), 1);

        // One more cut: five finished segments, sequence = 5 - 3
        assert!(roller.should_cut(11000));
        roller.cut(11000);
        assert_eq!(roller.segment_count(), 3);
        assert_eq!(roller.media_sequence(), 2);
    }

    #[test]
    fn test_cut_requires_full_duration() {
        let roller = PlaylistRoller::new("", "cam", 2000, 3);
        assert!(!roller.should_cut(1999));
        assert!(roller.should_cut(2000));
    }

    #[test]
    fn test_playlist_text() {
        let mut roller = PlaylistRoller::new("seg-", "cam", 2000, 3);
        roller.cut(2100);
        roller.cut(4300);

        let text = roller.playlist();
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains("#EXT-X-VERSION:3\n"));
        assert!(text.contains("#EXT-X-ALLOW-CACHE:NO\n"));
        assert!(text.contains("#EXT-X-TARGETDURATION:2.200\n"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(text.contains("#EXTINF:2.100,\nseg-cam-0.ts\n"));
        assert!(text.contains("#EXTINF:2.200,\nseg-cam-1.ts\n"));
    }

    #[test]
    fn test_target_duration_covers_every_extinf() {
        let mut roller = PlaylistRoller::new("", "cam", 2000, 4);
        for ts in [2100u32, 5000, 7100, 9100] {
            roller.cut(ts);
        }
        let max = roller.target_duration();
        for segment in &roller.segments {
            assert!(max >= segment.duration);
        }
    }

    #[test]
    fn test_segment_names() {
        let roller = PlaylistRoller::new("pre-", "abc", 2000, 3);
        assert_eq!(roller.current_segment_name(), "pre-abc-0.ts");
        assert_eq!(roller.segment_name(7), "pre-abc-7.ts");
        assert_eq!(roller.playlist_name(), "abc.m3u8");
    }
}
