//! HLS playlist documents.
//!
//! Renditions are segmented MPEG-TS with one variant playlist per bitrate
//! and a master playlist enumerating the variants. Builders render to text;
//! uploading is the caller's concern.

pub const PLAYLIST_MIME: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_MIME: &str = "video/mp2t";

pub struct MediaSegment {
    pub duration: f64,
    pub uri: String,
}

/// Variant playlist for a single bitrate.
pub struct MediaPlaylist {
    pub version: u8,
    pub target_duration: u32,
    pub segments: Vec<MediaSegment>,
    pub end_list: bool,
}

impl MediaPlaylist {
    pub fn new(target_duration: u32) -> Self {
        Self {
            version: 3,
            target_duration,
            segments: Vec::new(),
            end_list: true,
        }
    }

    pub fn add_segment(&mut self, duration: f64, uri: String) {
        self.segments.push(MediaSegment { duration, uri });
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        out.push_str(&format!("#EXT-X-VERSION:{}\n", self.version));
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration));
        out.push('\n');

        for segment in &self.segments {
            out.push_str(&format!("#EXTINF:{:.1},\n", segment.duration));
            out.push_str(&segment.uri);
            out.push('\n');
        }

        if self.end_list {
            out.push_str("#EXT-X-ENDLIST\n");
        }

        out
    }
}

/// Master playlist enumerating variant streams in ascending bitrate order.
pub struct MasterPlaylist {
    bitrates: Vec<u32>,
    /// Variant annotated for the requesting client, if any
    recommended: Option<u32>,
}

impl MasterPlaylist {
    pub fn new(mut bitrates: Vec<u32>) -> Self {
        bitrates.sort_unstable();
        bitrates.dedup();
        Self {
            bitrates,
            recommended: None,
        }
    }

    pub fn with_recommended(mut self, bitrate: u32) -> Self {
        self.recommended = Some(bitrate);
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n\n");

        for &bitrate in &self.bitrates {
            let bandwidth = bitrate as u64 * 1000;
            out.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},CODECS=\"mp4a.40.2\"",
                bandwidth
            ));
            if self.recommended == Some(bitrate) {
                out.push_str(",RESOLUTION=0x0");
            }
            out.push('\n');
            out.push_str(&format!("{}k/playlist.m3u8\n", bitrate));
        }

        out
    }
}

/// Canonical name of segment `index` inside a rendition directory.
pub fn segment_file_name(index: u32) -> String {
    format!("segment_{:03}.ts", index)
}

/// Public segment id, `{chapter_id}_{bitrate}_{NNN}`.
pub fn segment_id(chapter_id: &str, bitrate: u32, index: u32) -> String {
    format!("{}_{}_{:03}", chapter_id, bitrate, index)
}

/// Pull the numeric segment index out of a segment id or file name.
/// Accepts `{chapter}_{bitrate}_{NNN}`, `segment_{NNN}.ts`, or a bare index.
pub fn parse_segment_index(id: &str) -> Option<u32> {
    let stem = id.strip_suffix(".ts").unwrap_or(id);
    let tail = stem.rsplit('_').next().unwrap_or(stem);
    tail.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_playlist_format() {
        let mut playlist = MediaPlaylist::new(10);
        playlist.add_segment(10.0, "segment_000.ts".into());
        playlist.add_segment(10.0, "segment_001.ts".into());

        let body = playlist.render();
        assert_eq!(
            body,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n\n\
             #EXTINF:10.0,\nsegment_000.ts\n#EXTINF:10.0,\nsegment_001.ts\n\
             #EXT-X-ENDLIST\n"
        );
    }

    #[test]
    fn variant_playlist_terminates_with_endlist() {
        let playlist = MediaPlaylist::new(10);
        assert!(playlist.render().ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn master_playlist_sorts_ascending() {
        let body = MasterPlaylist::new(vec![256, 64, 128]).render();
        let b64 = body.find("BANDWIDTH=64000").unwrap();
        let b128 = body.find("BANDWIDTH=128000").unwrap();
        let b256 = body.find("BANDWIDTH=256000").unwrap();
        assert!(b64 < b128 && b128 < b256);
        assert!(body.contains("64k/playlist.m3u8"));
        assert!(body.contains("CODECS=\"mp4a.40.2\""));
    }

    #[test]
    fn master_playlist_annotates_only_the_recommended_variant() {
        let body = MasterPlaylist::new(vec![64, 128, 256])
            .with_recommended(128)
            .render();
        assert_eq!(body.matches("RESOLUTION=0x0").count(), 1);
        assert!(body.contains("BANDWIDTH=128000,CODECS=\"mp4a.40.2\",RESOLUTION=0x0"));
    }

    #[test]
    fn segment_naming() {
        assert_eq!(segment_file_name(7), "segment_007.ts");
        assert_eq!(segment_id("ch-1", 128, 4), "ch-1_128_004");
    }

    #[test]
    fn segment_index_parsing() {
        assert_eq!(parse_segment_index("ch-1_128_004"), Some(4));
        assert_eq!(parse_segment_index("segment_012.ts"), Some(12));
        assert_eq!(parse_segment_index("3"), Some(3));
        assert_eq!(parse_segment_index("playlist.m3u8"), None);
    }
}
