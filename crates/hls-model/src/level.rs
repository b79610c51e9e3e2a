use crate::details::LevelDetails;
use std::sync::Arc;
use url::Url;

/// One rendition entry as produced by the external manifest parser, before
/// grouping. Entries that share a bitrate are folded into a single [`Level`]
/// with redundant failover URLs.
#[derive(Debug, Clone)]
pub struct ParsedLevel {
    pub bitrate: u64,
    pub url: Url,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    /// `AUDIO` group attribute of this variant, if declared.
    pub audio_group_id: Option<String>,
    /// `SUBTITLES` group attribute of this variant, if declared.
    pub text_group_id: Option<String>,
    pub width: u32,
    pub height: u32,
}

/// One logical rendition: a bitrate plus one or more redundant URLs.
///
/// `url_id` selects the active URL and always satisfies
/// `url_id < url.len()`. `load_error` counts consecutive failures on this
/// level; once it reaches `url.len()` every redundant URL has been tried
/// and recovery must switch rendition instead.
#[derive(Debug, Clone)]
pub struct Level {
    pub bitrate: u64,
    pub url: Vec<Url>,
    pub url_id: usize,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    /// Audio group ids, parallel to `url` (one per redundant variant).
    pub audio_group_ids: Vec<String>,
    /// Subtitle group ids, parallel to `url`.
    pub text_group_ids: Vec<String>,
    pub details: Option<Arc<LevelDetails>>,
    pub load_error: u32,
    pub fragment_error: bool,
    pub width: u32,
    pub height: u32,
}

impl Level {
    pub fn new(parsed: ParsedLevel) -> Self {
        let mut level = Level {
            bitrate: parsed.bitrate,
            url: Vec::with_capacity(1),
            url_id: 0,
            audio_codec: parsed.audio_codec.clone(),
            video_codec: parsed.video_codec.clone(),
            audio_group_ids: Vec::new(),
            text_group_ids: Vec::new(),
            details: None,
            load_error: 0,
            fragment_error: false,
            width: parsed.width,
            height: parsed.height,
        };
        level.push_variant(parsed);
        level
    }

    /// Fold a same-bitrate manifest entry into this level as a redundant
    /// failover URL.
    pub fn add_fallback(&mut self, parsed: ParsedLevel) {
        if self.audio_codec.is_none() {
            self.audio_codec = parsed.audio_codec.clone();
        }
        if self.video_codec.is_none() {
            self.video_codec = parsed.video_codec.clone();
        }
        self.push_variant(parsed);
    }

    fn push_variant(&mut self, parsed: ParsedLevel) {
        self.url.push(parsed.url);
        self.audio_group_ids
            .push(parsed.audio_group_id.unwrap_or_default());
        self.text_group_ids
            .push(parsed.text_group_id.unwrap_or_default());
    }

    /// The URL currently selected for loading.
    pub fn active_url(&self) -> &Url {
        &self.url[self.url_id]
    }

    /// Rotate to the next redundant URL and drop the stale playlist.
    pub fn advance_url(&mut self) {
        self.url_id = (self.url_id + 1) % self.url.len();
        self.details = None;
    }

    /// Whether an untried redundant URL remains for the current failure run.
    pub fn has_untried_url(&self) -> bool {
        self.url.len() > 1 && (self.load_error as usize) < self.url.len()
    }

    /// Drop one redundant URL (and its parallel group ids), resetting the
    /// active index. Caller guarantees `url.len() > 1`.
    pub fn remove_url(&mut self, url_id: usize) {
        self.url.remove(url_id);
        if url_id < self.audio_group_ids.len() {
            self.audio_group_ids.remove(url_id);
        }
        if url_id < self.text_group_ids.len() {
            self.text_group_ids.remove(url_id);
        }
        self.url_id = 0;
        self.details = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(bitrate: u64, url: &str) -> ParsedLevel {
        ParsedLevel {
            bitrate,
            url: Url::parse(url).unwrap(),
            audio_codec: Some("mp4a.40.2".to_string()),
            video_codec: Some("avc1.42e01e".to_string()),
            audio_group_id: None,
            text_group_id: None,
            width: 1280,
            height: 720,
        }
    }

    #[test]
    fn fallback_extends_url_array() {
        let mut level = Level::new(parsed(1_500_000, "https://a.example/hi.m3u8"));
        level.add_fallback(parsed(1_500_000, "https://b.example/hi.m3u8"));
        assert_eq!(level.url.len(), 2);
        assert_eq!(level.audio_group_ids.len(), 2);
        assert_eq!(level.url_id, 0);
    }

    #[test]
    fn advance_url_wraps_and_clears_details() {
        let mut level = Level::new(parsed(1_500_000, "https://a.example/hi.m3u8"));
        level.add_fallback(parsed(1_500_000, "https://b.example/hi.m3u8"));
        level.advance_url();
        assert_eq!(level.url_id, 1);
        level.advance_url();
        assert_eq!(level.url_id, 0);
    }

    #[test]
    fn untried_urls_tracked_against_load_error() {
        let mut level = Level::new(parsed(1_500_000, "https://a.example/hi.m3u8"));
        assert!(!level.has_untried_url());
        level.add_fallback(parsed(1_500_000, "https://b.example/hi.m3u8"));
        level.load_error = 1;
        assert!(level.has_untried_url());
        level.load_error = 2;
        assert!(!level.has_untried_url());
    }

    #[test]
    fn remove_url_resets_active_index() {
        let mut level = Level::new(parsed(1_500_000, "https://a.example/hi.m3u8"));
        level.add_fallback(parsed(1_500_000, "https://b.example/hi.m3u8"));
        level.url_id = 1;
        level.remove_url(1);
        assert_eq!(level.url.len(), 1);
        assert_eq!(level.url_id, 0);
    }
}
