use crate::error::ErrorData;
use crate::media::SharedMedia;
use bytes::Bytes;
use hls_model::{Fragment, FragmentKind, Level, LevelDetails, ParsedLevel, UserdataSample};
use std::sync::Arc;

/// Timing of one network load, as reported by the external loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadStats {
    pub loading_ms: u64,
    pub total_bytes: u64,
}

/// Alternate audio rendition declared by the master manifest.
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub id: usize,
    pub group_id: String,
    pub name: String,
    pub lang: Option<String>,
    pub url: Option<String>,
}

/// Subtitle rendition declared by the master manifest.
#[derive(Debug, Clone)]
pub struct SubtitleTrackInfo {
    pub id: usize,
    pub group_id: String,
    pub name: String,
    pub lang: Option<String>,
    /// Codec of the subtitle payloads; `None` until auto-detected.
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextTrackKind {
    Captions,
    Subtitles,
}

/// A parsed text cue on the presentation timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub id: Option<String>,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Announcement of a text track when native rendering is disabled.
#[derive(Debug, Clone)]
pub struct NonNativeTextTrack {
    pub label: String,
    pub lang: Option<String>,
    pub kind: TextTrackKind,
    pub default: bool,
}

/// Everything that crosses a component boundary goes through this bus event
/// type. Handlers receive events mutably so recovery can promote `fatal`
/// in place for handlers later in the dispatch order.
#[derive(Clone)]
pub enum Event {
    MediaAttaching {
        media: SharedMedia,
    },
    MediaDetaching,
    ManifestLoading {
        url: String,
    },
    ManifestLoaded {
        levels: Vec<ParsedLevel>,
        audio_tracks: Vec<AudioTrack>,
        subtitles: Vec<SubtitleTrackInfo>,
        url: String,
        stats: LoadStats,
    },
    ManifestParsed {
        levels: Vec<Level>,
        first_level: usize,
        audio: bool,
        video: bool,
        alt_audio: bool,
    },
    LevelLoading {
        url: String,
        level: usize,
        /// Active redundant-URL index at the time of the request.
        id: usize,
    },
    LevelLoaded {
        level: usize,
        id: usize,
        details: Arc<LevelDetails>,
        stats: LoadStats,
    },
    LevelSwitching {
        level: usize,
        bitrate: u64,
    },
    LevelsUpdated {
        levels: Vec<Level>,
    },
    FragLoaded {
        frag: Arc<Fragment>,
        payload: Bytes,
    },
    FragDecrypted {
        frag: Arc<Fragment>,
        payload: Bytes,
    },
    FragParsingUserdata {
        frag: Arc<Fragment>,
        samples: Vec<UserdataSample>,
    },
    FragParsingInitSegment {
        frag: Arc<Fragment>,
    },
    InitPtsFound {
        id: FragmentKind,
        frag: Arc<Fragment>,
        /// Initial PTS of the discontinuity in 90 kHz ticks.
        init_pts: i64,
    },
    SubtitleFragProcessed {
        success: bool,
        frag: Arc<Fragment>,
        error: Option<String>,
    },
    CuesParsed {
        kind: TextTrackKind,
        track: String,
        cues: Vec<Cue>,
    },
    NonNativeTextTracksFound {
        tracks: Vec<NonNativeTextTrack>,
    },
    SubtitleTracksCleared,
    AudioTrackSwitched {
        id: usize,
    },
    Error(ErrorData),

    // Internal timer events.
    LevelReloadTick {
        level: usize,
    },
    PlaybackRateTick,
}

impl Event {
    /// Stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::MediaAttaching { .. } => "MEDIA_ATTACHING",
            Event::MediaDetaching => "MEDIA_DETACHING",
            Event::ManifestLoading { .. } => "MANIFEST_LOADING",
            Event::ManifestLoaded { .. } => "MANIFEST_LOADED",
            Event::ManifestParsed { .. } => "MANIFEST_PARSED",
            Event::LevelLoading { .. } => "LEVEL_LOADING",
            Event::LevelLoaded { .. } => "LEVEL_LOADED",
            Event::LevelSwitching { .. } => "LEVEL_SWITCHING",
            Event::LevelsUpdated { .. } => "LEVELS_UPDATED",
            Event::FragLoaded { .. } => "FRAG_LOADED",
            Event::FragDecrypted { .. } => "FRAG_DECRYPTED",
            Event::FragParsingUserdata { .. } => "FRAG_PARSING_USERDATA",
            Event::FragParsingInitSegment { .. } => "FRAG_PARSING_INIT_SEGMENT",
            Event::InitPtsFound { .. } => "INIT_PTS_FOUND",
            Event::SubtitleFragProcessed { .. } => "SUBTITLE_FRAG_PROCESSED",
            Event::CuesParsed { .. } => "CUES_PARSED",
            Event::NonNativeTextTracksFound { .. } => "NON_NATIVE_TEXT_TRACKS_FOUND",
            Event::SubtitleTracksCleared => "SUBTITLE_TRACKS_CLEARED",
            Event::AudioTrackSwitched { .. } => "AUDIO_TRACK_SWITCHED",
            Event::Error(_) => "ERROR",
            Event::LevelReloadTick { .. } => "LEVEL_RELOAD_TICK",
            Event::PlaybackRateTick => "PLAYBACK_RATE_TICK",
        }
    }
}
