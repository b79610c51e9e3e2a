use std::sync::Arc;

// --- Level loading / retry ---

/// Retry policy for playlist loading.
#[derive(Debug, Clone)]
pub struct LevelLoadPolicy {
    /// Maximum number of scheduled level reload retries before an error is
    /// promoted to fatal.
    pub max_retry: u32,
    /// Base delay for the exponential backoff, in milliseconds.
    pub retry_delay_ms: u64,
    /// Hard cap on the computed backoff delay, in milliseconds.
    pub max_retry_timeout_ms: u64,
}

impl Default for LevelLoadPolicy {
    fn default() -> Self {
        Self {
            max_retry: 4,
            retry_delay_ms: 1000,
            max_retry_timeout_ms: 64_000,
        }
    }
}

// --- Latency / playback rate ---

/// Closed-loop latency controller tuning.
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Target distance from the live edge, in seconds.
    pub latency_target: f64,
    /// Dead band around the target within which the rate stays at 1.0.
    pub refresh_latency: f64,
    /// Sampling period of the controller, in milliseconds.
    pub tick_interval_ms: u64,
    /// Buffered-range gaps up to this many seconds count as contiguous.
    pub max_buffer_hole: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            latency_target: 3.0,
            refresh_latency: 1.0,
            tick_interval_ms: 250,
            max_buffer_hole: 0.1,
        }
    }
}

// --- Captions ---

/// Caption/subtitle pipeline toggles and track naming.
#[derive(Debug, Clone)]
pub struct CaptionsConfig {
    pub enable_webvtt: bool,
    pub enable_imsc1: bool,
    pub enable_cea708_captions: bool,
    /// When false, cues are emitted as events instead of being pushed to a
    /// native text-track sink.
    pub render_text_tracks_natively: bool,
    /// Labels for the four embedded CEA caption channels.
    pub captions_track_labels: [String; 4],
    /// BCP 47 language codes for the four embedded CEA caption channels.
    pub captions_track_languages: [String; 4],
}

impl Default for CaptionsConfig {
    fn default() -> Self {
        Self {
            enable_webvtt: true,
            enable_imsc1: true,
            enable_cea708_captions: true,
            render_text_tracks_natively: false,
            captions_track_labels: [
                "English".to_string(),
                "Spanish".to_string(),
                "Unknown CC3".to_string(),
                "Unknown CC4".to_string(),
            ],
            captions_track_languages: [
                "en".to_string(),
                "es".to_string(),
                String::new(),
                String::new(),
            ],
        }
    }
}

// --- Top level ---

/// Aggregated engine configuration.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Initial rendition index; `None` defers to the manifest's first entry.
    pub start_level: Option<usize>,
    pub level_load: LevelLoadPolicy,
    pub latency: LatencyConfig,
    pub captions: CaptionsConfig,
    /// EWMA half-life handed to the external bandwidth estimator for live
    /// streams, in seconds.
    pub abr_ewma_fast_live: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            start_level: None,
            level_load: LevelLoadPolicy::default(),
            latency: LatencyConfig::default(),
            captions: CaptionsConfig::default(),
            abr_ewma_fast_live: 3.0,
        }
    }
}

/// What the attached media sink can decode, plus user-agent quirks.
///
/// Injected at engine construction so the controllers never consult global
/// environment state.
pub trait MediaCapabilities: Send + Sync {
    fn supports_audio_codec(&self, codec: &str) -> bool;
    fn supports_video_codec(&self, codec: &str) -> bool;
    /// True on user agents (Chrome, Firefox) whose demuxers misreport
    /// `mp4a.40.34`; the declared codec is erased so MPEG audio is
    /// auto-detected instead.
    fn mpeg_audio_quirk(&self) -> bool {
        false
    }
}

/// Capability descriptor that accepts every codec.
#[derive(Debug, Default)]
pub struct AssumeSupported;

impl MediaCapabilities for AssumeSupported {
    fn supports_audio_codec(&self, _codec: &str) -> bool {
        true
    }

    fn supports_video_codec(&self, _codec: &str) -> bool {
        true
    }
}

pub type SharedCapabilities = Arc<dyn MediaCapabilities>;
