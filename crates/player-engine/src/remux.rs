//! Pass-through remuxing of fMP4 payloads.
//!
//! The payload is already in the target container; what this owns is the
//! DTS continuity contract: consecutive segments chain end-to-start, the
//! first segment anchors at the externally supplied time offset, and every
//! track's base decode time is shifted by the stream's initial PTS.

use crate::error::EngineError;
use bytes::{Bytes, BytesMut};
use hls_model::bmff::{self, InitData};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxedTrackKind {
    Audio,
    Video,
    AudioVideo,
}

/// One remuxed media payload, tagged by the elementary streams it carries.
#[derive(Debug, Clone)]
pub struct RemuxedTrack {
    pub kind: RemuxedTrackKind,
    pub container: &'static str,
    pub data: Bytes,
    pub start_dts: f64,
    pub end_dts: f64,
    pub has_audio: bool,
    pub has_video: bool,
}

/// Init-segment description attached to the first remuxed payload.
#[derive(Debug, Clone)]
pub struct RemuxedInitSegment {
    pub tracks: InitData,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    /// Initial PTS in 90 kHz ticks, once known.
    pub init_pts: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct RemuxResult {
    pub init_segment: Option<RemuxedInitSegment>,
    pub track: Option<RemuxedTrack>,
}

/// Capability set shared by all remuxer variants.
pub trait Remuxer: Send {
    fn destroy(&mut self);
    /// Full timestamp reset; `default_init_pts` is in 90 kHz ticks.
    fn reset_timestamp(&mut self, default_init_pts: Option<i64>);
    /// Forget only the continuity anchor; the next remux re-anchors at its
    /// time offset.
    fn reset_next_timestamp(&mut self);
    fn reset_init_segment(&mut self);
    fn remux(&mut self, data: Bytes, time_offset: f64) -> Result<RemuxResult, EngineError>;
}

pub struct PassThroughRemuxer {
    /// Seconds subtracted from every track's base decode time.
    init_pts: Option<f64>,
    last_end_dts: Option<f64>,
    init_data: InitData,
    emit_init_segment: bool,
}

impl Default for PassThroughRemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl PassThroughRemuxer {
    pub fn new() -> Self {
        PassThroughRemuxer {
            init_pts: None,
            last_end_dts: None,
            init_data: InitData::default(),
            emit_init_segment: true,
        }
    }

    fn generate_init_segment(&mut self, data: &[u8]) {
        // Payloads may be self-initialising (moov + moof in one buffer).
        let init = bmff::parse_init_segment(data);
        if !init.is_empty() {
            debug!(
                audio = init.audio.is_some(),
                video = init.video.is_some(),
                "init segment parsed from payload"
            );
            self.init_data = init;
        }
    }
}

impl Remuxer for PassThroughRemuxer {
    fn destroy(&mut self) {
        self.reset_timestamp(None);
        self.reset_init_segment();
    }

    fn reset_timestamp(&mut self, default_init_pts: Option<i64>) {
        self.init_pts = default_init_pts.map(|ticks| ticks as f64 / 90_000.0);
        self.last_end_dts = None;
    }

    fn reset_next_timestamp(&mut self) {
        self.last_end_dts = None;
    }

    fn reset_init_segment(&mut self) {
        self.init_data = InitData::default();
        self.emit_init_segment = true;
    }

    fn remux(&mut self, data: Bytes, time_offset: f64) -> Result<RemuxResult, EngineError> {
        let mut result = RemuxResult::default();

        if self.last_end_dts.is_none() {
            // Fresh anchor after a timestamp reset.
            self.last_end_dts = Some(time_offset);
        }
        if self.init_data.is_empty() {
            self.generate_init_segment(&data);
        }
        if self.init_data.is_empty() {
            warn!("remux called without init segment data, dropping payload");
            return Ok(result);
        }

        if self.emit_init_segment {
            result.init_segment = Some(RemuxedInitSegment {
                tracks: self.init_data.clone(),
                audio_codec: self.init_data.audio.as_ref().map(|t| t.codec.clone()),
                video_codec: self.init_data.video.as_ref().map(|t| t.codec.clone()),
                init_pts: None,
            });
            self.emit_init_segment = false;
        }

        if self.init_pts.is_none()
            && let Some(start) = bmff::start_dts(&self.init_data, &data)
        {
            let init_pts = start - time_offset;
            debug!(init_pts, "initial PTS derived from first payload");
            self.init_pts = Some(init_pts);
        }
        if let Some(init_segment) = result.init_segment.as_mut() {
            init_segment.init_pts = self.init_pts.map(|s| (s * 90_000.0).round() as i64);
        }

        let duration = match bmff::segment_duration(&self.init_data, &data) {
            Some(d) => d,
            None => {
                warn!("could not compute fragment duration from boxes");
                0.0
            }
        };
        let start_dts = self.last_end_dts.unwrap_or(time_offset);
        let end_dts = start_dts + duration;

        let mut payload = BytesMut::from(&data[..]);
        if let Some(offset) = self.init_pts.filter(|o| *o != 0.0) {
            bmff::offset_track_start(&self.init_data, &mut payload, offset);
        }

        let has_audio = self.init_data.audio.is_some();
        let has_video = self.init_data.video.is_some();
        let (kind, container) = match (has_audio, has_video) {
            (true, true) => (RemuxedTrackKind::AudioVideo, "video/mp4"),
            (false, true) => (RemuxedTrackKind::Video, "video/mp4"),
            (true, false) => (RemuxedTrackKind::Audio, "audio/mp4"),
            (false, false) => unreachable!("init data verified non-empty"),
        };
        trace!(?kind, start_dts, end_dts, "payload remuxed");

        result.track = Some(RemuxedTrack {
            kind,
            container,
            data: payload.freeze(),
            start_dts,
            end_dts,
            has_audio,
            has_video,
        });
        self.last_end_dts = Some(end_dts);
        Ok(result)
    }
}
