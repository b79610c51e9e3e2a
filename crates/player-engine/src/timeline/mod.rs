//! Captions/subtitles synchronisation.
//!
//! Correlates decoded CEA-608 user data, WebVTT and IMSC1 subtitle payloads
//! against the per-discontinuity initial-PTS table. Subtitle parsing is
//! gated until the main track's initial PTS for that discontinuity is
//! known, and accepted cue ranges are de-duplicated per track.

pub mod cea608;
pub mod imsc1;
pub mod webvtt;

use crate::bus::{EventBus, EventHandler};
use crate::config::PlayerConfig;
use crate::events::{Cue, Event, SubtitleTrackInfo, TextTrackKind, NonNativeTextTrack};
use bytes::Bytes;
use cea608::{Cea608Decoder, PopOnDecoder, extract_cea608_pairs};
use hls_model::{Fragment, FragmentKind, UserdataSample};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// 90 kHz ticks synthesised as the initial PTS when captions must render on
/// a stream that never produced one (pure audio).
const SYNTHESISED_INIT_PTS: i64 = 90_000;

const VTT_CODEC: &str = "wvtt";

/// Pluggable cue constructor.
pub trait CueHandler: Send + Sync {
    fn create_cue(&self, id: Option<String>, start: f64, end: f64, text: &str) -> Cue;
}

/// Destination for cues when text tracks are rendered natively. Without a
/// sink (or with native rendering disabled) cues are emitted as events.
pub trait TextTrackSink: Send {
    fn add_cue(&mut self, track: &str, kind: TextTrackKind, cue: &Cue);
}

pub struct DefaultCueHandler;

impl CueHandler for DefaultCueHandler {
    fn create_cue(&self, id: Option<String>, start: f64, end: f64, text: &str) -> Cue {
        Cue {
            id,
            start,
            end,
            text: text.to_string(),
        }
    }
}

/// One entry of the VTT continuity chain: where a discontinuity starts on
/// the presentation timeline and which discontinuity preceded it.
#[derive(Debug, Clone, Copy)]
struct VttCc {
    start: f64,
    prev_cc: i64,
    new: bool,
}

#[derive(Debug, Default)]
struct TrackRanges {
    ranges: Vec<(f64, f64)>,
}

impl TrackRanges {
    /// Accept or reject a cue range. Overlap of at least half of the new
    /// range means the cue is a duplicate; smaller overlaps extend the
    /// existing range.
    fn accept(&mut self, start: f64, end: f64) -> bool {
        let new_len = (end - start).max(0.0);
        let mut best: Option<(usize, f64)> = None;
        for (idx, &(rs, re)) in self.ranges.iter().enumerate() {
            let overlap = (end.min(re) - start.max(rs)).max(0.0);
            if overlap > 0.0 && best.is_none_or(|(_, b)| overlap > b) {
                best = Some((idx, overlap));
            }
        }
        match best {
            Some((_, overlap)) if new_len > 0.0 && overlap >= 0.5 * new_len => false,
            Some((idx, _)) => {
                let range = &mut self.ranges[idx];
                range.0 = range.0.min(start);
                range.1 = range.1.max(end);
                true
            }
            None => {
                self.ranges.push((start, end));
                true
            }
        }
    }
}

pub struct TimelineController {
    config: Arc<PlayerConfig>,
    cue_handler: Arc<dyn CueHandler>,
    /// Initial PTS per discontinuity, 90 kHz ticks, main track.
    init_pts: HashMap<u64, i64>,
    unparsed_vtt_frags: Vec<(Arc<Fragment>, Bytes)>,
    vtt_ccs: HashMap<u64, VttCc>,
    prev_cc: i64,
    subtitle_tracks: Vec<SubtitleTrackInfo>,
    subtitle_ranges: HashMap<usize, TrackRanges>,
    caption_ranges: [TrackRanges; 4],
    field1: Box<dyn Cea608Decoder>,
    field2: Box<dyn Cea608Decoder>,
    last_main_sn: Option<u64>,
    sink: Option<Box<dyn TextTrackSink>>,
}

impl TimelineController {
    pub fn new(config: Arc<PlayerConfig>) -> Self {
        Self::with_parts(
            config,
            Arc::new(DefaultCueHandler),
            Box::new(PopOnDecoder::new(1)),
            Box::new(PopOnDecoder::new(3)),
        )
    }

    pub fn with_parts(
        config: Arc<PlayerConfig>,
        cue_handler: Arc<dyn CueHandler>,
        field1: Box<dyn Cea608Decoder>,
        field2: Box<dyn Cea608Decoder>,
    ) -> Self {
        TimelineController {
            config,
            cue_handler,
            init_pts: HashMap::new(),
            unparsed_vtt_frags: Vec::new(),
            vtt_ccs: HashMap::new(),
            prev_cc: -1,
            subtitle_tracks: Vec::new(),
            subtitle_ranges: HashMap::new(),
            caption_ranges: Default::default(),
            field1,
            field2,
            last_main_sn: None,
            sink: None,
        }
    }

    /// Install the native text-track destination. Only consulted when
    /// `render_text_tracks_natively` is set.
    pub fn set_text_track_sink(&mut self, sink: Box<dyn TextTrackSink>) {
        self.sink = Some(sink);
    }

    pub fn subtitle_tracks(&self) -> &[SubtitleTrackInfo] {
        &self.subtitle_tracks
    }

    fn reset(&mut self) {
        self.init_pts.clear();
        self.unparsed_vtt_frags.clear();
        self.vtt_ccs.clear();
        self.prev_cc = -1;
        self.subtitle_tracks.clear();
        self.subtitle_ranges.clear();
        self.caption_ranges = Default::default();
        self.field1.reset();
        self.field2.reset();
        self.last_main_sn = None;
    }

    fn on_manifest_loaded(&mut self, subtitles: &[SubtitleTrackInfo], bus: &EventBus) {
        self.subtitle_tracks = subtitles.to_vec();
        if self.config.captions.render_text_tracks_natively {
            return;
        }
        let mut tracks: Vec<NonNativeTextTrack> = self
            .subtitle_tracks
            .iter()
            .map(|t| NonNativeTextTrack {
                label: t.name.clone(),
                lang: t.lang.clone(),
                kind: TextTrackKind::Subtitles,
                default: false,
            })
            .collect();
        if self.config.captions.enable_cea708_captions {
            for (label, lang) in self
                .config
                .captions
                .captions_track_labels
                .iter()
                .zip(&self.config.captions.captions_track_languages)
            {
                tracks.push(NonNativeTextTrack {
                    label: label.clone(),
                    lang: (!lang.is_empty()).then(|| lang.clone()),
                    kind: TextTrackKind::Captions,
                    default: false,
                });
            }
        }
        if !tracks.is_empty() {
            bus.emit(Event::NonNativeTextTracksFound { tracks });
        }
    }

    // --- Initial-PTS gating ---

    fn on_init_pts_found(&mut self, id: FragmentKind, cc: u64, init_pts: i64, bus: &EventBus) {
        if id != FragmentKind::Main {
            return;
        }
        debug!(cc, init_pts, "initial PTS installed");
        self.init_pts.insert(cc, init_pts);

        // Drain synchronously: anything queued for a still-unknown
        // discontinuity simply re-queues itself.
        let pending = std::mem::take(&mut self.unparsed_vtt_frags);
        for (frag, payload) in pending {
            self.on_subtitle_payload(frag, payload, bus);
        }
    }

    /// Pure-audio streams never produce a demuxed initial PTS; synthesise
    /// one on the init-segment sentinel so captions can still render.
    fn on_frag_parsing_init_segment(&mut self, frag: &Arc<Fragment>, bus: &EventBus) {
        if self.init_pts.is_empty() {
            bus.emit(Event::InitPtsFound {
                id: FragmentKind::Main,
                frag: Arc::clone(frag),
                init_pts: SYNTHESISED_INIT_PTS,
            });
        }
    }

    fn on_subtitle_payload(&mut self, frag: Arc<Fragment>, payload: Bytes, bus: &EventBus) {
        let captions = &self.config.captions;
        if !captions.enable_webvtt && !captions.enable_imsc1 {
            return;
        }
        match self.init_pts.get(&frag.cc).copied() {
            Some(init_pts) => self.parse_subtitle(frag, payload, init_pts, bus),
            None => {
                trace!(sn = frag.sn, cc = frag.cc, "subtitle parse gated on initial PTS");
                let notify = !self.init_pts.is_empty();
                let frag_for_event = Arc::clone(&frag);
                self.unparsed_vtt_frags.push((frag, payload));
                if notify {
                    // Unblock the fetcher; the fragment stays queued here.
                    bus.emit(Event::SubtitleFragProcessed {
                        success: false,
                        frag: frag_for_event,
                        error: Some("missing initial subtitle PTS".to_string()),
                    });
                }
            }
        }
    }

    // --- Parsing ---

    fn parse_subtitle(&mut self, frag: Arc<Fragment>, payload: Bytes, init_pts: i64, bus: &EventBus) {
        // Chain the discontinuity before parsing so cue timestamps can be
        // reconstructed across timeline resets.
        if !self.vtt_ccs.contains_key(&frag.cc) {
            self.vtt_ccs.insert(
                frag.cc,
                VttCc {
                    start: frag.start,
                    prev_cc: self.prev_cc,
                    new: true,
                },
            );
            self.prev_cc = frag.cc as i64;
        }
        if let Some(entry) = self.vtt_ccs.get_mut(&frag.cc)
            && entry.new
        {
            trace!(
                cc = frag.cc,
                prev_cc = entry.prev_cc,
                start = entry.start,
                "subtitle timeline discontinuity chained"
            );
            entry.new = false;
        }

        let track_idx = frag.level;
        let codec = self
            .subtitle_tracks
            .get(track_idx)
            .and_then(|t| t.codec.clone());

        let outcome = match codec.as_deref() {
            Some(c) if c == imsc1::IMSC1_CODEC => self.parse_as_imsc1(&frag, &payload, init_pts),
            Some(_) => self.parse_as_webvtt(&frag, &payload, init_pts),
            None => {
                // Codec auto-detection: WebVTT first, IMSC1 on failure. The
                // result is sticky either way.
                match self.parse_as_webvtt(&frag, &payload, init_pts) {
                    Ok(cues) => {
                        self.set_track_codec(track_idx, VTT_CODEC);
                        Ok(cues)
                    }
                    Err(vtt_err) => {
                        if self.config.captions.enable_imsc1 && imsc1::looks_like_ttml(&payload) {
                            match self.parse_as_imsc1(&frag, &payload, init_pts) {
                                Ok(cues) => {
                                    self.set_track_codec(track_idx, imsc1::IMSC1_CODEC);
                                    Ok(cues)
                                }
                                Err(e) => {
                                    self.set_track_codec(track_idx, VTT_CODEC);
                                    Err(e)
                                }
                            }
                        } else {
                            self.set_track_codec(track_idx, VTT_CODEC);
                            Err(vtt_err)
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(cues) => {
                let accepted = self.deliver_subtitle_cues(track_idx, cues, bus);
                trace!(sn = frag.sn, accepted, "subtitle fragment parsed");
                bus.emit(Event::SubtitleFragProcessed {
                    success: true,
                    frag,
                    error: None,
                });
            }
            Err(err) => {
                warn!(sn = frag.sn, error = %err, "subtitle fragment failed to parse");
                bus.emit(Event::SubtitleFragProcessed {
                    success: false,
                    frag,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    fn parse_as_webvtt(
        &mut self,
        frag: &Fragment,
        payload: &[u8],
        init_pts: i64,
    ) -> Result<Vec<Cue>, crate::error::EngineError> {
        if !self.config.captions.enable_webvtt {
            return Err(crate::error::EngineError::SubtitleParse {
                reason: "WebVTT disabled".to_string(),
            });
        }
        let file = webvtt::parse_webvtt(payload)?;
        let sync_pts = init_pts as f64 / 90_000.0;
        // With a timestamp map the cues carry their own media-timeline
        // anchor; without one they are fragment-relative.
        let offset = match file.timestamp_map {
            Some(map) => map.mpegts as f64 / 90_000.0 - map.local - sync_pts,
            None => frag.start,
        };
        Ok(file
            .cues
            .into_iter()
            .map(|c| {
                self.cue_handler
                    .create_cue(c.id, c.start + offset, c.end + offset, &c.text)
            })
            .collect())
    }

    fn parse_as_imsc1(
        &mut self,
        _frag: &Fragment,
        payload: &[u8],
        init_pts: i64,
    ) -> Result<Vec<Cue>, crate::error::EngineError> {
        if !self.config.captions.enable_imsc1 {
            return Err(crate::error::EngineError::SubtitleParse {
                reason: "IMSC1 disabled".to_string(),
            });
        }
        let cues = imsc1::parse_imsc1(payload)?;
        // IMSC1 cue times are media-timeline times.
        let sync_pts = init_pts as f64 / 90_000.0;
        Ok(cues
            .into_iter()
            .map(|c| {
                self.cue_handler
                    .create_cue(c.id, c.start - sync_pts, c.end - sync_pts, &c.text)
            })
            .collect())
    }

    fn set_track_codec(&mut self, track_idx: usize, codec: &str) {
        while self.subtitle_tracks.len() <= track_idx {
            let id = self.subtitle_tracks.len();
            self.subtitle_tracks.push(SubtitleTrackInfo {
                id,
                group_id: String::new(),
                name: format!("subtitles-{id}"),
                lang: None,
                codec: None,
            });
        }
        let track = &mut self.subtitle_tracks[track_idx];
        if track.codec.as_deref() != Some(codec) {
            debug!(track = track_idx, codec, "subtitle codec resolved");
            track.codec = Some(codec.to_string());
        }
    }

    fn deliver_subtitle_cues(&mut self, track_idx: usize, cues: Vec<Cue>, bus: &EventBus) -> usize {
        let ranges = self.subtitle_ranges.entry(track_idx).or_default();
        let accepted: Vec<Cue> = cues
            .into_iter()
            .filter(|cue| ranges.accept(cue.start, cue.end))
            .collect();
        if accepted.is_empty() {
            return 0;
        }
        let count = accepted.len();
        let track = self
            .subtitle_tracks
            .get(track_idx)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| format!("subtitles-{track_idx}"));
        self.emit_cues(TextTrackKind::Subtitles, track, accepted, bus);
        count
    }

    fn emit_cues(&mut self, kind: TextTrackKind, track: String, cues: Vec<Cue>, bus: &EventBus) {
        if self.config.captions.render_text_tracks_natively
            && let Some(sink) = self.sink.as_mut()
        {
            for cue in &cues {
                sink.add_cue(&track, kind, cue);
            }
            return;
        }
        bus.emit(Event::CuesParsed { kind, track, cues });
    }

    // --- CEA-608 ---

    fn on_main_frag_loaded(&mut self, frag: &Fragment) {
        // A sequence gap means the embedded caption byte stream is torn;
        // decoding across it would attach cues to bad timestamps.
        if let Some(last) = self.last_main_sn
            && frag.sn != last + 1
        {
            debug!(last, sn = frag.sn, "sequence discontinuity, resetting caption decoders");
            self.field1.reset();
            self.field2.reset();
        }
        self.last_main_sn = Some(frag.sn);
    }

    fn on_userdata(&mut self, frag: &Fragment, samples: &[UserdataSample], bus: &EventBus) {
        if !self.config.captions.enable_cea708_captions {
            return;
        }
        if frag.kind != FragmentKind::Main {
            return;
        }
        for sample in samples {
            let fields = extract_cea608_pairs(&sample.bytes);
            if !fields[0].is_empty() {
                self.field1.push_pairs(sample.pts, &fields[0]);
            }
            if !fields[1].is_empty() {
                self.field2.push_pairs(sample.pts, &fields[1]);
            }
        }

        let mut channel_cues = self.field1.take_cues();
        channel_cues.extend(self.field2.take_cues());
        for channel_cue in channel_cues {
            let idx = (channel_cue.channel - 1) as usize;
            if idx >= 4 {
                continue;
            }
            if !self.caption_ranges[idx].accept(channel_cue.start, channel_cue.end) {
                continue;
            }
            let cue = self.cue_handler.create_cue(
                None,
                channel_cue.start,
                channel_cue.end,
                &channel_cue.text,
            );
            let track = self.config.captions.captions_track_labels[idx].clone();
            self.emit_cues(TextTrackKind::Captions, track, vec![cue], bus);
        }
    }
}

impl EventHandler for TimelineController {
    fn handle_event(&mut self, event: &mut Event, bus: &EventBus) {
        match event {
            Event::ManifestLoading { .. } => self.reset(),
            Event::ManifestLoaded { subtitles, .. } => {
                let subtitles = subtitles.clone();
                self.on_manifest_loaded(&subtitles, bus);
            }
            Event::SubtitleTracksCleared => {
                self.subtitle_tracks.clear();
                self.subtitle_ranges.clear();
                self.unparsed_vtt_frags.clear();
            }
            Event::FragLoaded { frag, payload } | Event::FragDecrypted { frag, payload } => {
                match frag.kind {
                    FragmentKind::Subtitle => {
                        let (frag, payload) = (Arc::clone(frag), payload.clone());
                        self.on_subtitle_payload(frag, payload, bus);
                    }
                    FragmentKind::Main => self.on_main_frag_loaded(frag),
                    FragmentKind::Audio => {}
                }
            }
            Event::InitPtsFound {
                id,
                frag,
                init_pts,
            } => {
                let (id, cc, init_pts) = (*id, frag.cc, *init_pts);
                self.on_init_pts_found(id, cc, init_pts, bus);
            }
            Event::FragParsingInitSegment { frag } => {
                let frag = Arc::clone(frag);
                self.on_frag_parsing_init_segment(&frag, bus);
            }
            Event::FragParsingUserdata { frag, samples } => {
                let (frag, samples) = (Arc::clone(frag), samples.clone());
                self.on_userdata(&frag, &samples, bus);
            }
            _ => {}
        }
    }
}
