//! Rendition management: manifest admission, level switching, live reload
//! scheduling (including low-latency blocking reloads), and load-error
//! recovery with redundant-URL failover.

use crate::bus::{EventBus, EventHandler};
use crate::config::{PlayerConfig, SharedCapabilities};
use crate::error::{ErrorData, ErrorDetail};
use crate::events::{AudioTrack, Event, LoadStats};
use crate::scheduler::{Scheduler, TimerId};
use hls_model::llhls::{self, BlockingReloadQuery};
use hls_model::{Level, LevelDetails, ParsedLevel};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

pub struct LevelController {
    config: Arc<PlayerConfig>,
    capabilities: SharedCapabilities,
    scheduler: Scheduler,
    levels: Vec<Level>,
    audio_tracks: Vec<AudioTrack>,
    /// Current rendition index; `None` until the manifest is admitted, after
    /// a fatal load failure, or when a manual-mode fragment error forces a
    /// re-trigger on the next set.
    current: Option<usize>,
    /// `Some` pins the rendition; `None` defers to the ABR choice.
    manual_level: Option<usize>,
    start_level: Option<usize>,
    next_auto_level: usize,
    first_level: usize,
    can_load: bool,
    timer: Option<TimerId>,
    /// Consecutive level-load retries across renditions, not per level.
    retry_count: u32,
}

impl LevelController {
    pub fn new(
        config: Arc<PlayerConfig>,
        capabilities: SharedCapabilities,
        scheduler: Scheduler,
    ) -> Self {
        LevelController {
            config,
            capabilities,
            scheduler,
            levels: Vec::new(),
            audio_tracks: Vec::new(),
            current: None,
            manual_level: None,
            start_level: None,
            next_auto_level: 0,
            first_level: 0,
            can_load: true,
            timer: None,
            retry_count: 0,
        }
    }

    // --- Accessors ---

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn current_level(&self) -> Option<usize> {
        self.current
    }

    pub fn first_level(&self) -> usize {
        self.first_level
    }

    pub fn manual_level(&self) -> Option<usize> {
        self.manual_level
    }

    /// The rendition the next fragment load should use: the manual pin when
    /// set, else the ABR controller's choice.
    pub fn next_load_level(&self) -> usize {
        self.manual_level.unwrap_or(self.next_auto_level)
    }

    /// Fed by the external bandwidth estimator.
    pub fn set_next_auto_level(&mut self, level: usize) {
        self.next_auto_level = level;
    }

    pub fn set_start_level(&mut self, level: usize) {
        self.start_level = Some(level);
    }

    /// Start level resolves: explicitly set, then configured, then the
    /// manifest's first rendition relocated into bitrate order.
    pub fn start_level_index(&self) -> usize {
        self.start_level
            .or(self.config.start_level)
            .unwrap_or(self.first_level)
    }

    // --- Load gating ---

    pub fn start_load(&mut self, bus: &EventBus) {
        self.can_load = true;
        self.retry_count = 0;
        if !self.levels.is_empty() {
            let target = self.current.unwrap_or_else(|| self.start_level_index());
            self.apply_level(target, bus);
        }
    }

    pub fn stop_load(&mut self) {
        self.can_load = false;
        self.clear_timer();
    }

    // --- Level selection ---

    /// Pin the rendition and switch to it.
    pub fn set_level(&mut self, level: usize, bus: &EventBus) {
        self.manual_level = Some(level);
        self.apply_level(level, bus);
    }

    /// Return rendition choice to the ABR controller.
    pub fn set_auto(&mut self) {
        self.manual_level = None;
    }

    /// The single write-authorised gate for rendition switching.
    fn apply_level(&mut self, new_level: usize, bus: &EventBus) {
        if self.levels.is_empty() {
            self.report_inconsistency("level switch requested with no levels installed", bus);
            return;
        }
        if new_level >= self.levels.len() {
            bus.emit(Event::Error(
                ErrorData::new(ErrorDetail::LevelSwitchError, false)
                    .with_reason(format!("invalid level index {new_level}")),
            ));
            return;
        }

        self.clear_timer();
        if self.current != Some(new_level) {
            let bitrate = self.levels[new_level].bitrate;
            info!(level = new_level, bitrate, "switching level");
            bus.emit(Event::LevelSwitching {
                level: new_level,
                bitrate,
            });
        }
        self.current = Some(new_level);

        let level = &self.levels[new_level];
        let needs_load = level.details.as_ref().map(|d| d.live).unwrap_or(true);
        if needs_load && self.can_load {
            bus.emit(Event::LevelLoading {
                url: level.active_url().to_string(),
                level: new_level,
                id: level.url_id,
            });
        }
    }

    // --- Manifest admission ---

    fn reset(&mut self) {
        self.clear_timer();
        self.levels.clear();
        self.audio_tracks.clear();
        self.current = None;
        self.retry_count = 0;
    }

    fn on_manifest_loaded(
        &mut self,
        parsed: &[ParsedLevel],
        audio_tracks: &[AudioTrack],
        bus: &EventBus,
    ) {
        self.audio_tracks = audio_tracks.to_vec();
        let first_bitrate = parsed.first().map(|p| p.bitrate);

        // Group by bitrate: the first occurrence creates the level, later
        // same-bitrate entries become redundant failover URLs.
        let mut levels: Vec<Level> = Vec::new();
        for entry in parsed {
            match levels.iter_mut().find(|l| l.bitrate == entry.bitrate) {
                Some(existing) => existing.add_fallback(entry.clone()),
                None => levels.push(Level::new(entry.clone())),
            }
        }

        let any_video = levels.iter().any(|l| l.video_codec.is_some());
        let any_audio = levels.iter().any(|l| l.audio_codec.is_some());
        if any_video && any_audio {
            levels.retain(|l| l.video_codec.is_some() || l.audio_codec.is_none());
        }

        levels.retain(|l| {
            let audio_ok = l
                .audio_codec
                .as_deref()
                .map(|c| self.capabilities.supports_audio_codec(c))
                .unwrap_or(true);
            let video_ok = l
                .video_codec
                .as_deref()
                .map(|c| self.capabilities.supports_video_codec(c))
                .unwrap_or(true);
            if !audio_ok || !video_ok {
                debug!(bitrate = l.bitrate, "dropping level with unsupported codecs");
            }
            audio_ok && video_ok
        });

        if self.capabilities.mpeg_audio_quirk() {
            for level in &mut levels {
                if level
                    .audio_codec
                    .as_deref()
                    .is_some_and(|c| c.contains("mp4a.40.34"))
                {
                    // Let the demuxer auto-detect MPEG audio instead.
                    level.audio_codec = None;
                }
            }
        }

        if levels.is_empty() {
            error!("no level with compatible codecs found in manifest");
            bus.emit(Event::Error(
                ErrorData::new(ErrorDetail::ManifestIncompatibleCodecs, true)
                    .with_reason("no level with compatible codecs found in manifest"),
            ));
            return;
        }

        levels.sort_by_key(|l| l.bitrate);
        self.first_level = first_bitrate
            .and_then(|b| levels.iter().position(|l| l.bitrate == b))
            .unwrap_or(0);

        let audio = levels.iter().any(|l| l.audio_codec.is_some());
        let video = levels.iter().any(|l| l.video_codec.is_some());
        self.levels = levels;
        info!(
            levels = self.levels.len(),
            first_level = self.first_level,
            "manifest admitted"
        );
        bus.emit(Event::ManifestParsed {
            levels: self.levels.clone(),
            first_level: self.first_level,
            audio,
            video,
            alt_audio: !self.audio_tracks.is_empty(),
        });

        let start = self.start_level_index();
        self.apply_level(start, bus);
    }

    // --- Live reload ---

    fn on_level_loaded(
        &mut self,
        level: usize,
        details: &mut Arc<LevelDetails>,
        stats: LoadStats,
        bus: &EventBus,
    ) {
        if Some(level) != self.current || level >= self.levels.len() {
            debug!(level, "ignoring level details for non-current level");
            return;
        }

        let prior = self.levels[level].details.clone();
        let mut installed = (**details).clone();
        installed.mark_updated(prior.as_deref());
        installed.push = Url::parse(&installed.url)
            .ok()
            .as_ref()
            .and_then(llhls::parse_push_info);
        let installed = Arc::new(installed);
        // Later handlers in this dispatch observe the stamped details.
        *details = Arc::clone(&installed);

        {
            let lvl = &mut self.levels[level];
            if !lvl.fragment_error {
                lvl.load_error = 0;
                self.retry_count = 0;
            }
            lvl.details = Some(Arc::clone(&installed));
        }

        if !installed.live {
            self.clear_timer();
            return;
        }

        let interval = installed.compute_reload_interval(stats.loading_ms);
        let delay = if installed.low_latency() {
            // Blocking reloads are issued slightly early; the server holds
            // the response until the requested sequence exists.
            interval.saturating_sub(100).max(100)
        } else {
            interval
        };
        debug!(level, delay_ms = delay, updated = installed.updated, "arming reload timer");
        self.arm_reload(level, delay);
    }

    /// A reload timer fired. The tick always targets the current level:
    /// timer discipline (cancel before arm, cancel on switch/stop) keeps a
    /// stale tick from ever reaching here with a different level armed.
    fn on_reload_tick(&mut self, bus: &EventBus) {
        self.timer = None;
        if !self.can_load {
            return;
        }
        let Some(level) = self.current else {
            return;
        };
        if level >= self.levels.len() {
            return;
        }
        let lvl = &self.levels[level];
        let url = match lvl.details.as_ref() {
            Some(d) if d.low_latency() => {
                let msn = d.end_sn + u64::from(d.updated);
                let query = BlockingReloadQuery {
                    msn,
                    part: None,
                    push: None,
                    skip: d
                        .server_control
                        .as_ref()
                        .is_some_and(|sc| sc.can_skip_until > 0.0),
                };
                llhls::blocking_reload_url(lvl.active_url(), &query).to_string()
            }
            _ => lvl.active_url().to_string(),
        };
        bus.emit(Event::LevelLoading {
            url,
            level,
            id: lvl.url_id,
        });
    }

    fn arm_reload(&mut self, level: usize, delay_ms: u64) {
        self.clear_timer();
        self.timer = Some(
            self.scheduler
                .schedule(delay_ms, Event::LevelReloadTick { level }),
        );
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.scheduler.cancel(timer);
        }
    }

    // --- Error recovery ---

    fn on_error(&mut self, data: &mut ErrorData, bus: &EventBus) {
        if data.fatal {
            self.clear_timer();
            return;
        }
        if !data.detail.is_recoverable_load_error() {
            return;
        }
        let level_scoped = data.detail.is_level_scoped();
        let Some(level_idx) = data.level.or_else(|| data.frag.as_ref().map(|f| f.level)) else {
            return;
        };
        if level_idx >= self.levels.len() {
            return;
        }

        {
            let lvl = &mut self.levels[level_idx];
            lvl.load_error += 1;
            lvl.fragment_error = !level_scoped;
        }

        if level_scoped {
            if self.retry_count < self.config.level_load.max_retry {
                let delay = (self.config.level_load.retry_delay_ms << self.retry_count)
                    .min(self.config.level_load.max_retry_timeout_ms);
                self.retry_count += 1;
                warn!(
                    level = level_idx,
                    retry = self.retry_count,
                    delay_ms = delay,
                    "level load failed, retrying with backoff"
                );
                self.arm_reload(level_idx, delay);
                data.level_retry = true;
            } else {
                error!(level = level_idx, "level load retries exhausted");
                data.fatal = true;
                self.retry_count = 0;
                self.clear_timer();
                self.current = None;
                return;
            }
        }

        // Redundant-URL escalation composes with any backoff scheduled
        // above: the retry fires against the freshly rotated URL.
        let lvl = &mut self.levels[level_idx];
        if lvl.has_untried_url() {
            lvl.advance_url();
            let url_id = lvl.url_id;
            warn!(level = level_idx, url_id, "switching to redundant URL");
            if !level_scoped && self.timer.is_none() && self.can_load {
                bus.emit(Event::LevelLoading {
                    url: self.levels[level_idx].active_url().to_string(),
                    level: level_idx,
                    id: url_id,
                });
            }
        } else if self.manual_level.is_none() {
            // Walk down one rendition, wrapping from the lowest to the
            // highest. This must not disturb a backoff timer scheduled
            // above: the retry fires against the switched-down level.
            let next = if level_idx == 0 {
                self.levels.len() - 1
            } else {
                level_idx - 1
            };
            warn!(
                from = level_idx,
                to = next,
                "redundant URLs exhausted, switching rendition"
            );
            self.next_auto_level = next;
            if self.current != Some(next) {
                bus.emit(Event::LevelSwitching {
                    level: next,
                    bitrate: self.levels[next].bitrate,
                });
            }
            self.current = Some(next);
            if self.timer.is_none() && self.can_load {
                let lvl = &self.levels[next];
                let needs_load = lvl.details.as_ref().map(|d| d.live).unwrap_or(true);
                if needs_load {
                    bus.emit(Event::LevelLoading {
                        url: lvl.active_url().to_string(),
                        level: next,
                        id: lvl.url_id,
                    });
                }
            }
        } else if !level_scoped {
            // Manual mode: null the index so a subsequent set re-triggers
            // the load.
            self.current = None;
        }
    }

    fn report_inconsistency(&self, reason: &str, bus: &EventBus) {
        error!(reason, "internal inconsistency");
        bus.emit(Event::Error(
            ErrorData::new(ErrorDetail::InternalInconsistency, true).with_reason(reason),
        ));
    }

    // --- Audio group re-binding ---

    fn on_audio_track_switched(&mut self, id: usize, bus: &EventBus) {
        let Some(track) = self.audio_tracks.iter().find(|t| t.id == id) else {
            return;
        };
        let Some(current) = self.current else {
            return;
        };
        let group_id = track.group_id.clone();
        let lvl = &mut self.levels[current];
        if lvl.audio_group_ids.iter().all(|g| g.is_empty()) {
            return;
        }
        if let Some(pos) = lvl.audio_group_ids.iter().position(|g| *g == group_id)
            && pos != lvl.url_id
        {
            info!(level = current, url_id = pos, group = %group_id, "re-binding level URL to audio group");
            lvl.url_id = pos;
            self.clear_timer();
            if self.can_load {
                bus.emit(Event::LevelLoading {
                    url: self.levels[current].active_url().to_string(),
                    level: current,
                    id: pos,
                });
            }
        }
    }

    // --- Level removal ---

    /// Remove one redundant URL of a level, or the whole level.
    ///
    /// Remaining fragments are reindexed so each one's `level` field matches
    /// its owning level's new position.
    pub fn remove_level(&mut self, index: usize, url_id: Option<usize>, bus: &EventBus) {
        if index >= self.levels.len() {
            return;
        }
        match url_id {
            Some(uid) if self.levels[index].url.len() > 1 => {
                self.levels[index].remove_url(uid);
            }
            _ => {
                self.levels.remove(index);
                match self.current {
                    Some(cur) if cur == index => self.current = None,
                    Some(cur) if cur > index => self.current = Some(cur - 1),
                    _ => {}
                }
            }
        }

        for (i, lvl) in self.levels.iter_mut().enumerate() {
            if let Some(details) = lvl.details.as_mut() {
                let details = Arc::make_mut(details);
                for frag in &mut details.fragments {
                    frag.level = i;
                }
                if let Some(init) = details.init_segment.as_mut() {
                    init.level = i;
                }
            }
        }

        bus.emit(Event::LevelsUpdated {
            levels: self.levels.clone(),
        });
    }
}

impl EventHandler for LevelController {
    fn handle_event(&mut self, event: &mut Event, bus: &EventBus) {
        match event {
            Event::ManifestLoading { .. } => self.reset(),
            Event::ManifestLoaded {
                levels,
                audio_tracks,
                ..
            } => {
                let levels = levels.clone();
                let audio_tracks = audio_tracks.clone();
                self.on_manifest_loaded(&levels, &audio_tracks, bus);
            }
            Event::LevelLoaded {
                level,
                details,
                stats,
                ..
            } => {
                let (level, stats) = (*level, *stats);
                self.on_level_loaded(level, details, stats, bus);
            }
            Event::LevelReloadTick { .. } => self.on_reload_tick(bus),
            Event::AudioTrackSwitched { id } => {
                let id = *id;
                self.on_audio_track_switched(id, bus);
            }
            Event::Error(data) => self.on_error(data, bus),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssumeSupported, MediaCapabilities};
    use parking_lot::Mutex;

    struct Recorder {
        seen: Vec<Event>,
    }

    impl EventHandler for Recorder {
        fn handle_event(&mut self, event: &mut Event, _bus: &EventBus) {
            self.seen.push(event.clone());
        }
    }

    struct Harness {
        bus: EventBus,
        scheduler: Scheduler,
        controller: Arc<Mutex<LevelController>>,
        recorder: Arc<Mutex<Recorder>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_capabilities(Arc::new(AssumeSupported))
        }

        fn with_capabilities(capabilities: SharedCapabilities) -> Self {
            let bus = EventBus::new();
            let scheduler = Scheduler::new();
            let controller = Arc::new(Mutex::new(LevelController::new(
                Arc::new(PlayerConfig::default()),
                capabilities,
                scheduler.clone(),
            )));
            bus.subscribe(controller.clone());
            let recorder = Arc::new(Mutex::new(Recorder { seen: Vec::new() }));
            bus.subscribe(recorder.clone());
            Harness {
                bus,
                scheduler,
                controller,
                recorder,
            }
        }

        fn load_manifest(&self, levels: Vec<ParsedLevel>) {
            self.bus.emit(Event::ManifestLoaded {
                levels,
                audio_tracks: Vec::new(),
                subtitles: Vec::new(),
                url: "https://a.example/master.m3u8".to_string(),
                stats: LoadStats::default(),
            });
            self.bus.dispatch_pending();
        }

        fn names(&self) -> Vec<&'static str> {
            self.recorder.lock().seen.iter().map(Event::name).collect()
        }

        fn level_loading_urls(&self) -> Vec<String> {
            self.recorder
                .lock()
                .seen
                .iter()
                .filter_map(|e| match e {
                    Event::LevelLoading { url, .. } => Some(url.clone()),
                    _ => None,
                })
                .collect()
        }

        fn clear(&self) {
            self.recorder.lock().seen.clear();
        }

        fn load_details(&self, level: usize, playlist: &str, url: &str) {
            let pl = match m3u8_rs::parse_playlist_res(playlist.as_bytes()).unwrap() {
                m3u8_rs::Playlist::MediaPlaylist(pl) => pl,
                _ => panic!("expected media playlist"),
            };
            let details = Arc::new(LevelDetails::from_media_playlist(&pl, level, url));
            self.bus.emit(Event::LevelLoaded {
                level,
                id: 0,
                details,
                stats: LoadStats::default(),
            });
            self.bus.dispatch_pending();
        }
    }

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

    const VOD_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.m4s\n#EXT-X-ENDLIST\n";
    const LIVE_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:40\n#EXTINF:4.0,\nseg40.m4s\n#EXTINF:4.0,\nseg41.m4s\n#EXTINF:4.0,\nseg42.m4s\n";
    const LL_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:9\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:40\n#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK=1.0\n#EXT-X-PART-INF:PART-TARGET=0.334\n#EXTINF:4.0,\nseg40.m4s\n#EXTINF:4.0,\nseg41.m4s\n#EXTINF:4.0,\nseg42.m4s\n";

    #[test]
    fn groups_same_bitrate_entries_and_relocates_first_level() {
        let harness = Harness::new();
        harness.load_manifest(vec![
            parsed(1_500_000, "https://a.example/hi.m3u8"),
            parsed(500_000, "https://a.example/lo.m3u8"),
            parsed(1_500_000, "https://backup.example/hi.m3u8"),
        ]);

        let controller = harness.controller.lock();
        let levels = controller.levels();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].bitrate, 500_000);
        assert_eq!(levels[1].bitrate, 1_500_000);
        assert_eq!(levels[1].url.len(), 2);
        // The manifest's first entry (1.5 Mbps) relocated into bitrate order.
        assert_eq!(controller.first_level(), 1);
        drop(controller);

        assert!(harness.names().contains(&"MANIFEST_PARSED"));
        // First load targets the start level (= first_level).
        assert_eq!(
            harness.level_loading_urls(),
            vec!["https://a.example/hi.m3u8".to_string()]
        );
    }

    #[test]
    fn drops_audio_only_levels_when_video_present() {
        let harness = Harness::new();
        let mut audio_only = parsed(96_000, "https://a.example/audio.m3u8");
        audio_only.video_codec = None;
        harness.load_manifest(vec![
            parsed(1_500_000, "https://a.example/hi.m3u8"),
            audio_only,
        ]);

        let controller = harness.controller.lock();
        assert_eq!(controller.levels().len(), 1);
        assert_eq!(controller.levels()[0].bitrate, 1_500_000);
    }

    struct NoEac3;

    impl MediaCapabilities for NoEac3 {
        fn supports_audio_codec(&self, codec: &str) -> bool {
            codec != "ec-3"
        }

        fn supports_video_codec(&self, _codec: &str) -> bool {
            true
        }

        fn mpeg_audio_quirk(&self) -> bool {
            true
        }
    }

    #[test]
    fn drops_levels_with_unsupported_codecs() {
        let harness = Harness::with_capabilities(Arc::new(NoEac3));
        let mut eac3 = parsed(2_000_000, "https://a.example/atmos.m3u8");
        eac3.audio_codec = Some("ec-3".to_string());
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8"), eac3]);

        let controller = harness.controller.lock();
        assert_eq!(controller.levels().len(), 1);
        assert_eq!(controller.levels()[0].bitrate, 1_500_000);
    }

    #[test]
    fn erases_mpeg_audio_codec_on_quirky_user_agents() {
        let harness = Harness::with_capabilities(Arc::new(NoEac3));
        let mut mp3 = parsed(800_000, "https://a.example/mp3.m3u8");
        mp3.audio_codec = Some("mp4a.40.34".to_string());
        harness.load_manifest(vec![mp3]);

        let controller = harness.controller.lock();
        assert_eq!(controller.levels().len(), 1);
        assert_eq!(controller.levels()[0].audio_codec, None);
    }

    #[test]
    fn incompatible_manifest_is_fatal() {
        struct Nothing;
        impl MediaCapabilities for Nothing {
            fn supports_audio_codec(&self, _c: &str) -> bool {
                false
            }
            fn supports_video_codec(&self, _c: &str) -> bool {
                false
            }
        }

        let harness = Harness::with_capabilities(Arc::new(Nothing));
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8")]);

        let recorder = harness.recorder.lock();
        let fatal = recorder.seen.iter().any(|e| {
            matches!(
                e,
                Event::Error(data)
                    if data.detail == ErrorDetail::ManifestIncompatibleCodecs && data.fatal
            )
        });
        assert!(fatal);
        assert!(!recorder.seen.iter().any(|e| e.name() == "MANIFEST_PARSED"));
    }

    #[test]
    fn invalid_level_index_is_a_non_fatal_switch_error() {
        let harness = Harness::new();
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8")]);
        harness.clear();

        harness.controller.lock().set_level(7, &harness.bus);
        harness.bus.dispatch_pending();

        let recorder = harness.recorder.lock();
        assert!(recorder.seen.iter().any(|e| {
            matches!(
                e,
                Event::Error(data)
                    if data.detail == ErrorDetail::LevelSwitchError && !data.fatal
            )
        }));
    }

    #[test]
    fn switch_with_no_levels_surfaces_fatal_inconsistency() {
        let harness = Harness::new();
        harness.controller.lock().set_level(0, &harness.bus);
        harness.bus.dispatch_pending();

        let recorder = harness.recorder.lock();
        assert!(recorder.seen.iter().any(|e| {
            matches!(
                e,
                Event::Error(data)
                    if data.detail == ErrorDetail::InternalInconsistency && data.fatal
            )
        }));
    }

    #[test]
    fn setting_current_level_with_vod_details_is_a_no_op() {
        let harness = Harness::new();
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8")]);
        harness.load_details(0, VOD_PLAYLIST, "https://a.example/hi.m3u8");
        harness.clear();

        harness.controller.lock().set_level(0, &harness.bus);
        harness.bus.dispatch_pending();

        assert!(harness.level_loading_urls().is_empty());
        assert!(!harness.names().contains(&"LEVEL_SWITCHING"));
    }

    #[test]
    fn vod_details_disarm_the_reload_timer() {
        let harness = Harness::new();
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8")]);
        harness.load_details(0, VOD_PLAYLIST, "https://a.example/hi.m3u8");
        assert!(!harness.scheduler.has_pending());
    }

    #[test]
    fn live_reload_halves_interval_when_not_updated() {
        let harness = Harness::new();
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8")]);

        // First details: no prior, counts as updated → full target duration.
        harness.load_details(0, LIVE_PLAYLIST, "https://a.example/hi.m3u8");
        assert_eq!(harness.scheduler.next_deadline_ms(), Some(4000));
        harness.clear();

        harness.scheduler.advance(4000, &harness.bus);
        assert_eq!(
            harness.level_loading_urls(),
            vec!["https://a.example/hi.m3u8".to_string()]
        );
        assert!(!harness.names().contains(&"LEVEL_SWITCHING"));

        // Same playlist again: endSN unchanged → updated=false → halved.
        let before = harness.scheduler.now_ms();
        harness.load_details(0, LIVE_PLAYLIST, "https://a.example/hi.m3u8");
        assert_eq!(harness.scheduler.next_deadline_ms(), Some(before + 2000));
    }

    #[test]
    fn stop_load_disarms_timer_and_silences_reloads() {
        let harness = Harness::new();
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8")]);
        harness.load_details(0, LIVE_PLAYLIST, "https://a.example/hi.m3u8");
        assert!(harness.scheduler.has_pending());

        harness.controller.lock().stop_load();
        assert!(!harness.scheduler.has_pending());
        harness.clear();

        harness.scheduler.advance(60_000, &harness.bus);
        assert!(harness.level_loading_urls().is_empty());

        // start_load resumes where it left off.
        harness.controller.lock().start_load(&harness.bus);
        harness.bus.dispatch_pending();
        assert_eq!(harness.level_loading_urls().len(), 1);
    }

    #[test]
    fn level_load_errors_back_off_exponentially_then_promote_fatal() {
        let harness = Harness::new();
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8")]);
        {
            let mut controller = harness.controller.lock();
            controller.config = Arc::new(PlayerConfig {
                level_load: crate::config::LevelLoadPolicy {
                    max_retry: 3,
                    retry_delay_ms: 1000,
                    max_retry_timeout_ms: 8000,
                },
                ..PlayerConfig::default()
            });
        }

        let mut observed_delays = Vec::new();
        for _ in 0..3 {
            let base = harness.scheduler.now_ms();
            harness.bus.emit(Event::Error(
                ErrorData::new(ErrorDetail::LevelLoadTimeout, false).with_level(0),
            ));
            harness.bus.dispatch_pending();
            let deadline = harness.scheduler.next_deadline_ms().expect("retry armed");
            observed_delays.push(deadline - base);
            // Let the retry fire so the next error starts from a clean timer.
            harness.scheduler.advance(deadline - base, &harness.bus);
        }
        assert_eq!(observed_delays, vec![1000, 2000, 4000]);

        // Scheduled retries flag the error event for upstream observers.
        assert!(harness.recorder.lock().seen.iter().any(|e| {
            matches!(e, Event::Error(data) if data.level_retry)
        }));

        // Fourth failure exhausts the retry budget and is promoted.
        harness.clear();
        harness.bus.emit(Event::Error(
            ErrorData::new(ErrorDetail::LevelLoadTimeout, false).with_level(0),
        ));
        harness.bus.dispatch_pending();
        let recorder = harness.recorder.lock();
        assert!(recorder.seen.iter().any(|e| {
            matches!(e, Event::Error(data) if data.fatal && data.detail == ErrorDetail::LevelLoadTimeout)
        }));
        drop(recorder);
        assert!(!harness.scheduler.has_pending());
        assert_eq!(harness.controller.lock().current_level(), None);
    }

    #[test]
    fn fragment_error_rotates_to_redundant_url_and_restarts() {
        let harness = Harness::new();
        harness.load_manifest(vec![
            parsed(1_500_000, "https://a.example/hi.m3u8"),
            parsed(500_000, "https://a.example/lo.m3u8"),
            parsed(1_500_000, "https://backup.example/hi.m3u8"),
        ]);
        harness.clear();

        harness.bus.emit(Event::Error(
            ErrorData::new(ErrorDetail::FragLoadError, false).with_level(1),
        ));
        harness.bus.dispatch_pending();

        let controller = harness.controller.lock();
        assert_eq!(controller.levels()[1].url_id, 1);
        assert!(controller.levels()[1].details.is_none());
        drop(controller);
        assert_eq!(
            harness.level_loading_urls(),
            vec!["https://backup.example/hi.m3u8".to_string()]
        );
    }

    #[test]
    fn exhausted_redundant_urls_switch_down_in_auto_mode() {
        let harness = Harness::new();
        // First manifest entry is the 1.5 Mbps level, so after sorting the
        // start level is index 1.
        harness.load_manifest(vec![
            parsed(1_500_000, "https://a.example/hi.m3u8"),
            parsed(500_000, "https://a.example/lo.m3u8"),
        ]);
        harness.clear();

        harness.bus.emit(Event::Error(
            ErrorData::new(ErrorDetail::FragLoadError, false).with_level(1),
        ));
        harness.bus.dispatch_pending();

        assert_eq!(harness.controller.lock().current_level(), Some(0));
        assert!(harness.names().contains(&"LEVEL_SWITCHING"));
    }

    #[test]
    fn switch_down_wraps_from_lowest_to_highest() {
        let harness = Harness::new();
        // First manifest entry is the lowest bitrate, so current starts at 0.
        harness.load_manifest(vec![
            parsed(500_000, "https://a.example/lo.m3u8"),
            parsed(1_500_000, "https://a.example/hi.m3u8"),
        ]);
        assert_eq!(harness.controller.lock().current_level(), Some(0));
        harness.clear();

        harness.bus.emit(Event::Error(
            ErrorData::new(ErrorDetail::FragLoadError, false).with_level(0),
        ));
        harness.bus.dispatch_pending();

        assert_eq!(harness.controller.lock().current_level(), Some(1));
    }

    #[test]
    fn manual_mode_fragment_error_nulls_current_level() {
        let harness = Harness::new();
        harness.load_manifest(vec![
            parsed(500_000, "https://a.example/lo.m3u8"),
            parsed(1_500_000, "https://a.example/hi.m3u8"),
        ]);
        harness.controller.lock().set_level(1, &harness.bus);
        harness.bus.dispatch_pending();
        harness.clear();

        harness.bus.emit(Event::Error(
            ErrorData::new(ErrorDetail::FragLoadError, false).with_level(1),
        ));
        harness.bus.dispatch_pending();

        let controller = harness.controller.lock();
        assert_eq!(controller.current_level(), None);
        assert_eq!(controller.manual_level(), Some(1));
        drop(controller);

        // A subsequent set re-triggers the load.
        harness.controller.lock().set_level(1, &harness.bus);
        harness.bus.dispatch_pending();
        assert_eq!(harness.level_loading_urls().len(), 1);
    }

    #[test]
    fn low_latency_reload_advances_msn_after_update() {
        let harness = Harness::new();
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8")]);
        harness.load_details(0, LL_PLAYLIST, "https://a.example/hi.m3u8");

        // Blocking reload fires 100 ms early: 4000 - 100.
        assert_eq!(harness.scheduler.next_deadline_ms(), Some(3900));
        harness.clear();

        harness.scheduler.advance(3900, &harness.bus);
        // endSN = 42, prior reload updated → request blocks for 43.
        assert_eq!(
            harness.level_loading_urls(),
            vec!["https://a.example/hi.m3u8?_HLS_msn=43".to_string()]
        );

        // An unchanged reload does not advance the sequence.
        harness.load_details(0, LL_PLAYLIST, "https://a.example/hi.m3u8");
        harness.clear();
        let deadline = harness.scheduler.next_deadline_ms().unwrap();
        harness
            .scheduler
            .advance_to(deadline, &harness.bus);
        assert_eq!(
            harness.level_loading_urls(),
            vec!["https://a.example/hi.m3u8?_HLS_msn=42".to_string()]
        );
    }

    #[test]
    fn low_latency_reload_requests_delta_when_skippable() {
        let harness = Harness::new();
        harness.load_manifest(vec![parsed(1_500_000, "https://a.example/hi.m3u8")]);
        let skippable = LL_PLAYLIST.replace(
            "CAN-BLOCK-RELOAD=YES",
            "CAN-BLOCK-RELOAD=YES,CAN-SKIP-UNTIL=12.0",
        );
        harness.load_details(0, &skippable, "https://a.example/hi.m3u8");
        harness.clear();

        harness.scheduler.advance(3900, &harness.bus);
        assert_eq!(
            harness.level_loading_urls(),
            vec!["https://a.example/hi.m3u8?_HLS_msn=43&_HLS_skip=YES".to_string()]
        );
    }

    #[test]
    fn audio_track_switch_rebinds_level_url() {
        let harness = Harness::new();
        let mut main = parsed(1_500_000, "https://a.example/hi.m3u8");
        main.audio_group_id = Some("aac".to_string());
        let mut backup = parsed(1_500_000, "https://b.example/hi.m3u8");
        backup.audio_group_id = Some("ec3".to_string());

        harness.bus.emit(Event::ManifestLoaded {
            levels: vec![main, backup],
            audio_tracks: vec![
                AudioTrack {
                    id: 0,
                    group_id: "aac".to_string(),
                    name: "Stereo".to_string(),
                    lang: Some("en".to_string()),
                    url: None,
                },
                AudioTrack {
                    id: 1,
                    group_id: "ec3".to_string(),
                    name: "Surround".to_string(),
                    lang: Some("en".to_string()),
                    url: None,
                },
            ],
            subtitles: Vec::new(),
            url: "https://a.example/master.m3u8".to_string(),
            stats: LoadStats::default(),
        });
        harness.bus.dispatch_pending();
        harness.clear();

        harness.bus.emit(Event::AudioTrackSwitched { id: 1 });
        harness.bus.dispatch_pending();

        let controller = harness.controller.lock();
        assert_eq!(controller.levels()[0].url_id, 1);
        drop(controller);
        assert_eq!(
            harness.level_loading_urls(),
            vec!["https://b.example/hi.m3u8".to_string()]
        );
    }

    #[test]
    fn remove_level_reindexes_remaining_fragments() {
        let harness = Harness::new();
        // First manifest entry is 1.5 Mbps → current is index 1 after sort.
        harness.load_manifest(vec![
            parsed(1_500_000, "https://a.example/hi.m3u8"),
            parsed(500_000, "https://a.example/lo.m3u8"),
        ]);
        // Install details on the current (index 1) level.
        harness.load_details(1, LIVE_PLAYLIST, "https://a.example/hi.m3u8");
        harness.clear();

        harness
            .controller
            .lock()
            .remove_level(0, None, &harness.bus);
        harness.bus.dispatch_pending();

        let controller = harness.controller.lock();
        assert_eq!(controller.levels().len(), 1);
        let details = controller.levels()[0].details.as_ref().expect("details");
        assert!(details.fragments.iter().all(|f| f.level == 0));
        assert_eq!(controller.current_level(), Some(0));
        drop(controller);
        assert!(harness.names().contains(&"LEVELS_UPDATED"));
    }

    #[test]
    fn remove_single_redundant_url_keeps_level() {
        let harness = Harness::new();
        harness.load_manifest(vec![
            parsed(1_500_000, "https://a.example/hi.m3u8"),
            parsed(1_500_000, "https://b.example/hi.m3u8"),
        ]);

        harness
            .controller
            .lock()
            .remove_level(0, Some(1), &harness.bus);
        harness.bus.dispatch_pending();

        let controller = harness.controller.lock();
        assert_eq!(controller.levels().len(), 1);
        assert_eq!(controller.levels()[0].url.len(), 1);
    }

    #[test]
    fn stale_level_loaded_events_are_discarded() {
        let harness = Harness::new();
        harness.load_manifest(vec![
            parsed(500_000, "https://a.example/lo.m3u8"),
            parsed(1_500_000, "https://a.example/hi.m3u8"),
        ]);
        // Current is 0; details for level 1 must be ignored.
        harness.load_details(1, LIVE_PLAYLIST, "https://a.example/hi.m3u8");
        let controller = harness.controller.lock();
        assert!(controller.levels()[1].details.is_none());
        assert!(!harness.scheduler.has_pending());
    }
}
