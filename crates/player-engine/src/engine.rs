//! Engine assembly: builds the bus and timer wheel, registers the
//! controllers, and drives everything from a single async loop.

use crate::bus::{EventBus, SubscriptionId};
use crate::config::{AssumeSupported, PlayerConfig, SharedCapabilities};
use crate::events::Event;
use crate::levels::LevelController;
use crate::media::SharedMedia;
use crate::rate_controller::PlaybackRateController;
use crate::scheduler::Scheduler;
use crate::timeline::TimelineController;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct PlayerEngine {
    bus: EventBus,
    scheduler: Scheduler,
    levels: Arc<Mutex<LevelController>>,
    timeline: Arc<Mutex<TimelineController>>,
    rate: Arc<Mutex<PlaybackRateController>>,
    subscriptions: Vec<SubscriptionId>,
    waker: Arc<Notify>,
}

impl PlayerEngine {
    pub fn new(config: PlayerConfig) -> Self {
        Self::with_capabilities(config, Arc::new(AssumeSupported))
    }

    pub fn with_capabilities(config: PlayerConfig, capabilities: SharedCapabilities) -> Self {
        let config = Arc::new(config);
        let bus = EventBus::new();
        let scheduler = Scheduler::new();

        let levels = Arc::new(Mutex::new(LevelController::new(
            Arc::clone(&config),
            capabilities,
            scheduler.clone(),
        )));
        let timeline = Arc::new(Mutex::new(TimelineController::new(Arc::clone(&config))));
        let rate = Arc::new(Mutex::new(PlaybackRateController::new(
            config.latency.clone(),
            scheduler.clone(),
        )));

        let subscriptions = vec![
            bus.subscribe(levels.clone()),
            bus.subscribe(timeline.clone()),
            bus.subscribe(rate.clone()),
        ];
        let waker = scheduler.notified();

        PlayerEngine {
            bus,
            scheduler,
            levels,
            timeline,
            rate,
            subscriptions,
            waker,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn levels(&self) -> &Arc<Mutex<LevelController>> {
        &self.levels
    }

    pub fn timeline(&self) -> &Arc<Mutex<TimelineController>> {
        &self.timeline
    }

    pub fn rate_controller(&self) -> &Arc<Mutex<PlaybackRateController>> {
        &self.rate
    }

    /// Feed an event in from an external collaborator (loader, demuxer,
    /// media-source wiring) and dispatch it synchronously.
    pub fn post(&self, event: Event) {
        self.bus.emit(event);
        self.bus.dispatch_pending();
        self.waker.notify_one();
    }

    pub fn attach_media(&self, media: SharedMedia) {
        self.post(Event::MediaAttaching { media });
    }

    pub fn detach_media(&self) {
        self.post(Event::MediaDetaching);
    }

    pub fn set_level(&self, level: usize) {
        self.levels.lock().set_level(level, &self.bus);
        self.bus.dispatch_pending();
    }

    pub fn start_load(&self) {
        self.levels.lock().start_load(&self.bus);
        self.bus.dispatch_pending();
    }

    pub fn stop_load(&self) {
        self.levels.lock().stop_load();
    }

    /// Unregister every component from the bus. Pending timers are left to
    /// lapse; without subscribers they are inert.
    pub fn destroy(&mut self) {
        self.stop_load();
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
    }

    /// Async driver: sleeps until the next timer deadline (or an external
    /// post), fires due timers and dispatches.
    pub async fn run(&self, token: CancellationToken) {
        info!("engine driver started");
        let start = Instant::now();
        loop {
            self.bus.dispatch_pending();
            if token.is_cancelled() {
                break;
            }
            let now_ms = start.elapsed().as_millis() as u64;
            self.scheduler.advance_to(now_ms, &self.bus);

            let sleep = match self.scheduler.next_deadline_ms() {
                Some(deadline) => {
                    let now_ms = start.elapsed().as_millis() as u64;
                    Duration::from_millis(deadline.saturating_sub(now_ms).max(1))
                }
                None => Duration::from_secs(3600),
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = self.waker.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!("engine driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventHandler;
    use crate::events::LoadStats;
    use crate::media::{MediaElement, TimeRange};
    use hls_model::ParsedLevel;
    use url::Url;

    struct Recorder {
        seen: Vec<String>,
    }

    impl EventHandler for Recorder {
        fn handle_event(&mut self, event: &mut Event, _bus: &EventBus) {
            self.seen.push(event.name().to_string());
        }
    }

    fn manifest_event() -> Event {
        Event::ManifestLoaded {
            levels: vec![ParsedLevel {
                bitrate: 1_500_000,
                url: Url::parse("https://a.example/hi.m3u8").unwrap(),
                audio_codec: Some("mp4a.40.2".to_string()),
                video_codec: Some("avc1.42e01e".to_string()),
                audio_group_id: None,
                text_group_id: None,
                width: 1280,
                height: 720,
            }],
            audio_tracks: Vec::new(),
            subtitles: Vec::new(),
            url: "https://a.example/master.m3u8".to_string(),
            stats: LoadStats::default(),
        }
    }

    #[test]
    fn manifest_flows_through_to_level_loading() {
        let engine = PlayerEngine::new(PlayerConfig::default());
        let recorder = Arc::new(Mutex::new(Recorder { seen: Vec::new() }));
        engine.bus().subscribe(recorder.clone());

        engine.post(manifest_event());

        let seen = recorder.lock().seen.clone();
        assert!(seen.contains(&"MANIFEST_PARSED".to_string()));
        assert!(seen.contains(&"LEVEL_LOADING".to_string()));
        assert_eq!(engine.levels().lock().current_level(), Some(0));
    }

    struct StillMedia;

    impl MediaElement for StillMedia {
        fn current_time(&self) -> f64 {
            0.0
        }
        fn buffered(&self) -> Vec<TimeRange> {
            vec![]
        }
        fn playback_rate(&self) -> f64 {
            1.0
        }
        fn set_playback_rate(&self, _rate: f64) {}
    }

    #[test]
    fn attaching_media_arms_the_rate_sampler() {
        let engine = PlayerEngine::new(PlayerConfig::default());
        engine.attach_media(Arc::new(StillMedia));
        assert_eq!(engine.scheduler().next_deadline_ms(), Some(250));

        engine.detach_media();
        assert!(!engine.scheduler().has_pending());
    }

    #[test]
    fn destroy_unsubscribes_components() {
        let mut engine = PlayerEngine::new(PlayerConfig::default());
        engine.destroy();
        engine.post(manifest_event());
        assert_eq!(engine.levels().lock().current_level(), None);
    }

    #[tokio::test]
    async fn driver_stops_on_cancellation() {
        let engine = Arc::new(PlayerEngine::new(PlayerConfig::default()));
        let token = CancellationToken::new();
        let driver = {
            let engine = Arc::clone(&engine);
            let token = token.clone();
            tokio::spawn(async move { engine.run(token).await })
        };

        engine.post(manifest_event());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), driver)
            .await
            .expect("driver exits after cancellation")
            .expect("driver task joins");
    }
}
