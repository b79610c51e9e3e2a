//! Closed-loop playback-rate controller.
//!
//! Samples the media sink every tick and nudges the playback rate toward a
//! forward-buffer target with a saturating sigmoid gain. Inside the dead
//! band around the target the rate is pinned to 1.0 to avoid chattering.

use crate::bus::{EventBus, EventHandler};
use crate::config::LatencyConfig;
use crate::events::Event;
use crate::media::{SharedMedia, forward_buffer_length};
use crate::scheduler::{Scheduler, TimerId};
use tracing::{debug, trace};

/// Sigmoid gain saturating in (0, 2): far behind the target the rate tends
/// to 0, far ahead it tends to 2, and it crosses 1 exactly at the target.
pub fn sigmoid_rate(buffer_length: f64, target: f64) -> f64 {
    const L: f64 = 2.0;
    const K: f64 = 0.5;
    L / (1.0 + (-K * (buffer_length - target)).exp())
}

pub struct PlaybackRateController {
    config: LatencyConfig,
    scheduler: Scheduler,
    media: Option<SharedMedia>,
    timer: Option<TimerId>,
}

impl PlaybackRateController {
    pub fn new(config: LatencyConfig, scheduler: Scheduler) -> Self {
        PlaybackRateController {
            config,
            scheduler,
            media: None,
            timer: None,
        }
    }

    fn attach(&mut self, media: SharedMedia) {
        debug!("media attached, starting rate sampling");
        self.media = Some(media);
        self.arm();
    }

    /// Detach order matters: the timer is cleared before the media handle is
    /// dropped so no further tick can touch the sink.
    fn detach(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.scheduler.cancel(timer);
        }
        self.media = None;
    }

    fn arm(&mut self) {
        self.timer = Some(
            self.scheduler
                .schedule(self.config.tick_interval_ms, Event::PlaybackRateTick),
        );
    }

    fn tick(&mut self) {
        let Some(media) = self.media.clone() else {
            return;
        };
        let pos = media.current_time();
        let buffer_length =
            forward_buffer_length(&media.buffered(), pos, self.config.max_buffer_hole);
        let distance = self.config.latency_target - buffer_length;

        let rate = if distance < 0.0 || distance > self.config.refresh_latency {
            sigmoid_rate(buffer_length, self.config.latency_target)
        } else {
            1.0
        };

        if (rate - media.playback_rate()).abs() > f64::EPSILON {
            trace!(
                buffer_length,
                distance,
                rate,
                "adjusting playback rate"
            );
            media.set_playback_rate(rate);
        }
        self.arm();
    }
}

impl EventHandler for PlaybackRateController {
    fn handle_event(&mut self, event: &mut Event, _bus: &EventBus) {
        match event {
            Event::MediaAttaching { media } => self.attach(media.clone()),
            Event::MediaDetaching => self.detach(),
            Event::PlaybackRateTick => self.tick(),
            _ => {}
        }
    }
}
