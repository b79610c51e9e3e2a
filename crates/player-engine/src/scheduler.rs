//! Deterministic timer wheel.
//!
//! Timers fire as bus events: each due timer is emitted and dispatched as
//! its own run-to-completion cycle, so a timer callback observes the same
//! scheduling model as any other event. Production drives the wheel from an
//! async loop; tests advance it manually.

use crate::bus::EventBus;
use crate::events::Event;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct SchedulerInner {
    now_ms: u64,
    next_id: u64,
    /// Deadline-ordered timers; the id breaks ties in schedule order.
    timers: BTreeMap<(u64, u64), Event>,
    deadlines: HashMap<u64, u64>,
}

/// Cheaply clonable handle to the shared timer wheel.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<SchedulerInner>>,
    /// Woken whenever a timer is armed, so a sleeping driver re-evaluates
    /// its next deadline.
    notify: Arc<Notify>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Arc::new(Mutex::new(SchedulerInner {
                now_ms: 0,
                next_id: 0,
                timers: BTreeMap::new(),
                deadlines: HashMap::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.inner.lock().now_ms
    }

    /// Arm a one-shot timer that emits `event` after `delay_ms`.
    pub fn schedule(&self, delay_ms: u64, event: Event) -> TimerId {
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            let deadline = inner.now_ms + delay_ms;
            trace!(event = event.name(), deadline_ms = deadline, "arm timer");
            inner.timers.insert((deadline, id), event);
            inner.deadlines.insert(id, deadline);
            TimerId(id)
        };
        self.notify.notify_one();
        id
    }

    /// Disarm a timer. Returns false when it already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock();
        match inner.deadlines.remove(&id.0) {
            Some(deadline) => inner.timers.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.inner
            .lock()
            .timers
            .first_key_value()
            .map(|((deadline, _), _)| *deadline)
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().timers.is_empty()
    }

    pub fn notified(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Move the clock forward by `delta_ms`, firing due timers in deadline
    /// order. Each fired timer is dispatched before the next is considered.
    pub fn advance(&self, delta_ms: u64, bus: &EventBus) {
        let target = self.inner.lock().now_ms + delta_ms;
        self.advance_to(target, bus);
    }

    /// Move the clock to an absolute time, firing everything due on the way.
    pub fn advance_to(&self, target_ms: u64, bus: &EventBus) {
        loop {
            let due = {
                let mut inner = self.inner.lock();
                match inner.timers.first_key_value() {
                    Some((&(deadline, id), _)) if deadline <= target_ms => {
                        let event = inner.timers.remove(&(deadline, id)).unwrap();
                        inner.deadlines.remove(&id);
                        inner.now_ms = deadline;
                        Some(event)
                    }
                    _ => None,
                }
            };
            match due {
                Some(event) => {
                    trace!(event = event.name(), "timer fired");
                    bus.emit(event);
                    bus.dispatch_pending();
                }
                None => break,
            }
        }
        let mut inner = self.inner.lock();
        inner.now_ms = inner.now_ms.max(target_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventHandler;

    struct Recorder {
        seen: Vec<(String, u64)>,
        scheduler: Scheduler,
    }

    impl EventHandler for Recorder {
        fn handle_event(&mut self, event: &mut Event, _bus: &EventBus) {
            self.seen
                .push((event.name().to_string(), self.scheduler.now_ms()));
        }
    }

    fn recording_bus(scheduler: &Scheduler) -> (EventBus, Arc<Mutex<Recorder>>) {
        let bus = EventBus::new();
        let recorder = Arc::new(Mutex::new(Recorder {
            seen: Vec::new(),
            scheduler: scheduler.clone(),
        }));
        bus.subscribe(recorder.clone());
        (bus, recorder)
    }

    #[test]
    fn timers_fire_in_deadline_order_at_their_deadline() {
        let scheduler = Scheduler::new();
        let (bus, recorder) = recording_bus(&scheduler);

        scheduler.schedule(500, Event::MediaDetaching);
        scheduler.schedule(250, Event::PlaybackRateTick);
        scheduler.advance(1000, &bus);

        assert_eq!(
            recorder.lock().seen,
            vec![
                ("PLAYBACK_RATE_TICK".to_string(), 250),
                ("MEDIA_DETACHING".to_string(), 500)
            ]
        );
        assert_eq!(scheduler.now_ms(), 1000);
    }

    #[test]
    fn cancelled_timers_do_not_fire() {
        let scheduler = Scheduler::new();
        let (bus, recorder) = recording_bus(&scheduler);

        let id = scheduler.schedule(100, Event::MediaDetaching);
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        scheduler.advance(200, &bus);

        assert!(recorder.lock().seen.is_empty());
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn partial_advance_leaves_future_timers_armed() {
        let scheduler = Scheduler::new();
        let (bus, recorder) = recording_bus(&scheduler);

        scheduler.schedule(300, Event::PlaybackRateTick);
        scheduler.advance(200, &bus);
        assert!(recorder.lock().seen.is_empty());
        assert_eq!(scheduler.next_deadline_ms(), Some(300));

        scheduler.advance(100, &bus);
        assert_eq!(recorder.lock().seen.len(), 1);
    }

    #[test]
    fn deadlines_are_relative_to_current_time() {
        let scheduler = Scheduler::new();
        let (bus, recorder) = recording_bus(&scheduler);

        scheduler.advance(1000, &bus);
        scheduler.schedule(250, Event::PlaybackRateTick);
        assert_eq!(scheduler.next_deadline_ms(), Some(1250));

        scheduler.advance(250, &bus);
        assert_eq!(recorder.lock().seen, vec![("PLAYBACK_RATE_TICK".to_string(), 1250)]);
    }
}
