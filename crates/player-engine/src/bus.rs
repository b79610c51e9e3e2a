//! Typed publish/subscribe bus with run-to-completion dispatch.
//!
//! Emitting only enqueues; `dispatch_pending` drains the queue, delivering
//! each event to every subscriber in subscription order. A handler that
//! emits during dispatch appends to the queue and is never re-entered, so
//! every handler observes a complete, ordered event stream.

use crate::events::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// A component that reacts to bus events.
///
/// Events arrive mutably so a handler earlier in the dispatch order can
/// amend a payload (e.g. promote an error to fatal) for later handlers.
pub trait EventHandler: Send {
    fn handle_event(&mut self, event: &mut Event, bus: &EventBus);
}

pub type SharedHandler = Arc<Mutex<dyn EventHandler>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct BusInner {
    handlers: Vec<(SubscriptionId, SharedHandler)>,
    queue: VecDeque<Event>,
    dispatching: bool,
    next_id: u64,
}

/// Cheaply clonable handle to the shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(Mutex::new(BusInner {
                handlers: Vec::new(),
                queue: VecDeque::new(),
                dispatching: false,
                next_id: 0,
            })),
        }
    }

    pub fn subscribe(&self, handler: SharedHandler) -> SubscriptionId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.handlers.push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.handlers.len();
        inner.handlers.retain(|(hid, _)| *hid != id);
        inner.handlers.len() != before
    }

    /// Enqueue an event. Delivery happens on the next `dispatch_pending`.
    pub fn emit(&self, event: Event) {
        trace!(event = event.name(), "enqueue");
        self.inner.lock().queue.push_back(event);
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Drain the queue, delivering each event to all current subscribers.
    ///
    /// Re-entrant calls (from within a handler) return immediately; the
    /// outer drain picks up whatever the handler enqueued.
    pub fn dispatch_pending(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.dispatching {
                return;
            }
            inner.dispatching = true;
        }

        loop {
            let next = self.inner.lock().queue.pop_front();
            let Some(mut event) = next else {
                break;
            };
            let handlers: Vec<SharedHandler> = {
                let inner = self.inner.lock();
                inner.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
            };
            trace!(event = event.name(), handlers = handlers.len(), "dispatch");
            for handler in handlers {
                handler.lock().handle_event(&mut event, self);
            }
        }

        self.inner.lock().dispatching = false;
    }
}
