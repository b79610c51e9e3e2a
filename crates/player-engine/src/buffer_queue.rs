//! Per-track FIFO serializer over an asynchronous single-updater buffer.
//!
//! The media sink accepts one mutation at a time per track and signals
//! completion out of band (`updateend`). All ordering guarantees live here:
//! callers enqueue freely, the queue dispatches at most one operation per
//! track, and the external `updateend` observer advances the queue.

use crate::error::EngineError;
use crate::media::SharedSourceBuffer;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceBufferType {
    Audio,
    Video,
}

type ExecuteFn = Box<dyn FnOnce() -> Result<(), EngineError> + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;
type ErrorFn = Box<dyn FnOnce(&EngineError) + Send>;

/// One queued mutation of a source buffer.
///
/// `execute` must eventually cause an `updateend` signal on the target
/// buffer when it returns `Ok`. Operations have no identity; completion
/// callbacks are one-shot.
pub struct BufferOperation {
    label: &'static str,
    execute: Option<ExecuteFn>,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
}

impl BufferOperation {
    pub fn new(label: &'static str, execute: impl FnOnce() -> Result<(), EngineError> + Send + 'static) -> Self {
        BufferOperation {
            label,
            execute: Some(Box::new(execute)),
            on_complete: None,
            on_error: None,
        }
    }

    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&EngineError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn in_flight(&self) -> bool {
        self.execute.is_none()
    }
}

#[derive(Default)]
struct TrackQueue {
    ops: VecDeque<BufferOperation>,
    buffer: Option<SharedSourceBuffer>,
}

/// Serializes appends, removes and flush barriers per source-buffer type.
#[derive(Default)]
pub struct BufferOperationQueue {
    audio: TrackQueue,
    video: TrackQueue,
}

impl BufferOperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn track_mut(&mut self, ty: SourceBufferType) -> &mut TrackQueue {
        match ty {
            SourceBufferType::Audio => &mut self.audio,
            SourceBufferType::Video => &mut self.video,
        }
    }

    fn track(&self, ty: SourceBufferType) -> &TrackQueue {
        match ty {
            SourceBufferType::Audio => &self.audio,
            SourceBufferType::Video => &self.video,
        }
    }

    /// Bind the underlying buffer for a track. Anything already queued
    /// starts executing immediately.
    pub fn attach_buffer(&mut self, ty: SourceBufferType, buffer: SharedSourceBuffer) {
        let queue = self.track_mut(ty);
        queue.buffer = Some(buffer);
        if !queue.ops.is_empty() {
            self.execute_next(ty);
        }
    }

    pub fn detach_buffer(&mut self, ty: SourceBufferType) {
        self.track_mut(ty).buffer = None;
    }

    pub fn len(&self, ty: SourceBufferType) -> usize {
        self.track(ty).ops.len()
    }

    pub fn is_empty(&self, ty: SourceBufferType) -> bool {
        self.track(ty).ops.is_empty()
    }

    /// Whether the head operation has been dispatched but not yet completed.
    pub fn has_in_flight(&self, ty: SourceBufferType) -> bool {
        self.track(ty)
            .ops
            .front()
            .map(BufferOperation::in_flight)
            .unwrap_or(false)
    }

    /// Enqueue; if the track was idle and its buffer exists, dispatch now.
    pub fn append(&mut self, op: BufferOperation, ty: SourceBufferType) {
        let queue = self.track_mut(ty);
        debug!(op = op.label, ty = ?ty, depth = queue.ops.len(), "enqueue buffer operation");
        queue.ops.push_back(op);
        if queue.ops.len() == 1 && queue.buffer.is_some() {
            self.execute_next(ty);
        }
    }

    /// Enqueue a synthetic operation whose only effect is resolving the
    /// returned handle once every prior operation has completed. The blocker
    /// stays at the head of the queue until the caller shifts it, so work
    /// appended meanwhile stays serialized behind it.
    pub fn append_blocker(&mut self, ty: SourceBufferType) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let op = BufferOperation::new("blocker", move || {
            let _ = tx.send(());
            Ok(())
        });
        self.append(op, ty);
        rx
    }

    /// Pop the completed head (firing its completion callback) and start
    /// the next operation. Called by the external `updateend` observer.
    pub fn shift_and_execute_next(&mut self, ty: SourceBufferType) {
        let queue = self.track_mut(ty);
        if let Some(mut op) = queue.ops.pop_front()
            && let Some(complete) = op.on_complete.take()
        {
            complete();
        }
        self.execute_next(ty);
    }

    /// Dispatch the head operation if it has not been dispatched yet.
    ///
    /// A synchronous failure is reported through `on_error`; if the buffer
    /// is idle the head is popped and the next operation dispatched, since
    /// no `updateend` will ever arrive to advance the queue.
    fn execute_next(&mut self, ty: SourceBufferType) {
        loop {
            let queue = self.track_mut(ty);
            let Some(head) = queue.ops.front_mut() else {
                return;
            };
            let Some(execute) = head.execute.take() else {
                // Already in flight; updateend will advance.
                return;
            };
            match execute() {
                Ok(()) => return,
                Err(err) => {
                    warn!(op = head.label, ty = ?ty, error = %err, "buffer operation failed synchronously");
                    if let Some(on_error) = head.on_error.take() {
                        on_error(&err);
                    }
                    let updating = queue
                        .buffer
                        .as_ref()
                        .map(|b| b.is_updating())
                        .unwrap_or(false);
                    if updating {
                        // The buffer is mid-update; its updateend (or error
                        // signal) is responsible for shifting the queue.
                        return;
                    }
                    queue.ops.pop_front();
                }
            }
        }
    }
}
