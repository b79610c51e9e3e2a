use std::sync::Arc;

/// One contiguous buffered interval of the media sink, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        TimeRange { start, end }
    }
}

/// The playback surface the engine samples and drives.
///
/// Implementations are expected to use interior mutability; the engine only
/// ever holds shared references.
pub trait MediaElement: Send + Sync {
    /// Current playback position in seconds.
    fn current_time(&self) -> f64;
    /// Buffered ranges, sorted ascending and non-overlapping.
    fn buffered(&self) -> Vec<TimeRange>;
    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&self, rate: f64);
}

pub type SharedMedia = Arc<dyn MediaElement>;

/// The asynchronous single-updater buffer behind the operation queue.
///
/// `is_updating` reflects whether an operation dispatched against the
/// buffer has not yet signalled `updateend`.
pub trait SourceBufferSink: Send + Sync {
    fn is_updating(&self) -> bool;
}

pub type SharedSourceBuffer = Arc<dyn SourceBufferSink>;

/// Length of the contiguous forward buffer from `pos`, treating gaps of at
/// most `max_hole` seconds as continuous.
pub fn forward_buffer_length(ranges: &[TimeRange], pos: f64, max_hole: f64) -> f64 {
    let mut end = pos;
    for range in ranges {
        if range.end <= end {
            continue;
        }
        if range.start > end + max_hole {
            break;
        }
        end = range.end;
    }
    end - pos
}
