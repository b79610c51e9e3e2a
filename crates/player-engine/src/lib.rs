//! # player-engine
//!
//! Core runtime of an HLS adaptive-bitrate playback engine: a typed event
//! bus and timer wheel, the rendition (level) controller with live reload
//! and low-latency blocking reloads, a per-track buffer operation queue, a
//! closed-loop playback-rate controller, the captions/subtitles timeline
//! controller, and a pass-through fMP4 remuxer.
//!
//! External collaborators (HTTP loader, manifest parser, demuxer, ABR
//! estimator, media-source wiring) communicate with the engine exclusively
//! through [`events::Event`] on the [`bus::EventBus`].

pub mod buffer_queue;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod levels;
pub mod media;
pub mod rate_controller;
pub mod remux;
pub mod scheduler;
pub mod timeline;

// Re-exports for easier access
pub use buffer_queue::{BufferOperation, BufferOperationQueue, SourceBufferType};
pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use config::{AssumeSupported, MediaCapabilities, PlayerConfig};
pub use engine::PlayerEngine;
pub use error::{EngineError, ErrorData, ErrorDetail, ErrorKind};
pub use events::Event;
pub use levels::LevelController;
pub use media::{MediaElement, SourceBufferSink, TimeRange};
pub use rate_controller::PlaybackRateController;
pub use remux::{PassThroughRemuxer, RemuxResult, Remuxer};
pub use scheduler::{Scheduler, TimerId};
pub use timeline::{CueHandler, TextTrackSink, TimelineController};
