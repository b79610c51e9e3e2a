//! # hls-model
//!
//! Value types shared by the playback engine: renditions ([`Level`]),
//! per-rendition playlist state ([`LevelDetails`]), media fragments
//! ([`Fragment`]), the Low-Latency HLS blocking-reload wire helpers, and a
//! minimal ISO-BMFF timing layer for fMP4 payloads.
//!
//! The manifest parser itself is an external collaborator; this crate takes
//! `m3u8_rs` structures at the boundary and turns them into engine state.

pub mod bmff;
pub mod details;
pub mod fragment;
pub mod level;
pub mod llhls;

pub use details::{LevelDetails, PlaylistType, ServerControl};
pub use fragment::{Fragment, FragmentKind, UserdataSample};
pub use level::{Level, ParsedLevel};
pub use llhls::{BlockingReloadQuery, PushInfo};
