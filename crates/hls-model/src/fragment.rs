use bytes::Bytes;

/// Which elementary stream a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentKind {
    Main,
    Audio,
    Subtitle,
}

/// A single media segment reference, immutable once parsed from a playlist.
///
/// The `level` index is the only field rewritten after construction: when a
/// rendition is removed, remaining fragments are reindexed to match their
/// owning level's new position.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Media sequence number within the owning rendition.
    pub sn: u64,
    /// Discontinuity counter at this fragment.
    pub cc: u64,
    /// Index of the owning rendition.
    pub level: usize,
    pub kind: FragmentKind,
    /// Presentation start time in seconds.
    pub start: f64,
    /// Declared duration in seconds.
    pub duration: f64,
    pub url: String,
    /// Encryption tag carried verbatim from the playlist, if any.
    pub decryptdata: Option<m3u8_rs::Key>,
    /// Wall-clock anchor in seconds since the Unix epoch.
    pub program_date_time: Option<f64>,
}

impl Fragment {
    /// End of the fragment on the presentation timeline.
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// One decoded user-data sample (H.264 SEI payload) with its timestamp.
#[derive(Debug, Clone)]
pub struct UserdataSample {
    /// Presentation timestamp in seconds.
    pub pts: f64,
    pub bytes: Bytes,
}
