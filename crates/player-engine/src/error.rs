use hls_model::Fragment;
use std::sync::Arc;

/// Failures surfaced through `Result` returns inside the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("remux error: {reason}")]
    Remux { reason: String },

    #[error("buffer operation error: {reason}")]
    BufferOperation { reason: String },

    #[error("subtitle parse error: {reason}")]
    SubtitleParse { reason: String },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
}

impl EngineError {
    pub fn remux(reason: impl Into<String>) -> Self {
        Self::Remux {
            reason: reason.into(),
        }
    }

    pub fn buffer(reason: impl Into<String>) -> Self {
        Self::BufferOperation {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}

/// Broad classification of an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Media,
    Other,
}

/// Specific error condition carried by an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDetail {
    ManifestIncompatibleCodecs,
    LevelLoadError,
    LevelLoadTimeout,
    LevelSwitchError,
    FragLoadError,
    FragLoadTimeout,
    KeyLoadError,
    KeyLoadTimeout,
    RemuxAllocError,
    /// The engine detected state it cannot recover from (e.g. an operation
    /// that requires a level set when none is).
    InternalInconsistency,
}

impl ErrorDetail {
    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorDetail::LevelLoadError
            | ErrorDetail::LevelLoadTimeout
            | ErrorDetail::FragLoadError
            | ErrorDetail::FragLoadTimeout
            | ErrorDetail::KeyLoadError
            | ErrorDetail::KeyLoadTimeout => ErrorKind::Network,
            ErrorDetail::ManifestIncompatibleCodecs | ErrorDetail::RemuxAllocError => {
                ErrorKind::Media
            }
            ErrorDetail::LevelSwitchError | ErrorDetail::InternalInconsistency => ErrorKind::Other,
        }
    }

    /// Whether the condition is scoped to a playlist load rather than a
    /// single fragment.
    pub fn is_level_scoped(self) -> bool {
        matches!(
            self,
            ErrorDetail::LevelLoadError | ErrorDetail::LevelLoadTimeout
        )
    }

    /// Whether level-controller recovery applies at all.
    pub fn is_recoverable_load_error(self) -> bool {
        matches!(
            self,
            ErrorDetail::LevelLoadError
                | ErrorDetail::LevelLoadTimeout
                | ErrorDetail::FragLoadError
                | ErrorDetail::FragLoadTimeout
                | ErrorDetail::KeyLoadError
                | ErrorDetail::KeyLoadTimeout
                | ErrorDetail::RemuxAllocError
        )
    }
}

/// Payload of an error event. Recovery may mutate `fatal` in place so that
/// handlers later in the dispatch order observe the promotion.
#[derive(Debug, Clone)]
pub struct ErrorData {
    pub kind: ErrorKind,
    pub detail: ErrorDetail,
    pub fatal: bool,
    pub level: Option<usize>,
    pub frag: Option<Arc<Fragment>>,
    pub reason: Option<String>,
    /// Set by recovery when a level retry has been scheduled for this error.
    pub level_retry: bool,
}

impl ErrorData {
    pub fn new(detail: ErrorDetail, fatal: bool) -> Self {
        ErrorData {
            kind: detail.kind(),
            detail,
            fatal,
            level: None,
            frag: None,
            reason: None,
            level_retry: false,
        }
    }

    pub fn with_level(mut self, level: usize) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_frag(mut self, frag: Arc<Fragment>) -> Self {
        self.frag = Some(frag);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_maps_to_kind() {
        assert_eq!(ErrorDetail::LevelLoadTimeout.kind(), ErrorKind::Network);
        assert_eq!(
            ErrorDetail::ManifestIncompatibleCodecs.kind(),
            ErrorKind::Media
        );
        assert_eq!(ErrorDetail::LevelSwitchError.kind(), ErrorKind::Other);
    }

    #[test]
    fn level_scope_classification() {
        assert!(ErrorDetail::LevelLoadError.is_level_scoped());
        assert!(!ErrorDetail::FragLoadError.is_level_scoped());
        assert!(ErrorDetail::KeyLoadTimeout.is_recoverable_load_error());
        assert!(!ErrorDetail::LevelSwitchError.is_recoverable_load_error());
    }
}
