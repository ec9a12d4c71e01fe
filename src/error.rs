#![forbid(unsafe_code)]

//! Error taxonomy for the archiving pipeline.
//!
//! The split matters for control flow: malformed tracks and recognition
//! failures are recoverable (the video still archives, with the gap recorded
//! on the record), persistence and construction errors are fatal to the
//! current video only, and duplicate identities are routed through the
//! configured policy.

use std::path::PathBuf;

use thiserror::Error;

pub type ArchiveResult<T> = Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A caption payload could not be turned into a valid track. The track is
    /// dropped and the video proceeds without it.
    #[error("malformed caption track ({language}/{origin}): {reason}")]
    MalformedCaptionTrack {
        language: String,
        origin: String,
        reason: String,
    },

    /// The external recognizer failed or produced an empty transcript. The
    /// language is recorded as unavailable for this video.
    #[error("speech recognition failed for language {language}: {reason}")]
    RecognitionFailure { language: String, reason: String },

    /// Writing subtitle assets or store rows failed. Fatal to the current
    /// video's pipeline, never to sibling videos.
    #[error("persistence failure at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record for this video identifier already exists and the duplicate
    /// policy is `fail`.
    #[error("archive record already exists for video {0}")]
    DuplicateIdentity(String),

    /// The record could not be assembled, e.g. the video asset is missing or
    /// empty.
    #[error("cannot build archive record: {0}")]
    Construction(String),

    /// The batch was cancelled before this video committed.
    #[error("archiving cancelled")]
    Cancelled,

    /// A bounded external call exceeded its deadline.
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("metadata store error: {0}")]
    Store(#[from] libsql::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ArchiveError {
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Recoverable errors are recorded on the archive record instead of
    /// aborting the video's pipeline.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedCaptionTrack { .. }
                | Self::RecognitionFailure { .. }
                | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        let malformed = ArchiveError::MalformedCaptionTrack {
            language: "en".into(),
            origin: "auto-generated".into(),
            reason: "overlap".into(),
        };
        assert!(malformed.is_recoverable());

        let recognition = ArchiveError::RecognitionFailure {
            language: "de".into(),
            reason: "empty transcript".into(),
        };
        assert!(recognition.is_recoverable());

        assert!(!ArchiveError::Construction("missing video".into()).is_recoverable());
        assert!(!ArchiveError::DuplicateIdentity("abc".into()).is_recoverable());
    }

    #[test]
    fn messages_carry_context() {
        let err = ArchiveError::persistence(
            "/archive/subs/en.srt",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.contains("/archive/subs/en.srt"));
    }
}
