use thiserror::Error;

use crate::cfi::CfiParseError;
use crate::store::StoreError;

/// Failures surfaced by the reading core.
///
/// Everything except [`ReaderError::FatalDocument`] and
/// [`ReaderError::DocumentClosed`] is recoverable: callers log it and keep the
/// reading flow going with whatever degraded state they have.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("malformed address: {0}")]
    Parse(#[from] CfiParseError),

    #[error("section {section} failed to load: {source}")]
    Load {
        section: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("location index is not available")]
    IndexUnavailable,

    #[error("location {location} is outside of the index (length {length})")]
    LocationOutOfRange { location: usize, length: usize },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("navigation failed: {0}")]
    Navigation(#[source] anyhow::Error),

    #[error("document error: {0}")]
    FatalDocument(String),

    #[error("no document is open")]
    DocumentClosed,
}

pub type Result<T> = std::result::Result<T, ReaderError>;

impl ReaderError {
    /// Whether the failure should block reading and be shown to the user.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReaderError::FatalDocument(_) | ReaderError::DocumentClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_document_failures_are_fatal() {
        assert!(ReaderError::FatalDocument("broken".into()).is_fatal());
        assert!(ReaderError::DocumentClosed.is_fatal());
        assert!(!ReaderError::IndexUnavailable.is_fatal());
        assert!(!ReaderError::Parse(CfiParseError::Empty).is_fatal());
        assert!(!ReaderError::Load {
            section: 3,
            source: anyhow::anyhow!("io"),
        }
        .is_fatal());
    }

    #[test]
    fn out_of_range_message_names_bounds() {
        let err = ReaderError::LocationOutOfRange {
            location: 50,
            length: 42,
        };
        assert_eq!(
            err.to_string(),
            "location 50 is outside of the index (length 42)"
        );
    }
}
