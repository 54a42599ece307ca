//! Error taxonomy for the download pipeline.
//!
//! Worker and compression failures are converted into result messages and
//! carried across channels; they never cross the channel boundary as panics
//! and never terminate the orchestrator. Variants hold owned strings so the
//! type stays `Clone` for `Failed` states and snapshots.

use thiserror::Error;

use crate::model::SourceId;

/// A chapter-level download failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    /// The source reported zero pages. Terminal; not retried beyond the
    /// list-fetch retry.
    #[error("source returned an empty page list")]
    PageListEmpty,

    /// Fetching the page list failed after the retry budget.
    #[error("failed to fetch page list: {message}")]
    PageList {
        /// Last underlying error.
        message: String,
    },

    /// A single page could not be resolved or fetched after the retry
    /// budget. Logged per page; the chapter escalates via [`Self::Pages`].
    #[error("failed to fetch page: {message}")]
    PageFetch {
        /// Last underlying error.
        message: String,
    },

    /// One or more pages failed after all pages were attempted.
    #[error("{failed} of {total} pages failed to download")]
    Pages {
        /// Number of pages that failed irrecoverably.
        failed: usize,
        /// Total pages in the chapter.
        total: usize,
    },

    /// No source registered for the chapter's source id.
    #[error("no source registered for source id {source_id}")]
    SourceMissing {
        /// The missing source id.
        source_id: SourceId,
    },

    /// Local filesystem failure.
    #[error("I/O error: {message}")]
    Io {
        /// Underlying error text.
        message: String,
    },

    /// Archiving the completed directory failed. Not retried.
    #[error("compression failed: {message}")]
    Compression {
        /// Underlying error text.
        message: String,
    },
}

impl DownloadError {
    /// Wraps a filesystem error.
    #[must_use]
    pub fn io(error: &std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        assert_eq!(
            DownloadError::PageListEmpty.to_string(),
            "source returned an empty page list"
        );
        assert_eq!(
            DownloadError::Pages {
                failed: 2,
                total: 10
            }
            .to_string(),
            "2 of 10 pages failed to download"
        );
        assert!(
            DownloadError::SourceMissing { source_id: 4 }
                .to_string()
                .contains('4')
        );
    }

    #[test]
    fn test_error_is_clone_and_comparable() {
        let error = DownloadError::PageList {
            message: "timeout".to_string(),
        };
        assert_eq!(error.clone(), error);
    }
}
