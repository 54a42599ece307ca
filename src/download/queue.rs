//! In-memory queue entry and per-chapter state machine types.

use std::path::PathBuf;

use crate::model::{Chapter, ChapterId, Manga, SourceId};
use crate::source::Page;
use crate::store::SavedDownload;

use super::error::DownloadError;

/// One queued chapter download.
///
/// `pages` starts empty and is populated by the worker on the first fetch
/// attempt, then written back into the queue entry on failure so a retried
/// download skips the page-list round trip. The queue holds at most one
/// entry per chapter id.
#[derive(Debug, Clone)]
pub struct QueuedDownload {
    /// Owning manga (carries the source id).
    pub manga: Manga,
    /// The chapter to download.
    pub chapter: Chapter,
    /// Lazily-populated, cached page list.
    pub pages: Option<Vec<Page>>,
}

impl QueuedDownload {
    /// Creates a fresh queue entry with no cached pages.
    #[must_use]
    pub fn new(manga: Manga, chapter: Chapter) -> Self {
        Self {
            manga,
            chapter,
            pages: None,
        }
    }

    /// Chapter identifier (queue uniqueness key).
    #[must_use]
    pub fn chapter_id(&self) -> ChapterId {
        self.chapter.id
    }

    /// Source this download goes through.
    #[must_use]
    pub fn source_id(&self) -> SourceId {
        self.manga.source_id
    }
}

impl From<SavedDownload> for QueuedDownload {
    fn from(saved: SavedDownload) -> Self {
        let (manga, chapter) = saved.into_entities();
        Self::new(manga, chapter)
    }
}

/// Per-chapter download state.
///
/// At most one entry exists per chapter id; absence means "queued but not
/// yet scheduled" or "no longer tracked".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    /// Assigned to a worker and actively downloading.
    Downloading {
        /// Pool slot handling the chapter.
        worker_id: usize,
    },
    /// Raw directory complete, archive in flight.
    Compressing,
    /// Artifact finished but not yet finalized (possibly lock-deferred).
    Completing {
        /// Temporary artifact path (directory or archive).
        artifact: PathBuf,
    },
    /// Terminal failure; the chapter stays queued for a later retry.
    Failed {
        /// What went wrong.
        error: DownloadError,
    },
}

impl DownloadState {
    /// Returns `true` while a worker or compressor still owns the chapter.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Downloading { .. } | Self::Compressing)
    }
}
