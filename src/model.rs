//! Library identity types shared across the download pipeline.
//!
//! These are deliberately thin: the surrounding library/storage layer owns
//! the full entities, the download pipeline only needs stable identity and
//! the handful of descriptive fields used for on-disk naming.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a content source (extension/provider).
pub type SourceId = i64;

/// Identifier of a manga within the library.
pub type MangaId = i64;

/// Identifier of a chapter within the library.
pub type ChapterId = i64;

/// A manga the pipeline downloads chapters for.
///
/// The source id lives on the manga: every chapter of a manga is fetched
/// through that one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manga {
    /// Unique identifier.
    pub id: MangaId,
    /// Source this manga belongs to.
    pub source_id: SourceId,
    /// Title, used for the on-disk directory name.
    pub title: String,
}

/// One downloadable chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Unique identifier.
    pub id: ChapterId,
    /// Owning manga.
    pub manga_id: MangaId,
    /// Display name, used for the on-disk artifact name.
    pub name: String,
    /// Source-specific chapter reference (path or key understood by the source).
    pub url: String,
}

impl fmt::Display for Chapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chapter {{ id: {}, name: {} }}", self.id, self.name)
    }
}
