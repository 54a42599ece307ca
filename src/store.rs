//! Durable download-queue store.
//!
//! Persists a snapshot of every queued chapter so the queue survives process
//! restarts. Rows are written when a chapter is enqueued, deleted when it
//! finalizes or is removed, and read back exactly once at orchestrator
//! startup to rehydrate the in-memory queue. The store is never consulted
//! mid-session.
//!
//! # Example
//!
//! ```ignore
//! use mangadl_core::{Database, DownloadStore};
//!
//! let db = Database::new_in_memory().await?;
//! let store = DownloadStore::new(db);
//! let saved = store.find_all().await?;
//! ```

use sqlx::FromRow;
use thiserror::Error;
use tracing::instrument;

use crate::db::Database;
use crate::model::{Chapter, ChapterId, Manga, MangaId, SourceId};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store operation errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A persisted snapshot of one queued chapter download.
///
/// Carries only identity plus the descriptive fields needed to rebuild the
/// on-disk path after a restart.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SavedDownload {
    /// Chapter identifier (primary key).
    pub chapter_id: ChapterId,
    /// Owning manga identifier.
    pub manga_id: MangaId,
    /// Source the chapter downloads through.
    pub source_id: SourceId,
    /// Manga title at enqueue time.
    pub manga_title: String,
    /// Chapter name at enqueue time.
    pub chapter_name: String,
    /// Source-specific chapter reference.
    pub chapter_url: String,
}

impl SavedDownload {
    /// Builds a snapshot from the in-memory entities.
    #[must_use]
    pub fn from_entities(manga: &Manga, chapter: &Chapter) -> Self {
        Self {
            chapter_id: chapter.id,
            manga_id: manga.id,
            source_id: manga.source_id,
            manga_title: manga.title.clone(),
            chapter_name: chapter.name.clone(),
            chapter_url: chapter.url.clone(),
        }
    }

    /// Rebuilds the in-memory entities from the snapshot.
    #[must_use]
    pub fn into_entities(self) -> (Manga, Chapter) {
        let manga = Manga {
            id: self.manga_id,
            source_id: self.source_id,
            title: self.manga_title,
        };
        let chapter = Chapter {
            id: self.chapter_id,
            manga_id: self.manga_id,
            name: self.chapter_name,
            url: self.chapter_url,
        };
        (manga, chapter)
    }
}

/// Repository for persisted download-queue rows.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    db: Database,
}

impl DownloadStore {
    /// Creates a new store over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns every persisted download in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn find_all(&self) -> Result<Vec<SavedDownload>> {
        let rows = sqlx::query_as::<_, SavedDownload>(
            "SELECT chapter_id, manga_id, source_id, manga_title, chapter_name, chapter_url \
             FROM downloads ORDER BY created_at, chapter_id",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Inserts the given snapshots, ignoring chapters already present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any insert fails.
    #[instrument(skip(self, downloads), fields(count = downloads.len()))]
    pub async fn insert(&self, downloads: &[SavedDownload]) -> Result<()> {
        for download in downloads {
            sqlx::query(
                "INSERT OR IGNORE INTO downloads \
                 (chapter_id, manga_id, source_id, manga_title, chapter_name, chapter_url) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(download.chapter_id)
            .bind(download.manga_id)
            .bind(download.source_id)
            .bind(&download.manga_title)
            .bind(&download.chapter_name)
            .bind(&download.chapter_url)
            .execute(self.db.pool())
            .await?;
        }

        Ok(())
    }

    /// Deletes the row for one chapter. Missing rows are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, chapter_id: ChapterId) -> Result<()> {
        sqlx::query("DELETE FROM downloads WHERE chapter_id = ?")
            .bind(chapter_id)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    /// Deletes the rows for the given chapters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any delete fails.
    #[instrument(skip(self, chapter_ids), fields(count = chapter_ids.len()))]
    pub async fn delete_many(&self, chapter_ids: &[ChapterId]) -> Result<()> {
        for chapter_id in chapter_ids {
            self.delete(*chapter_id).await?;
        }

        Ok(())
    }

    /// Deletes every persisted download.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM downloads")
            .execute(self.db.pool())
            .await?;

        Ok(())
    }
}
