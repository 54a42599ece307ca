//! Download worker: the per-chapter page-fetch pipeline.
//!
//! Each worker owns a dedicated inbox and processes one [`QueuedDownload`]
//! at a time: resolve the page list (with retry), skip pages already on
//! disk, fetch/resolve/write the rest, and report a terminal result over
//! the shared result channel. Failures are captured into the result; the
//! worker itself never panics across the channel boundary.
//!
//! # Retry budget
//!
//! Deliberately small and fixed (see the constants below): one retry for
//! page-list and page resolution, two for the page body fetch. This bounds
//! worst-case latency per chapter while tolerating transient network blips.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::model::Chapter;
use crate::source::{Page, PageContent, Source, SourceRegistry};

use super::artifact;
use super::error::DownloadError;
use super::queue::QueuedDownload;

/// Retries after a failed page-list fetch.
pub const PAGE_LIST_RETRIES: u32 = 1;

/// Retries after a failed page resolution.
pub const PAGE_RESOLVE_RETRIES: u32 = 1;

/// Retries after a failed page body fetch/write.
pub const PAGE_FETCH_RETRIES: u32 = 2;

/// Default fixed delay between retry attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Terminal result of one worker assignment.
///
/// Carries the item back so the orchestrator can restore the cached page
/// list into the queue entry on failure.
#[derive(Debug)]
pub(crate) struct WorkerResult {
    /// Pool slot that produced the result.
    pub worker_id: usize,
    /// The processed item, pages populated if the list fetch succeeded.
    pub item: QueuedDownload,
    /// Working directory on success.
    pub outcome: Result<PathBuf, DownloadError>,
}

/// One pool slot of the download worker pool.
pub(crate) struct DownloadWorker {
    id: usize,
    sources: Arc<dyn SourceRegistry>,
    download_root: PathBuf,
    retry_delay: Duration,
    inbox: mpsc::Receiver<QueuedDownload>,
    results: mpsc::Sender<WorkerResult>,
}

impl DownloadWorker {
    pub(crate) fn new(
        id: usize,
        sources: Arc<dyn SourceRegistry>,
        download_root: PathBuf,
        retry_delay: Duration,
        inbox: mpsc::Receiver<QueuedDownload>,
        results: mpsc::Sender<WorkerResult>,
    ) -> Self {
        Self {
            id,
            sources,
            download_root,
            retry_delay,
            inbox,
            results,
        }
    }

    /// Blocks on the inbox and processes assignments until the channel or
    /// the result channel closes (both happen on pool teardown).
    pub(crate) async fn run(mut self) {
        while let Some(mut item) = self.inbox.recv().await {
            let chapter_id = item.chapter_id();
            debug!(worker_id = self.id, chapter_id, "worker picked up chapter");

            let outcome = self.process(&mut item).await;
            match &outcome {
                Ok(dir) => {
                    info!(worker_id = self.id, chapter_id, dir = %dir.display(), "chapter downloaded");
                }
                Err(error) => {
                    warn!(worker_id = self.id, chapter_id, %error, "chapter download failed");
                }
            }

            let result = WorkerResult {
                worker_id: self.id,
                item,
                outcome,
            };
            if self.results.send(result).await.is_err() {
                // Orchestrator gone; nothing left to report to.
                break;
            }
        }
    }

    /// Runs the full page pipeline for one chapter.
    #[instrument(skip(self, item), fields(worker_id = self.id, chapter_id = item.chapter_id()))]
    async fn process(&self, item: &mut QueuedDownload) -> Result<PathBuf, DownloadError> {
        let source = self
            .sources
            .get(item.source_id())
            .ok_or(DownloadError::SourceMissing {
                source_id: item.source_id(),
            })?;

        if item.pages.is_none() {
            let pages =
                fetch_page_list(source.as_ref(), &item.chapter, self.retry_delay).await?;
            if pages.is_empty() {
                return Err(DownloadError::PageListEmpty);
            }
            debug!(pages = pages.len(), "resolved page list");
            item.pages = Some(pages);
        }

        let dir = artifact::chapter_tmp_dir(
            &self.download_root,
            source.name(),
            &item.manga,
            &item.chapter,
        );
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::io(&e))?;

        let existing = scan_existing_pages(&dir).await?;
        if !existing.is_empty() {
            debug!(skipped = existing.len(), "resuming partial download");
        }

        let Some(pages) = item.pages.as_mut() else {
            return Err(DownloadError::PageList {
                message: "page list missing after fetch".to_string(),
            });
        };

        let total = pages.len();
        let mut failed = 0usize;

        // Best-effort: a failed page marks the chapter errored but never
        // aborts the remaining pages.
        for page in pages.iter_mut() {
            let index = page.index();
            if existing.contains(&index) {
                continue;
            }

            if page.is_reference() {
                match resolve_page(source.as_ref(), page, self.retry_delay).await {
                    Ok(content) => *page = page.clone().resolve(content),
                    Err(error) => {
                        warn!(index, %error, "page resolution failed");
                        failed += 1;
                        continue;
                    }
                }
            }

            let Page::Resolved { content, .. } = &*page else {
                failed += 1;
                continue;
            };

            if let Err(error) =
                write_page(source.as_ref(), &dir, index, content, self.retry_delay).await
            {
                warn!(index, %error, "page write failed");
                failed += 1;
            }
        }

        if failed > 0 {
            Err(DownloadError::Pages { failed, total })
        } else {
            Ok(dir)
        }
    }
}

/// Fetches the page list, retrying once after a fixed delay.
async fn fetch_page_list(
    source: &dyn Source,
    chapter: &Chapter,
    retry_delay: Duration,
) -> Result<Vec<Page>, DownloadError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match source.page_list(chapter).await {
            Ok(pages) => return Ok(pages),
            Err(error) if attempt <= PAGE_LIST_RETRIES => {
                warn!(attempt, %error, "page list fetch failed; retrying");
                tokio::time::sleep(retry_delay).await;
            }
            Err(error) => {
                return Err(DownloadError::PageList {
                    message: error.to_string(),
                });
            }
        }
    }
}

/// Resolves a reference page, retrying once after a fixed delay.
async fn resolve_page(
    source: &dyn Source,
    page: &Page,
    retry_delay: Duration,
) -> Result<PageContent, DownloadError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match source.resolve_page(page).await {
            Ok(content) => return Ok(content),
            Err(error) if attempt <= PAGE_RESOLVE_RETRIES => {
                warn!(attempt, index = page.index(), %error, "page resolution failed; retrying");
                tokio::time::sleep(retry_delay).await;
            }
            Err(error) => {
                return Err(DownloadError::PageFetch {
                    message: error.to_string(),
                });
            }
        }
    }
}

/// Writes one resolved page: fetch/decode the body, write it to a `.tmp`
/// file, sniff the extension, and atomically rename. The whole attempt is
/// retried twice with a fixed delay.
async fn write_page(
    source: &dyn Source,
    dir: &Path,
    index: u32,
    content: &PageContent,
    retry_delay: Duration,
) -> Result<(), DownloadError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match write_page_once(source, dir, index, content).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt <= PAGE_FETCH_RETRIES => {
                warn!(attempt, index, %error, "page fetch failed; retrying");
                tokio::time::sleep(retry_delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn write_page_once(
    source: &dyn Source,
    dir: &Path,
    index: u32,
    content: &PageContent,
) -> Result<(), DownloadError> {
    let (bytes, extension) = match content {
        PageContent::RemoteImage { url } => {
            let bytes = source
                .fetch_image(url)
                .await
                .map_err(|e| DownloadError::PageFetch {
                    message: e.to_string(),
                })?;
            let extension = artifact::sniff_image_extension(&bytes);
            (bytes, extension)
        }
        PageContent::InlineImage { data } => {
            let bytes = BASE64.decode(data).map_err(|e| DownloadError::PageFetch {
                message: format!("invalid inline image data: {e}"),
            })?;
            let extension = artifact::sniff_image_extension(&bytes);
            (bytes, extension)
        }
        PageContent::Text { text } => {
            (text.as_bytes().to_vec(), Some(artifact::TEXT_EXTENSION))
        }
    };

    let stem = artifact::page_stem(index);
    let tmp_path = dir.join(format!("{stem}{}", artifact::TMP_SUFFIX));
    tokio::fs::write(&tmp_path, &bytes)
        .await
        .map_err(|e| DownloadError::io(&e))?;

    let final_name = match extension {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    };
    tokio::fs::rename(&tmp_path, dir.join(final_name))
        .await
        .map_err(|e| DownloadError::io(&e))?;

    Ok(())
}

/// Scans the working directory for pages from a previous run.
///
/// Files carrying the tmp suffix are incomplete artifacts from a crash and
/// are deleted; the indices of complete page files are returned so those
/// pages can be skipped.
async fn scan_existing_pages(dir: &Path) -> Result<HashSet<u32>, DownloadError> {
    let mut existing = HashSet::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| DownloadError::io(&e))?;

    while let Some(entry) = entries.next_entry().await.map_err(|e| DownloadError::io(&e))? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(artifact::TMP_SUFFIX) {
            debug!(file = name, "removing incomplete page artifact");
            tokio::fs::remove_file(entry.path())
                .await
                .map_err(|e| DownloadError::io(&e))?;
            continue;
        }
        if let Some(index) = artifact::parse_page_index(name) {
            existing.insert(index);
        }
    }

    Ok(existing)
}
