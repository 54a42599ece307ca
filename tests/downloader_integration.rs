//! Integration tests for the download orchestrator.
//!
//! These drive the real actor with an in-memory store and a scriptable
//! in-process source, covering scheduling limits, the per-chapter state
//! machine, locking, persistence, and the compression branch.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use mangadl_core::source::registry_from_sources;
use mangadl_core::{
    Chapter, CompressPreference, Database, DownloadConfig, DownloadState, DownloadStore,
    Downloader, DownloaderSnapshot, Manga, Page, PageContent, SavedDownload, Source, SourceError,
    SourceId, SourceRegistry,
};

/// Retry delay short enough to keep retry-path tests fast.
const FAST_RETRY: Duration = Duration::from_millis(10);

/// How long `wait_for` polls before declaring a test hung.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

// ==================== Test Source ====================

/// In-process source with scriptable failures and an optional gate that
/// holds image fetches until the test releases them.
struct TestSource {
    id: SourceId,
    pages_per_chapter: u32,
    gate: Option<Arc<Semaphore>>,
    list_calls: AtomicU32,
    list_failures: AtomicU32,
}

impl TestSource {
    fn new(id: SourceId, pages_per_chapter: u32) -> Self {
        Self {
            id,
            pages_per_chapter,
            gate: None,
            list_calls: AtomicU32::new(0),
            list_failures: AtomicU32::new(0),
        }
    }

    /// Image fetches block until [`release`](Self::release) is called.
    fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    fn fail_list_times(self, n: u32) -> Self {
        self.list_failures.store(n, Ordering::SeqCst);
        self
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }
}

#[async_trait]
impl Source for TestSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn name(&self) -> &str {
        "test-source"
    }

    async fn page_list(&self, chapter: &Chapter) -> Result<Vec<Page>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.list_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::Network("scripted list failure".to_string()));
        }
        Ok((0..self.pages_per_chapter)
            .map(|index| Page::Resolved {
                index,
                content: PageContent::RemoteImage {
                    url: format!("https://img.example.com/{}/{index}.png", chapter.id),
                },
            })
            .collect())
    }

    async fn resolve_page(&self, page: &Page) -> Result<PageContent, SourceError> {
        Err(SourceError::UnresolvablePage {
            index: page.index(),
        })
    }

    async fn fetch_image(&self, _url: &str) -> Result<Vec<u8>, SourceError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| SourceError::Network("gate closed".to_string()))?;
            permit.forget();
        }
        Ok(vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00])
    }
}

// ==================== Helpers ====================

fn manga(id: i64, source_id: SourceId) -> Manga {
    Manga {
        id,
        source_id,
        title: format!("Manga {id}"),
    }
}

fn chapter(id: i64, manga_id: i64) -> Chapter {
    Chapter {
        id,
        manga_id,
        name: format!("Ch. {id}"),
        url: format!("/chapters/{id}"),
    }
}

fn config(root: &Path) -> DownloadConfig {
    let mut config = DownloadConfig::new(root);
    config.retry_delay = FAST_RETRY;
    config
}

async fn test_store() -> DownloadStore {
    let db = Database::new_in_memory().await.unwrap();
    DownloadStore::new(db)
}

fn spawn_downloader(
    sources: Vec<Arc<TestSource>>,
    store: DownloadStore,
    config: DownloadConfig,
) -> Downloader {
    let registry: Arc<dyn SourceRegistry> = registry_from_sources(
        sources
            .into_iter()
            .map(|source| source as Arc<dyn Source>)
            .collect(),
    );
    Downloader::spawn(registry, store, config)
}

/// Polls snapshots until `cond` holds, panicking after a timeout.
async fn wait_for(
    downloader: &Downloader,
    what: &str,
    cond: impl Fn(&DownloaderSnapshot) -> bool,
) -> DownloaderSnapshot {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let snapshot = downloader
            .snapshot()
            .await
            .expect("orchestrator stopped unexpectedly");
        if cond(&snapshot) {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}; last snapshot: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn downloading_count(snapshot: &DownloaderSnapshot) -> usize {
    snapshot
        .states
        .values()
        .filter(|state| matches!(state, DownloadState::Downloading { .. }))
        .count()
}

// ==================== Queue Semantics ====================

#[tokio::test]
async fn test_add_is_idempotent_per_chapter() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 1));
    let downloader = spawn_downloader(vec![source], test_store().await, config(root.path()));

    let m = manga(1, 1);
    downloader.add(vec![(m.clone(), vec![chapter(10, 1)])]);
    downloader.add(vec![(m, vec![chapter(10, 1)])]);

    let snapshot = wait_for(&downloader, "queue to settle", |s| s.queue.len() == 1).await;
    assert_eq!(snapshot.queue, vec![10]);
}

#[tokio::test]
async fn test_add_persists_to_store() {
    let root = tempfile::tempdir().unwrap();
    let store = test_store().await;
    let source = Arc::new(TestSource::new(1, 1));
    let downloader = spawn_downloader(vec![source], store.clone(), config(root.path()));

    downloader.add(vec![(manga(1, 1), vec![chapter(10, 1), chapter(11, 1)])]);
    wait_for(&downloader, "chapters queued", |s| s.queue.len() == 2).await;

    let persisted = store.find_all().await.unwrap();
    let mut ids: Vec<i64> = persisted.iter().map(|d| d.chapter_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![10, 11]);
}

#[tokio::test]
async fn test_restore_rehydrates_queue_without_states() {
    let root = tempfile::tempdir().unwrap();
    let store = test_store().await;
    store
        .insert(&[SavedDownload {
            chapter_id: 10,
            manga_id: 1,
            source_id: 1,
            manga_title: "Manga 1".to_string(),
            chapter_name: "Ch. 10".to_string(),
            chapter_url: "/chapters/10".to_string(),
        }])
        .await
        .unwrap();

    let source = Arc::new(TestSource::new(1, 1));
    let downloader = spawn_downloader(vec![source], store, config(root.path()));

    let snapshot = wait_for(&downloader, "queue restored", |s| s.queue.len() == 1).await;
    assert_eq!(snapshot.queue, vec![10]);
    assert!(snapshot.states.is_empty());
    assert!(!snapshot.running);
}

#[tokio::test]
async fn test_clear_empties_queue_and_store() {
    let root = tempfile::tempdir().unwrap();
    let store = test_store().await;
    let source = Arc::new(TestSource::new(1, 1));
    let downloader = spawn_downloader(vec![source], store.clone(), config(root.path()));

    downloader.add(vec![(manga(1, 1), vec![chapter(10, 1), chapter(11, 1)])]);
    wait_for(&downloader, "chapters queued", |s| s.queue.len() == 2).await;

    downloader.clear();
    let snapshot = wait_for(&downloader, "queue cleared", |s| s.queue.is_empty()).await;
    assert!(!snapshot.running);
    assert!(store.find_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_to_empty_stops_pool_and_store_rows() {
    let root = tempfile::tempdir().unwrap();
    let store = test_store().await;
    let source = Arc::new(TestSource::new(1, 2).gated());
    let downloader = spawn_downloader(vec![Arc::clone(&source)], store.clone(), config(root.path()));

    let m = manga(1, 1);
    let chapters = vec![chapter(10, 1), chapter(11, 1)];
    downloader.add(vec![(m, chapters.clone())]);
    downloader.start();
    wait_for(&downloader, "pool running", |s| s.running).await;

    downloader.remove(chapters);

    let snapshot = wait_for(&downloader, "pool stopped", |s| !s.running).await;
    assert!(snapshot.queue.is_empty());
    assert!(store.find_all().await.unwrap().is_empty());
}

// ==================== Scheduling ====================

#[tokio::test]
async fn test_five_sources_cap_at_worker_pool_size() {
    let root = tempfile::tempdir().unwrap();
    let sources: Vec<Arc<TestSource>> = (1..=5)
        .map(|id| Arc::new(TestSource::new(id, 1).gated()))
        .collect();
    let downloader = spawn_downloader(sources.clone(), test_store().await, config(root.path()));

    let items = (1..=5)
        .map(|id| (manga(id, id), vec![chapter(100 + id, id)]))
        .collect();
    downloader.add(items);
    downloader.start();

    let snapshot = wait_for(&downloader, "three downloads in flight", |s| {
        downloading_count(s) == 3
    })
    .await;
    assert_eq!(snapshot.states.len(), 3);
    assert_eq!(snapshot.queue.len(), 5);

    for source in &sources {
        source.release();
    }
    let snapshot = wait_for(&downloader, "all chapters finalized", |s| {
        s.queue.is_empty() && !s.running
    })
    .await;
    assert!(snapshot.states.is_empty());
}

#[tokio::test]
async fn test_same_source_chapters_download_one_at_a_time() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 1).gated());
    let downloader =
        spawn_downloader(vec![Arc::clone(&source)], test_store().await, config(root.path()));

    downloader.add(vec![(manga(1, 1), vec![chapter(10, 1), chapter(11, 1)])]);
    downloader.start();

    let snapshot = wait_for(&downloader, "first chapter in flight", |s| {
        downloading_count(s) == 1
    })
    .await;
    // Two idle workers remain, but the second chapter shares the source.
    assert_eq!(snapshot.states.len(), 1);
    assert!(matches!(
        snapshot.states.get(&10),
        Some(DownloadState::Downloading { .. })
    ));

    source.release();
    wait_for(&downloader, "both chapters finalized", |s| {
        s.queue.is_empty() && !s.running
    })
    .await;
}

// ==================== Completion & Failure ====================

#[tokio::test]
async fn test_successful_download_finalizes_artifact() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 3));
    let downloader = spawn_downloader(vec![source], test_store().await, config(root.path()));

    downloader.add(vec![(manga(1, 1), vec![chapter(10, 1)])]);
    downloader.start();

    let snapshot = wait_for(&downloader, "chapter finalized", |s| {
        s.queue.is_empty() && !s.running
    })
    .await;
    assert!(snapshot.states.is_empty());

    let final_dir = root.path().join("test-source/Manga 1/Ch. 10");
    assert!(final_dir.is_dir(), "artifact should be renamed into place");
    assert!(!final_dir.with_file_name("Ch. 10.tmp").exists());
    assert_eq!(std::fs::read_dir(&final_dir).unwrap().count(), 3);
}

#[tokio::test]
async fn test_failed_download_stays_queued_without_rename() {
    let root = tempfile::tempdir().unwrap();
    // Source 1 reports zero pages (hard failure); source 2 is gated so the
    // pool stays up long enough to observe the Failed state.
    let failing = Arc::new(TestSource::new(1, 0));
    let healthy = Arc::new(TestSource::new(2, 1).gated());
    let downloader = spawn_downloader(
        vec![failing, Arc::clone(&healthy)],
        test_store().await,
        config(root.path()),
    );

    downloader.add(vec![
        (manga(1, 1), vec![chapter(10, 1)]),
        (manga(2, 2), vec![chapter(20, 2)]),
    ]);
    downloader.start();

    let snapshot = wait_for(&downloader, "first chapter failed", |s| {
        matches!(s.states.get(&10), Some(DownloadState::Failed { .. }))
    })
    .await;
    assert!(snapshot.queue.contains(&10), "failed chapter stays queued");

    healthy.release();
    let snapshot = wait_for(&downloader, "pool idle", |s| !s.running).await;
    // The failed chapter survives the auto-stop in the queue; its Failed
    // state does not.
    assert_eq!(snapshot.queue, vec![10]);
    assert!(snapshot.states.is_empty());
    assert!(!root.path().join("test-source/Manga 1/Ch. 10").exists());
}

#[tokio::test]
async fn test_page_list_retry_then_success() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 1).fail_list_times(1));
    let downloader =
        spawn_downloader(vec![Arc::clone(&source)], test_store().await, config(root.path()));

    downloader.add(vec![(manga(1, 1), vec![chapter(10, 1)])]);
    downloader.start();

    wait_for(&downloader, "chapter finalized", |s| {
        s.queue.is_empty() && !s.running
    })
    .await;
    assert_eq!(source.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_page_list_failing_twice_fails_chapter() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 1).fail_list_times(2));
    let downloader =
        spawn_downloader(vec![Arc::clone(&source)], test_store().await, config(root.path()));

    downloader.add(vec![(manga(1, 1), vec![chapter(10, 1)])]);
    downloader.start();

    let snapshot = wait_for(&downloader, "pool idle after failure", |s| !s.running).await;
    assert_eq!(snapshot.queue, vec![10]);
    assert_eq!(source.list_calls.load(Ordering::SeqCst), 2);
}

// ==================== Locking ====================

#[tokio::test]
async fn test_lock_defers_finalization_until_unlock() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 1).gated());
    let downloader =
        spawn_downloader(vec![Arc::clone(&source)], test_store().await, config(root.path()));

    downloader.add(vec![(manga(1, 1), vec![chapter(10, 1)])]);
    downloader.start();
    wait_for(&downloader, "chapter in flight", |s| downloading_count(s) == 1).await;

    downloader.lock_source_files(10);
    source.release();

    let snapshot = wait_for(&downloader, "chapter parked in Completing", |s| {
        matches!(s.states.get(&10), Some(DownloadState::Completing { .. }))
    })
    .await;
    assert!(snapshot.locked.contains(&10));

    let tmp_dir = root.path().join("test-source/Manga 1/Ch. 10.tmp");
    let final_dir = root.path().join("test-source/Manga 1/Ch. 10");
    assert!(tmp_dir.is_dir(), "artifact must stay temporary while locked");
    assert!(!final_dir.exists());

    // The Completing entry survives the auto-idle stop.
    let snapshot = wait_for(&downloader, "pool idle", |s| !s.running).await;
    assert!(matches!(
        snapshot.states.get(&10),
        Some(DownloadState::Completing { .. })
    ));

    downloader.unlock_source_files(10);
    let snapshot = wait_for(&downloader, "chapter finalized", |s| s.queue.is_empty()).await;
    assert!(snapshot.states.is_empty());
    assert!(final_dir.is_dir());
    assert!(!tmp_dir.exists());
}

// ==================== Compression ====================

#[tokio::test]
async fn test_compression_branch_produces_cbz() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 2));
    let mut config = config(root.path());
    config.compress = CompressPreference::new(true);
    let downloader = spawn_downloader(vec![source], test_store().await, config);

    downloader.add(vec![(manga(1, 1), vec![chapter(10, 1)])]);
    downloader.start();

    wait_for(&downloader, "chapter finalized", |s| {
        s.queue.is_empty() && !s.running
    })
    .await;

    let archive_path = root.path().join("test-source/Manga 1/Ch. 10.cbz");
    assert!(archive_path.is_file());
    assert!(!root.path().join("test-source/Manga 1/Ch. 10").exists());
    assert!(!root.path().join("test-source/Manga 1/Ch. 10.tmp").exists());

    let archive =
        zip::ZipArchive::new(std::fs::File::open(&archive_path).unwrap()).unwrap();
    assert_eq!(archive.len(), 2);
}

#[tokio::test]
async fn test_readd_of_compressed_dotted_chapter_is_skipped() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 1));
    let mut config = config(root.path());
    config.compress = CompressPreference::new(true);
    let downloader = spawn_downloader(vec![source], test_store().await, config);

    // A dotted name must not confuse the on-disk dedup check: the archive
    // is "Vol.1 Ch.1.cbz", not "Vol.1 Ch.cbz".
    let dotted = Chapter {
        id: 10,
        manga_id: 1,
        name: "Vol.1 Ch.1".to_string(),
        url: "/chapters/10".to_string(),
    };
    downloader.add(vec![(manga(1, 1), vec![dotted.clone()])]);
    downloader.start();
    wait_for(&downloader, "chapter finalized", |s| {
        s.queue.is_empty() && !s.running
    })
    .await;
    assert!(
        root.path()
            .join("test-source/Manga 1/Vol.1 Ch.1.cbz")
            .is_file()
    );

    downloader.add(vec![(manga(1, 1), vec![dotted])]);

    let snapshot = wait_for(&downloader, "re-add processed", |_| true).await;
    assert!(
        snapshot.queue.is_empty(),
        "already-downloaded chapter was re-queued: {:?}",
        snapshot.queue
    );
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_start_with_empty_queue_is_noop() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 1));
    let downloader = spawn_downloader(vec![source], test_store().await, config(root.path()));

    downloader.start();

    let snapshot = wait_for(&downloader, "snapshot", |_| true).await;
    assert!(!snapshot.running);
}

#[tokio::test]
async fn test_stop_preserves_queue() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::new(1, 2).gated());
    let downloader =
        spawn_downloader(vec![Arc::clone(&source)], test_store().await, config(root.path()));

    downloader.add(vec![(manga(1, 1), vec![chapter(10, 1), chapter(11, 1)])]);
    downloader.start();
    wait_for(&downloader, "chapter in flight", |s| downloading_count(s) == 1).await;

    downloader.stop();

    let snapshot = wait_for(&downloader, "pool stopped", |s| !s.running).await;
    assert_eq!(snapshot.queue, vec![10, 11]);
    assert!(snapshot.states.is_empty());
}
