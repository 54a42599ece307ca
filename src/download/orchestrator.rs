//! Download orchestrator: the single-writer actor coordinating the queue,
//! the worker pool, and the per-chapter state machine.
//!
//! All mutable scheduling state (queue, state map, locked set, worker
//! assignments) is owned by one event loop that multiplexes the control
//! inbox and the two result channels with `tokio::select!`. Workers and
//! compression tasks communicate only by channel, never by shared memory,
//! so the loop needs no locks. Any change here must preserve that
//! single-writer invariant.
//!
//! # Example
//!
//! ```no_run
//! use mangadl_core::{Database, Downloader, DownloadConfig, DownloadStore};
//! use mangadl_core::source::registry_from_sources;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(std::path::Path::new("downloads.db")).await?;
//! let store = DownloadStore::new(db);
//! let sources = registry_from_sources(vec![]);
//! let downloader = Downloader::spawn(sources, store, DownloadConfig::new("./downloads"));
//!
//! downloader.start();
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::model::{Chapter, ChapterId, Manga, SourceId};
use crate::source::SourceRegistry;
use crate::store::{DownloadStore, SavedDownload};

use super::artifact;
use super::compress;
use super::error::DownloadError;
use super::queue::{DownloadState, QueuedDownload};
use super::worker::{DEFAULT_RETRY_DELAY, DownloadWorker, WorkerResult};

/// Fixed size of the download worker pool.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Capacity of the shared result channels.
const RESULT_CHANNEL_CAPACITY: usize = 16;

/// Shared "compress on completion" preference.
///
/// Read once per completed download to choose the post-processing branch;
/// the hosting application flips it from its settings layer.
#[derive(Debug, Clone, Default)]
pub struct CompressPreference(Arc<AtomicBool>);

impl CompressPreference {
    /// Creates a preference handle with the given initial value.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    /// Updates the preference.
    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    /// Returns the current preference.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configuration for the download orchestrator.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Root directory all chapter artifacts live under.
    pub download_root: PathBuf,
    /// Worker pool size.
    pub worker_count: usize,
    /// Compress-on-completion preference.
    pub compress: CompressPreference,
    /// Fixed delay between worker retry attempts.
    pub retry_delay: Duration,
}

impl DownloadConfig {
    /// Creates a config with the reference defaults (3 workers, no
    /// compression, 2 s retry delay).
    #[must_use]
    pub fn new(download_root: impl Into<PathBuf>) -> Self {
        Self {
            download_root: download_root.into(),
            worker_count: DEFAULT_WORKER_COUNT,
            compress: CompressPreference::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Point-in-time view of the orchestrator's state, for callers and tests.
#[derive(Debug, Clone)]
pub struct DownloaderSnapshot {
    /// Chapter ids in queue order.
    pub queue: Vec<ChapterId>,
    /// Per-chapter state entries.
    pub states: HashMap<ChapterId, DownloadState>,
    /// Chapters whose finalization is deferred.
    pub locked: HashSet<ChapterId>,
    /// Whether the worker pool is up.
    pub running: bool,
}

/// Control messages accepted by the orchestrator.
enum Command {
    Start,
    Stop,
    Add(Vec<(Manga, Vec<Chapter>)>),
    Remove(Vec<Chapter>),
    Clear,
    LockSourceFiles(ChapterId),
    UnlockSourceFiles(ChapterId),
    Snapshot(oneshot::Sender<DownloaderSnapshot>),
}

/// Result of one compression task.
struct CompressOutcome {
    chapter_id: ChapterId,
    outcome: Result<PathBuf, DownloadError>,
}

/// Handle to the download orchestrator.
///
/// All operations are asynchronous message sends and return immediately;
/// the actor applies them in order. Cloning the handle is cheap.
#[derive(Debug, Clone)]
pub struct Downloader {
    commands: mpsc::UnboundedSender<Command>,
}

impl Downloader {
    /// Spawns the orchestrator actor and returns its handle.
    ///
    /// The actor rehydrates the queue from the store before processing
    /// commands and runs until every handle is dropped.
    #[must_use]
    pub fn spawn(
        sources: Arc<dyn SourceRegistry>,
        store: DownloadStore,
        config: DownloadConfig,
    ) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let actor = Orchestrator::new(sources, store, config, inbox);
        tokio::spawn(actor.run());
        Self { commands }
    }

    /// Starts the worker pool if the queue is non-empty.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Tears down the worker pool, keeping `Completing` states.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Queues chapters for download, deduplicating by chapter id.
    pub fn add(&self, items: Vec<(Manga, Vec<Chapter>)>) {
        self.send(Command::Add(items));
    }

    /// Removes chapters from the queue; stops the pool if it empties.
    pub fn remove(&self, chapters: Vec<Chapter>) {
        self.send(Command::Remove(chapters));
    }

    /// Stops the pool and empties the queue.
    pub fn clear(&self) {
        self.send(Command::Clear);
    }

    /// Defers finalization of the chapter's artifact.
    pub fn lock_source_files(&self, chapter_id: ChapterId) {
        self.send(Command::LockSourceFiles(chapter_id));
    }

    /// Allows finalization again and re-attempts it immediately.
    pub fn unlock_source_files(&self, chapter_id: ChapterId) {
        self.send(Command::UnlockSourceFiles(chapter_id));
    }

    /// Requests a state snapshot; `None` if the actor has stopped.
    pub async fn snapshot(&self) -> Option<DownloaderSnapshot> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot(reply));
        response.await.ok()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("download orchestrator is no longer running");
        }
    }
}

/// One slot of the worker pool.
struct WorkerSlot {
    /// Dedicated assignment channel (capacity 1; pushed only when idle).
    sender: mpsc::Sender<QueuedDownload>,
    /// Current assignment, `None` when idle.
    current: Option<(ChapterId, SourceId)>,
}

/// The worker pool: a task group plus per-slot bookkeeping.
struct WorkerPool {
    tasks: JoinSet<()>,
    slots: Vec<WorkerSlot>,
}

/// The actor state. Owned exclusively by the event loop.
struct Orchestrator {
    sources: Arc<dyn SourceRegistry>,
    store: DownloadStore,
    config: DownloadConfig,
    inbox: mpsc::UnboundedReceiver<Command>,
    download_tx: mpsc::Sender<WorkerResult>,
    download_rx: mpsc::Receiver<WorkerResult>,
    compress_tx: mpsc::Sender<CompressOutcome>,
    compress_rx: mpsc::Receiver<CompressOutcome>,
    queue: Vec<QueuedDownload>,
    states: HashMap<ChapterId, DownloadState>,
    locked: HashSet<ChapterId>,
    pool: Option<WorkerPool>,
}

impl Orchestrator {
    fn new(
        sources: Arc<dyn SourceRegistry>,
        store: DownloadStore,
        config: DownloadConfig,
        inbox: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (download_tx, download_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let (compress_tx, compress_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            sources,
            store,
            config,
            inbox,
            download_tx,
            download_rx,
            compress_tx,
            compress_rx,
            queue: Vec::new(),
            states: HashMap::new(),
            locked: HashSet::new(),
            pool: None,
        }
    }

    /// The event loop: restore once, then serially apply events.
    async fn run(mut self) {
        self.restore().await;

        loop {
            tokio::select! {
                command = self.inbox.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
                Some(result) = self.download_rx.recv() => {
                    self.handle_worker_result(result).await;
                }
                Some(result) = self.compress_rx.recv() => {
                    self.handle_compress_result(result).await;
                }
            }
        }

        // Every handle dropped; tear the pool down before exiting.
        self.stop_pool().await;
        info!("download orchestrator stopped");
    }

    /// Rehydrates the queue from the persisted store, once, at startup.
    async fn restore(&mut self) {
        match self.store.find_all().await {
            Ok(saved) => {
                let restored = saved.len();
                for entry in saved {
                    if !self.is_queued(entry.chapter_id) {
                        self.queue.push(QueuedDownload::from(entry));
                    }
                }
                if restored > 0 {
                    info!(restored, "restored persisted download queue");
                }
            }
            Err(error) => warn!(%error, "failed to restore persisted download queue"),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start().await,
            Command::Stop => self.stop_pool().await,
            Command::Add(items) => {
                self.add(items).await;
                self.schedule().await;
            }
            Command::Remove(chapters) => self.remove(chapters).await,
            Command::Clear => {
                self.stop_pool().await;
                self.queue.clear();
                if let Err(error) = self.store.clear().await {
                    warn!(%error, "failed to clear persisted download queue");
                }
            }
            Command::LockSourceFiles(chapter_id) => {
                self.locked.insert(chapter_id);
                debug!(chapter_id, "source files locked");
            }
            Command::UnlockSourceFiles(chapter_id) => {
                self.locked.remove(&chapter_id);
                debug!(chapter_id, "source files unlocked");
                self.try_finalize(chapter_id).await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> DownloaderSnapshot {
        DownloaderSnapshot {
            queue: self.queue.iter().map(QueuedDownload::chapter_id).collect(),
            states: self.states.clone(),
            locked: self.locked.clone(),
            running: self.pool.is_some(),
        }
    }

    fn is_queued(&self, chapter_id: ChapterId) -> bool {
        self.queue
            .iter()
            .any(|item| item.chapter_id() == chapter_id)
    }

    /// Spins up the worker pool unless it already exists or there is
    /// nothing to download.
    #[instrument(skip(self))]
    async fn start(&mut self) {
        if self.pool.is_some() {
            debug!("worker pool already running");
            return;
        }
        if self.queue.is_empty() {
            debug!("queue empty; not starting worker pool");
            return;
        }

        let mut tasks = JoinSet::new();
        let mut slots = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            let (sender, assignments) = mpsc::channel(1);
            let worker = DownloadWorker::new(
                worker_id,
                Arc::clone(&self.sources),
                self.config.download_root.clone(),
                self.config.retry_delay,
                assignments,
                self.download_tx.clone(),
            );
            tasks.spawn(worker.run());
            slots.push(WorkerSlot {
                sender,
                current: None,
            });
        }
        self.pool = Some(WorkerPool { tasks, slots });
        info!(workers = self.config.worker_count, "download worker pool started");

        self.schedule().await;
    }

    /// Tears down the worker pool and drops every state entry that is not
    /// `Completing` (those finish via the lock set, not worker lifetime).
    async fn stop_pool(&mut self) {
        let Some(mut pool) = self.pool.take() else {
            return;
        };
        pool.slots.clear();
        pool.tasks.shutdown().await;
        self.states
            .retain(|_, state| matches!(state, DownloadState::Completing { .. }));
        info!("download worker pool stopped");
    }

    /// Queues new chapters, skipping ones already queued, already tracked,
    /// or already downloaded on disk. New entries are persisted immediately.
    async fn add(&mut self, items: Vec<(Manga, Vec<Chapter>)>) {
        let mut saved = Vec::new();
        for (manga, chapters) in items {
            for chapter in chapters {
                if self.is_queued(chapter.id) || self.states.contains_key(&chapter.id) {
                    debug!(chapter_id = chapter.id, "chapter already queued");
                    continue;
                }
                if self.already_downloaded(&manga, &chapter).await {
                    debug!(chapter_id = chapter.id, "chapter already downloaded");
                    continue;
                }
                saved.push(SavedDownload::from_entities(&manga, &chapter));
                self.queue.push(QueuedDownload::new(manga.clone(), chapter));
            }
        }

        if saved.is_empty() {
            return;
        }
        if let Err(error) = self.store.insert(&saved).await {
            warn!(%error, "failed to persist queued downloads");
        }
        info!(added = saved.len(), "chapters queued for download");
    }

    /// Checks for a finalized artifact (directory or archive) on disk.
    async fn already_downloaded(&self, manga: &Manga, chapter: &Chapter) -> bool {
        let Some(source) = self.sources.get(manga.source_id) else {
            return false;
        };
        let tmp_dir = artifact::chapter_tmp_dir(
            &self.config.download_root,
            source.name(),
            manga,
            chapter,
        );
        let Some(final_dir) = artifact::final_path(&tmp_dir) else {
            return false;
        };
        if tokio::fs::try_exists(&final_dir).await.unwrap_or(false) {
            return true;
        }
        let Some(archive) = artifact::archive_final_path(&final_dir) else {
            return false;
        };
        tokio::fs::try_exists(&archive).await.unwrap_or(false)
    }

    async fn remove(&mut self, chapters: Vec<Chapter>) {
        let ids: Vec<ChapterId> = chapters.iter().map(|chapter| chapter.id).collect();
        self.queue
            .retain(|item| !ids.contains(&item.chapter_id()));
        for chapter_id in &ids {
            // Completing entries stay tracked so already-downloaded bytes
            // still finalize; everything else is forgotten and any in-flight
            // worker result becomes stale.
            if !matches!(
                self.states.get(chapter_id),
                Some(DownloadState::Completing { .. })
            ) {
                self.states.remove(chapter_id);
            }
        }
        if let Err(error) = self.store.delete_many(&ids).await {
            warn!(%error, "failed to delete persisted downloads");
        }

        if self.queue.is_empty() {
            self.stop_pool().await;
        } else {
            self.schedule().await;
        }
    }

    /// The scheduling pass, run after every state-changing event.
    ///
    /// For each idle worker in id order: assign the first queued chapter
    /// with no state entry, not locked, and whose source is not already
    /// being downloaded by another worker. Afterwards, stop the pool if
    /// nothing is in progress.
    async fn schedule(&mut self) {
        let worker_count = match self.pool.as_ref() {
            Some(pool) => pool.slots.len(),
            None => return,
        };

        for worker_id in 0..worker_count {
            let busy_sources: HashSet<SourceId> = {
                let Some(pool) = self.pool.as_ref() else { return };
                if pool.slots[worker_id].current.is_some() {
                    continue;
                }
                pool.slots
                    .iter()
                    .filter_map(|slot| slot.current.map(|(_, source_id)| source_id))
                    .collect()
            };

            let candidate = self
                .queue
                .iter()
                .find(|item| {
                    !self.states.contains_key(&item.chapter_id())
                        && !self.locked.contains(&item.chapter_id())
                        && !busy_sources.contains(&item.source_id())
                })
                .cloned();
            let Some(item) = candidate else { continue };

            let chapter_id = item.chapter_id();
            let source_id = item.source_id();
            self.states
                .insert(chapter_id, DownloadState::Downloading { worker_id });

            let Some(pool) = self.pool.as_mut() else { return };
            pool.slots[worker_id].current = Some((chapter_id, source_id));
            debug!(worker_id, chapter_id, source_id, "chapter assigned to worker");

            // Capacity 1 and the slot is idle, so this must always succeed.
            if let Err(error) = pool.slots[worker_id].sender.try_send(item) {
                warn!(worker_id, chapter_id, %error, "failed to hand chapter to idle worker");
                pool.slots[worker_id].current = None;
                self.states.remove(&chapter_id);
            }
        }

        self.assert_source_invariant();

        if !self
            .states
            .values()
            .any(DownloadState::is_in_progress)
        {
            debug!("no downloads in progress; stopping worker pool");
            self.stop_pool().await;
        }
    }

    /// At most one worker may be downloading from any source.
    fn assert_source_invariant(&self) {
        if cfg!(debug_assertions)
            && let Some(pool) = self.pool.as_ref()
        {
            let sources: Vec<SourceId> = pool
                .slots
                .iter()
                .filter_map(|slot| slot.current.map(|(_, source_id)| source_id))
                .collect();
            let unique: HashSet<SourceId> = sources.iter().copied().collect();
            debug_assert_eq!(
                sources.len(),
                unique.len(),
                "two workers assigned the same source concurrently"
            );
        }
    }

    async fn handle_worker_result(&mut self, result: WorkerResult) {
        let chapter_id = result.item.chapter_id();

        if let Some(pool) = self.pool.as_mut()
            && let Some(slot) = pool.slots.get_mut(result.worker_id)
            && slot.current.map(|(id, _)| id) == Some(chapter_id)
        {
            slot.current = None;
        }

        let live = matches!(
            self.states.get(&chapter_id),
            Some(DownloadState::Downloading { worker_id }) if *worker_id == result.worker_id
        );
        if !live {
            debug!(chapter_id, "dropping stale download result");
            self.schedule().await;
            return;
        }

        match result.outcome {
            Ok(dir) => {
                if self.config.compress.enabled() {
                    self.states.insert(chapter_id, DownloadState::Compressing);
                    self.dispatch_compression(chapter_id, dir);
                } else {
                    self.states
                        .insert(chapter_id, DownloadState::Completing { artifact: dir });
                    self.try_finalize(chapter_id).await;
                }
            }
            Err(error) => {
                // Keep the resolved page list so a retried download skips
                // the list fetch.
                if let Some(entry) = self
                    .queue
                    .iter_mut()
                    .find(|entry| entry.chapter_id() == chapter_id)
                {
                    entry.pages = result.item.pages;
                }
                self.states
                    .insert(chapter_id, DownloadState::Failed { error });
            }
        }

        self.schedule().await;
    }

    /// Spawns the compression stage onto the pool's task group.
    fn dispatch_compression(&mut self, chapter_id: ChapterId, dir: PathBuf) {
        let Some(pool) = self.pool.as_mut() else {
            self.states.insert(
                chapter_id,
                DownloadState::Failed {
                    error: DownloadError::Compression {
                        message: "worker pool stopped before compression".to_string(),
                    },
                },
            );
            return;
        };

        let results = self.compress_tx.clone();
        pool.tasks.spawn(async move {
            let outcome = compress::compress_chapter(&dir).await;
            let _ = results.send(CompressOutcome { chapter_id, outcome }).await;
        });
        debug!(chapter_id, "compression dispatched");
    }

    async fn handle_compress_result(&mut self, result: CompressOutcome) {
        let chapter_id = result.chapter_id;
        if !matches!(self.states.get(&chapter_id), Some(DownloadState::Compressing)) {
            debug!(chapter_id, "dropping stale compression result");
            return;
        }

        match result.outcome {
            Ok(archive) => {
                self.states
                    .insert(chapter_id, DownloadState::Completing { artifact: archive });
                self.try_finalize(chapter_id).await;
            }
            Err(error) => {
                warn!(chapter_id, %error, "compression failed");
                self.states
                    .insert(chapter_id, DownloadState::Failed { error });
            }
        }

        self.schedule().await;
    }

    /// Finalizes a `Completing` chapter unless its source files are locked:
    /// atomically rename the artifact, delete the persisted record, and drop
    /// the queue entry and state.
    async fn try_finalize(&mut self, chapter_id: ChapterId) {
        if self.locked.contains(&chapter_id) {
            debug!(chapter_id, "finalization deferred; source files locked");
            return;
        }
        let Some(DownloadState::Completing { artifact }) = self.states.get(&chapter_id) else {
            return;
        };
        let artifact = artifact.clone();

        let Some(target) = artifact::final_path(&artifact) else {
            warn!(chapter_id, artifact = %artifact.display(), "artifact is not temporary");
            self.states.insert(
                chapter_id,
                DownloadState::Failed {
                    error: DownloadError::Io {
                        message: format!("artifact is not temporary: {}", artifact.display()),
                    },
                },
            );
            return;
        };

        if let Err(error) = tokio::fs::rename(&artifact, &target).await {
            warn!(chapter_id, %error, "failed to finalize artifact");
            self.states.insert(
                chapter_id,
                DownloadState::Failed {
                    error: DownloadError::io(&error),
                },
            );
            return;
        }

        if let Err(error) = self.store.delete(chapter_id).await {
            warn!(chapter_id, %error, "failed to delete persisted download");
        }
        self.queue.retain(|item| item.chapter_id() != chapter_id);
        self.states.remove(&chapter_id);
        info!(chapter_id, target = %target.display(), "chapter finalized");
    }
}
