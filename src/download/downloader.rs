use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tokio::task::{AbortHandle, Id, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::engine::{TrackTransfer, TransferEngine, TransferOptions};
use super::error::DownloadError;
use super::progress::{ProgressSettings, spawn_progress_watcher};
use super::provider::DownloadProvider;
use super::queue::DownloadQueue;
use super::selector::{VideoPreferences, select_best_video};
use super::store::StoreError;
use super::task::{DownloadState, DownloadTask};
use crate::source::{Anime, EntityLookup, Episode, SourceManager, Video};

#[derive(Debug, Clone)]
pub struct DownloaderOptions {
    pub max_concurrent_downloads: usize,
    pub downloads_per_source: usize,
    /// Segmented (multi-range) transfers unless a task asks for the other
    /// strategy.
    pub prefer_segmented: bool,
    pub download_tracks: bool,
    pub min_free_space: u64,
    pub queue_warning_threshold: usize,
    pub episodes_per_source_warning_threshold: usize,
    pub preferences: VideoPreferences,
    pub progress: ProgressSettings,
    pub transfer: TransferOptions,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            downloads_per_source: 1,
            prefer_segmented: true,
            download_tracks: true,
            min_free_space: 200 * 1024 * 1024,
            queue_warning_threshold: 20,
            episodes_per_source_warning_threshold: 10,
            preferences: VideoPreferences::default(),
            progress: ProgressSettings::default(),
            transfer: TransferOptions::default(),
        }
    }
}

/// How episodes are put in the queue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub auto_start: bool,
    /// Use the other transfer strategy for these episodes.
    pub change_downloader: bool,
    /// Download this exact video instead of resolving one.
    pub video: Option<Video>,
}

/// Outcome of queueing episodes by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub queued: usize,
    /// Already downloaded or already queued.
    pub skipped: usize,
    /// Ids the catalog or source registry could not resolve.
    pub missing: Vec<i64>,
}

struct SchedulerJob {
    handle: JoinHandle<()>,
    halt: oneshot::Sender<()>,
}

struct Shared {
    queue: DownloadQueue,
    provider: DownloadProvider,
    sources: SourceManager,
    lookup: Arc<dyn EntityLookup>,
    options: DownloaderOptions,
    engine: TransferEngine,
    running: watch::Sender<bool>,
    wake: Notify,
    job: Mutex<Option<SchedulerJob>>,
}

impl Shared {
    fn lock_job(&self) -> MutexGuard<'_, Option<SchedulerJob>> {
        self.job.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drains the queue with bounded concurrency.
pub struct Downloader {
    shared: Arc<Shared>,
}

impl Downloader {
    pub fn new(
        queue: DownloadQueue,
        provider: DownloadProvider,
        sources: SourceManager,
        lookup: Arc<dyn EntityLookup>,
        options: DownloaderOptions,
    ) -> Self {
        let (running, _) = watch::channel(false);
        let engine = TransferEngine::new(options.transfer.clone());

        Self {
            shared: Arc::new(Shared {
                queue,
                provider,
                sources,
                lookup,
                options,
                engine,
                running,
                wake: Notify::new(),
                job: Mutex::new(None),
            }),
        }
    }

    pub fn queue(&self) -> &DownloadQueue {
        &self.shared.queue
    }

    pub fn provider(&self) -> &DownloadProvider {
        &self.shared.provider
    }

    pub fn options(&self) -> &DownloaderOptions {
        &self.shared.options
    }

    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.shared.running.subscribe()
    }

    /// Rebuild the queue from the store. Entries whose episode or source can
    /// no longer be resolved are dropped. Returns the number of tasks queued.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let shared = &self.shared;
        let mut tasks = Vec::new();
        let mut unresolved = Vec::new();

        for entry in shared.queue.stored_entries() {
            if shared.queue.contains_episode(entry.episode_id) {
                continue;
            }

            let resolved = shared.lookup.episode(entry.episode_id).await.and_then(
                |(anime, episode)| {
                    shared
                        .sources
                        .get(anime.source_id)
                        .map(|source| (source, anime, episode))
                },
            );

            match resolved {
                Some((source, anime, episode)) => tasks.push(DownloadTask::new(
                    source,
                    anime,
                    episode,
                    entry.change_downloader,
                    None,
                )),
                None => {
                    warn!("Dropping queued episode {}: no longer resolvable", entry.episode_id);
                    unresolved.push(entry.episode_id);
                }
            }
        }

        if !unresolved.is_empty() {
            shared.queue.store().remove_episodes(&unresolved)?;
        }

        let count = shared.queue.add_all(tasks)?;
        if count > 0 {
            info!("Restored {} queued download(s)", count);
        }
        Ok(count)
    }

    /// Queue episodes of one anime, newest first. Episodes already on disk or
    /// already queued are skipped. Returns how many were queued.
    pub fn queue_episodes(
        &self,
        anime: &Anime,
        episodes: Vec<Episode>,
        options: EnqueueOptions,
    ) -> Result<usize, DownloadError> {
        if episodes.is_empty() {
            return Ok(0);
        }

        let shared = &self.shared;
        let source = shared
            .sources
            .get(anime.source_id)
            .ok_or(DownloadError::UnknownSource(anime.source_id))?;
        let was_empty = shared.queue.is_empty();

        let mut requested = HashSet::new();
        let mut episodes: Vec<Episode> = episodes
            .into_iter()
            .filter(|e| requested.insert(e.id))
            .filter(|e| !shared.provider.is_downloaded(e, anime, source.as_ref()))
            .filter(|e| !shared.queue.contains_episode(e.id))
            .collect();
        episodes.sort_by(|a, b| b.source_order.cmp(&a.source_order));

        let tasks: Vec<Arc<DownloadTask>> = episodes
            .into_iter()
            .map(|episode| {
                DownloadTask::new(
                    Arc::clone(&source),
                    anime.clone(),
                    episode,
                    options.change_downloader,
                    options.video.clone(),
                )
            })
            .collect();

        if tasks.is_empty() {
            return Ok(0);
        }
        let count = shared.queue.add_all(tasks)?;
        debug!("Queued {} episode(s) of {}", count, anime.title);

        if options.auto_start && was_empty {
            self.warn_on_large_queue();
            self.start();
        }
        Ok(count)
    }

    /// Queue episodes by id, resolving them through the catalog.
    pub async fn queue_episode_ids(
        &self,
        episode_ids: &[i64],
        options: EnqueueOptions,
    ) -> Result<QueueReport, DownloadError> {
        let mut report = QueueReport::default();
        let mut by_anime: BTreeMap<i64, (Anime, Vec<Episode>)> = BTreeMap::new();

        for &id in episode_ids {
            match self.shared.lookup.episode(id).await {
                Some((anime, episode)) if self.shared.sources.get(anime.source_id).is_some() => {
                    by_anime
                        .entry(anime.id)
                        .or_insert_with(|| (anime, Vec::new()))
                        .1
                        .push(episode);
                }
                _ => report.missing.push(id),
            }
        }

        let was_empty = self.shared.queue.is_empty();
        let requested: usize = by_anime.values().map(|(_, e)| e.len()).sum();
        for (anime, episodes) in by_anime.into_values() {
            let per_anime = EnqueueOptions {
                auto_start: false,
                ..options.clone()
            };
            report.queued += self.queue_episodes(&anime, episodes, per_anime)?;
        }
        report.skipped = requested - report.queued;

        if options.auto_start && was_empty && report.queued > 0 {
            self.warn_on_large_queue();
            self.start();
        }
        Ok(report)
    }

    fn warn_on_large_queue(&self) {
        let options = &self.shared.options;
        let queue = &self.shared.queue;
        let queued = queue.len();
        let max_per_source = queue
            .group_by(|t| t.key().source_id)
            .values()
            .map(Vec::len)
            .max()
            .unwrap_or(0);

        if queued > options.queue_warning_threshold
            || max_per_source > options.episodes_per_source_warning_threshold
        {
            warn!(
                "{} downloads queued ({} from a single source); large queues may get you rate limited",
                queued, max_per_source
            );
        }
    }

    /// Start draining the queue. Tasks that are not downloaded are marked
    /// queued again. Returns `false` when there is nothing to download.
    pub fn start(&self) -> bool {
        let shared = &self.shared;
        let mut job = shared.lock_job();

        let pending = shared
            .queue
            .filter(|t| t.state() != DownloadState::Downloaded);
        for task in &pending {
            if !task.state().is_active() {
                shared.queue.requeue(task);
            }
        }

        if job.is_some() {
            shared.wake.notify_one();
            return !pending.is_empty();
        }
        if pending.is_empty() {
            return false;
        }

        let (halt, halt_rx) = oneshot::channel();
        shared.running.send_replace(true);
        *job = Some(SchedulerJob {
            handle: tokio::spawn(run_scheduler(Arc::clone(shared), halt_rx)),
            halt,
        });
        info!("Downloader started with {} pending download(s)", pending.len());
        true
    }

    /// Stop the scheduler and wait until every worker is gone. Returns whether
    /// it was running.
    async fn halt(&self) -> bool {
        let job = self.shared.lock_job().take();
        let Some(job) = job else {
            return false;
        };

        let _ = job.halt.send(());
        if let Err(e) = job.handle.await {
            if e.is_panic() {
                error!("Download scheduler panicked: {}", e);
            }
        }
        self.shared.running.send_replace(false);
        true
    }

    /// Stop downloading; downloads in flight are marked failed.
    pub async fn stop(&self) {
        self.halt().await;
        for task in self
            .shared
            .queue
            .filter(|t| t.state() == DownloadState::Downloading)
        {
            task.set_state(DownloadState::Error);
        }
        info!("Downloader stopped");
    }

    /// Stop downloading; downloads in flight go back to the queue.
    pub async fn pause(&self) {
        self.halt().await;
        for task in self
            .shared
            .queue
            .filter(|t| t.state() == DownloadState::Downloading)
        {
            task.set_state(DownloadState::Queue);
        }
        info!("Downloader paused");
    }

    pub async fn clear_queue(&self) -> usize {
        self.halt().await;
        self.shared.queue.clear()
    }

    /// Replace the queue with `tasks`, e.g. after the user reordered it.
    pub async fn update_queue(&self, tasks: Vec<Arc<DownloadTask>>) -> Result<(), StoreError> {
        if tasks.is_empty() {
            self.clear_queue().await;
            self.stop().await;
            return Ok(());
        }

        let was_running = self.is_running();
        self.pause().await;
        self.shared.queue.clear();
        self.shared.queue.add_all(tasks)?;

        if was_running {
            self.start();
        }
        Ok(())
    }

    /// Resolve once the scheduler has nothing left to do.
    pub async fn wait_idle(&self) {
        let mut running = self.shared.running.subscribe();
        let _ = running.wait_for(|r| !*r).await;
    }
}

type ActiveWorkers = HashMap<Id, (Arc<DownloadTask>, AbortHandle)>;

async fn run_scheduler(shared: Arc<Shared>, mut halt: oneshot::Receiver<()>) {
    let slots = Arc::new(Semaphore::new(shared.options.max_concurrent_downloads.max(1)));
    let mut queue_rx = shared.queue.subscribe();
    let mut workers = JoinSet::new();
    let mut active: ActiveWorkers = HashMap::new();

    loop {
        let snapshot = queue_rx.borrow_and_update().clone();

        // Workers of tasks that left the queue give their slot back now.
        for (task, handle) in active.values() {
            let queued = snapshot.iter().any(|t| Arc::ptr_eq(t, task));
            if !queued && task.state() != DownloadState::Downloaded {
                handle.abort();
            }
        }

        launch_ready(&shared, &snapshot, &slots, &mut workers, &mut active);

        if active.is_empty() {
            let mut job = shared.lock_job();
            let halted = job.is_none();
            if !halted && !shared.queue.none(|t| t.state() == DownloadState::Queue) {
                continue;
            }
            *job = None;
            shared.running.send_replace(false);
            info!("Download queue idle");
            return;
        }

        tokio::select! {
            Some(joined) = workers.join_next_with_id() => {
                let id = match joined {
                    Ok((id, ())) => id,
                    Err(e) => {
                        if e.is_panic() {
                            error!("Download worker panicked: {}", e);
                        }
                        e.id()
                    }
                };
                if let Some((task, _)) = active.remove(&id) {
                    if task.state() == DownloadState::Downloading {
                        task.set_state(DownloadState::Error);
                    }
                }
            }
            changed = queue_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shared.wake.notified() => {}
            _ = &mut halt => {
                debug!("Halting {} download worker(s)", active.len());
                workers.shutdown().await;
                return;
            }
        }
    }
}

/// Start workers for queued tasks in queue order, within the global and the
/// per-source limits.
fn launch_ready(
    shared: &Arc<Shared>,
    snapshot: &[Arc<DownloadTask>],
    slots: &Arc<Semaphore>,
    workers: &mut JoinSet<()>,
    active: &mut ActiveWorkers,
) {
    let mut per_source: HashMap<i64, usize> = HashMap::new();
    for (task, _) in active.values() {
        *per_source.entry(task.key().source_id).or_default() += 1;
    }
    let per_source_limit = shared.options.downloads_per_source.max(1);

    for task in snapshot {
        if task.state() != DownloadState::Queue
            || active.values().any(|(t, _)| Arc::ptr_eq(t, task))
        {
            continue;
        }

        let running = per_source.entry(task.key().source_id).or_default();
        if *running >= per_source_limit {
            continue;
        }
        let Ok(permit) = Arc::clone(slots).try_acquire_owned() else {
            break;
        };
        *running += 1;

        debug!("Starting download of {}", task);
        let handle = workers.spawn(worker(Arc::clone(shared), Arc::clone(task), permit));
        active.insert(handle.id(), (Arc::clone(task), handle));
    }
}

async fn worker(shared: Arc<Shared>, task: Arc<DownloadTask>, _permit: OwnedSemaphorePermit) {
    match download(&shared, &task).await {
        Ok(()) => {
            info!("Downloaded {}", task);
            shared.queue.remove(&task);
        }
        Err(DownloadError::Cancelled) => debug!("Download of {} cancelled", task),
        Err(e) => {
            error!("Download of {} failed: {}", task, e);
            if task.state().is_active() {
                task.set_state(DownloadState::Error);
            }
        }
    }
}

async fn download(shared: &Shared, task: &Arc<DownloadTask>) -> Result<(), DownloadError> {
    let options = &shared.options;
    let source = Arc::clone(task.source());
    let anime = task.anime();
    let episode = task.episode();

    shared.provider.anime_dir(anime, source.as_ref())?;
    shared.provider.ensure_free_space(options.min_free_space)?;
    let _watcher = spawn_progress_watcher(Arc::clone(task), options.progress);

    let video = match task.video() {
        Some(video) => video,
        None => {
            let hosters = source
                .hosters(anime, episode)
                .await
                .map_err(|e| DownloadError::Resolution(e.to_string()))?;
            let video = select_best_video(&hosters, &options.preferences).ok_or_else(|| {
                DownloadError::Resolution(format!("no video offered for {}", task))
            })?;
            debug!("Selected {} for {}", video, task);
            task.set_video(video.clone());
            video
        }
    };

    if !task.compare_and_set(DownloadState::Queue, DownloadState::Downloading) {
        return Err(DownloadError::Cancelled);
    }

    let work_dir = shared.provider.work_dir(episode, anime, source.as_ref());
    let episode_dir = shared.provider.episode_path(episode, anime, source.as_ref());
    let segmented = options.prefer_segmented != task.change_downloader();
    let cancel = task.subscribe_state();

    let mut headers = source.headers();
    headers.extend(video.headers.clone());

    let mut transfers: Vec<TrackTransfer> = Vec::new();
    let video_file = work_dir.join(DownloadProvider::video_file_name(anime, episode, &video));
    transfers.push(
        shared
            .engine
            .plan(
                source.as_ref(),
                &video.url,
                &headers,
                &work_dir.join("video"),
                &video_file,
                segmented,
                &cancel,
            )
            .await?,
    );

    if options.download_tracks {
        let tracks = video
            .audio_tracks
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("audio-{}", i), t, "m4a"))
            .chain(
                video
                    .subtitle_tracks
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (format!("subtitle-{}", i), t, "srt")),
            );

        for (dir, track, fallback_ext) in tracks {
            let file =
                DownloadProvider::track_file_name(anime, episode, &track.lang, &track.url, fallback_ext);
            transfers.push(
                shared
                    .engine
                    .plan(
                        source.as_ref(),
                        &track.url,
                        &headers,
                        &work_dir.join(dir),
                        &work_dir.join(file),
                        false,
                        &cancel,
                    )
                    .await?,
            );
        }
    }

    task.attach_part_streams(transfers.iter().flat_map(TrackTransfer::progress_streams));

    for transfer in &mut transfers {
        shared
            .engine
            .run(Arc::clone(&source), transfer, cancel.clone())
            .await?;
        shared.engine.merge(transfer).await?;
        task.increment_downloaded_images();
    }

    if task.state() != DownloadState::Downloading {
        return Err(DownloadError::Cancelled);
    }
    shared.provider.finalize(&work_dir, &episode_dir)?;

    task.update_progress(100);
    if !task.compare_and_set(DownloadState::Downloading, DownloadState::Downloaded) {
        return Err(DownloadError::Cancelled);
    }
    Ok(())
}
