use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};

use crate::source::{Anime, Episode, Source, Video};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotDownloaded,
    Queue,
    Downloading,
    Downloaded,
    Error,
}

impl DownloadState {
    /// Final states of one enqueue cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadState::Downloaded | DownloadState::Error)
    }

    /// Queued or in flight.
    pub fn is_active(self) -> bool {
        matches!(self, DownloadState::Queue | DownloadState::Downloading)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DownloadState::NotDownloaded => "not downloaded",
            DownloadState::Queue => "queued",
            DownloadState::Downloading => "downloading",
            DownloadState::Downloaded => "downloaded",
            DownloadState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub source_id: i64,
    pub anime_id: i64,
    pub episode_id: i64,
}

/// A status or progress change of one task.
#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub task: Arc<DownloadTask>,
    pub state: DownloadState,
    pub progress: u8,
}

pub(crate) type EventCallback = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;

/// Sinks a queue wires into each task it tracks.
#[derive(Clone)]
pub(crate) struct TaskObservers {
    pub status_tx: broadcast::Sender<DownloadEvent>,
    pub progress_tx: broadcast::Sender<DownloadEvent>,
    pub on_status: Option<EventCallback>,
}

struct TaskInner {
    progress: u8,
    video: Option<Video>,
    part_streams: Vec<watch::Receiver<u8>>,
    observers: Option<TaskObservers>,
}

/// One episode to download.
///
/// State changes and progress updates go through [`set_state`](Self::set_state),
/// [`compare_and_set`](Self::compare_and_set) and
/// [`update_progress`](Self::update_progress). Each of them stores the new
/// value and publishes the matching event under the same lock, so no value
/// is observable without its notification.
pub struct DownloadTask {
    source: Arc<dyn Source>,
    anime: Anime,
    episode: Episode,
    change_downloader: bool,
    inner: Mutex<TaskInner>,
    state_tx: watch::Sender<DownloadState>,
    downloaded_images: AtomicU32,
}

impl DownloadTask {
    pub fn new(
        source: Arc<dyn Source>,
        anime: Anime,
        episode: Episode,
        change_downloader: bool,
        video: Option<Video>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(DownloadState::NotDownloaded);

        Arc::new(Self {
            source,
            anime,
            episode,
            change_downloader,
            inner: Mutex::new(TaskInner {
                progress: 0,
                video,
                part_streams: Vec::new(),
                observers: None,
            }),
            state_tx,
            downloaded_images: AtomicU32::new(0),
        })
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn anime(&self) -> &Anime {
        &self.anime
    }

    pub fn episode(&self) -> &Episode {
        &self.episode
    }

    pub fn change_downloader(&self) -> bool {
        self.change_downloader
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            source_id: self.source.id(),
            anime_id: self.anime.id,
            episode_id: self.episode.id,
        }
    }

    pub fn state(&self) -> DownloadState {
        *self.state_tx.borrow()
    }

    /// Watch the state; the downloader treats a reset to
    /// [`DownloadState::NotDownloaded`] as cancellation.
    pub fn subscribe_state(&self) -> watch::Receiver<DownloadState> {
        self.state_tx.subscribe()
    }

    pub fn progress(&self) -> u8 {
        self.lock().progress
    }

    pub fn video(&self) -> Option<Video> {
        self.lock().video.clone()
    }

    pub fn set_video(&self, video: Video) {
        self.lock().video = Some(video);
    }

    pub fn downloaded_images(&self) -> u32 {
        self.downloaded_images.load(Ordering::Relaxed)
    }

    pub fn increment_downloaded_images(&self) -> u32 {
        self.downloaded_images.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register progress streams of the parts making up the current video.
    pub fn attach_part_streams(&self, streams: impl IntoIterator<Item = watch::Receiver<u8>>) {
        self.lock().part_streams.extend(streams);
    }

    pub fn part_streams(&self) -> Vec<watch::Receiver<u8>> {
        self.lock().part_streams.clone()
    }

    pub(crate) fn attach(&self, observers: TaskObservers) {
        self.lock().observers = Some(observers);
    }

    pub(crate) fn detach(&self) {
        self.lock().observers = None;
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.lock().observers.is_some()
    }

    /// Move to `state`. Returns the published event, or `None` when the
    /// state did not change.
    pub fn set_state(self: &Arc<Self>, state: DownloadState) -> Option<DownloadEvent> {
        self.transition(None, state).ok().flatten()
    }

    /// Move to `new` only if the task is currently in `expected`.
    pub fn compare_and_set(self: &Arc<Self>, expected: DownloadState, new: DownloadState) -> bool {
        self.transition(Some(expected), new).is_ok()
    }

    fn transition(
        self: &Arc<Self>,
        expected: Option<DownloadState>,
        state: DownloadState,
    ) -> Result<Option<DownloadEvent>, DownloadState> {
        let (event, callback) = {
            let mut inner = self.lock();
            let current = self.state();
            if expected.is_some_and(|e| e != current) {
                return Err(current);
            }
            if current == state {
                return Ok(None);
            }

            if matches!(state, DownloadState::Queue | DownloadState::Downloading) {
                inner.progress = 0;
                inner.part_streams.clear();
            }
            self.state_tx.send_replace(state);

            let event = DownloadEvent {
                task: Arc::clone(self),
                state,
                progress: inner.progress,
            };
            let callback = inner.observers.as_ref().and_then(|observers| {
                let _ = observers.status_tx.send(event.clone());
                observers.on_status.clone()
            });
            (event, callback)
        };

        if let Some(callback) = callback {
            callback(&event);
        }
        Ok(Some(event))
    }

    /// Record overall progress (0-100) and publish it.
    ///
    /// Decreases are ignored while downloading. Once the task is terminal
    /// the value is still recorded but nothing is published.
    pub fn update_progress(self: &Arc<Self>, value: u8) -> Option<DownloadEvent> {
        let value = value.min(100);
        let mut inner = self.lock();
        let state = self.state();

        if value == inner.progress {
            return None;
        }
        if value < inner.progress && (state == DownloadState::Downloading || state.is_terminal()) {
            return None;
        }

        inner.progress = value;
        if state.is_terminal() {
            return None;
        }

        let event = DownloadEvent {
            task: Arc::clone(self),
            state,
            progress: value,
        };
        if let Some(observers) = &inner.observers {
            let _ = observers.progress_tx.send(event.clone());
        }
        Some(event)
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("key", &self.key())
            .field("episode", &self.episode.name)
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}

impl fmt::Display for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.anime.title, self.episode.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn task() -> Arc<DownloadTask> {
        let anime = Anime {
            id: 10,
            source_id: 1,
            title: "Frieren".to_string(),
        };
        let episode = Episode {
            id: 100,
            anime_id: 10,
            name: "Episode 1".to_string(),
            scanlator: None,
            source_order: 1,
        };
        DownloadTask::new(Arc::new(MemorySource::new(1, "mem")), anime, episode, false, None)
    }

    fn observers() -> (
        TaskObservers,
        broadcast::Receiver<DownloadEvent>,
        broadcast::Receiver<DownloadEvent>,
    ) {
        let (status_tx, status_rx) = broadcast::channel(16);
        let (progress_tx, progress_rx) = broadcast::channel(16);
        let observers = TaskObservers {
            status_tx,
            progress_tx,
            on_status: None,
        };
        (observers, status_rx, progress_rx)
    }

    #[test]
    fn test_state_transitions_publish_once() {
        let task = task();
        let (observers, mut status_rx, _) = observers();
        task.attach(observers);

        assert!(task.set_state(DownloadState::Queue).is_some());
        assert!(task.set_state(DownloadState::Queue).is_none());
        assert_eq!(status_rx.try_recv().unwrap().state, DownloadState::Queue);
        assert!(status_rx.try_recv().is_err());
    }

    #[test]
    fn test_compare_and_set() {
        let task = task();
        task.set_state(DownloadState::Queue);

        assert!(!task.compare_and_set(DownloadState::Downloading, DownloadState::Downloaded));
        assert!(task.compare_and_set(DownloadState::Queue, DownloadState::Downloading));
        assert_eq!(task.state(), DownloadState::Downloading);
    }

    #[test]
    fn test_progress_is_monotonic_while_downloading() {
        let task = task();
        let (observers, _, mut progress_rx) = observers();
        task.attach(observers);
        task.set_state(DownloadState::Queue);
        task.set_state(DownloadState::Downloading);

        assert!(task.update_progress(40).is_some());
        assert!(task.update_progress(30).is_none());
        assert!(task.update_progress(40).is_none());
        assert!(task.update_progress(250).is_some());
        assert_eq!(task.progress(), 100);

        let values: Vec<u8> = std::iter::from_fn(|| progress_rx.try_recv().ok())
            .map(|e| e.progress)
            .collect();
        assert_eq!(values, vec![40, 100]);
    }

    #[test]
    fn test_terminal_state_stops_progress_events() {
        let task = task();
        let (observers, _, mut progress_rx) = observers();
        task.attach(observers);
        task.set_state(DownloadState::Queue);
        task.set_state(DownloadState::Downloading);
        task.set_state(DownloadState::Error);

        assert!(task.update_progress(70).is_none());
        assert_eq!(task.progress(), 70);
        assert!(progress_rx.try_recv().is_err());
    }

    #[test]
    fn test_status_callback_runs_after_publish() {
        let task = task();
        let (mut observers, _, _) = observers();
        observers.on_status = Some(Arc::new(|event: &DownloadEvent| {
            if event.state.is_terminal() {
                event.task.detach();
            }
        }));
        task.attach(observers);

        task.set_state(DownloadState::Queue);
        assert!(task.is_attached());
        task.set_state(DownloadState::Downloaded);
        assert!(!task.is_attached());
    }

    #[test]
    fn test_requeue_resets_progress() {
        let task = task();
        task.set_state(DownloadState::Queue);
        task.set_state(DownloadState::Downloading);
        task.update_progress(50);
        task.set_state(DownloadState::Error);

        task.set_state(DownloadState::Queue);
        assert_eq!(task.progress(), 0);
        assert_eq!(task.increment_downloaded_images(), 1);
    }
}
