use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::store::{DownloadStore, StoreError, StoredDownload};
use super::task::{DownloadEvent, DownloadState, DownloadTask, TaskObservers};

const STATUS_CHANNEL_CAPACITY: usize = 1024;
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// The ordered set of tasks waiting for or undergoing download.
///
/// The list lives in a watch channel and is replaced as a whole on every
/// mutation, so a snapshot is never half updated. Every mutation writes the
/// store while holding that channel's lock.
#[derive(Debug)]
pub struct DownloadQueue {
    store: DownloadStore,
    state: watch::Sender<Vec<Arc<DownloadTask>>>,
    status_tx: broadcast::Sender<DownloadEvent>,
    progress_tx: broadcast::Sender<DownloadEvent>,
}

impl DownloadQueue {
    pub fn new(store: DownloadStore) -> Self {
        let (state, _) = watch::channel(Vec::new());
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);

        Self {
            store,
            state,
            status_tx,
            progress_tx,
        }
    }

    pub fn store(&self) -> &DownloadStore {
        &self.store
    }

    /// Entries persisted by a previous run, in queue order.
    pub fn stored_entries(&self) -> Vec<StoredDownload> {
        self.store.entries()
    }

    fn observers(&self) -> TaskObservers {
        TaskObservers {
            status_tx: self.status_tx.clone(),
            progress_tx: self.progress_tx.clone(),
            on_status: Some(Arc::new(|event: &DownloadEvent| {
                if event.state.is_terminal() {
                    event.task.detach();
                }
            })),
        }
    }

    /// Append tasks and mark them queued.
    ///
    /// The batch is persisted before it becomes visible. If persisting fails
    /// nothing changes. Tasks whose episode is already queued, or repeated
    /// within the batch, are dropped. Returns how many tasks were added.
    pub fn add_all(&self, tasks: Vec<Arc<DownloadTask>>) -> Result<usize, StoreError> {
        if tasks.is_empty() {
            return Ok(0);
        }

        let mut result = Ok(0);
        self.state.send_if_modified(|current| {
            let mut seen: HashSet<i64> = current.iter().map(|t| t.episode().id).collect();
            let fresh: Vec<Arc<DownloadTask>> = tasks
                .iter()
                .filter(|t| seen.insert(t.episode().id))
                .cloned()
                .collect();
            if fresh.is_empty() {
                return false;
            }

            if let Err(e) = self.store.add_all(&fresh) {
                result = Err(e);
                return false;
            }

            for task in &fresh {
                task.attach(self.observers());
                task.set_state(DownloadState::Queue);
            }

            let mut next = Vec::with_capacity(current.len() + fresh.len());
            next.extend(current.iter().cloned());
            next.extend(fresh.iter().cloned());
            *current = next;
            result = Ok(fresh.len());
            true
        });

        if let Ok(added) = result {
            if added < tasks.len() {
                debug!("Skipped {} already queued download(s)", tasks.len() - added);
            }
            debug!("Queued {} download(s)", added);
        }
        result
    }

    /// Put a failed or reset task that is still in the list back in line.
    pub(crate) fn requeue(&self, task: &Arc<DownloadTask>) {
        task.attach(self.observers());
        task.set_state(DownloadState::Queue);
    }

    /// Remove one task. Returns `false` when it was not queued.
    pub fn remove(&self, task: &Arc<DownloadTask>) -> bool {
        self.remove_where(|t| Arc::ptr_eq(t, task)) > 0
    }

    pub fn remove_episodes(&self, episode_ids: &[i64]) -> usize {
        let ids: HashSet<i64> = episode_ids.iter().copied().collect();
        self.remove_where(|t| ids.contains(&t.episode().id))
    }

    pub fn remove_anime(&self, anime_id: i64) -> usize {
        self.remove_where(|t| t.anime().id == anime_id)
    }

    /// Drop every task. Queued and running ones go back to not downloaded.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        self.state.send_if_modified(|current| {
            if current.is_empty() {
                return false;
            }
            if let Err(e) = self.store.clear() {
                warn!("Failed to clear persisted queue: {}", e);
            }
            for task in current.iter() {
                reset(task);
            }
            removed = current.len();
            *current = Vec::new();
            true
        });
        removed
    }

    fn remove_where(&self, matches: impl Fn(&Arc<DownloadTask>) -> bool) -> usize {
        let mut removed = 0;
        self.state.send_if_modified(|current| {
            let (gone, kept): (Vec<_>, Vec<_>) = current.iter().cloned().partition(|t| matches(t));
            if gone.is_empty() {
                return false;
            }

            let episode_ids: Vec<i64> = gone.iter().map(|t| t.episode().id).collect();
            if let Err(e) = self.store.remove_episodes(&episode_ids) {
                warn!("Failed to remove {} persisted download(s): {}", gone.len(), e);
            }
            for task in &gone {
                reset(task);
            }

            removed = gone.len();
            *current = kept;
            true
        });
        removed
    }

    /// Current list of tasks.
    pub fn state(&self) -> Vec<Arc<DownloadTask>> {
        self.state.borrow().clone()
    }

    /// Watch the list; fires whenever tasks are added or removed.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Arc<DownloadTask>>> {
        self.state.subscribe()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().is_empty()
    }

    pub fn count(&self, predicate: impl Fn(&DownloadTask) -> bool) -> usize {
        self.state.borrow().iter().filter(|t| predicate(t)).count()
    }

    pub fn filter(&self, predicate: impl Fn(&DownloadTask) -> bool) -> Vec<Arc<DownloadTask>> {
        self.state
            .borrow()
            .iter()
            .filter(|t| predicate(t))
            .cloned()
            .collect()
    }

    pub fn find(&self, predicate: impl Fn(&DownloadTask) -> bool) -> Option<Arc<DownloadTask>> {
        self.state.borrow().iter().find(|t| predicate(t)).cloned()
    }

    pub fn none(&self, predicate: impl Fn(&DownloadTask) -> bool) -> bool {
        !self.state.borrow().iter().any(|t| predicate(t))
    }

    pub fn group_by<K: Ord>(
        &self,
        key: impl Fn(&DownloadTask) -> K,
    ) -> BTreeMap<K, Vec<Arc<DownloadTask>>> {
        let mut groups: BTreeMap<K, Vec<Arc<DownloadTask>>> = BTreeMap::new();
        for task in self.state.borrow().iter() {
            groups.entry(key(task)).or_default().push(Arc::clone(task));
        }
        groups
    }

    pub fn contains_episode(&self, episode_id: i64) -> bool {
        !self.none(|t| t.episode().id == episode_id)
    }

    /// Status changes of all queued tasks, starting with the ones downloading
    /// right now.
    pub fn status_flow(&self) -> BoxStream<'static, DownloadEvent> {
        self.flow(&self.status_tx)
    }

    /// Progress changes of all queued tasks, starting with the ones
    /// downloading right now.
    pub fn progress_flow(&self) -> BoxStream<'static, DownloadEvent> {
        self.flow(&self.progress_tx)
    }

    fn flow(&self, tx: &broadcast::Sender<DownloadEvent>) -> BoxStream<'static, DownloadEvent> {
        // Subscribe before taking the snapshot so nothing falls in between.
        let rx = tx.subscribe();
        let replay: Vec<DownloadEvent> = self
            .filter(|t| t.state() == DownloadState::Downloading)
            .into_iter()
            .map(|task| DownloadEvent {
                state: task.state(),
                progress: task.progress(),
                task,
            })
            .collect();

        stream::iter(replay).chain(broadcast_stream(rx)).boxed()
    }
}

/// Detach a removed task and reset it if it was still queued or running.
fn reset(task: &Arc<DownloadTask>) {
    task.detach();
    if task.state().is_active() {
        task.set_state(DownloadState::NotDownloaded);
    }
}

fn broadcast_stream(
    rx: broadcast::Receiver<DownloadEvent>,
) -> BoxStream<'static, DownloadEvent> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Download event subscriber lagged, skipped {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Anime, Episode, MemorySource};
    use std::time::Duration;
    use tokio::time::timeout;

    fn task(anime_id: i64, episode_id: i64) -> Arc<DownloadTask> {
        let anime = Anime {
            id: anime_id,
            source_id: 1,
            title: format!("Anime {}", anime_id),
        };
        let episode = Episode {
            id: episode_id,
            anime_id,
            name: format!("Episode {}", episode_id),
            scanlator: None,
            source_order: episode_id,
        };
        DownloadTask::new(Arc::new(MemorySource::new(1, "mem")), anime, episode, false, None)
    }

    async fn next(flow: &mut BoxStream<'static, DownloadEvent>) -> Option<DownloadEvent> {
        timeout(Duration::from_millis(100), flow.next()).await.ok().flatten()
    }

    #[test]
    fn test_add_all_marks_queued_in_order() {
        let queue = DownloadQueue::new(DownloadStore::in_memory());
        queue.add_all(vec![task(1, 1), task(1, 2)]).unwrap();
        queue.add_all(vec![task(2, 3)]).unwrap();

        let ids: Vec<i64> = queue.state().iter().map(|t| t.episode().id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(queue.count(|t| t.state() == DownloadState::Queue), 3);
        assert_eq!(queue.store().len(), 3);
    }

    #[test]
    fn test_add_all_keeps_one_task_per_episode() {
        let queue = DownloadQueue::new(DownloadStore::in_memory());
        let first = task(1, 1);
        let twin = task(1, 1);
        assert_eq!(queue.add_all(vec![first.clone(), twin.clone()]).unwrap(), 1);
        assert_eq!(queue.add_all(vec![task(1, 1), task(1, 2)]).unwrap(), 1);

        let ids: Vec<i64> = queue.state().iter().map(|t| t.episode().id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(Arc::ptr_eq(&queue.state()[0], &first));
        assert_eq!(twin.state(), DownloadState::NotDownloaded);
        assert_eq!(queue.store().len(), 2);
    }

    #[test]
    fn test_failed_persist_leaves_queue_untouched() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("queue.json");
        std::fs::create_dir_all(path.join("blocker")).unwrap();
        let queue = DownloadQueue::new(DownloadStore::open(&path));

        let task = task(1, 1);
        assert!(queue.add_all(vec![task.clone()]).is_err());
        assert!(queue.is_empty());
        assert_eq!(task.state(), DownloadState::NotDownloaded);
    }

    #[test]
    fn test_remove_resets_and_is_idempotent() {
        let queue = DownloadQueue::new(DownloadStore::in_memory());
        let first = task(1, 1);
        let second = task(1, 2);
        queue.add_all(vec![first.clone(), second.clone()]).unwrap();
        first.set_state(DownloadState::Downloading);

        assert!(queue.remove(&first));
        assert_eq!(first.state(), DownloadState::NotDownloaded);
        assert!(!first.is_attached());

        assert!(!queue.remove(&first));
        assert_eq!(second.state(), DownloadState::Queue);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.store().len(), 1);
    }

    #[test]
    fn test_remove_by_episode_and_anime() {
        let queue = DownloadQueue::new(DownloadStore::in_memory());
        queue
            .add_all(vec![task(1, 1), task(1, 2), task(2, 3), task(2, 4)])
            .unwrap();

        assert_eq!(queue.remove_episodes(&[2, 99]), 1);
        assert_eq!(queue.remove_anime(2), 2);
        assert!(queue.contains_episode(1));
        assert!(!queue.contains_episode(3));

        let remaining = queue.state();
        assert_eq!(queue.clear(), 1);
        assert_eq!(remaining[0].state(), DownloadState::NotDownloaded);
        assert!(queue.store().is_empty());
    }

    #[test]
    fn test_query_helpers() {
        let queue = DownloadQueue::new(DownloadStore::in_memory());
        queue.add_all(vec![task(1, 1), task(2, 2), task(2, 3)]).unwrap();

        let groups = queue.group_by(|t| t.anime().id);
        assert_eq!(groups[&1].len(), 1);
        assert_eq!(groups[&2].len(), 2);
        assert_eq!(queue.find(|t| t.episode().id == 3).unwrap().anime().id, 2);
        assert!(queue.none(|t| t.state() == DownloadState::Downloading));
        assert_eq!(queue.filter(|t| t.anime().id == 2).len(), 2);
    }

    #[tokio::test]
    async fn test_flows_replay_downloading_tasks() {
        let queue = DownloadQueue::new(DownloadStore::in_memory());
        let running = task(1, 1);
        queue.add_all(vec![running.clone(), task(1, 2)]).unwrap();
        running.set_state(DownloadState::Downloading);
        running.update_progress(30);

        let mut progress = queue.progress_flow();
        let replayed = next(&mut progress).await.unwrap();
        assert!(Arc::ptr_eq(&replayed.task, &running));
        assert_eq!(replayed.progress, 30);

        running.update_progress(60);
        assert_eq!(next(&mut progress).await.unwrap().progress, 60);
    }

    #[tokio::test]
    async fn test_no_events_after_terminal_state() {
        let queue = DownloadQueue::new(DownloadStore::in_memory());
        let task = task(1, 1);
        queue.add_all(vec![task.clone()]).unwrap();
        let mut status = queue.status_flow();
        let mut progress = queue.progress_flow();

        task.set_state(DownloadState::Downloading);
        task.set_state(DownloadState::Error);
        assert_eq!(next(&mut status).await.unwrap().state, DownloadState::Downloading);
        assert_eq!(next(&mut status).await.unwrap().state, DownloadState::Error);

        task.update_progress(80);
        task.set_state(DownloadState::NotDownloaded);
        assert!(next(&mut status).await.is_none());
        assert!(next(&mut progress).await.is_none());
    }

    #[tokio::test]
    async fn test_removed_task_emits_nothing() {
        let queue = DownloadQueue::new(DownloadStore::in_memory());
        let task = task(1, 1);
        queue.add_all(vec![task.clone()]).unwrap();
        task.set_state(DownloadState::Downloading);

        let mut status = queue.status_flow();
        let mut progress = queue.progress_flow();
        assert!(next(&mut status).await.is_some());
        assert!(next(&mut progress).await.is_some());

        queue.remove(&task);
        task.update_progress(50);
        assert!(next(&mut status).await.is_none());
        assert!(next(&mut progress).await.is_none());
    }
}
