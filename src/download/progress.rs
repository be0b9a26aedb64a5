//! Folds the per-part progress streams of a task into its overall progress.

use futures_util::future::select_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::trace;

use super::task::DownloadTask;

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub(crate) struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressSettings {
    /// Quiet period after a change before the mean is published.
    pub debounce: Duration,
    /// How often to look for the video and its parts before they exist.
    pub resolve_poll: Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            resolve_poll: Duration::from_millis(50),
        }
    }
}

/// Mean of the current values of all streams, 0 when there are none.
pub fn mean_progress(streams: &[watch::Receiver<u8>]) -> u8 {
    if streams.is_empty() {
        return 0;
    }
    let sum: u32 = streams.iter().map(|rx| *rx.borrow() as u32).sum();
    (sum / streams.len() as u32) as u8
}

pub(crate) fn spawn_progress_watcher(
    task: Arc<DownloadTask>,
    settings: ProgressSettings,
) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(watch_progress(task, settings)))
}

async fn watch_progress(task: Arc<DownloadTask>, settings: ProgressSettings) {
    // Progress stays at 0 until a video is resolved and split into parts.
    let mut streams = loop {
        if !task.state().is_active() {
            return;
        }
        if task.video().is_some() {
            let streams = task.part_streams();
            if !streams.is_empty() {
                break streams;
            }
        }
        sleep(settings.resolve_poll).await;
    };

    let mut open: Vec<usize> = (0..streams.len()).collect();
    task.update_progress(mean_progress(&streams));

    while !open.is_empty() {
        let (result, position) = {
            let pending = streams
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| open.contains(i))
                .map(|(_, rx)| Box::pin(rx.changed()));
            let (result, position, _) = select_all(pending).await;
            (result, position)
        };
        if result.is_err() {
            open.remove(position);
        }

        sleep(settings.debounce).await;
        if !task.state().is_active() {
            return;
        }

        let mean = mean_progress(&streams);
        trace!("{}: {}%", task, mean);
        task.update_progress(mean);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::task::DownloadState;
    use crate::source::{Anime, Episode, MemorySource, Video};

    fn task() -> Arc<DownloadTask> {
        let anime = Anime {
            id: 1,
            source_id: 1,
            title: "A".to_string(),
        };
        let episode = Episode {
            id: 1,
            anime_id: 1,
            name: "E".to_string(),
            scanlator: None,
            source_order: 0,
        };
        DownloadTask::new(Arc::new(MemorySource::new(1, "mem")), anime, episode, false, None)
    }

    fn settings() -> ProgressSettings {
        ProgressSettings {
            debounce: Duration::from_millis(5),
            resolve_poll: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_mean_progress() {
        let (a, rx_a) = watch::channel(100u8);
        let (_b, rx_b) = watch::channel(50u8);
        assert_eq!(mean_progress(&[rx_a.clone(), rx_b]), 75);
        drop(a);
        assert_eq!(mean_progress(&[rx_a]), 100);
        assert_eq!(mean_progress(&[]), 0);
    }

    #[tokio::test]
    async fn test_watcher_reports_final_mean() {
        let task = task();
        task.set_state(DownloadState::Queue);
        let _watcher = spawn_progress_watcher(task.clone(), settings());

        sleep(Duration::from_millis(20)).await;
        assert_eq!(task.progress(), 0);

        task.set_state(DownloadState::Downloading);
        task.set_video(Video::new("mem://a.mp4", "a"));
        let (first, rx_first) = watch::channel(0u8);
        let (second, rx_second) = watch::channel(0u8);
        task.attach_part_streams([rx_first, rx_second]);

        first.send_replace(100);
        second.send_replace(40);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(task.progress(), 70);

        second.send_replace(100);
        drop(first);
        drop(second);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(task.progress(), 100);
    }

    #[tokio::test]
    async fn test_watcher_exits_when_task_leaves_queue() {
        let task = task();
        task.set_state(DownloadState::Queue);
        let watcher = tokio::spawn(watch_progress(task.clone(), settings()));

        task.set_state(DownloadState::NotDownloaded);
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
    }
}
