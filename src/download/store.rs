//! Durable mirror of the download queue.
//!
//! Holds just enough identity to rebuild each task after a restart. The file
//! is rewritten as a whole on every mutation, through a temp file and rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

use super::task::DownloadTask;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write queue file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode queue: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDownload {
    pub source_id: i64,
    pub anime_id: i64,
    pub episode_id: i64,
    pub order: u64,
    #[serde(default)]
    pub change_downloader: bool,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    entries: Vec<StoredDownload>,
}

impl StoreData {
    fn next_order(&self) -> u64 {
        self.entries.iter().map(|e| e.order + 1).max().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct DownloadStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
}

impl DownloadStore {
    /// Open the store at `path`. A missing file is an empty queue; an
    /// unreadable one is logged and treated as empty.
    pub fn open(path: &Path) -> Self {
        let data = match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<StoreData>(&content) {
                Ok(data) => {
                    debug!("Loaded {} queued downloads from {:?}", data.entries.len(), path);
                    data
                }
                Err(e) => {
                    warn!("Ignoring corrupt queue file {:?}: {}", path, e);
                    StoreData::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => {
                warn!("Failed to read queue file {:?}: {}", path, e);
                StoreData::default()
            }
        };

        Self {
            path: Some(path.to_path_buf()),
            data: Mutex::new(data),
        }
    }

    /// A store that keeps nothing across restarts.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StoreData::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append the tasks. An episode that already has an entry keeps its
    /// position. Either the whole batch is persisted or nothing changes.
    pub fn add_all(&self, tasks: &[Arc<DownloadTask>]) -> Result<(), StoreError> {
        self.update(|data| {
            let now = Utc::now();
            for task in tasks {
                let key = task.key();
                if let Some(existing) = data
                    .entries
                    .iter_mut()
                    .find(|e| e.episode_id == key.episode_id)
                {
                    existing.change_downloader = task.change_downloader();
                    continue;
                }

                let order = data.next_order();
                data.entries.push(StoredDownload {
                    source_id: key.source_id,
                    anime_id: key.anime_id,
                    episode_id: key.episode_id,
                    order,
                    change_downloader: task.change_downloader(),
                    queued_at: now,
                });
            }
            true
        })
    }

    pub fn remove(&self, task: &DownloadTask) -> Result<(), StoreError> {
        self.remove_episodes(&[task.key().episode_id])
    }

    pub fn remove_episodes(&self, episode_ids: &[i64]) -> Result<(), StoreError> {
        self.update(|data| {
            let before = data.entries.len();
            data.entries.retain(|e| !episode_ids.contains(&e.episode_id));
            data.entries.len() != before
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.update(|data| {
            let had_entries = !data.entries.is_empty();
            data.entries.clear();
            had_entries
        })
    }

    /// Stored entries in queue order.
    pub fn entries(&self) -> Vec<StoredDownload> {
        let mut entries = self.data().entries.clone();
        entries.sort_by_key(|e| e.order);
        entries
    }

    pub fn len(&self) -> usize {
        self.data().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().entries.is_empty()
    }

    /// Apply `change` to a copy, persist it, and only then make it current.
    fn update(&self, change: impl FnOnce(&mut StoreData) -> bool) -> Result<(), StoreError> {
        let mut data = self.data();
        let mut next = data.clone();
        if !change(&mut next) {
            return Ok(());
        }

        if let Some(path) = &self.path {
            write_atomic(path, &next)?;
        }
        *data = next;
        Ok(())
    }

    fn data(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn write_atomic(path: &Path, data: &StoreData) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(data)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;

    debug!("Wrote {} queued downloads to {:?}", data.entries.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Anime, Episode, MemorySource};
    use tempfile::TempDir;

    fn task(episode_id: i64) -> Arc<DownloadTask> {
        let anime = Anime {
            id: 10,
            source_id: 1,
            title: "Frieren".to_string(),
        };
        let episode = Episode {
            id: episode_id,
            anime_id: 10,
            name: format!("Episode {}", episode_id),
            scanlator: None,
            source_order: episode_id,
        };
        DownloadTask::new(Arc::new(MemorySource::new(1, "mem")), anime, episode, false, None)
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue.json");

        let store = DownloadStore::open(&path);
        store.add_all(&[task(3), task(1), task(2)]).unwrap();
        drop(store);

        let reopened = DownloadStore::open(&path);
        let ids: Vec<i64> = reopened.entries().iter().map(|e| e.episode_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert!(!tmp.path().join("queue.json.tmp").exists());
    }

    #[test]
    fn test_readding_keeps_position() {
        let store = DownloadStore::in_memory();
        store.add_all(&[task(1), task(2)]).unwrap();
        store.add_all(&[task(1), task(3)]).unwrap();

        let ids: Vec<i64> = store.entries().iter().map(|e| e.episode_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_and_clear() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue.json");
        let store = DownloadStore::open(&path);

        let first = task(1);
        store.add_all(&[first.clone(), task(2), task(3)]).unwrap();
        store.remove(&first).unwrap();
        store.remove_episodes(&[3]).unwrap();
        assert_eq!(store.len(), 1);

        store.clear().unwrap();
        assert!(DownloadStore::open(&path).is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(DownloadStore::open(&path).is_empty());
    }

    #[test]
    fn test_failed_write_keeps_previous_state() {
        let tmp = TempDir::new().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = tmp.path().join("queue.json");
        fs::create_dir_all(path.join("blocker")).unwrap();

        let store = DownloadStore::open(&path);
        assert!(store.add_all(&[task(1)]).is_err());
        assert!(store.is_empty());
    }
}
