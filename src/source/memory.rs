//! A source that serves files from memory. Used for offline fixtures and to
//! exercise the pipeline without a network.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{Anime, ByteRange, ByteStream, Episode, Hoster, RemoteFile, Source, SourceError};

/// One recorded call to [`Source::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    pub url: String,
    pub range: Option<ByteRange>,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<String, Bytes>,
    hosters: HashMap<i64, Vec<Hoster>>,
    failing_hosters: HashMap<i64, String>,
    // (url, range start) -> remaining failures
    failures: HashMap<(String, u64), u32>,
    fetches: Vec<FetchRecord>,
}

#[derive(Debug)]
pub struct MemorySource {
    id: i64,
    name: String,
    accepts_ranges: bool,
    chunk_size: usize,
    chunk_delay: Duration,
    state: Mutex<MemoryState>,
}

impl MemorySource {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            accepts_ranges: true,
            chunk_size: 64 * 1024,
            chunk_delay: Duration::ZERO,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accepts_ranges = false;
        self
    }

    /// Deliver bodies in chunks of `size` bytes, pausing `delay` before each.
    pub fn with_chunking(mut self, size: usize, delay: Duration) -> Self {
        self.chunk_size = size.max(1);
        self.chunk_delay = delay;
        self
    }

    pub fn add_file(&self, url: &str, data: impl Into<Bytes>) {
        self.state().files.insert(url.to_string(), data.into());
    }

    pub fn add_hosters(&self, episode_id: i64, hosters: Vec<Hoster>) {
        self.state().hosters.insert(episode_id, hosters);
    }

    /// Make hoster resolution for an episode fail with `message`.
    pub fn fail_hosters(&self, episode_id: i64, message: &str) {
        self.state()
            .failing_hosters
            .insert(episode_id, message.to_string());
    }

    /// Make the next `times` fetches of the range starting at `start` break
    /// off after the first chunk.
    pub fn fail_range(&self, url: &str, start: u64, times: u32) {
        self.state().failures.insert((url.to_string(), start), times);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.state().fetches.clone()
    }

    pub fn clear_fetches(&self) {
        self.state().fetches.clear();
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Source for MemorySource {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn hosters(&self, _anime: &Anime, episode: &Episode) -> Result<Vec<Hoster>, SourceError> {
        let state = self.state();
        if let Some(message) = state.failing_hosters.get(&episode.id) {
            return Err(SourceError::Other(message.clone()));
        }
        Ok(state.hosters.get(&episode.id).cloned().unwrap_or_default())
    }

    async fn probe(
        &self,
        url: &str,
        _headers: &BTreeMap<String, String>,
    ) -> Result<RemoteFile, SourceError> {
        let state = self.state();
        let file = state.files.get(url).ok_or_else(|| SourceError::Status {
            status: 404,
            url: url.to_string(),
        })?;

        Ok(RemoteFile {
            length: Some(file.len() as u64),
            accepts_ranges: self.accepts_ranges,
        })
    }

    async fn fetch(
        &self,
        url: &str,
        _headers: &BTreeMap<String, String>,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, SourceError> {
        let (body, fail) = {
            let mut state = self.state();
            state.fetches.push(FetchRecord {
                url: url.to_string(),
                range,
            });

            let file = state
                .files
                .get(url)
                .cloned()
                .ok_or_else(|| SourceError::Status {
                    status: 404,
                    url: url.to_string(),
                })?;

            let body = match range {
                Some(_) if !self.accepts_ranges => {
                    return Err(SourceError::RangeNotHonoured {
                        url: url.to_string(),
                    });
                }
                Some(r) if r.end >= file.len() as u64 => {
                    return Err(SourceError::Status {
                        status: 416,
                        url: url.to_string(),
                    });
                }
                Some(r) => file.slice(r.start as usize..=r.end as usize),
                None => file,
            };

            let key = (url.to_string(), range.map(|r| r.start).unwrap_or(0));
            let fail = match state.failures.get_mut(&key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            (body, fail)
        };

        let chunks: Vec<Bytes> = (0..body.len())
            .step_by(self.chunk_size)
            .map(|at| body.slice(at..(at + self.chunk_size).min(body.len())))
            .collect();
        let delay = self.chunk_delay;

        let delivered = stream::iter(chunks).then(move |chunk| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<Bytes, SourceError>(chunk)
        });

        if fail {
            let broken = stream::once(async {
                Err(SourceError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )))
            });
            return Ok(delivered.take(1).chain(broken).boxed());
        }

        Ok(delivered.boxed())
    }
}
