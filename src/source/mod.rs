//! Content sources: the narrow seam through which the download pipeline
//! resolves videos for an episode and fetches their bytes.

pub mod catalog;
pub mod http;
pub mod memory;
pub mod model;

pub use catalog::Catalog;
pub use http::HttpSource;
pub use memory::MemorySource;
pub use model::{Anime, Episode, Hoster, Track, Video};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Body of a fetch, delivered chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, SourceError>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("incomplete body: expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: u64 },

    #[error("server ignored range request for {url}")]
    RangeNotHonoured { url: String },

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Whether retrying the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            SourceError::Request(e) => !e.is_builder(),
            SourceError::Io(_) | SourceError::Incomplete { .. } => true,
            SourceError::RangeNotHonoured { .. } | SourceError::Other(_) => false,
        }
    }
}

/// Inclusive byte range, as used by the HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Split `total` bytes into at most `parts` contiguous ranges, none
    /// smaller than `min_part_size` except possibly the last one.
    pub fn split(total: u64, parts: usize, min_part_size: u64) -> Vec<ByteRange> {
        if total == 0 {
            return Vec::new();
        }

        let max_by_size = (total / min_part_size.max(1)).max(1);
        let count = (parts.max(1) as u64).min(max_by_size);
        let base = total / count;

        (0..count)
            .map(|i| {
                let start = i * base;
                let end = if i == count - 1 {
                    total - 1
                } else {
                    start + base - 1
                };
                ByteRange::new(start, end)
            })
            .collect()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// What a probe learned about a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFile {
    pub length: Option<u64>,
    pub accepts_ranges: bool,
}

/// An external content provider.
#[async_trait]
pub trait Source: Send + Sync + fmt::Debug {
    fn id(&self) -> i64;

    fn name(&self) -> &str;

    /// Headers sent with every request unless the video overrides them.
    fn headers(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Hosters and their videos available for an episode.
    async fn hosters(&self, anime: &Anime, episode: &Episode) -> Result<Vec<Hoster>, SourceError>;

    /// Learn the size of a remote file and whether it can be fetched in ranges.
    async fn probe(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<RemoteFile, SourceError>;

    /// Fetch a file, or one range of it.
    async fn fetch(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, SourceError>;
}

/// Resolves episode ids to their current metadata.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    async fn episode(&self, episode_id: i64) -> Option<(Anime, Episode)>;

    async fn anime(&self, anime_id: i64) -> Option<Anime>;

    async fn episodes_of(&self, anime_id: i64) -> Vec<Episode>;
}

#[derive(Debug, Clone, Default)]
pub struct SourceManager {
    sources: HashMap<i64, Arc<dyn Source>>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn Source>) {
        self.sources.insert(source.id(), source);
    }

    pub fn with(mut self, source: Arc<dyn Source>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, id: i64) -> Option<Arc<dyn Source>> {
        self.sources.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_even_ranges() {
        let ranges = ByteRange::split(10 * 1024 * 1024, 4, 1024);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[3].end, 10 * 1024 * 1024 - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
        let total: u64 = ranges.iter().map(ByteRange::len).sum();
        assert_eq!(total, 10 * 1024 * 1024);
    }

    #[test]
    fn test_split_respects_min_part_size() {
        let ranges = ByteRange::split(3000, 8, 1000);
        assert_eq!(ranges.len(), 3);

        let ranges = ByteRange::split(500, 8, 1000);
        assert_eq!(ranges, vec![ByteRange::new(0, 499)]);

        assert!(ByteRange::split(0, 4, 1).is_empty());
    }

    #[test]
    fn test_split_uneven_tail() {
        let ranges = ByteRange::split(10, 3, 1);
        assert_eq!(
            ranges,
            vec![ByteRange::new(0, 2), ByteRange::new(3, 5), ByteRange::new(6, 9)]
        );
    }

    #[test]
    fn test_transient_classification() {
        let status = |status| SourceError::Status {
            status,
            url: "u".to_string(),
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());
        assert!(SourceError::Incomplete { expected: 2, received: 1 }.is_transient());
        assert!(!SourceError::RangeNotHonoured { url: "u".to_string() }.is_transient());
    }

    #[test]
    fn test_range_header() {
        assert_eq!(ByteRange::new(5, 9).header_value(), "bytes=5-9");
        assert_eq!(ByteRange::new(5, 9).len(), 5);
    }
}
