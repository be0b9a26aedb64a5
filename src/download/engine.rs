//! Segmented, resumable transfer of a single file.
//!
//! A file is planned into parts (one per byte range, or a single part when
//! the server cannot serve ranges), each part is fetched into its own temp
//! file with bounded retries, and the parts are concatenated once all of them
//! are complete.

use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::error::DownloadError;
use super::part::DownloadPart;
use super::task::DownloadState;
use crate::source::{ByteRange, RemoteFile, Source, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Wait before retrying after failed attempt number `attempt` (1-based):
    /// the initial backoff doubled for every further attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub parts_per_video: usize,
    pub min_part_size: u64,
    pub max_concurrent_parts: usize,
    pub retry: RetryPolicy,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            parts_per_video: 4,
            min_part_size: 1024 * 1024,
            max_concurrent_parts: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// One file to fetch: where it comes from, where its parts go, and where the
/// assembled result ends up.
#[derive(Debug)]
pub struct TrackTransfer {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub dir: PathBuf,
    pub output: PathBuf,
    pub length: Option<u64>,
    pub parts: Vec<Arc<DownloadPart>>,
    merged: bool,
}

impl TrackTransfer {
    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub fn progress_streams(&self) -> Vec<watch::Receiver<u8>> {
        self.parts.iter().map(|p| p.subscribe()).collect()
    }

    /// Parts that still have to be fetched.
    pub fn pending_parts(&self) -> impl Iterator<Item = &Arc<DownloadPart>> {
        self.parts.iter().filter(|p| !p.is_completed())
    }
}

enum PartFailure {
    Cancelled,
    Source(SourceError),
}

impl From<SourceError> for PartFailure {
    fn from(e: SourceError) -> Self {
        PartFailure::Source(e)
    }
}

impl From<io::Error> for PartFailure {
    fn from(e: io::Error) -> Self {
        PartFailure::Source(SourceError::Io(e))
    }
}

/// Resolves once the task is no longer downloading.
async fn cancelled(state: &mut watch::Receiver<DownloadState>) {
    let _ = state.wait_for(|s| *s != DownloadState::Downloading).await;
}

#[derive(Debug, Clone, Default)]
pub struct TransferEngine {
    options: TransferOptions,
}

impl TransferEngine {
    pub fn new(options: TransferOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Probe `url` and lay out its parts under `dir`.
    ///
    /// Part files a previous attempt completed are kept and marked done;
    /// part files from a different layout are deleted. When `output` already
    /// exists the file was assembled before and nothing is left to fetch.
    #[allow(clippy::too_many_arguments)]
    pub async fn plan(
        &self,
        source: &dyn Source,
        url: &str,
        headers: &BTreeMap<String, String>,
        dir: &Path,
        output: &Path,
        segmented: bool,
        cancel: &watch::Receiver<DownloadState>,
    ) -> Result<TrackTransfer, DownloadError> {
        if let Ok(meta) = fs::metadata(output) {
            if meta.is_file() {
                debug!("{:?} already assembled", output);
                let part = DownloadPart::whole(dir, Some(meta.len()));
                part.mark_completed();
                return Ok(TrackTransfer {
                    url: url.to_string(),
                    headers: headers.clone(),
                    dir: dir.to_path_buf(),
                    output: output.to_path_buf(),
                    length: Some(meta.len()),
                    parts: vec![Arc::new(part)],
                    merged: true,
                });
            }
        }

        let remote = self.probe(source, url, headers, cancel).await?;
        let parts: Vec<DownloadPart> = match remote {
            RemoteFile {
                length: Some(length),
                accepts_ranges: true,
            } if segmented && length > 0 => ByteRange::split(
                length,
                self.options.parts_per_video,
                self.options.min_part_size,
            )
            .into_iter()
            .map(|range| DownloadPart::ranged(dir, range))
            .collect(),
            _ => vec![DownloadPart::whole(dir, remote.length)],
        };

        remove_foreign_part_files(dir, &parts)?;

        let reused = parts.iter().filter(|p| p.verify_on_disk()).count();
        if reused > 0 {
            info!("Resuming {}: {}/{} parts already on disk", url, reused, parts.len());
        }
        debug!(
            "Planned {} in {} part(s), length {:?}",
            url,
            parts.len(),
            remote.length
        );

        Ok(TrackTransfer {
            url: url.to_string(),
            headers: headers.clone(),
            dir: dir.to_path_buf(),
            output: output.to_path_buf(),
            length: remote.length,
            parts: parts.into_iter().map(Arc::new).collect(),
            merged: false,
        })
    }

    async fn probe(
        &self,
        source: &dyn Source,
        url: &str,
        headers: &BTreeMap<String, String>,
        cancel: &watch::Receiver<DownloadState>,
    ) -> Result<RemoteFile, DownloadError> {
        let retry = self.options.retry;
        let mut cancel = cancel.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match source.probe(url, headers).await {
                Ok(remote) => return Ok(remote),
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    warn!("Probe of {} failed: {}. Retrying in {:?}", url, e, delay);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cancelled(&mut cancel) => return Err(DownloadError::Cancelled),
                    }
                }
                Err(e) => {
                    return Err(DownloadError::Transfer {
                        url: url.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    /// Fetch every pending part, at most `max_concurrent_parts` at a time.
    ///
    /// Returns [`DownloadError::Cancelled`] as soon as the task leaves the
    /// downloading state; in-flight requests are aborted. The first part
    /// that fails for good aborts the others.
    pub async fn run(
        &self,
        source: Arc<dyn Source>,
        transfer: &TrackTransfer,
        cancel: watch::Receiver<DownloadState>,
    ) -> Result<(), DownloadError> {
        if transfer.merged {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_parts.max(1)));
        let mut parts = JoinSet::new();

        for part in transfer.pending_parts() {
            let semaphore = Arc::clone(&semaphore);
            let source = Arc::clone(&source);
            let part_handle = Arc::clone(part);
            let url = transfer.url.clone();
            let headers = transfer.headers.clone();
            let retry = self.options.retry;
            let cancel = cancel.clone();

            let handle = parts.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| DownloadError::Cancelled)?;
                fetch_part_with_retry(source.as_ref(), &url, &headers, &part_handle, retry, cancel)
                    .await
            });
            part.set_request(handle);
        }

        let mut cancel = cancel;
        loop {
            tokio::select! {
                joined = parts.join_next() => match joined {
                    None => return Ok(()),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        parts.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => {
                        parts.abort_all();
                        return Err(DownloadError::Io(io::Error::other(e)));
                    }
                },
                _ = cancelled(&mut cancel) => {
                    debug!("Aborting transfer of {}", transfer.url);
                    for part in &transfer.parts {
                        part.abort();
                    }
                    parts.abort_all();
                    return Err(DownloadError::Cancelled);
                }
            }
        }
    }

    /// Concatenate the parts in range order into the output file and delete
    /// them. Returns the assembled length.
    pub async fn merge(&self, transfer: &mut TrackTransfer) -> Result<u64, DownloadError> {
        let output = transfer.output.clone();
        let merge_err = |source| DownloadError::Merge {
            path: output.clone(),
            source,
        };

        if transfer.merged {
            return Ok(transfer.length.unwrap_or(0));
        }
        if transfer.pending_parts().next().is_some() {
            return Err(merge_err(io::Error::other("not all parts are complete")));
        }

        let mut parts: Vec<&Arc<DownloadPart>> = transfer.parts.iter().collect();
        parts.sort_by_key(|p| p.start());

        let assembling = transfer.output.with_extension("merging");
        let total = match concat_parts(&parts, &assembling).await {
            Ok(total) => total,
            Err(e) => {
                let _ = tokio::fs::remove_file(&assembling).await;
                return Err(merge_err(e));
            }
        };

        if let Some(expected) = transfer.length {
            if total != expected {
                let _ = tokio::fs::remove_file(&assembling).await;
                return Err(merge_err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("assembled {} bytes, expected {}", total, expected),
                )));
            }
        }

        tokio::fs::rename(&assembling, &transfer.output)
            .await
            .map_err(merge_err)?;

        for part in &parts {
            if let Err(e) = part.remove_file() {
                warn!("Failed to remove part file {:?}: {}", part.temp_path(), e);
            }
        }
        let _ = fs::remove_dir(&transfer.dir);

        transfer.merged = true;
        transfer.length = Some(total);
        debug!("Assembled {:?} ({} bytes)", transfer.output, total);
        Ok(total)
    }
}

async fn concat_parts(parts: &[&Arc<DownloadPart>], target: &Path) -> io::Result<u64> {
    let mut output = tokio::fs::File::create(target).await?;
    let mut total = 0;

    for part in parts {
        let mut input = tokio::fs::File::open(part.temp_path()).await?;
        total += tokio::io::copy(&mut input, &mut output).await?;
    }

    output.flush().await?;
    output.sync_all().await?;
    Ok(total)
}

/// Delete `*.part.tmp` files in `dir` that none of `parts` owns.
fn remove_foreign_part_files(dir: &Path, parts: &[DownloadPart]) -> Result<(), DownloadError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let is_part = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".part.tmp"));
        if is_part && !parts.iter().any(|p| p.temp_path() == path) {
            debug!("Removing stale part file {:?}", path);
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

async fn fetch_part_with_retry(
    source: &dyn Source,
    url: &str,
    headers: &BTreeMap<String, String>,
    part: &DownloadPart,
    retry: RetryPolicy,
    mut cancel: watch::Receiver<DownloadState>,
) -> Result<(), DownloadError> {
    let label = part
        .range()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "whole file".to_string());
    let mut attempt = 0;

    loop {
        attempt += 1;
        match fetch_part_once(source, url, headers, part, &cancel).await {
            Ok(()) => {
                part.mark_completed();
                debug!("Part {} of {} done after {} attempt(s)", label, url, attempt);
                return Ok(());
            }
            Err(PartFailure::Cancelled) => return Err(DownloadError::Cancelled),
            Err(PartFailure::Source(e)) if e.is_transient() && attempt < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    "Part {} of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                    label, url, attempt, retry.max_attempts, e, delay
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancelled(&mut cancel) => return Err(DownloadError::Cancelled),
                }
            }
            Err(PartFailure::Source(e)) => {
                warn!("Part {} of {} failed after {} attempt(s): {}", label, url, attempt, e);
                return Err(DownloadError::Transfer {
                    url: url.to_string(),
                    attempts: attempt,
                    source: e,
                });
            }
        }
    }
}

async fn fetch_part_once(
    source: &dyn Source,
    url: &str,
    headers: &BTreeMap<String, String>,
    part: &DownloadPart,
    cancel: &watch::Receiver<DownloadState>,
) -> Result<(), PartFailure> {
    let is_cancelled = || *cancel.borrow() != DownloadState::Downloading;
    if is_cancelled() {
        return Err(PartFailure::Cancelled);
    }

    let path = part.file()?.to_path_buf();
    let mut file = tokio::fs::File::create(&path).await?;
    let mut stream = source.fetch(url, headers, part.range()).await?;
    let mut written: u64 = 0;
    part.report(0);

    while let Some(chunk) = stream.next().await {
        if is_cancelled() {
            return Err(PartFailure::Cancelled);
        }
        let chunk = chunk?;

        if let Some(expected) = part.expected_len() {
            if written + chunk.len() as u64 > expected {
                return Err(SourceError::Other(format!(
                    "received more than the {} bytes requested",
                    expected
                ))
                .into());
            }
        }

        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        part.report(written);
    }
    file.flush().await?;

    match part.expected_len() {
        Some(expected) if written != expected => Err(SourceError::Incomplete {
            expected,
            received: written,
        }
        .into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use tempfile::TempDir;

    fn fast_options(parts: usize) -> TransferOptions {
        TransferOptions {
            parts_per_video: parts,
            min_part_size: 1,
            max_concurrent_parts: parts,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        }
    }

    fn downloading() -> (watch::Sender<DownloadState>, watch::Receiver<DownloadState>) {
        watch::channel(DownloadState::Downloading)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for(3), Duration::from_secs(8));
        assert_eq!(retry.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_segmented_transfer_with_retries() {
        let tmp = TempDir::new().unwrap();
        let source = Arc::new(MemorySource::new(1, "mem").with_chunking(100, Duration::ZERO));
        let data = payload(4000);
        source.add_file("mem://v.mp4", data.clone());
        source.fail_range("mem://v.mp4", 1000, 2);

        let engine = TransferEngine::new(fast_options(4));
        let (_state, cancel) = downloading();
        let dir = tmp.path().join("video");
        let output = tmp.path().join("v.mp4");

        let mut transfer = engine
            .plan(source.as_ref(), "mem://v.mp4", &BTreeMap::new(), &dir, &output, true, &cancel)
            .await
            .unwrap();
        assert_eq!(transfer.parts.len(), 4);

        engine.run(source.clone(), &transfer, cancel).await.unwrap();
        assert_eq!(engine.merge(&mut transfer).await.unwrap(), 4000);

        assert_eq!(fs::read(&output).unwrap(), data);
        assert!(!dir.exists());
        let retried = source
            .fetches()
            .iter()
            .filter(|f| f.range.map(|r| r.start) == Some(1000))
            .count();
        assert_eq!(retried, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_completed_parts() {
        let tmp = TempDir::new().unwrap();
        let source = Arc::new(MemorySource::new(1, "mem").with_chunking(10, Duration::ZERO));
        source.add_file("mem://v.mp4", payload(400));
        source.fail_range("mem://v.mp4", 300, 10);

        let mut options = fast_options(4);
        options.max_concurrent_parts = 1;
        let engine = TransferEngine::new(options);
        let (_state, cancel) = downloading();
        let dir = tmp.path().join("video");
        let output = tmp.path().join("v.mp4");

        let transfer = engine
            .plan(source.as_ref(), "mem://v.mp4", &BTreeMap::new(), &dir, &output, true, &cancel)
            .await
            .unwrap();
        let result = engine.run(source.clone(), &transfer, cancel.clone()).await;
        assert!(matches!(
            result,
            Err(DownloadError::Transfer { attempts: 3, .. })
        ));

        source.clear_failures();
        source.clear_fetches();
        let transfer = engine
            .plan(source.as_ref(), "mem://v.mp4", &BTreeMap::new(), &dir, &output, true, &cancel)
            .await
            .unwrap();
        assert_eq!(transfer.pending_parts().count(), 1);

        engine.run(source.clone(), &transfer, cancel).await.unwrap();
        let fetched: Vec<_> = source.fetches().iter().map(|f| f.range).collect();
        assert_eq!(fetched, vec![Some(ByteRange::new(300, 399))]);
    }

    #[tokio::test]
    async fn test_single_part_without_range_support() {
        let tmp = TempDir::new().unwrap();
        let source = Arc::new(MemorySource::new(1, "mem").without_ranges());
        source.add_file("mem://v.mp4", payload(1000));

        let engine = TransferEngine::new(fast_options(4));
        let (_state, cancel) = downloading();
        let output = tmp.path().join("v.mp4");
        let mut transfer = engine
            .plan(
                source.as_ref(),
                "mem://v.mp4",
                &BTreeMap::new(),
                &tmp.path().join("video"),
                &output,
                true,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(transfer.parts.len(), 1);
        assert_eq!(transfer.parts[0].range(), None);
        engine.run(source.clone(), &transfer, cancel).await.unwrap();
        engine.merge(&mut transfer).await.unwrap();
        assert_eq!(fs::read(&output).unwrap(), payload(1000));
    }

    #[tokio::test]
    async fn test_cancel_stops_transfer() {
        let tmp = TempDir::new().unwrap();
        let source = Arc::new(
            MemorySource::new(1, "mem").with_chunking(10, Duration::from_millis(20)),
        );
        source.add_file("mem://v.mp4", payload(10_000));

        let engine = TransferEngine::new(fast_options(2));
        let (state, cancel) = downloading();
        let transfer = engine
            .plan(
                source.as_ref(),
                "mem://v.mp4",
                &BTreeMap::new(),
                &tmp.path().join("video"),
                &tmp.path().join("v.mp4"),
                true,
                &cancel,
            )
            .await
            .unwrap();

        let run = engine.run(source.clone(), &transfer, cancel);
        let stop = async {
            sleep(Duration::from_millis(50)).await;
            state.send_replace(DownloadState::NotDownloaded);
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(run, stop)
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(transfer.parts.iter().all(|p| !p.is_completed()));
    }

    #[tokio::test]
    async fn test_plan_drops_foreign_parts_and_skips_assembled_output() {
        let tmp = TempDir::new().unwrap();
        let source = MemorySource::new(1, "mem");
        source.add_file("mem://v.mp4", payload(100));
        let dir = tmp.path().join("video");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("37.part.tmp"), b"old").unwrap();

        let engine = TransferEngine::new(fast_options(2));
        let (_state, cancel) = downloading();
        let output = tmp.path().join("v.mp4");
        let transfer = engine
            .plan(&source, "mem://v.mp4", &BTreeMap::new(), &dir, &output, true, &cancel)
            .await
            .unwrap();
        assert!(!dir.join("37.part.tmp").exists());
        assert!(!transfer.is_merged());

        fs::write(&output, payload(100)).unwrap();
        let transfer = engine
            .plan(&source, "mem://v.mp4", &BTreeMap::new(), &dir, &output, true, &cancel)
            .await
            .unwrap();
        assert!(transfer.is_merged());
        assert_eq!(transfer.pending_parts().count(), 0);
    }
}
