use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::source::ByteRange;

/// One byte range of a file being transferred.
///
/// The temp file is created on first use and named after the range start,
/// so a retry finds the same file again.
#[derive(Debug)]
pub struct DownloadPart {
    dir: PathBuf,
    range: Option<ByteRange>,
    expected_len: Option<u64>,
    file: OnceLock<PathBuf>,
    completed: AtomicBool,
    progress: watch::Sender<u8>,
    request: Mutex<Option<AbortHandle>>,
}

impl DownloadPart {
    /// A part covering `range` of a file.
    pub fn ranged(dir: &Path, range: ByteRange) -> Self {
        Self::new(dir, Some(range), Some(range.len()))
    }

    /// A part covering a whole file whose length may be unknown.
    pub fn whole(dir: &Path, length: Option<u64>) -> Self {
        Self::new(dir, None, length)
    }

    fn new(dir: &Path, range: Option<ByteRange>, expected_len: Option<u64>) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            dir: dir.to_path_buf(),
            range,
            expected_len,
            file: OnceLock::new(),
            completed: AtomicBool::new(false),
            progress,
            request: Mutex::new(None),
        }
    }

    pub fn range(&self) -> Option<ByteRange> {
        self.range
    }

    pub fn start(&self) -> u64 {
        self.range.map(|r| r.start).unwrap_or(0)
    }

    pub fn expected_len(&self) -> Option<u64> {
        self.expected_len
    }

    pub fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("{}.part.tmp", self.start()))
    }

    /// The temp file, created empty if it does not exist yet.
    pub fn file(&self) -> io::Result<&Path> {
        if let Some(path) = self.file.get() {
            return Ok(path);
        }

        let path = self.temp_path();
        fs::create_dir_all(&self.dir)?;
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(self.file.get_or_init(|| path))
    }

    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }

    /// Report `written` bytes of this part as a percentage.
    pub fn report(&self, written: u64) {
        let percent = match self.expected_len {
            Some(0) => 100,
            Some(len) => (written.min(len) * 100 / len) as u8,
            None => 0,
        };
        self.progress.send_if_modified(|current| {
            if *current == percent {
                return false;
            }
            *current = percent;
            true
        });
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
        self.progress.send_replace(100);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Mark the part completed if a previous run left its full range on disk.
    pub fn verify_on_disk(&self) -> bool {
        let Some(expected) = self.expected_len else {
            return false;
        };

        match fs::metadata(self.temp_path()) {
            Ok(meta) if meta.is_file() && meta.len() == expected => {
                debug!("Reusing completed part {:?}", self.temp_path());
                self.mark_completed();
                true
            }
            _ => false,
        }
    }

    /// Remember the in-flight request so it can be aborted.
    pub fn set_request(&self, handle: AbortHandle) {
        *self.request.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn abort(&self) {
        let handle = self.request.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn remove_file(&self) -> io::Result<()> {
        match fs::remove_file(self.temp_path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_file_created_lazily() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("video");
        let part = DownloadPart::ranged(&dir, ByteRange::new(1024, 2047));

        assert!(!part.temp_path().exists());
        let path = part.file().unwrap().to_path_buf();
        assert_eq!(path, dir.join("1024.part.tmp"));
        assert!(path.exists());
        assert_eq!(part.file().unwrap(), path.as_path());
    }

    #[test]
    fn test_progress_reporting() {
        let tmp = TempDir::new().unwrap();
        let part = DownloadPart::ranged(tmp.path(), ByteRange::new(0, 99));
        let rx = part.subscribe();

        part.report(25);
        assert_eq!(*rx.borrow(), 25);
        part.report(1000);
        assert_eq!(*rx.borrow(), 100);
        assert!(!part.is_completed());

        part.mark_completed();
        assert!(part.is_completed());
    }

    #[test]
    fn test_verify_on_disk() {
        let tmp = TempDir::new().unwrap();
        let part = DownloadPart::ranged(tmp.path(), ByteRange::new(10, 19));

        fs::write(part.temp_path(), vec![0u8; 5]).unwrap();
        assert!(!part.verify_on_disk());

        fs::write(part.temp_path(), vec![0u8; 10]).unwrap();
        assert!(part.verify_on_disk());
        assert!(part.is_completed());

        part.remove_file().unwrap();
        part.remove_file().unwrap();
        assert!(!part.temp_path().exists());
    }

    #[tokio::test]
    async fn test_abort_in_flight_request() {
        let tmp = TempDir::new().unwrap();
        let part = DownloadPart::whole(tmp.path(), None);

        let handle = tokio::spawn(std::future::pending::<()>());
        part.set_request(handle.abort_handle());
        part.abort();

        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
