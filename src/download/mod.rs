pub mod downloader;
pub mod engine;
pub mod error;
pub mod part;
pub mod progress;
pub mod provider;
pub mod queue;
pub mod selector;
pub mod store;
pub mod task;

pub use downloader::{Downloader, DownloaderOptions, EnqueueOptions, QueueReport};
pub use engine::{RetryPolicy, TrackTransfer, TransferEngine, TransferOptions};
pub use error::DownloadError;
pub use part::DownloadPart;
pub use progress::ProgressSettings;
pub use provider::DownloadProvider;
pub use queue::DownloadQueue;
pub use selector::{VideoPreferences, select_best_video};
pub use store::{DownloadStore, StoreError, StoredDownload};
pub use task::{DownloadEvent, DownloadState, DownloadTask, TaskKey};
