pub mod config;
pub mod download;
pub mod source;

pub use config::{Config, ConfigManager};
pub use download::{
    DownloadError, DownloadEvent, DownloadQueue, DownloadState, DownloadStore, DownloadTask,
    Downloader, DownloaderOptions, EnqueueOptions,
};
pub use source::{Anime, Catalog, EntityLookup, Episode, Hoster, Source, SourceManager, Video};
