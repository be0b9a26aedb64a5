pub mod catalog;
pub mod clean;
pub mod clear;
pub mod config;
pub mod list;
pub mod queue;
pub mod remove;
pub mod run;

use crate::cli::Commands;
use anidl::config::Config;
use anidl::download::{
    DownloadProvider, DownloadQueue, DownloadStore, Downloader, DownloaderOptions,
};
use anidl::source::{Catalog, EntityLookup};
use anyhow::{Context, Result};
use std::sync::Arc;

pub use catalog::handle_catalog;
pub use clean::handle_clean;
pub use clear::handle_clear;
pub use config::handle_config;
pub use list::handle_list;
pub use queue::handle_queue;
pub use remove::handle_remove;
pub use run::handle_run;

/// Config commands must work even when the config does not validate.
pub fn should_skip_config_validation(command: &Commands) -> bool {
    matches!(command, Commands::Config { .. })
}

pub fn open_catalog(config: &Config) -> Result<Arc<Catalog>> {
    let path = &config.catalog.path;
    let catalog = Catalog::load(path).with_context(|| {
        format!(
            "No usable catalog at {:?}; set [catalog] path in the config",
            path
        )
    })?;
    Ok(Arc::new(catalog))
}

/// Wire the catalog, its sources and the persisted queue into a downloader.
/// The queue starts empty; call [`Downloader::restore`] to load it.
pub fn open_downloader(
    config: &Config,
    catalog: Arc<Catalog>,
    options: DownloaderOptions,
) -> Result<Downloader> {
    let sources = catalog.build_sources(&config.transfer.user_agent)?;
    let store = DownloadStore::open(&config.storage.queue_file);
    let provider = DownloadProvider::new(&config.storage.downloads_dir);
    let lookup: Arc<dyn EntityLookup> = catalog;

    Ok(Downloader::new(
        DownloadQueue::new(store),
        provider,
        sources,
        lookup,
        options,
    ))
}
