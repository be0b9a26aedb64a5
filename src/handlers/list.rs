use super::open_catalog;
use anidl::config::ConfigManager;
use anidl::download::DownloadStore;
use anyhow::Result;
use console::{Term, style};
use tracing::debug;

pub async fn handle_list(
    config_manager: &ConfigManager,
    anime_filter: Option<i64>,
    detailed: bool,
) -> Result<()> {
    let term = Term::stdout();
    let config = config_manager.config();
    let store = DownloadStore::open(&config.storage.queue_file);

    // Titles are a nicety; the queue is still listed without a catalog.
    let catalog = match open_catalog(config) {
        Ok(catalog) => Some(catalog),
        Err(e) => {
            debug!("Listing without catalog: {:#}", e);
            None
        }
    };

    let entries: Vec<_> = store
        .entries()
        .into_iter()
        .filter(|e| anime_filter.is_none_or(|id| e.anime_id == id))
        .collect();

    if entries.is_empty() {
        term.write_line(&format!("{} The queue is empty", style("💤").dim()))?;
        return Ok(());
    }

    term.write_line(&format!(
        "{} {} queued download(s):",
        style("📋").cyan(),
        entries.len()
    ))?;

    for (position, entry) in entries.iter().enumerate() {
        let anime = catalog
            .as_ref()
            .and_then(|c| c.find_anime(entry.anime_id))
            .map(|a| a.title.clone())
            .unwrap_or_else(|| format!("anime #{}", entry.anime_id));
        let episode = catalog
            .as_ref()
            .and_then(|c| c.find_episode(entry.episode_id))
            .map(|e| e.episode.name.clone())
            .unwrap_or_else(|| format!("episode #{}", entry.episode_id));

        term.write_line(&format!(
            "  {:>3}. {} - {} {}",
            position + 1,
            style(&anime).cyan(),
            episode,
            style(format!("[{}]", entry.episode_id)).dim()
        ))?;

        if detailed {
            let strategy = if entry.change_downloader {
                "alternate"
            } else {
                "default"
            };
            term.write_line(&format!(
                "       {}: {}   {}: {}   {}: {}",
                style("source").dim(),
                entry.source_id,
                style("strategy").dim(),
                strategy,
                style("queued").dim(),
                entry.queued_at.format("%Y-%m-%d %H:%M")
            ))?;
        }
    }

    Ok(())
}
