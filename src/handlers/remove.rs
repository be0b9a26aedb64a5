use anidl::config::ConfigManager;
use anidl::download::DownloadStore;
use anyhow::Result;
use console::{Term, style};

pub async fn handle_remove(
    config_manager: &ConfigManager,
    episode_ids: Vec<i64>,
    anime_id: Option<i64>,
) -> Result<()> {
    let term = Term::stdout();
    let store = DownloadStore::open(&config_manager.config().storage.queue_file);

    let targets: Vec<i64> = store
        .entries()
        .into_iter()
        .filter(|e| match anime_id {
            Some(anime) => e.anime_id == anime,
            None => episode_ids.contains(&e.episode_id),
        })
        .map(|e| e.episode_id)
        .collect();

    if targets.is_empty() {
        term.write_line(&format!(
            "{} Nothing matching is queued",
            style("💤").dim()
        ))?;
        return Ok(());
    }

    store.remove_episodes(&targets)?;
    term.write_line(&format!(
        "{} Removed {} download(s) from the queue",
        style("🗑").green(),
        targets.len()
    ))?;

    let not_queued: Vec<String> = episode_ids
        .iter()
        .filter(|id| !targets.contains(id))
        .map(i64::to_string)
        .collect();
    if !not_queued.is_empty() {
        term.write_line(&format!(
            "   {} not queued: {}",
            style("ℹ").dim(),
            not_queued.join(", ")
        ))?;
    }
    Ok(())
}
