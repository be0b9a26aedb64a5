use super::open_catalog;
use anidl::config::ConfigManager;
use anidl::download::{DownloadProvider, DownloadStore};
use anyhow::Result;
use console::{Term, style};
use std::collections::HashSet;
use std::process;

pub async fn handle_catalog(config_manager: &ConfigManager, anime_id: Option<i64>) -> Result<()> {
    let term = Term::stdout();
    let config = config_manager.config();
    let catalog = open_catalog(config)?;

    let Some(anime_id) = anime_id else {
        for source in &catalog.sources {
            term.write_line(&format!(
                "{} {} {}",
                style("🌐").cyan(),
                style(&source.name).bold(),
                style(format!("[{}]", source.id)).dim()
            ))?;
            for anime in catalog.anime.iter().filter(|a| a.source_id == source.id) {
                term.write_line(&format!(
                    "   {:>5}  {} ({} episodes)",
                    anime.id,
                    style(&anime.title).cyan(),
                    catalog.episodes_for(anime.id).len()
                ))?;
            }
        }
        return Ok(());
    };

    let Some(anime) = catalog.find_anime(anime_id) else {
        term.write_line(&format!(
            "{} No anime with id {} in the catalog",
            style("❌").red(),
            anime_id
        ))?;
        process::exit(1);
    };

    let sources = catalog.build_sources(&config.transfer.user_agent)?;
    let source = sources.get(anime.source_id);
    let provider = DownloadProvider::new(&config.storage.downloads_dir);
    let queued: HashSet<i64> = DownloadStore::open(&config.storage.queue_file)
        .entries()
        .into_iter()
        .map(|e| e.episode_id)
        .collect();

    term.write_line(&format!(
        "{} {}",
        style("📺").cyan(),
        style(&anime.title).bold()
    ))?;

    let mut episodes = catalog.episodes_for(anime.id);
    episodes.sort_by_key(|e| e.episode.source_order);

    for entry in episodes {
        let episode = &entry.episode;
        let status = if source
            .as_ref()
            .is_some_and(|s| provider.is_downloaded(episode, anime, s.as_ref()))
        {
            style("downloaded").green()
        } else if queued.contains(&episode.id) {
            style("queued").yellow()
        } else {
            style("available").dim()
        };

        term.write_line(&format!(
            "   {:>6}  {:<40} {:>3} hoster(s)  {}",
            episode.id,
            episode.name,
            entry.hosters.len(),
            status
        ))?;
    }

    Ok(())
}
