use super::open_catalog;
use anidl::config::ConfigManager;
use anidl::download::provider::dir_size;
use anidl::download::{DownloadProvider, DownloadStore};
use anyhow::Result;
use console::{Term, style};
use dialoguer::Confirm;
use indicatif::HumanBytes;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

pub async fn handle_clean(config_manager: &ConfigManager, dry_run: bool, yes: bool) -> Result<()> {
    let term = Term::stdout();
    let config = config_manager.config();
    let provider = DownloadProvider::new(&config.storage.downloads_dir);

    if dry_run {
        term.write_line(&format!(
            "{} Dry run - showing what would be cleaned",
            style("🧹").cyan()
        ))?;
    }

    // Work dirs of queued episodes hold resumable parts and are kept.
    let mut keep: HashSet<PathBuf> = HashSet::new();
    match open_catalog(config) {
        Ok(catalog) => {
            let sources = catalog.build_sources(&config.transfer.user_agent)?;
            for entry in DownloadStore::open(&config.storage.queue_file).entries() {
                let Some(found) = catalog.find_episode(entry.episode_id) else {
                    continue;
                };
                let anime = catalog.find_anime(found.episode.anime_id);
                let source = sources.get(entry.source_id);
                if let (Some(anime), Some(source)) = (anime, source) {
                    keep.insert(provider.work_dir(&found.episode, anime, source.as_ref()));
                }
            }
        }
        Err(e) => debug!("Cleaning without catalog: {:#}", e),
    }

    let stale: Vec<(PathBuf, u64)> = provider
        .stale_work_dirs()
        .into_iter()
        .filter(|dir| !keep.contains(dir))
        .map(|dir| {
            let size = dir_size(&dir);
            (dir, size)
        })
        .collect();

    if stale.is_empty() {
        term.write_line(&format!("{} Nothing to clean", style("✨").green()))?;
        return Ok(());
    }

    let total: u64 = stale.iter().map(|(_, size)| size).sum();
    for (dir, size) in &stale {
        term.write_line(&format!(
            "   {} {}",
            style(dir.display()).dim(),
            HumanBytes(*size)
        ))?;
    }
    term.write_line(&format!(
        "{} {} stale work dir(s), {}",
        style("📦").cyan(),
        stale.len(),
        HumanBytes(total)
    ))?;

    if dry_run {
        return Ok(());
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt("Delete these directories?")
            .default(false)
            .interact()?;

        if !confirmed {
            term.write_line(&format!("{} Operation cancelled", style("❌").red()))?;
            return Ok(());
        }
    }

    let mut removed = 0;
    for (dir, _) in &stale {
        match fs::remove_dir_all(dir) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove {:?}: {}", dir, e),
        }
    }

    term.write_line(&format!(
        "{} Removed {} of {} director(ies)",
        style("🧹").green(),
        removed,
        stale.len()
    ))?;
    Ok(())
}
