use anidl::config::ConfigManager;
use anidl::download::DownloadStore;
use anyhow::Result;
use console::{Term, style};
use dialoguer::Confirm;

pub async fn handle_clear(config_manager: &ConfigManager, yes: bool) -> Result<()> {
    let term = Term::stdout();
    let store = DownloadStore::open(&config_manager.config().storage.queue_file);

    if store.is_empty() {
        term.write_line(&format!("{} The queue is already empty", style("💤").dim()))?;
        return Ok(());
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Remove all {} queued download(s)?",
                style(store.len()).cyan()
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            term.write_line(&format!("{} Operation cancelled", style("❌").red()))?;
            return Ok(());
        }
    }

    let count = store.len();
    store.clear()?;
    term.write_line(&format!(
        "{} Removed {} download(s) from the queue",
        style("🗑").green(),
        count
    ))?;
    Ok(())
}
