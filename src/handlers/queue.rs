use super::{open_catalog, open_downloader, run};
use anidl::config::ConfigManager;
use anidl::download::{DownloaderOptions, EnqueueOptions};
use anyhow::Result;
use console::{Term, style};

pub async fn handle_queue(
    config_manager: &ConfigManager,
    episode_ids: Vec<i64>,
    alternate: bool,
    no_start: bool,
) -> Result<()> {
    let config = config_manager.config();
    let downloader = open_downloader(
        config,
        open_catalog(config)?,
        DownloaderOptions::from(config),
    )?;
    downloader.restore().await?;

    let report = downloader
        .queue_episode_ids(
            &episode_ids,
            EnqueueOptions {
                auto_start: false,
                change_downloader: alternate,
                video: None,
            },
        )
        .await?;

    let term = Term::stdout();
    term.write_line(&format!(
        "{} Queued {} episode(s)",
        style("➕").green(),
        style(report.queued).bold()
    ))?;
    if report.skipped > 0 {
        term.write_line(&format!(
            "   {} already downloaded or queued",
            style(report.skipped).dim()
        ))?;
    }
    if !report.missing.is_empty() {
        let ids: Vec<String> = report.missing.iter().map(i64::to_string).collect();
        term.write_line(&format!(
            "{} Not in the catalog: {}",
            style("⚠️").yellow(),
            ids.join(", ")
        ))?;
    }

    if no_start || !config.general.auto_start {
        term.write_line(&format!(
            "{} Run 'anidl run' to start downloading",
            style("💡").yellow()
        ))?;
        return Ok(());
    }

    run::drive(&downloader).await
}
