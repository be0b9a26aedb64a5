use super::{open_catalog, open_downloader};
use anidl::config::ConfigManager;
use anidl::download::{DownloadEvent, DownloadState, Downloader, DownloaderOptions, TaskKey};
use anyhow::Result;
use console::{Term, style};
use futures_util::{FutureExt, StreamExt, stream};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

pub async fn handle_run(
    config_manager: &ConfigManager,
    max_concurrent: Option<usize>,
) -> Result<()> {
    let config = config_manager.config();
    let mut options = DownloaderOptions::from(config);
    if let Some(n) = max_concurrent {
        options.max_concurrent_downloads = n.max(1);
    }

    let downloader = open_downloader(config, open_catalog(config)?, options)?;
    let restored = downloader.restore().await?;

    let term = Term::stdout();
    term.write_line(&format!(
        "{} {} download(s) in the queue",
        style("📋").cyan(),
        style(restored).bold()
    ))?;

    drive(&downloader).await
}

/// Start the downloader and render its progress until the queue is drained
/// or the user interrupts, in which case running downloads are paused.
pub(crate) async fn drive(downloader: &Downloader) -> Result<()> {
    let term = Term::stdout();
    let queue = downloader.queue();

    let mut events = stream::select(queue.status_flow(), queue.progress_flow());
    if !downloader.start() {
        term.write_line(&format!("{} Nothing to download", style("💤").dim()))?;
        return Ok(());
    }

    let mut bars = TaskBars::new();
    let idle = downloader.wait_idle();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(idle, interrupt);

    loop {
        tokio::select! {
            _ = &mut idle => break,
            _ = &mut interrupt => {
                downloader.pause().await;
                bars.clear();
                term.write_line(&format!(
                    "{} Paused; run 'anidl run' to resume",
                    style("⏸").yellow()
                ))?;
                return Ok(());
            }
            Some(event) = events.next() => bars.update(&event),
        }
    }

    while let Some(Some(event)) = events.next().now_or_never() {
        bars.update(&event);
    }
    bars.clear();

    let failed = queue.count(|t| t.state() == DownloadState::Error);
    if failed == 0 {
        term.write_line(&format!("{} All downloads finished", style("✅").green()))?;
    } else {
        term.write_line(&format!(
            "{} {} download(s) failed; run 'anidl run' to retry",
            style("❌").red(),
            failed
        ))?;
    }
    Ok(())
}

struct TaskBars {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<TaskKey, ProgressBar>,
}

impl TaskBars {
    fn new() -> Self {
        let style = ProgressStyle::with_template("{msg:40!} [{bar:30.cyan/blue}] {pos:>3}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");

        Self {
            multi: MultiProgress::new(),
            style,
            bars: HashMap::new(),
        }
    }

    fn update(&mut self, event: &DownloadEvent) {
        let key = event.task.key();

        match event.state {
            DownloadState::Downloading => {
                let bar = self.bars.entry(key).or_insert_with(|| {
                    let bar = self.multi.add(ProgressBar::new(100));
                    bar.set_style(self.style.clone());
                    bar.set_message(event.task.to_string());
                    bar
                });
                bar.set_position(u64::from(event.progress));
            }
            DownloadState::Downloaded => {
                if let Some(bar) = self.bars.remove(&key) {
                    bar.set_position(100);
                    bar.finish_with_message(format!("{} {}", style("✓").green(), event.task));
                }
            }
            DownloadState::Error => {
                if let Some(bar) = self.bars.remove(&key) {
                    bar.abandon_with_message(format!("{} {}", style("✗").red(), event.task));
                } else {
                    let _ = self
                        .multi
                        .println(format!("{} {}", style("✗").red(), event.task));
                }
            }
            DownloadState::Queue | DownloadState::NotDownloaded => {
                if let Some(bar) = self.bars.remove(&key) {
                    bar.finish_and_clear();
                }
            }
        }
    }

    fn clear(&mut self) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
    }
}
