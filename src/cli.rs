use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "anidl")]
#[command(about = "Queue and download anime episodes from configured sources")]
#[command(long_about = "
anidl keeps a persistent queue of anime episodes and downloads them with
bounded concurrency, fetching large videos in resumable byte ranges.

Examples:
  anidl catalog                      # Show anime and episodes in the catalog
  anidl queue 101 102 103            # Queue episodes and start downloading
  anidl run                          # Resume the saved queue
  anidl list --long                  # Show the queue with progress
  anidl remove --anime 7             # Drop every queued episode of an anime
")]
#[command(version)]
pub struct Cli {
    /// Override config file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add episodes to the download queue
    #[command(visible_alias = "q")]
    Queue {
        /// Episode ids from the catalog
        #[arg(required = true, value_name = "EPISODE_ID")]
        episodes: Vec<i64>,

        #[arg(short, long)]
        #[arg(help = "Use the other transfer strategy (single stream vs. ranges)")]
        alternate: bool,

        #[arg(long)]
        #[arg(help = "Only queue, do not start downloading")]
        no_start: bool,
    },

    /// Show the download queue
    #[command(visible_alias = "ls")]
    List {
        #[arg(short, long, value_name = "ID")]
        #[arg(help = "Only show episodes of this anime")]
        anime: Option<i64>,

        #[arg(short = 'l', long)]
        #[arg(help = "Show state and progress of each task")]
        long: bool,
    },

    /// Remove episodes from the queue
    #[command(visible_alias = "rm")]
    Remove {
        #[arg(value_name = "EPISODE_ID", required_unless_present = "anime")]
        episodes: Vec<i64>,

        #[arg(short, long, value_name = "ID", conflicts_with = "episodes")]
        #[arg(help = "Remove every queued episode of this anime")]
        anime: Option<i64>,
    },

    /// Remove every episode from the queue
    Clear {
        #[arg(short, long)]
        #[arg(help = "Skip confirmation prompt")]
        yes: bool,
    },

    /// Download the saved queue until it is empty
    Run {
        #[arg(short, long, value_name = "N")]
        #[arg(help = "Override the number of concurrent downloads")]
        max_concurrent: Option<usize>,
    },

    /// Browse the catalog of sources, anime and episodes
    Catalog {
        #[arg(short, long, value_name = "ID")]
        #[arg(help = "List the episodes of this anime")]
        anime: Option<i64>,
    },

    /// Delete work directories left behind by interrupted downloads
    #[command(visible_alias = "cleanup")]
    Clean {
        #[arg(short, long)]
        #[arg(help = "Show what would be deleted without deleting")]
        dry_run: bool,

        #[arg(short, long)]
        #[arg(help = "Skip confirmation prompt")]
        yes: bool,
    },

    /// Manage configuration
    #[command(visible_alias = "cfg")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the configuration file
    Show {
        #[arg(short, long, value_name = "SECTION")]
        #[arg(help = "Show only one section (general, transfer, storage, preferences, catalog)")]
        section: Option<String>,
    },

    /// Check the configuration for invalid values
    #[command(visible_alias = "check")]
    Validate,

    /// Restore default values
    Reset {
        #[arg(short, long, value_name = "SECTION")]
        #[arg(help = "Section to reset (general, transfer, storage, preferences, catalog)")]
        section: Option<String>,

        #[arg(short, long)]
        #[arg(help = "Skip confirmation prompt")]
        yes: bool,
    },

    /// Print the configuration file location
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_queue() {
        let cli = Cli::try_parse_from(["anidl", "queue", "1", "2", "--alternate"]).unwrap();
        match cli.command {
            Commands::Queue {
                episodes,
                alternate,
                no_start,
            } => {
                assert_eq!(episodes, vec![1, 2]);
                assert!(alternate);
                assert!(!no_start);
            }
            _ => panic!("expected queue"),
        }
    }

    #[test]
    fn test_remove_needs_target() {
        assert!(Cli::try_parse_from(["anidl", "remove"]).is_err());
        assert!(Cli::try_parse_from(["anidl", "remove", "--anime", "3"]).is_ok());
        assert!(Cli::try_parse_from(["anidl", "remove", "4", "--anime", "3"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["anidl", "run", "-v", "--config", "x.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("x.toml")));
    }
}
