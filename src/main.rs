mod cli;
mod handlers;

use anidl::config::ConfigManager;
use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::process;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let mut config_manager = match &args.config {
        Some(path) => ConfigManager::with_path(path)?,
        None => ConfigManager::new()?,
    };

    if !handlers::should_skip_config_validation(&args.command) {
        if let Err(e) = config_manager.validate() {
            eprintln!("Configuration validation failed: {}", e);
            eprintln!("Run 'anidl config validate' for details or 'anidl config reset' to start over");
            process::exit(1);
        }
    }

    match args.command {
        Commands::Queue {
            episodes,
            alternate,
            no_start,
        } => {
            handlers::handle_queue(&config_manager, episodes, alternate, no_start).await?;
        }
        Commands::List { anime, long } => {
            handlers::handle_list(&config_manager, anime, long || args.verbose).await?;
        }
        Commands::Remove { episodes, anime } => {
            handlers::handle_remove(&config_manager, episodes, anime).await?;
        }
        Commands::Clear { yes } => {
            handlers::handle_clear(&config_manager, yes).await?;
        }
        Commands::Run { max_concurrent } => {
            handlers::handle_run(&config_manager, max_concurrent).await?;
        }
        Commands::Catalog { anime } => {
            handlers::handle_catalog(&config_manager, anime).await?;
        }
        Commands::Clean { dry_run, yes } => {
            handlers::handle_clean(&config_manager, dry_run, yes).await?;
        }
        Commands::Config { action } => {
            handlers::handle_config(&mut config_manager, action).await?;
        }
    }

    Ok(())
}
