use crate::cli::ConfigAction;
use anidl::config::ConfigManager;
use anyhow::Result;
use console::{Term, style};
use dialoguer::Confirm;
use std::process;

pub async fn handle_config(config_manager: &mut ConfigManager, action: ConfigAction) -> Result<()> {
    let term = Term::stdout();

    match action {
        ConfigAction::Show { section } => {
            let config = config_manager.config();
            let content = match section.as_deref() {
                None => toml::to_string_pretty(config)?,
                Some("general") => toml::to_string_pretty(&config.general)?,
                Some("transfer") => toml::to_string_pretty(&config.transfer)?,
                Some("storage") => toml::to_string_pretty(&config.storage)?,
                Some("preferences") => toml::to_string_pretty(&config.preferences)?,
                Some("catalog") => toml::to_string_pretty(&config.catalog)?,
                Some(s) => {
                    term.write_line(&format!("{} Unknown section: {}", style("❌").red(), s))?;
                    process::exit(1);
                }
            };

            let title = section.as_deref().unwrap_or("Current");
            term.write_line(&format!(
                "{} {} configuration:",
                style("⚙️").cyan(),
                style(title).bold()
            ))?;
            term.write_line("")?;
            term.write_line(&content)?;
        }

        ConfigAction::Validate => {
            term.write_line(&format!(
                "{} Validating configuration...",
                style("🔍").cyan()
            ))?;

            match config_manager.validate() {
                Ok(()) => {
                    term.write_line(&format!("{} Configuration is valid", style("✅").green()))?;
                }
                Err(e) => {
                    term.write_line(&format!(
                        "{} Configuration validation failed:",
                        style("❌").red()
                    ))?;
                    term.write_line(&format!("   {}", e))?;
                    process::exit(1);
                }
            }

            let catalog = &config_manager.config().catalog.path;
            if !catalog.exists() {
                term.write_line(&format!(
                    "{} Catalog file {:?} does not exist yet",
                    style("⚠️").yellow(),
                    catalog
                ))?;
            }
        }

        ConfigAction::Reset { section, yes } => {
            let target = section.as_deref().unwrap_or("all configuration");

            if !yes {
                let confirmed = Confirm::new()
                    .with_prompt(format!(
                        "Are you sure you want to reset {}?",
                        style(target).cyan()
                    ))
                    .default(false)
                    .interact()?;

                if !confirmed {
                    term.write_line(&format!("{} Operation cancelled", style("❌").red()))?;
                    return Ok(());
                }
            }

            config_manager.reset(section.as_deref())?;
            term.write_line(&format!("{} Reset {}", style("🔄").green(), target))?;
        }

        ConfigAction::Path => {
            term.write_line(&config_manager.config_file().display().to_string())?;
        }
    }
    Ok(())
}
