use anyhow::{Context, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::download::{
    DownloaderOptions, ProgressSettings, RetryPolicy, TransferOptions, VideoPreferences,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub preferences: PreferencesConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_downloads_per_source")]
    pub downloads_per_source: usize,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_queue_warning_threshold")]
    pub queue_warning_threshold: usize,
    #[serde(default = "default_episodes_per_source_warning_threshold")]
    pub episodes_per_source_warning_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_parts_per_video")]
    pub parts_per_video: usize,
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_progress_debounce_ms")]
    pub progress_debounce_ms: u64,
    #[serde(default = "default_resolve_poll_ms")]
    pub resolve_poll_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_true")]
    pub download_tracks: bool,
    #[serde(default = "default_true")]
    pub prefer_segmented: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferencesConfig {
    #[serde(default)]
    pub preferred_quality: Option<String>,
    #[serde(default)]
    pub preferred_hoster: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "anidl")
}

fn default_max_concurrent_downloads() -> usize {
    3
}
fn default_downloads_per_source() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_queue_warning_threshold() -> usize {
    20
}
fn default_episodes_per_source_warning_threshold() -> usize {
    10
}
fn default_parts_per_video() -> usize {
    4
}
fn default_min_part_size() -> u64 {
    1024 * 1024
}
fn default_max_concurrent_parts() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    2000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_progress_debounce_ms() -> u64 {
    100
}
fn default_resolve_poll_ms() -> u64 {
    50
}
fn default_user_agent() -> String {
    format!("anidl/{}", env!("CARGO_PKG_VERSION"))
}
fn default_downloads_dir() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("downloads"))
        .join("anidl")
}
fn default_queue_file() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("queue.json")
}
fn default_min_free_space_mb() -> u64 {
    200
}
fn default_catalog_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("catalog.toml")
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            downloads_per_source: default_downloads_per_source(),
            auto_start: true,
            queue_warning_threshold: default_queue_warning_threshold(),
            episodes_per_source_warning_threshold: default_episodes_per_source_warning_threshold(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parts_per_video: default_parts_per_video(),
            min_part_size: default_min_part_size(),
            max_concurrent_parts: default_max_concurrent_parts(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            progress_debounce_ms: default_progress_debounce_ms(),
            resolve_poll_ms: default_resolve_poll_ms(),
            user_agent: default_user_agent(),
            download_tracks: true,
            prefer_segmented: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
            queue_file: default_queue_file(),
            min_free_space_mb: default_min_free_space_mb(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

impl From<&Config> for DownloaderOptions {
    fn from(config: &Config) -> Self {
        let transfer = &config.transfer;
        Self {
            max_concurrent_downloads: config.general.max_concurrent_downloads,
            downloads_per_source: config.general.downloads_per_source,
            prefer_segmented: transfer.prefer_segmented,
            download_tracks: transfer.download_tracks,
            min_free_space: config.storage.min_free_space_mb.saturating_mul(1024 * 1024),
            queue_warning_threshold: config.general.queue_warning_threshold,
            episodes_per_source_warning_threshold: config
                .general
                .episodes_per_source_warning_threshold,
            preferences: VideoPreferences {
                quality: config.preferences.preferred_quality.clone(),
                hoster: config.preferences.preferred_hoster.clone(),
            },
            progress: ProgressSettings {
                debounce: Duration::from_millis(transfer.progress_debounce_ms),
                resolve_poll: Duration::from_millis(transfer.resolve_poll_ms),
            },
            transfer: TransferOptions {
                parts_per_video: transfer.parts_per_video,
                min_part_size: transfer.min_part_size,
                max_concurrent_parts: transfer.max_concurrent_parts,
                retry: RetryPolicy {
                    max_attempts: transfer.max_attempts,
                    initial_backoff: Duration::from_millis(transfer.initial_backoff_ms),
                    max_backoff: Duration::from_millis(transfer.max_backoff_ms),
                },
            },
        }
    }
}

pub struct ConfigManager {
    config_file: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Load the config from the platform config directory, writing the
    /// defaults there on first run.
    pub fn new() -> Result<Self> {
        let project_dirs = project_dirs().context("Failed to determine config directory")?;
        Self::with_path(project_dirs.config_dir().join("config.toml"))
    }

    /// Load the config from an explicit file, creating it with defaults when
    /// it does not exist yet.
    pub fn with_path(config_file: impl Into<PathBuf>) -> Result<Self> {
        let config_file = config_file.into();

        if let Some(dir) = config_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            if !dir.exists() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
            }
        }

        let config = if config_file.exists() {
            Self::load_config(&config_file)?
        } else {
            let default_config = Config::default();
            Self::save_config(&config_file, &default_config)?;
            default_config
        };

        Ok(Self {
            config_file,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn save(&self) -> Result<()> {
        Self::save_config(&self.config_file, &self.config)
    }

    /// Replace the whole config, or a single section, with its defaults.
    pub fn reset(&mut self, section: Option<&str>) -> Result<()> {
        match section {
            None => self.config = Config::default(),
            Some("general") => self.config.general = GeneralConfig::default(),
            Some("transfer") => self.config.transfer = TransferConfig::default(),
            Some("storage") => self.config.storage = StorageConfig::default(),
            Some("preferences") => self.config.preferences = PreferencesConfig::default(),
            Some("catalog") => self.config.catalog = CatalogConfig::default(),
            Some(other) => anyhow::bail!("Unknown config section '{}'", other),
        }
        self.save()
    }

    fn load_config(config_file: &Path) -> Result<Config> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_file))
    }

    fn save_config(config_file: &Path, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(config_file, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let general = &self.config.general;
        if general.max_concurrent_downloads == 0 {
            anyhow::bail!("max_concurrent_downloads must be greater than 0");
        }
        if general.downloads_per_source == 0 {
            anyhow::bail!("downloads_per_source must be greater than 0");
        }

        let transfer = &self.config.transfer;
        if transfer.parts_per_video == 0 {
            anyhow::bail!("parts_per_video must be greater than 0");
        }
        if transfer.max_concurrent_parts == 0 {
            anyhow::bail!("max_concurrent_parts must be greater than 0");
        }
        if transfer.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }
        if transfer.initial_backoff_ms > transfer.max_backoff_ms {
            anyhow::bail!(
                "initial_backoff_ms ({}) must not exceed max_backoff_ms ({})",
                transfer.initial_backoff_ms,
                transfer.max_backoff_ms
            );
        }
        if transfer.resolve_poll_ms == 0 {
            anyhow::bail!("resolve_poll_ms must be greater than 0");
        }
        if transfer.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent cannot be empty");
        }

        if self.config.storage.downloads_dir.as_os_str().is_empty() {
            anyhow::bail!("downloads_dir cannot be empty");
        }
        if self.config.storage.queue_file.as_os_str().is_empty() {
            anyhow::bail!("queue_file cannot be empty");
        }

        Ok(())
    }
}
