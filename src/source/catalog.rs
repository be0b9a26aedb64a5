use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{Anime, EntityLookup, Episode, Hoster, HttpSource, SourceManager};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSource {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEpisode {
    #[serde(flatten)]
    pub episode: Episode,
    #[serde(default)]
    pub hosters: Vec<Hoster>,
}

/// Local description of sources, anime and episodes, with the hosters each
/// episode can be fetched from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub sources: Vec<CatalogSource>,
    #[serde(default)]
    pub anime: Vec<Anime>,
    #[serde(default)]
    pub episodes: Vec<CatalogEpisode>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {:?}", path))?;
        let catalog = Self::parse(&content)
            .with_context(|| format!("Failed to parse catalog file: {:?}", path))?;

        debug!(
            "Loaded catalog with {} sources, {} anime, {} episodes",
            catalog.sources.len(),
            catalog.anime.len(),
            catalog.episodes.len()
        );
        Ok(catalog)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let catalog: Catalog = toml::from_str(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Reject duplicate ids and dangling references.
    pub fn validate(&self) -> Result<()> {
        let mut source_ids = HashSet::new();
        for source in &self.sources {
            if !source_ids.insert(source.id) {
                bail!("Duplicate source id {}", source.id);
            }
        }

        let mut anime_ids = HashSet::new();
        for anime in &self.anime {
            if !anime_ids.insert(anime.id) {
                bail!("Duplicate anime id {}", anime.id);
            }
            if !source_ids.contains(&anime.source_id) {
                bail!(
                    "Anime {} references unknown source {}",
                    anime.id,
                    anime.source_id
                );
            }
        }

        let mut episode_ids = HashSet::new();
        for entry in &self.episodes {
            if !episode_ids.insert(entry.episode.id) {
                bail!("Duplicate episode id {}", entry.episode.id);
            }
            if !anime_ids.contains(&entry.episode.anime_id) {
                bail!(
                    "Episode {} references unknown anime {}",
                    entry.episode.id,
                    entry.episode.anime_id
                );
            }
        }

        Ok(())
    }

    pub fn find_anime(&self, anime_id: i64) -> Option<&Anime> {
        self.anime.iter().find(|a| a.id == anime_id)
    }

    pub fn find_episode(&self, episode_id: i64) -> Option<&CatalogEpisode> {
        self.episodes.iter().find(|e| e.episode.id == episode_id)
    }

    pub fn episodes_for(&self, anime_id: i64) -> Vec<&CatalogEpisode> {
        self.episodes
            .iter()
            .filter(|e| e.episode.anime_id == anime_id)
            .collect()
    }

    /// Build one [`HttpSource`] per catalog source, preloaded with the
    /// hosters of its episodes.
    pub fn build_sources(&self, user_agent: &str) -> Result<SourceManager> {
        let mut manager = SourceManager::new();

        for entry in &self.sources {
            let mut source =
                HttpSource::new(entry.id, &entry.name, user_agent)?.with_headers(entry.headers.clone());

            for anime in self.anime.iter().filter(|a| a.source_id == entry.id) {
                for episode in self.episodes_for(anime.id) {
                    source = source.with_hosters(episode.episode.id, episode.hosters.clone());
                }
            }

            manager.register(Arc::new(source));
        }

        Ok(manager)
    }
}

#[async_trait]
impl EntityLookup for Catalog {
    async fn episode(&self, episode_id: i64) -> Option<(Anime, Episode)> {
        let entry = self.find_episode(episode_id)?;
        let anime = self.find_anime(entry.episode.anime_id)?;
        Some((anime.clone(), entry.episode.clone()))
    }

    async fn anime(&self, anime_id: i64) -> Option<Anime> {
        self.find_anime(anime_id).cloned()
    }

    async fn episodes_of(&self, anime_id: i64) -> Vec<Episode> {
        self.episodes_for(anime_id)
            .into_iter()
            .map(|e| e.episode.clone())
            .collect()
    }
}
