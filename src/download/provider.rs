//! Where downloads live on disk.
//!
//! `<downloads>/<source>/<anime>/<episode>/` holds a finished episode. While
//! it is being fetched the same path with a `_tmp` suffix is used as the work
//! directory, and it is renamed into place once everything is assembled.

use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use sysinfo::Disks;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::error::DownloadError;
use crate::source::model::extension_of;
use crate::source::{Anime, Episode, Source, Video};

pub const TMP_DIR_SUFFIX: &str = "_tmp";

const MAX_FILENAME_BYTES: usize = 240;

static INVALID_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\x00-\x1f"*/:<>?\\|]"#).expect("static pattern"));

/// Replace characters that are not allowed in file names and trim the result
/// to a length every common filesystem accepts.
pub fn build_valid_filename(name: &str) -> String {
    let cleaned = INVALID_FILENAME_CHARS.replace_all(name.trim(), "_");
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());

    let mut end = cleaned.len().min(MAX_FILENAME_BYTES);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    let cleaned = &cleaned[..end];

    if cleaned.is_empty() {
        "(invalid)".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct DownloadProvider {
    downloads_dir: PathBuf,
}

impl DownloadProvider {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn source_dir_name(source: &dyn Source) -> String {
        build_valid_filename(source.name())
    }

    pub fn anime_dir_name(anime: &Anime) -> String {
        build_valid_filename(&anime.title)
    }

    pub fn episode_dir_name(episode: &Episode) -> String {
        let name = if episode.name.trim().is_empty() {
            "Episode"
        } else {
            episode.name.as_str()
        };

        match episode.scanlator.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(scanlator) => build_valid_filename(&format!("{}_{}", scanlator, name)),
            None => build_valid_filename(name),
        }
    }

    /// Names an episode directory may have on disk, current naming first.
    /// Directories written before blank names and scanlators were normalised
    /// used the raw values.
    pub fn episode_dir_names(episode: &Episode) -> Vec<String> {
        let current = Self::episode_dir_name(episode);
        let legacy = build_valid_filename(&match &episode.scanlator {
            Some(scanlator) => format!("{}_{}", scanlator, episode.name),
            None => episode.name.clone(),
        });

        if legacy == current {
            vec![current]
        } else {
            vec![current, legacy]
        }
    }

    pub fn anime_path(&self, anime: &Anime, source: &dyn Source) -> PathBuf {
        self.downloads_dir
            .join(Self::source_dir_name(source))
            .join(Self::anime_dir_name(anime))
    }

    /// Directory of an anime, created if missing.
    pub fn anime_dir(&self, anime: &Anime, source: &dyn Source) -> io::Result<PathBuf> {
        let dir = self.anime_path(anime, source);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Directory of an already downloaded episode, if any.
    pub fn find_episode_dir(
        &self,
        episode: &Episode,
        anime: &Anime,
        source: &dyn Source,
    ) -> Option<PathBuf> {
        let anime_dir = self.anime_path(anime, source);
        Self::episode_dir_names(episode)
            .into_iter()
            .map(|name| anime_dir.join(name))
            .find(|dir| dir.is_dir())
    }

    pub fn is_downloaded(&self, episode: &Episode, anime: &Anime, source: &dyn Source) -> bool {
        self.find_episode_dir(episode, anime, source).is_some()
    }

    pub fn episode_path(&self, episode: &Episode, anime: &Anime, source: &dyn Source) -> PathBuf {
        self.anime_path(anime, source).join(Self::episode_dir_name(episode))
    }

    pub fn work_dir(&self, episode: &Episode, anime: &Anime, source: &dyn Source) -> PathBuf {
        let mut name = Self::episode_dir_name(episode);
        name.push_str(TMP_DIR_SUFFIX);
        self.anime_path(anime, source).join(name)
    }

    /// File name of the main video, `<anime> - <episode>.<ext>`.
    pub fn video_file_name(anime: &Anime, episode: &Episode, video: &Video) -> String {
        let ext = video.extension().unwrap_or_else(|| "mp4".to_string());
        let stem = build_valid_filename(&format!("{} - {}", anime.title, episode.name));
        format!("{}.{}", stem, ext)
    }

    /// File name of a sidecar track next to the video, `<anime> - <episode>.<lang>.<ext>`.
    pub fn track_file_name(
        anime: &Anime,
        episode: &Episode,
        lang: &str,
        url: &str,
        fallback_ext: &str,
    ) -> String {
        let ext = extension_of(url).unwrap_or_else(|| fallback_ext.to_string());
        let stem = build_valid_filename(&format!(
            "{} - {}.{}",
            anime.title,
            episode.name,
            build_valid_filename(lang)
        ));
        format!("{}.{}", stem, ext)
    }

    /// Free space on the volume holding the downloads directory, if known.
    pub fn available_space(&self) -> Option<u64> {
        let mut target = self.downloads_dir.clone();
        while !target.exists() {
            if !target.pop() {
                return None;
            }
        }
        let target = fs::canonicalize(&target).unwrap_or(target);

        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }

    /// Fail when the downloads volume has less than `required` bytes free.
    /// An unknown amount of free space is not an error.
    pub fn ensure_free_space(&self, required: u64) -> Result<(), DownloadError> {
        match self.available_space() {
            Some(available) if available < required => {
                Err(DownloadError::InsufficientSpace {
                    available,
                    required,
                })
            }
            Some(_) => Ok(()),
            None => {
                debug!("Free space of {:?} unknown, continuing", self.downloads_dir);
                Ok(())
            }
        }
    }

    /// Rename a finished work directory to its final episode directory.
    pub fn finalize(&self, work_dir: &Path, episode_dir: &Path) -> io::Result<()> {
        if episode_dir.exists() {
            warn!("Replacing existing episode directory {:?}", episode_dir);
            fs::remove_dir_all(episode_dir)?;
        }
        fs::rename(work_dir, episode_dir)?;
        debug!("Finalized {:?}", episode_dir);
        Ok(())
    }

    /// Work directories left behind by interrupted or failed downloads.
    pub fn stale_work_dirs(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.downloads_dir)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(TMP_DIR_SUFFIX))
            .map(|entry| entry.into_path())
            .collect()
    }
}

/// Total size of the files under `dir`.
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use tempfile::TempDir;

    fn anime() -> Anime {
        Anime {
            id: 1,
            source_id: 1,
            title: "Frieren: Beyond Journey's End".to_string(),
        }
    }

    fn episode(name: &str, scanlator: Option<&str>) -> Episode {
        Episode {
            id: 1,
            anime_id: 1,
            name: name.to_string(),
            scanlator: scanlator.map(str::to_string),
            source_order: 1,
        }
    }

    #[test]
    fn test_build_valid_filename() {
        assert_eq!(build_valid_filename("a/b:c?"), "a_b_c_");
        assert_eq!(build_valid_filename("  name.  "), "name");
        assert_eq!(build_valid_filename("..."), "(invalid)");
        assert_eq!(build_valid_filename(&"é".repeat(200)).len(), 240);
    }

    #[test]
    fn test_episode_dir_names() {
        assert_eq!(
            DownloadProvider::episode_dir_name(&episode("Episode 1", Some("subs"))),
            "subs_Episode 1"
        );
        assert_eq!(DownloadProvider::episode_dir_name(&episode("  ", None)), "Episode");
        assert_eq!(
            DownloadProvider::episode_dir_names(&episode("Ep 2", Some(" "))),
            vec!["Ep 2".to_string(), "_Ep 2".to_string()]
        );
        assert_eq!(DownloadProvider::episode_dir_names(&episode("Ep 3", None)).len(), 1);
    }

    #[test]
    fn test_layout_and_lookup() {
        let tmp = TempDir::new().unwrap();
        let provider = DownloadProvider::new(tmp.path());
        let source = MemorySource::new(1, "Source/One");
        let anime = anime();
        let episode = episode("Episode 1", None);

        let work = provider.work_dir(&episode, &anime, &source);
        assert!(work.ends_with("Source_One/Frieren_ Beyond Journey's End/Episode 1_tmp"));
        assert!(!provider.is_downloaded(&episode, &anime, &source));

        fs::create_dir_all(&work).unwrap();
        assert_eq!(provider.stale_work_dirs(), vec![work.clone()]);

        let final_dir = provider.episode_path(&episode, &anime, &source);
        provider.finalize(&work, &final_dir).unwrap();
        assert_eq!(
            provider.find_episode_dir(&episode, &anime, &source),
            Some(final_dir)
        );
        assert!(provider.stale_work_dirs().is_empty());
    }

    #[test]
    fn test_file_names() {
        let anime = anime();
        let episode = episode("Episode 1", None);
        let video = Video::new("https://cdn.example.com/v/1.mkv?sig=x", "1080p");

        assert_eq!(
            DownloadProvider::video_file_name(&anime, &episode, &video),
            "Frieren_ Beyond Journey's End - Episode 1.mkv"
        );
        assert_eq!(
            DownloadProvider::video_file_name(&anime, &episode, &Video::new("https://x/stream", "")),
            "Frieren_ Beyond Journey's End - Episode 1.mp4"
        );
        assert_eq!(
            DownloadProvider::track_file_name(&anime, &episode, "en", "https://x/subs.vtt", "srt"),
            "Frieren_ Beyond Journey's End - Episode 1.en.vtt"
        );
    }

    #[test]
    fn test_free_space_check() {
        let tmp = TempDir::new().unwrap();
        let provider = DownloadProvider::new(tmp.path());
        assert!(provider.ensure_free_space(0).is_ok());
        if provider.available_space().is_some() {
            assert!(matches!(
                provider.ensure_free_space(u64::MAX),
                Err(DownloadError::InsufficientSpace { .. })
            ));
        }
    }
}
