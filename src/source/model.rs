use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anime {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub anime_id: i64,
    pub name: String,
    #[serde(default)]
    pub scanlator: Option<String>,
    /// Position in the source's listing, higher is newer.
    #[serde(default)]
    pub source_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub url: String,
    pub lang: String,
}

/// A playable stream definition as offered by a hoster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub resolution: Option<u32>,
    #[serde(default)]
    pub bitrate: Option<u32>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub preferred: bool,
    #[serde(default)]
    pub subtitle_tracks: Vec<Track>,
    #[serde(default)]
    pub audio_tracks: Vec<Track>,
}

impl Video {
    pub fn new(url: &str, title: &str) -> Self {
        Self {
            url: url.to_string(),
            title: title.to_string(),
            resolution: None,
            bitrate: None,
            headers: BTreeMap::new(),
            preferred: false,
            subtitle_tracks: Vec::new(),
            audio_tracks: Vec::new(),
        }
    }

    pub fn with_resolution(mut self, resolution: u32) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_audio_track(mut self, url: &str, lang: &str) -> Self {
        self.audio_tracks.push(Track {
            url: url.to_string(),
            lang: lang.to_string(),
        });
        self
    }

    pub fn with_subtitle_track(mut self, url: &str, lang: &str) -> Self {
        self.subtitle_tracks.push(Track {
            url: url.to_string(),
            lang: lang.to_string(),
        });
        self
    }

    pub fn preferred(mut self) -> Self {
        self.preferred = true;
        self
    }

    /// File extension of the stream, taken from the last path segment of the URL.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.url)
    }
}

impl fmt::Display for Video {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.title.is_empty() {
            write!(f, "{}", self.url)
        } else {
            write!(f, "{}", self.title)
        }
    }
}

/// A video provider for one episode, with the qualities it offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hoster {
    pub name: String,
    #[serde(default)]
    pub videos: Vec<Video>,
}

pub(crate) fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let last = path.rsplit('/').next()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
