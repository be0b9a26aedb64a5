use regex::Regex;
use std::sync::LazyLock;

use crate::source::{Hoster, Video};

static RESOLUTION_IN_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{3,4})p\b").expect("static pattern"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoPreferences {
    /// Substring matched against the video title, e.g. `1080`.
    pub quality: Option<String>,
    /// Hoster name, compared case-insensitively.
    pub hoster: Option<String>,
}

/// Vertical resolution of a video, falling back to a `720p`-style title.
pub fn resolution_of(video: &Video) -> Option<u32> {
    video.resolution.or_else(|| {
        RESOLUTION_IN_TITLE
            .captures(&video.title)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

fn score(hoster: &Hoster, video: &Video, prefs: &VideoPreferences) -> u32 {
    let mut score = 0;

    if video.preferred {
        score += 1_000_000;
    }

    if let Some(wanted) = &prefs.hoster {
        if hoster.name.eq_ignore_ascii_case(wanted) {
            score += 500_000;
        }
    }

    if let Some(quality) = &prefs.quality {
        if !quality.is_empty() && video.title.contains(quality.as_str()) {
            score += 250_000;
        }
    }

    score + resolution_of(video).unwrap_or(0).min(100_000)
}

/// Pick the video to download among all hosters.
///
/// A video flagged as preferred wins, then one from the preferred hoster,
/// then one whose title contains the preferred quality, then the highest
/// resolution. Ties keep the order the source listed them in.
pub fn select_best_video(hosters: &[Hoster], prefs: &VideoPreferences) -> Option<Video> {
    let mut best: Option<(u32, &Video)> = None;

    for hoster in hosters {
        for video in &hoster.videos {
            let score = score(hoster, video, prefs);
            if best.is_none_or(|(best_score, _)| score > best_score) {
                best = Some((score, video));
            }
        }
    }

    best.map(|(_, video)| video.clone())
}
