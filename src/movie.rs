use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AcquisitionError;

/// External catalog identifier (IMDB-style, e.g. `tt0000001`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogId(String);

impl CatalogId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name usable as a single path component
    pub fn dir_name(&self) -> String {
        self.0.replace(['/', '\\', ':', '.'], "_")
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CatalogId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Opaque handle to a job in the download daemon
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovieStatus {
    Requested,
    Downloading,
    Transcoding,
    Ready,
    Error,
}

impl MovieStatus {
    /// Whether an acquisition attempt is in flight
    pub fn is_active(self) -> bool {
        matches!(self, MovieStatus::Downloading | MovieStatus::Transcoding)
    }
}

impl fmt::Display for MovieStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MovieStatus::Requested => "requested",
            MovieStatus::Downloading => "downloading",
            MovieStatus::Transcoding => "transcoding",
            MovieStatus::Ready => "ready",
            MovieStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Resolution tier. Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2160p")]
    P2160,
}

static QUALITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(2160p|4k|uhd|1080p|720p|480p)\b").expect("static regex is valid")
});

impl Quality {
    pub const ALL: [Quality; 4] = [
        Quality::P480,
        Quality::P720,
        Quality::P1080,
        Quality::P2160,
    ];

    /// Output frame height in pixels
    pub fn height(self) -> u32 {
        match self {
            Quality::P480 => 480,
            Quality::P720 => 720,
            Quality::P1080 => 1080,
            Quality::P2160 => 2160,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Quality::P480 => "480p",
            Quality::P720 => "720p",
            Quality::P1080 => "1080p",
            Quality::P2160 => "2160p",
        }
    }

    /// Infer quality from a release title
    /// e.g. "Movie.2019.1080p.BluRay.x264" -> Some(P1080)
    pub fn detect(title: &str) -> Option<Quality> {
        let caps = QUALITY_RE.captures(title)?;
        match caps.get(1)?.as_str().to_lowercase().as_str() {
            "2160p" | "4k" | "uhd" => Some(Quality::P2160),
            "1080p" => Some(Quality::P1080),
            "720p" => Some(Quality::P720),
            "480p" => Some(Quality::P480),
            _ => None,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown quality '{0}' (expected 480p, 720p, 1080p or 2160p)")]
pub struct ParseQualityError(String);

impl FromStr for Quality {
    type Err = ParseQualityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "480p" | "480" => Ok(Quality::P480),
            "720p" | "720" => Ok(Quality::P720),
            "1080p" | "1080" => Ok(Quality::P1080),
            "2160p" | "2160" | "4k" => Ok(Quality::P2160),
            other => Err(ParseQualityError(other.to_string())),
        }
    }
}

/// Persisted movie record, one per catalog id.
///
/// Readers get clones of this struct; treat them as snapshots that may already be stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub catalog_id: CatalogId,
    pub status: MovieStatus,
    pub selected_quality: Option<Quality>,
    pub download_job_id: Option<JobId>,
    pub magnet_url: Option<String>,
    pub total_size: Option<u64>,
    pub downloaded_size: u64,
    pub download_progress: f64,
    pub transcode_progress: f64,
    pub download_path: Option<PathBuf>,
    pub video_path: Option<PathBuf>,
    pub available_qualities: BTreeSet<Quality>,
    pub can_stream: bool,
    pub error_message: Option<String>,
    /// Acquisition attempts started for this record, bumped on every retry
    #[serde(default)]
    pub attempt: u32,
    /// Owned by the watch-history collaborator
    #[serde(default)]
    pub last_watched_at: Option<DateTime<Utc>>,
    /// Owned by the watch-history collaborator
    #[serde(default)]
    pub watch_count: u64,
    /// Owned by the catalog collaborator, never interpreted here
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Movie {
    pub fn new(catalog_id: CatalogId) -> Self {
        let now = Utc::now();
        Self {
            catalog_id,
            status: MovieStatus::Requested,
            selected_quality: None,
            download_job_id: None,
            magnet_url: None,
            total_size: None,
            downloaded_size: 0,
            download_progress: 0.0,
            transcode_progress: 0.0,
            download_path: None,
            video_path: None,
            available_qualities: BTreeSet::new(),
            can_stream: false,
            error_message: None,
            attempt: 1,
            last_watched_at: None,
            watch_count: 0,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether watch history still points at this record
    pub fn is_referenced(&self) -> bool {
        self.last_watched_at.is_some() || self.watch_count > 0
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One downloadable release of a title, as provided by the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentOption {
    pub title: String,
    #[serde(default)]
    pub quality: Option<Quality>,
    #[serde(default)]
    pub magnet_url: Option<String>,
    #[serde(default)]
    pub info_hash: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub seeders: Option<u32>,
}

impl TorrentOption {
    /// Explicit quality, falling back to what the title says
    pub fn effective_quality(&self) -> Option<Quality> {
        self.quality.or_else(|| Quality::detect(&self.title))
    }

    /// Get a URL the daemon can add:
    /// magnet, infohash-based magnet, or .torrent URL
    pub fn torrent_url(&self) -> Option<String> {
        if let Some(ref magnet) = self.magnet_url {
            return Some(magnet.clone());
        }

        if let Some(ref link) = self.link
            && link.starts_with("magnet:")
        {
            return Some(link.clone());
        }

        if let Some(ref hash) = self.info_hash {
            let encoded_name = urlencoding::encode(&self.title);
            return Some(format!("magnet:?xt=urn:btih:{}&dn={}", hash, encoded_name));
        }

        self.link.clone()
    }
}

/// Pick the release to download for `wanted`.
///
/// Exact quality when present, otherwise the closest lower quality that exists.
/// Ties are broken by seeder count.
pub fn select_torrent(
    options: &[TorrentOption],
    wanted: Quality,
) -> Result<(Quality, &TorrentOption), AcquisitionError> {
    options
        .iter()
        .filter(|o| o.torrent_url().is_some())
        .filter_map(|o| o.effective_quality().map(|q| (q, o)))
        .filter(|(q, _)| *q <= wanted)
        .max_by_key(|(q, o)| (*q, o.seeders.unwrap_or(0)))
        .ok_or(AcquisitionError::NoTorrentForQuality(wanted))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(title: &str, quality: Option<Quality>, seeders: u32) -> TorrentOption {
        TorrentOption {
            title: title.to_string(),
            quality,
            magnet_url: Some(format!("magnet:?xt=urn:btih:{}", title.len())),
            info_hash: None,
            link: None,
            size: None,
            seeders: Some(seeders),
        }
    }

    #[test]
    fn test_quality_detect() {
        assert_eq!(
            Quality::detect("Movie.2019.1080p.BluRay.x264"),
            Some(Quality::P1080)
        );
        assert_eq!(Quality::detect("Movie 2019 720p WEB"), Some(Quality::P720));
        assert_eq!(Quality::detect("Movie.2019.4K.HDR"), Some(Quality::P2160));
        assert_eq!(Quality::detect("Movie.2019.DVDRip"), None);
    }

    #[test]
    fn test_quality_ordering_and_parse() {
        assert!(Quality::P480 < Quality::P720);
        assert!(Quality::P1080 < Quality::P2160);
        assert_eq!("1080p".parse::<Quality>(), Ok(Quality::P1080));
        assert_eq!("4K".parse::<Quality>(), Ok(Quality::P2160));
        assert!("360p".parse::<Quality>().is_err());
    }

    #[test]
    fn test_quality_serde_labels() {
        let json = serde_json::to_string(&Quality::P720).unwrap();
        assert_eq!(json, "\"720p\"");
        let q: Quality = serde_json::from_str("\"2160p\"").unwrap();
        assert_eq!(q, Quality::P2160);
    }

    #[test]
    fn test_select_exact_quality() {
        let options = vec![
            option("a", Some(Quality::P480), 10),
            option("b", Some(Quality::P720), 5),
            option("c", Some(Quality::P1080), 1),
        ];
        let (q, chosen) = select_torrent(&options, Quality::P720).unwrap();
        assert_eq!(q, Quality::P720);
        assert_eq!(chosen.title, "b");
    }

    #[test]
    fn test_select_falls_back_to_closest_lower() {
        let options = vec![
            option("a", Some(Quality::P480), 10),
            option("b", Some(Quality::P720), 5),
        ];
        let (q, _) = select_torrent(&options, Quality::P1080).unwrap();
        assert_eq!(q, Quality::P720);
    }

    #[test]
    fn test_select_never_picks_higher() {
        let options = vec![option("a", Some(Quality::P1080), 10)];
        let err = select_torrent(&options, Quality::P720).unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::NoTorrentForQuality(Quality::P720)
        ));
    }

    #[test]
    fn test_select_no_options() {
        let err = select_torrent(&[], Quality::P480).unwrap_err();
        assert!(matches!(err, AcquisitionError::NoTorrentForQuality(_)));
    }

    #[test]
    fn test_select_prefers_seeders_and_detects_from_title() {
        let options = vec![
            option("Movie.720p.WEB", None, 3),
            option("Movie.720p.BluRay", None, 40),
        ];
        let (q, chosen) = select_torrent(&options, Quality::P720).unwrap();
        assert_eq!(q, Quality::P720);
        assert_eq!(chosen.title, "Movie.720p.BluRay");
    }

    #[test]
    fn test_select_skips_unaddable_options() {
        let mut bare = option("Movie.720p", None, 100);
        bare.magnet_url = None;
        let options = vec![bare, option("Movie.480p", None, 1)];
        let (q, _) = select_torrent(&options, Quality::P720).unwrap();
        assert_eq!(q, Quality::P480);
    }

    #[test]
    fn test_torrent_url_from_infohash() {
        let opt = TorrentOption {
            title: "The Movie".to_string(),
            quality: None,
            magnet_url: None,
            info_hash: Some("abcdef".to_string()),
            link: None,
            size: None,
            seeders: None,
        };
        assert_eq!(
            opt.torrent_url().as_deref(),
            Some("magnet:?xt=urn:btih:abcdef&dn=The%20Movie")
        );
    }

    #[test]
    fn test_movie_serializes_camel_case() {
        let movie = Movie::new(CatalogId::from("tt0000001"));
        let json = serde_json::to_value(&movie).unwrap();
        assert_eq!(json["catalogId"], "tt0000001");
        assert_eq!(json["status"], "requested");
        assert_eq!(json["canStream"], false);
    }
}
