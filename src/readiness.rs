//! Streaming-readiness predicate.
//!
//! Decides whether sequential playback from the start can begin without the
//! player outrunning the bytes that exist. O(1) per call; it runs on every
//! applied progress sample.

use serde::Deserialize;

use crate::movie::Quality;

/// Assumed playback bitrates in bytes per second
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Bitrates {
    #[serde(rename = "480p")]
    pub p480: u64,
    #[serde(rename = "720p")]
    pub p720: u64,
    #[serde(rename = "1080p")]
    pub p1080: u64,
    #[serde(rename = "2160p")]
    pub p2160: u64,
}

impl Default for Bitrates {
    fn default() -> Self {
        Self {
            p480: 187_500,
            p720: 500_000,
            p1080: 1_000_000,
            p2160: 3_125_000,
        }
    }
}

impl Bitrates {
    pub fn for_quality(&self, quality: Quality) -> u64 {
        match quality {
            Quality::P480 => self.p480,
            Quality::P720 => self.p720,
            Quality::P1080 => self.p1080,
            Quality::P2160 => self.p2160,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// Seconds of playback that must be buffered before starting
    pub min_buffer_secs: u64,
    /// Leading share of the source that must exist, in percent
    pub min_download_percent: f64,
    /// Only stream once the transcoder has produced output
    pub require_transcoded_output: bool,
    /// Transcoded share of the primary quality required when the above is set
    pub min_transcoded_percent: f64,
    pub bitrates: Bitrates,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            min_buffer_secs: 30,
            min_download_percent: 5.0,
            require_transcoded_output: true,
            min_transcoded_percent: 2.0,
            bitrates: Bitrates::default(),
        }
    }
}

/// What is known about a movie's bytes at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReadinessInput {
    /// Bytes known complete from the start of the file
    pub available_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Current download rate in bytes per second, when the daemon reports it
    pub download_rate: Option<u64>,
    /// Primary-quality transcode progress, `None` before transcoding starts
    pub transcoded_percent: Option<f64>,
    pub quality: Option<Quality>,
}

impl ReadinessPolicy {
    /// Bitrate to plan with. Unknown quality assumes the most demanding tier.
    fn bitrate(&self, quality: Option<Quality>) -> u64 {
        self.bitrates
            .for_quality(quality.unwrap_or(Quality::P2160))
            .max(1)
    }
}

/// Whether playback can start now and keep going.
///
/// With a known download rate the player (consuming `bitrate` bytes/s) must never
/// catch up with the download (producing `rate` bytes/s). When the rate is
/// unknown only the byte thresholds apply.
pub fn can_stream(input: &ReadinessInput, policy: &ReadinessPolicy) -> bool {
    let Some(total) = input.total_bytes.filter(|t| *t > 0) else {
        return false;
    };

    if policy.require_transcoded_output {
        match input.transcoded_percent {
            Some(p) if p >= policy.min_transcoded_percent => {}
            _ => return false,
        }
    }

    let available = input.available_bytes.min(total);
    if available == total {
        return true;
    }

    let percent = available as f64 / total as f64 * 100.0;
    if percent < policy.min_download_percent {
        return false;
    }

    let bitrate = policy.bitrate(input.quality);
    let startup = bitrate.saturating_mul(policy.min_buffer_secs).min(total);
    if available < startup {
        return false;
    }

    let Some(rate) = input.download_rate else {
        return true;
    };
    if rate >= bitrate {
        return true;
    }

    // Worst point is the end of the file: the player needs `total` bytes after
    // total/bitrate seconds, by which time the download added rate * that.
    let deficit = total as f64 * (1.0 - rate as f64 / bitrate as f64);
    available as f64 >= deficit + startup as f64
}
