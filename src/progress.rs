//! Progress aggregation.
//!
//! Samples from the download poller and the transcoder arrive unordered and
//! possibly duplicated (retried polls). A sample only lands when its value is at
//! least what is stored for the same stage, so the stored value is always the
//! maximum seen.

use serde::Deserialize;
use tracing::debug;

use crate::movie::{Movie, MovieStatus, Quality};
use crate::readiness::{self, ReadinessInput, ReadinessPolicy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadSample {
    pub downloaded: u64,
    pub total: Option<u64>,
    /// Bytes per second
    pub rate: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscodeSample {
    pub quality: Quality,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressSample {
    Download(DownloadSample),
    Transcode(TranscodeSample),
}

/// When transcoding starts on a still-incomplete download
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TranscodeTrigger {
    pub percent: f64,
    /// Absolute leading bytes that also trigger, whichever comes first
    pub leading_bytes: Option<u64>,
}

impl Default for TranscodeTrigger {
    fn default() -> Self {
        Self {
            percent: 40.0,
            leading_bytes: None,
        }
    }
}

impl TranscodeTrigger {
    pub fn crossed(&self, movie: &Movie) -> bool {
        let complete = movie
            .total_size
            .is_some_and(|total| total > 0 && movie.downloaded_size >= total);
        let by_bytes = self
            .leading_bytes
            .is_some_and(|bytes| movie.downloaded_size >= bytes);
        complete || by_bytes || movie.download_progress >= self.percent
    }
}

/// Result of applying one sample
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Applied {
    /// The sample was not stale and got written
    pub applied: bool,
    /// Still downloading and the trigger threshold is crossed
    pub trigger_transcode: bool,
    /// `can_stream` flipped to true with this sample
    pub became_streamable: bool,
}

/// Per-movie aggregator. Owned by the movie's driver task.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    trigger: TranscodeTrigger,
    readiness: ReadinessPolicy,
    last_rate: Option<u64>,
}

impl ProgressAggregator {
    pub fn new(trigger: TranscodeTrigger, readiness: ReadinessPolicy) -> Self {
        Self {
            trigger,
            readiness,
            last_rate: None,
        }
    }

    pub fn apply(&mut self, movie: &mut Movie, sample: &ProgressSample) -> Applied {
        let applied = match sample {
            ProgressSample::Download(s) => self.apply_download(movie, s),
            ProgressSample::Transcode(s) => apply_transcode(movie, s),
        };
        if !applied {
            return Applied::default();
        }

        movie.touch();
        let became_streamable = self.update_can_stream(movie);
        Applied {
            applied,
            trigger_transcode: movie.status == MovieStatus::Downloading
                && self.trigger.crossed(movie),
            became_streamable,
        }
    }

    fn apply_download(&mut self, movie: &mut Movie, sample: &DownloadSample) -> bool {
        if !matches!(
            movie.status,
            MovieStatus::Downloading | MovieStatus::Transcoding
        ) {
            debug!(catalog_id = %movie.catalog_id, status = %movie.status, "download sample ignored");
            return false;
        }

        let total = movie.total_size.or(sample.total.filter(|t| *t > 0));
        let downloaded = match total {
            Some(total) => sample.downloaded.min(total),
            None => sample.downloaded,
        };
        let percent = match total {
            Some(total) => downloaded as f64 / total as f64 * 100.0,
            None => movie.download_progress,
        };

        if downloaded < movie.downloaded_size || percent < movie.download_progress {
            debug!(
                catalog_id = %movie.catalog_id,
                downloaded,
                stored = movie.downloaded_size,
                "stale download sample discarded"
            );
            return false;
        }

        movie.total_size = total;
        movie.downloaded_size = downloaded;
        movie.download_progress = percent;
        if sample.rate.is_some() {
            self.last_rate = sample.rate;
        }
        true
    }

    fn update_can_stream(&self, movie: &mut Movie) -> bool {
        if movie.can_stream {
            return false;
        }
        let transcoded_percent = match movie.status {
            MovieStatus::Transcoding | MovieStatus::Ready => Some(movie.transcode_progress),
            _ => None,
        };
        let input = ReadinessInput {
            available_bytes: contiguous_bytes(movie),
            total_bytes: movie.total_size,
            download_rate: self.last_rate,
            transcoded_percent,
            quality: movie.selected_quality,
        };
        if readiness::can_stream(&input, &self.readiness) {
            debug!(catalog_id = %movie.catalog_id, "movie became streamable");
            movie.can_stream = true;
            true
        } else {
            false
        }
    }
}

/// Source bytes known present from the start of the file. The daemon's count
/// covers pieces finished in any order, so short of a complete download only
/// what the primary transcoder has read in sequence counts.
fn contiguous_bytes(movie: &Movie) -> u64 {
    let Some(total) = movie.total_size.filter(|t| *t > 0) else {
        return 0;
    };
    if movie.downloaded_size >= total {
        return total;
    }
    match movie.status {
        MovieStatus::Transcoding | MovieStatus::Ready => {
            (total as f64 * movie.transcode_progress / 100.0) as u64
        }
        _ => 0,
    }
}

fn apply_transcode(movie: &mut Movie, sample: &TranscodeSample) -> bool {
    if movie.status != MovieStatus::Transcoding || movie.selected_quality != Some(sample.quality)
    {
        return false;
    }
    let percent = sample.percent.clamp(0.0, 100.0);
    if percent < movie.transcode_progress {
        debug!(
            catalog_id = %movie.catalog_id,
            percent,
            stored = movie.transcode_progress,
            "stale transcode sample discarded"
        );
        return false;
    }
    movie.transcode_progress = percent;
    true
}
