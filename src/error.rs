use thiserror::Error;

use crate::movie::Quality;

/// Faults that end (or prevent) an acquisition attempt.
///
/// Everything except `NoTorrentForQuality` and `Catalog` is recorded on the movie
/// as an `error` status; callers only ever see the message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("failed to start download: {0}")]
    DownloadStart(String),

    #[error("download stalled: no progress for {secs}s")]
    DownloadStalled { secs: u64 },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("failed to start transcode: {0}")]
    TranscodeStart(String),

    #[error("transcode to {quality} failed: {reason}")]
    TranscodeFailure { quality: Quality, reason: String },

    #[error("no torrent available for {0} or any lower quality")]
    NoTorrentForQuality(Quality),

    #[error("catalog lookup failed: {0}")]
    Catalog(String),
}

impl AcquisitionError {
    /// Whether the caller may retry the acquisition as-is
    pub fn is_retryable(&self) -> bool {
        match self {
            AcquisitionError::DownloadStart(_)
            | AcquisitionError::DownloadStalled { .. }
            | AcquisitionError::DownloadFailed(_)
            | AcquisitionError::TranscodeFailure { .. }
            | AcquisitionError::Catalog(_) => true,
            AcquisitionError::TranscodeStart(_) | AcquisitionError::NoTorrentForQuality(_) => {
                false
            }
        }
    }
}
