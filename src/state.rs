//! Movie state machine.
//!
//! ```text
//! requested -> downloading -> transcoding -> ready
//!     \            \              \            \
//!      +------------+--------------+------------+--> error --(retry)--> requested
//! ```
//!
//! Transitions are the only way `status` changes; every method checks its guard
//! and leaves the record untouched when the guard fails.

use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::movie::{JobId, Movie, MovieStatus, Quality};

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid transition for {catalog_id}: {from} -> {to}")]
pub struct TransitionError {
    pub catalog_id: String,
    pub from: MovieStatus,
    pub to: MovieStatus,
}

impl Movie {
    fn guard(&self, allowed: &[MovieStatus], to: MovieStatus) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError {
                catalog_id: self.catalog_id.to_string(),
                from: self.status,
                to,
            })
        }
    }

    fn set_status(&mut self, to: MovieStatus) {
        info!(catalog_id = %self.catalog_id, from = %self.status, to = %to, "movie transition");
        self.status = to;
        self.touch();
    }

    /// `requested -> downloading`, once the daemon accepted the job
    pub fn begin_download(
        &mut self,
        job: JobId,
        magnet_url: String,
        quality: Quality,
    ) -> Result<(), TransitionError> {
        self.guard(&[MovieStatus::Requested], MovieStatus::Downloading)?;
        self.download_job_id = Some(job);
        self.magnet_url = Some(magnet_url);
        self.selected_quality = Some(quality);
        self.set_status(MovieStatus::Downloading);
        Ok(())
    }

    /// `downloading -> transcoding`, once the trigger threshold was crossed
    pub fn begin_transcode(&mut self) -> Result<(), TransitionError> {
        self.guard(&[MovieStatus::Downloading], MovieStatus::Transcoding)?;
        self.set_status(MovieStatus::Transcoding);
        Ok(())
    }

    /// `transcoding -> ready`, once the primary quality finished transcoding
    pub fn mark_ready(&mut self, video_path: PathBuf) -> Result<(), TransitionError> {
        self.guard(&[MovieStatus::Transcoding], MovieStatus::Ready)?;
        if let Some(quality) = self.selected_quality {
            self.available_qualities.insert(quality);
        }
        self.video_path = Some(video_path);
        self.transcode_progress = 100.0;
        self.can_stream = true;
        self.set_status(MovieStatus::Ready);
        Ok(())
    }

    /// Record a finished non-primary quality. No status change.
    pub fn add_available_quality(&mut self, quality: Quality) {
        if matches!(
            self.status,
            MovieStatus::Transcoding | MovieStatus::Ready
        ) && self.available_qualities.insert(quality)
        {
            info!(catalog_id = %self.catalog_id, %quality, "quality available");
            self.touch();
        }
    }

    /// `* -> error`. Returns false when the record already failed; the first
    /// message is kept.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status == MovieStatus::Error {
            return false;
        }
        let message = message.into();
        info!(catalog_id = %self.catalog_id, error = %message, "acquisition failed");
        self.download_job_id = None;
        self.video_path = None;
        self.available_qualities.clear();
        self.can_stream = false;
        self.error_message = Some(message);
        self.set_status(MovieStatus::Error);
        true
    }

    /// `error -> requested`, on explicit caller request
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        self.guard(&[MovieStatus::Error], MovieStatus::Requested)?;
        self.clear_acquisition();
        self.attempt += 1;
        self.set_status(MovieStatus::Requested);
        Ok(())
    }

    /// Drop every acquisition field and go back to an idle `requested` record.
    /// Used by remove when watch history still references the movie.
    pub fn reset(&mut self) {
        self.clear_acquisition();
        if self.status != MovieStatus::Requested {
            self.set_status(MovieStatus::Requested);
        } else {
            self.touch();
        }
    }

    fn clear_acquisition(&mut self) {
        self.selected_quality = None;
        self.download_job_id = None;
        self.magnet_url = None;
        self.total_size = None;
        self.downloaded_size = 0;
        self.download_progress = 0.0;
        self.transcode_progress = 0.0;
        self.download_path = None;
        self.video_path = None;
        self.available_qualities.clear();
        self.can_stream = false;
        self.error_message = None;
    }
}
