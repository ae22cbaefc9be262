pub mod catalog;
pub mod config;
pub mod daemon;
pub mod doctor;
pub mod download;
pub mod error;
pub mod movie;
pub mod pipeline;
pub mod progress;
pub mod readiness;
pub mod state;
pub mod store;
pub mod transcode;

pub use error::AcquisitionError;
pub use movie::{CatalogId, JobId, Movie, MovieStatus, Quality, TorrentOption};
pub use pipeline::{AcquisitionRequest, Pipeline, PipelineSettings, Playback};
