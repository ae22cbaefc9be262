use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemon::{DaemonError, DownloadDaemon, FileStream, JobFile, JobState, JobStatus};
use crate::error::AcquisitionError;
use crate::movie::{CatalogId, JobId};
use crate::progress::DownloadSample;
use crate::transcode::{SourceOpener, TranscodeError};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v"];

/// Check if a file is a video file based on extension
pub fn is_video_file(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|video| ext.eq_ignore_ascii_case(video))
        })
}

/// The main feature is the largest video file of the torrent
fn main_video_file(files: &[JobFile]) -> Option<&JobFile> {
    files
        .iter()
        .filter(|f| is_video_file(&f.relative_path.to_string_lossy()))
        .max_by_key(|f| f.size)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Consecutive transient failures tolerated before the download is failed
    pub max_failures: u32,
    pub backoff_max: Duration,
    pub stall_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_failures: 5,
            backoff_max: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(600),
        }
    }
}

impl PollPolicy {
    /// Delay before the next attempt after `failures` consecutive misses
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(16);
        self.interval.saturating_mul(factor).min(self.backoff_max)
    }
}

/// What the observer reports for one movie's download
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// Main video file chosen once metadata arrived
    FileResolved {
        path: PathBuf,
        /// Position in the daemon's file list
        index: usize,
        size: u64,
    },
    Progress(DownloadSample),
    Finished,
    Failed(AcquisitionError),
}

/// Daemon job per movie. Entries are added when a job starts and removed when it
/// is cancelled or released.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<CatalogId, JobId>>,
}

impl JobRegistry {
    pub fn get(&self, movie: &CatalogId) -> Option<JobId> {
        self.jobs.lock().get(movie).cloned()
    }

    fn insert(&self, movie: CatalogId, job: JobId) {
        self.jobs.lock().insert(movie, job);
    }

    fn remove(&self, movie: &CatalogId) -> Option<JobId> {
        self.jobs.lock().remove(movie)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

pub struct DownloadController {
    daemon: Arc<dyn DownloadDaemon>,
    registry: JobRegistry,
    download_dir: PathBuf,
    policy: PollPolicy,
}

impl DownloadController {
    pub fn new(daemon: Arc<dyn DownloadDaemon>, download_dir: PathBuf, policy: PollPolicy) -> Self {
        Self {
            daemon,
            registry: JobRegistry::default(),
            download_dir,
            policy,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Folder owned by one movie's download
    pub fn output_dir(&self, movie: &CatalogId) -> PathBuf {
        self.download_dir.join(movie.dir_name())
    }

    /// File `file_index` of `job`, read through the daemon
    pub fn source(&self, job: JobId, file_index: usize) -> DaemonSource {
        DaemonSource {
            daemon: self.daemon.clone(),
            job,
            file_index,
        }
    }

    /// Start downloading `magnet_url` for `movie`.
    ///
    /// Returns the existing job when one is already registered for the movie.
    /// Callers must make sure only one start per movie is in flight.
    pub async fn start(
        &self,
        movie: &CatalogId,
        magnet_url: &str,
    ) -> Result<JobId, AcquisitionError> {
        if let Some(job) = self.registry.get(movie) {
            debug!(catalog_id = %movie, %job, "download already running");
            return Ok(job);
        }

        let output_dir = self.output_dir(movie);
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            AcquisitionError::DownloadStart(format!(
                "cannot create {}: {}",
                output_dir.display(),
                e
            ))
        })?;

        let mut failures = 0;
        let job = loop {
            match self.daemon.add_by_magnet(magnet_url, &output_dir).await {
                Ok(job) => break job,
                Err(e) if e.is_transient() && failures + 1 < self.policy.max_failures => {
                    failures += 1;
                    let delay = self.policy.backoff(failures);
                    warn!(catalog_id = %movie, error = %e, failures, ?delay, "add failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(AcquisitionError::DownloadStart(e.to_string())),
            }
        };

        info!(catalog_id = %movie, %job, "download started");
        self.registry.insert(movie.clone(), job.clone());
        Ok(job)
    }

    /// Poll the daemon for `job` until it finishes, fails or `cancel` fires.
    ///
    /// Transient poll failures are retried with backoff; only `max_failures` misses
    /// in a row fail the download. Events go to `tx`; the loop ends quietly when
    /// the receiver is gone.
    pub async fn observe<E>(
        &self,
        movie: CatalogId,
        job: JobId,
        tx: mpsc::Sender<E>,
        cancel: CancellationToken,
    ) where
        E: From<DownloadEvent> + Send,
    {
        let output_dir = self.output_dir(&movie);
        let mut observer = Observer {
            daemon: self.daemon.as_ref(),
            policy: &self.policy,
            movie: &movie,
            job: &job,
            output_dir: &output_dir,
            file: None,
            failures: 0,
            last_bytes: 0,
            last_change: Instant::now(),
        };

        loop {
            let delay = match observer.failures {
                0 => self.policy.interval,
                n => self.policy.backoff(n),
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(catalog_id = %movie, "download observer cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let events = observer.tick().await;
            let done = events
                .iter()
                .any(|e| matches!(e, DownloadEvent::Finished | DownloadEvent::Failed(_)));
            for event in events {
                if tx.send(E::from(event)).await.is_err() {
                    return;
                }
            }
            if done {
                return;
            }
        }
    }

    /// Release the movie's job. The local release always happens; a failed
    /// remote removal is only logged.
    pub async fn cancel(&self, movie: &CatalogId, delete_files: bool) -> Option<JobId> {
        let job = self.registry.remove(movie)?;
        self.remove_job(movie, &job, delete_files).await;
        Some(job)
    }

    /// Remove a job this controller may not have started, e.g. one recorded by
    /// an earlier process
    pub async fn remove_job(&self, movie: &CatalogId, job: &JobId, delete_files: bool) {
        match self.daemon.remove(job, delete_files).await {
            Ok(()) => info!(catalog_id = %movie, %job, "download cancelled"),
            Err(e) => warn!(
                catalog_id = %movie,
                %job,
                error = %e,
                "daemon did not confirm removal, job released locally"
            ),
        }
    }
}

/// A job's video file as the transcoders read it. The daemon only hands out
/// downloaded bytes, in order, so a reader never sees a piece that is still
/// missing on disk.
pub struct DaemonSource {
    daemon: Arc<dyn DownloadDaemon>,
    job: JobId,
    file_index: usize,
}

#[async_trait]
impl SourceOpener for DaemonSource {
    async fn open(&self) -> Result<FileStream, TranscodeError> {
        self.daemon
            .open_stream(&self.job, self.file_index)
            .await
            .map_err(|e| TranscodeError::SourceUnreadable(e.to_string()))
    }
}

struct Observer<'a> {
    daemon: &'a dyn DownloadDaemon,
    policy: &'a PollPolicy,
    movie: &'a CatalogId,
    job: &'a JobId,
    output_dir: &'a Path,
    /// (daemon file index, size) of the main video file
    file: Option<(usize, u64)>,
    failures: u32,
    last_bytes: u64,
    last_change: Instant,
}

impl Observer<'_> {
    async fn tick(&mut self) -> Vec<DownloadEvent> {
        let status = match self.daemon.status(self.job).await {
            Ok(status) => {
                self.failures = 0;
                status
            }
            Err(e) => return self.poll_miss(e).into_iter().collect(),
        };

        if status.state == JobState::Error {
            let reason = status
                .error
                .unwrap_or_else(|| "daemon reported a job error".to_string());
            return vec![DownloadEvent::Failed(AcquisitionError::DownloadFailed(
                reason,
            ))];
        }

        let mut events = Vec::new();
        if self.file.is_none() {
            match self.daemon.files(self.job).await {
                Ok(Some(files)) => match main_video_file(&files) {
                    Some(file) => {
                        info!(
                            catalog_id = %self.movie,
                            file = %file.relative_path.display(),
                            size = file.size,
                            "main video file resolved"
                        );
                        self.file = Some((file.index, file.size));
                        events.push(DownloadEvent::FileResolved {
                            path: self.output_dir.join(&file.relative_path),
                            index: file.index,
                            size: file.size,
                        });
                    }
                    None => {
                        return vec![DownloadEvent::Failed(AcquisitionError::DownloadFailed(
                            "no video files found in torrent".to_string(),
                        ))];
                    }
                },
                Ok(None) => debug!(catalog_id = %self.movie, "still waiting for metadata"),
                Err(e) if e.is_transient() => {
                    debug!(catalog_id = %self.movie, error = %e, "file listing failed")
                }
                Err(e) => {
                    return vec![DownloadEvent::Failed(AcquisitionError::DownloadFailed(
                        e.to_string(),
                    ))];
                }
            }
        }

        let Some((index, size)) = self.file else {
            return events.into_iter().chain(self.check_stall(0)).collect();
        };

        let sample = file_sample(&status, index, size);
        events.push(DownloadEvent::Progress(sample));
        if status.state == JobState::Finished || sample.downloaded >= size {
            events.push(DownloadEvent::Finished);
            return events;
        }
        events.extend(self.check_stall(sample.downloaded));
        events
    }

    fn poll_miss(&mut self, error: DaemonError) -> Option<DownloadEvent> {
        if !error.is_transient() {
            return Some(DownloadEvent::Failed(AcquisitionError::DownloadFailed(
                error.to_string(),
            )));
        }

        self.failures += 1;
        warn!(
            catalog_id = %self.movie,
            job = %self.job,
            error = %error,
            failures = self.failures,
            "status poll failed"
        );
        if self.failures >= self.policy.max_failures {
            return Some(DownloadEvent::Failed(AcquisitionError::DownloadFailed(
                format!(
                    "daemon unreachable after {} attempts: {}",
                    self.failures, error
                ),
            )));
        }
        None
    }

    fn check_stall(&mut self, bytes: u64) -> Option<DownloadEvent> {
        if bytes > self.last_bytes {
            self.last_bytes = bytes;
            self.last_change = Instant::now();
            return None;
        }
        let idle = self.last_change.elapsed();
        if idle >= self.policy.stall_timeout {
            return Some(DownloadEvent::Failed(AcquisitionError::DownloadStalled {
                secs: idle.as_secs(),
            }));
        }
        None
    }
}

/// Progress of one file out of a job status. The count covers completed
/// pieces anywhere in the file, not a prefix of it.
fn file_sample(status: &JobStatus, index: usize, size: u64) -> DownloadSample {
    let downloaded = status
        .file_progress
        .get(index)
        .copied()
        .unwrap_or_else(|| status.downloaded_size.min(size));
    DownloadSample {
        downloaded: downloaded.min(size),
        total: Some(size),
        rate: status.download_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(index: usize, name: &str, size: u64) -> JobFile {
        JobFile {
            index,
            relative_path: PathBuf::from(name),
            size,
        }
    }

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file("movie.mkv"));
        assert!(is_video_file("Movie.2024.1080p.BluRay.MP4"));
        assert!(!is_video_file("movie.srt"));
        assert!(!is_video_file("movie.nfo"));
        assert!(!is_video_file("trailer_mkv"));
        assert!(!is_video_file("Movie.2024.mkv.part"));
        assert!(!is_video_file("mkv"));
    }

    #[test]
    fn test_main_video_file_is_largest_video() {
        let files = vec![
            file(0, "Movie/sample.mkv", 10),
            file(1, "Movie/Movie.mkv", 1000),
            file(2, "Movie/extras.zip", 5000),
        ];
        assert_eq!(main_video_file(&files).map(|f| f.index), Some(1));
        assert!(main_video_file(&[file(0, "game.iso", 10)]).is_none());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = PollPolicy {
            interval: Duration::from_millis(100),
            backoff_max: Duration::from_millis(1000),
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_file_sample_prefers_file_progress() {
        let status = JobStatus {
            state: JobState::Live,
            downloaded_size: 900,
            total_size: Some(2000),
            download_rate: Some(50),
            file_progress: vec![100, 400],
            error: None,
        };
        let sample = file_sample(&status, 1, 1000);
        assert_eq!(sample.downloaded, 400);
        assert_eq!(sample.total, Some(1000));
        assert_eq!(sample.rate, Some(50));

        let no_files = JobStatus {
            file_progress: Vec::new(),
            ..status
        };
        assert_eq!(file_sample(&no_files, 1, 1000).downloaded, 900);
    }

    /// Adds fail `add_failures` times, status always fails, removal is refused
    #[derive(Default)]
    struct FlakyDaemon {
        add_failures: Mutex<u32>,
        adds: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl DownloadDaemon for FlakyDaemon {
        async fn add_by_magnet(&self, _: &str, _: &Path) -> Result<JobId, DaemonError> {
            *self.adds.lock() += 1;
            let mut left = self.add_failures.lock();
            if *left > 0 {
                *left -= 1;
                return Err(DaemonError::Unreachable("connection refused".to_string()));
            }
            Ok(JobId::new("1"))
        }

        async fn status(&self, _: &JobId) -> Result<JobStatus, DaemonError> {
            Err(DaemonError::Unreachable("connection refused".to_string()))
        }

        async fn files(&self, _: &JobId) -> Result<Option<Vec<JobFile>>, DaemonError> {
            Ok(None)
        }

        async fn open_stream(&self, job: &JobId, _: usize) -> Result<FileStream, DaemonError> {
            Err(DaemonError::JobNotFound(job.clone()))
        }

        async fn remove(&self, _: &JobId, _: bool) -> Result<(), DaemonError> {
            Err(DaemonError::Rejected("nope".to_string()))
        }

        async fn ping(&self) -> Result<(), DaemonError> {
            Ok(())
        }
    }

    fn controller(daemon: Arc<FlakyDaemon>, dir: &Path) -> DownloadController {
        let policy = PollPolicy {
            interval: Duration::from_millis(5),
            max_failures: 3,
            backoff_max: Duration::from_millis(20),
            stall_timeout: Duration::from_secs(60),
        };
        DownloadController::new(daemon, dir.to_path_buf(), policy)
    }

    #[tokio::test]
    async fn test_start_retries_transient_failures_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Arc::new(FlakyDaemon {
            add_failures: Mutex::new(2),
            ..Default::default()
        });
        let controller = controller(daemon.clone(), tmp.path());
        let movie = CatalogId::from("tt1");

        let job = controller.start(&movie, "magnet:?a").await.unwrap();
        assert_eq!(*daemon.adds.lock(), 3);
        assert!(controller.output_dir(&movie).is_dir());

        let again = controller.start(&movie, "magnet:?a").await.unwrap();
        assert_eq!(again, job);
        assert_eq!(*daemon.adds.lock(), 3);
        assert_eq!(controller.registry().get(&movie), Some(job));
    }

    #[tokio::test]
    async fn test_start_gives_up_after_max_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = Arc::new(FlakyDaemon {
            add_failures: Mutex::new(10),
            ..Default::default()
        });
        let controller = controller(daemon, tmp.path());

        let err = controller
            .start(&"tt1".into(), "magnet:?a")
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::DownloadStart(_)));
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_observe_escalates_repeated_poll_misses() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = controller(Arc::new(FlakyDaemon::default()), tmp.path());
        let (tx, mut rx) = mpsc::channel::<DownloadEvent>(8);

        controller
            .observe("tt1".into(), JobId::new("1"), tx, CancellationToken::new())
            .await;

        match rx.recv().await {
            Some(DownloadEvent::Failed(AcquisitionError::DownloadFailed(msg))) => {
                assert!(msg.contains("after 3 attempts"), "{}", msg)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_source_open_maps_daemon_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = controller(Arc::new(FlakyDaemon::default()), tmp.path());

        let err = controller
            .source(JobId::new("4"), 0)
            .open()
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            TranscodeError::SourceUnreadable("job 4 not found in daemon".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancel_releases_locally_when_remote_refuses() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = controller(Arc::new(FlakyDaemon::default()), tmp.path());
        let movie = CatalogId::from("tt1");
        controller.start(&movie, "magnet:?a").await.unwrap();

        assert_eq!(controller.cancel(&movie, true).await, Some(JobId::new("1")));
        assert!(controller.registry().get(&movie).is_none());
        assert_eq!(controller.cancel(&movie, true).await, None);
    }
}
