#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use hypertube::catalog::StaticCatalog;
use hypertube::daemon::{DaemonError, DownloadDaemon, FileStream, JobFile, JobState, JobStatus};
use hypertube::download::PollPolicy;
use hypertube::progress::TranscodeTrigger;
use hypertube::readiness::ReadinessPolicy;
use hypertube::store::MovieStore;
use hypertube::transcode::{PLAYLIST, TranscodeError, TranscodeJob, Transcoder, feed};
use hypertube::{CatalogId, JobId, Movie, Pipeline, PipelineSettings, Quality, TorrentOption};

pub const FILE_NAME: &str = "Movie.2024.720p.mkv";
pub const FILE_SIZE: u64 = 20_000_000;

/// Content of every downloaded byte; never zero, unlike a hole in a sparse file
static CONTENT: [u8; 64 * 1024] = [0xAB; 64 * 1024];

/// In-memory download daemon. Every status poll grows each job by `step` bytes.
pub struct FakeDaemon {
    step: AtomicU64,
    /// Pieces land back half first, so the count runs ahead of the prefix
    scattered: AtomicBool,
    state: Mutex<DaemonState>,
}

#[derive(Default)]
struct DaemonState {
    adds: usize,
    next_id: u32,
    jobs: HashMap<JobId, FakeJob>,
    removed: Vec<(JobId, bool)>,
    /// Contiguous bytes of the file each time a stream was opened
    opened: Vec<u64>,
    status_failures: u32,
}

struct FakeJob {
    downloaded: u64,
    /// Bytes present from the start of the file, what streams may hand out
    prefix: Arc<AtomicU64>,
    error: Option<String>,
}

impl FakeDaemon {
    pub fn new(step: u64) -> Arc<Self> {
        Arc::new(Self {
            step: AtomicU64::new(step),
            scattered: AtomicBool::new(false),
            state: Mutex::new(DaemonState::default()),
        })
    }

    pub fn set_step(&self, step: u64) {
        self.step.store(step, Ordering::SeqCst);
    }

    pub fn set_scattered(&self, scattered: bool) {
        self.scattered.store(scattered, Ordering::SeqCst);
    }

    /// The next `count` status polls fail as if the daemon were unreachable
    pub fn fail_status(&self, count: u32) {
        self.state.lock().status_failures = count;
    }

    pub fn adds(&self) -> usize {
        self.state.lock().adds
    }

    pub fn removed(&self) -> Vec<(JobId, bool)> {
        self.state.lock().removed.clone()
    }

    pub fn opened(&self) -> Vec<u64> {
        self.state.lock().opened.clone()
    }

    pub fn fail_job(&self, job: &JobId, reason: &str) {
        if let Some(job) = self.state.lock().jobs.get_mut(job) {
            job.error = Some(reason.to_string());
        }
    }

    fn prefix_of(&self, downloaded: u64) -> u64 {
        if !self.scattered.load(Ordering::SeqCst) || downloaded == FILE_SIZE {
            return downloaded;
        }
        downloaded.saturating_sub(FILE_SIZE / 2)
    }
}

#[async_trait]
impl DownloadDaemon for FakeDaemon {
    async fn add_by_magnet(&self, _magnet_url: &str, output_dir: &Path) -> Result<JobId, DaemonError> {
        tokio::fs::create_dir_all(output_dir).await.unwrap();

        let mut state = self.state.lock();
        state.adds += 1;
        state.next_id += 1;
        let job = JobId::new(state.next_id.to_string());
        state.jobs.insert(
            job.clone(),
            FakeJob {
                downloaded: 0,
                prefix: Arc::new(AtomicU64::new(0)),
                error: None,
            },
        );
        Ok(job)
    }

    async fn status(&self, job: &JobId) -> Result<JobStatus, DaemonError> {
        let step = self.step.load(Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.status_failures > 0 {
            state.status_failures -= 1;
            return Err(DaemonError::Unreachable("connection reset".to_string()));
        }
        let fake = state
            .jobs
            .get_mut(job)
            .ok_or_else(|| DaemonError::JobNotFound(job.clone()))?;

        if let Some(error) = &fake.error {
            return Ok(JobStatus {
                state: JobState::Error,
                downloaded_size: fake.downloaded,
                total_size: Some(FILE_SIZE),
                download_rate: None,
                file_progress: vec![fake.downloaded, 0],
                error: Some(error.clone()),
            });
        }

        fake.downloaded = (fake.downloaded + step).min(FILE_SIZE);
        fake.prefix
            .store(self.prefix_of(fake.downloaded), Ordering::SeqCst);
        let job_state = if fake.downloaded == FILE_SIZE {
            JobState::Finished
        } else {
            JobState::Live
        };
        Ok(JobStatus {
            state: job_state,
            downloaded_size: fake.downloaded,
            total_size: Some(FILE_SIZE + 10),
            download_rate: Some(2_000_000),
            file_progress: vec![fake.downloaded, 0],
            error: None,
        })
    }

    async fn files(&self, job: &JobId) -> Result<Option<Vec<JobFile>>, DaemonError> {
        if !self.state.lock().jobs.contains_key(job) {
            return Err(DaemonError::JobNotFound(job.clone()));
        }
        Ok(Some(vec![
            JobFile {
                index: 0,
                relative_path: PathBuf::from(FILE_NAME),
                size: FILE_SIZE,
            },
            JobFile {
                index: 1,
                relative_path: PathBuf::from("readme.txt"),
                size: 10,
            },
        ]))
    }

    async fn open_stream(&self, job: &JobId, file_index: usize) -> Result<FileStream, DaemonError> {
        assert_eq!(file_index, 0, "only the video file is streamed");
        let prefix = {
            let mut state = self.state.lock();
            let prefix = state
                .jobs
                .get(job)
                .ok_or_else(|| DaemonError::JobNotFound(job.clone()))?
                .prefix
                .clone();
            state.opened.push(prefix.load(Ordering::SeqCst));
            prefix
        };

        // waits for missing bytes like the daemon's stream endpoint does
        let chunks = futures::stream::unfold(0u64, move |pos| {
            let prefix = prefix.clone();
            async move {
                if pos >= FILE_SIZE {
                    return None;
                }
                loop {
                    let end = prefix.load(Ordering::SeqCst).min(FILE_SIZE);
                    if end > pos {
                        let n = (end - pos).min(CONTENT.len() as u64) as usize;
                        let chunk: &'static [u8] = &CONTENT[..n];
                        return Some((Ok::<_, io::Error>(chunk), pos + n as u64));
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }
        });
        Ok(Box::pin(StreamReader::new(chunks)))
    }

    async fn remove(&self, job: &JobId, delete_files: bool) -> Result<(), DaemonError> {
        let mut state = self.state.lock();
        state.jobs.remove(job);
        state.removed.push((job.clone(), delete_files));
        Ok(())
    }

    async fn ping(&self) -> Result<(), DaemonError> {
        Ok(())
    }
}

/// Sink standing in for ffmpeg's stdin
#[derive(Debug, Default)]
struct Inspect {
    bytes: u64,
    zeros: u64,
}

impl AsyncWrite for Inspect {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.bytes += buf.len() as u64;
        self.zeros += buf.iter().filter(|b| **b == 0).count() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeed,
    /// Report a little progress, then exit with the message
    Crash(String),
}

/// What one finished run consumed from its source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fed {
    pub quality: Quality,
    pub bytes: u64,
    pub zeros: u64,
}

/// Transcoder that feeds its source into a counting sink like ffmpeg's stdin
/// and writes a playlist at the end
pub struct FakeTranscoder {
    outcomes: Mutex<HashMap<Quality, Outcome>>,
    started: Mutex<Vec<Quality>>,
    fed: Mutex<Vec<Fed>>,
}

impl FakeTranscoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            fed: Mutex::new(Vec::new()),
        })
    }

    pub fn set_outcome(&self, quality: Quality, outcome: Outcome) {
        self.outcomes.lock().insert(quality, outcome);
    }

    pub fn started(&self) -> Vec<Quality> {
        self.started.lock().clone()
    }

    pub fn fed(&self) -> Vec<Fed> {
        self.fed.lock().clone()
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        job: TranscodeJob,
        progress: watch::Sender<f64>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, TranscodeError> {
        let outcome = self
            .outcomes
            .lock()
            .get(&job.quality)
            .cloned()
            .unwrap_or(Outcome::Succeed);
        self.started.lock().push(job.quality);

        if let Outcome::Crash(message) = outcome {
            progress.send_replace(1.0);
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Err(TranscodeError::Exit(message));
        }

        let mut sink = Inspect::default();
        tokio::select! {
            _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
            fed = feed(job.source, &mut sink, job.source_size, &progress, Duration::from_secs(5)) => {
                fed?;
            }
        }
        self.fed.lock().push(Fed {
            quality: job.quality,
            bytes: sink.bytes,
            zeros: sink.zeros,
        });

        tokio::fs::create_dir_all(&job.output_dir).await.unwrap();
        let playlist = job.output_dir.join(PLAYLIST);
        tokio::fs::write(&playlist, "#EXTM3U\n#EXT-X-ENDLIST\n")
            .await
            .unwrap();
        Ok(playlist)
    }
}

pub fn option(title: &str, quality: Quality, seeders: u32) -> TorrentOption {
    TorrentOption {
        title: title.to_string(),
        quality: Some(quality),
        magnet_url: Some(format!("magnet:?xt=urn:btih:{}", title.len())),
        info_hash: None,
        link: None,
        size: None,
        seeders: Some(seeders),
    }
}

pub fn catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with(
            "tt0000001",
            vec![
                option("Movie.2024.720p.WEB", Quality::P720, 40),
                option("Movie.2024.1080p.BluRay", Quality::P1080, 12),
            ],
        )
        .with("tt0000002", vec![option("Other.720p", Quality::P720, 5)])
        .with("tt0000003", vec![option("Third.1080p", Quality::P1080, 5)])
}

pub fn settings(root: &Path) -> PipelineSettings {
    PipelineSettings {
        default_quality: Quality::P720,
        extra_qualities: Vec::new(),
        trigger: TranscodeTrigger {
            percent: 40.0,
            leading_bytes: None,
        },
        readiness: ReadinessPolicy::default(),
        poll: PollPolicy {
            interval: Duration::from_millis(10),
            max_failures: 3,
            backoff_max: Duration::from_millis(50),
            stall_timeout: Duration::from_secs(10),
        },
        download_dir: root.join("downloads"),
        video_dir: root.join("videos"),
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub daemon: Arc<FakeDaemon>,
    pub transcoder: Arc<FakeTranscoder>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|_| {}, MovieStore::in_memory())
    }

    pub fn build(tweak: impl FnOnce(&mut PipelineSettings), store: MovieStore) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        tweak(&mut settings);

        let daemon = FakeDaemon::new(FILE_SIZE / 10);
        let transcoder = FakeTranscoder::new();
        let pipeline = Pipeline::new(
            settings,
            store,
            Arc::new(catalog()),
            daemon.clone(),
            transcoder.clone(),
        );
        Self {
            dir,
            daemon,
            transcoder,
            pipeline,
        }
    }

    /// Poll the movie until `done` holds, panicking after a few seconds
    pub async fn wait_for(&self, id: &str, done: impl Fn(&Movie) -> bool) -> Movie {
        let id = CatalogId::from(id);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(movie) = self.pipeline.snapshot(&id)
                && done(&movie)
            {
                return movie;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting on {}: {:?}",
                    id,
                    self.pipeline.snapshot(&id)
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the movie's attempt has fully wound down
    pub async fn wait_idle(&self, id: &str) {
        let id = CatalogId::from(id);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.pipeline.is_active(&id) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "attempt for {} never ended",
                id
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
