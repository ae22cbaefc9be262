use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemon::FileStream;
use crate::error::AcquisitionError;
use crate::movie::{CatalogId, Quality};
use crate::progress::TranscodeSample;

/// Name of the playlist written in each quality folder
pub const PLAYLIST: &str = "index.m3u8";

const FEED_CHUNK: usize = 256 * 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranscodeError {
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("no source bytes arrived for {0}s")]
    SourceStalled(u64),

    #[error("failed to launch '{0}': {1}")]
    Spawn(String, String),

    #[error("transcoder exited with {0}")]
    Exit(String),

    #[error("transcoder i/o failed: {0}")]
    Io(String),

    #[error("transcode cancelled")]
    Cancelled,
}

/// Opens readers over one movie's source video
#[async_trait]
pub trait SourceOpener: Send + Sync {
    /// A fresh reader positioned at the first byte
    async fn open(&self) -> Result<FileStream, TranscodeError>;
}

/// One quality of one movie
pub struct TranscodeJob {
    pub movie: CatalogId,
    pub quality: Quality,
    /// Source video in order; reads wait until the bytes are downloaded
    pub source: FileStream,
    pub source_size: u64,
    pub output_dir: PathBuf,
}

/// External transcoding process
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Run `job` to completion and return the playlist path. Progress in percent
    /// goes to `progress`; it must stay below 100 until the output is complete.
    async fn transcode(
        &self,
        job: TranscodeJob,
        progress: watch::Sender<f64>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, TranscodeError>;
}

/// ffmpeg writing segmented HLS output
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    command: String,
    preset: String,
    segment_secs: u32,
    stall_timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(command: &str, preset: &str, segment_secs: u32, stall_timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            preset: preset.to_string(),
            segment_secs,
            stall_timeout,
        }
    }

    fn command(&self, quality: Quality, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-i", "pipe:0"])
            .args(["-map", "0:v:0", "-map", "0:a:0?"])
            .args(["-c:v", "libx264", "-preset", &self.preset])
            .args(["-pix_fmt", "yuv420p"])
            .arg("-vf")
            .arg(format!("scale=-2:{}", quality.height()))
            .args(["-c:a", "aac", "-b:a", "160k"])
            .args(["-f", "hls", "-hls_playlist_type", "event"])
            .arg("-hls_time")
            .arg(self.segment_secs.to_string())
            .arg("-hls_segment_filename")
            .arg(output_dir.join("segment_%05d.ts"))
            .arg(output_dir.join(PLAYLIST));

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        job: TranscodeJob,
        progress: watch::Sender<f64>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, TranscodeError> {
        tokio::fs::create_dir_all(&job.output_dir)
            .await
            .map_err(|e| TranscodeError::Io(e.to_string()))?;

        info!(
            catalog_id = %job.movie,
            quality = %job.quality,
            source_size = job.source_size,
            "starting ffmpeg"
        );
        let mut child = self
            .command(job.quality, &job.output_dir)
            .spawn()
            .map_err(|e| TranscodeError::Spawn(self.command.clone(), e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TranscodeError::Io("ffmpeg stdin not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let feeder = feed(
            job.source,
            stdin,
            job.source_size,
            &progress,
            self.stall_timeout,
        );
        let fed = tokio::select! {
            _ = cancel.cancelled() => None,
            r = feeder => Some(r),
        };
        let closed_early = match fed {
            None => {
                let _ = child.kill().await;
                return Err(TranscodeError::Cancelled);
            }
            Some(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Some(Ok(FeedEnd::ProcessClosed { fed })) if fed < job.source_size => {
                debug!(catalog_id = %job.movie, fed, "ffmpeg closed its input early");
                Some(fed)
            }
            Some(Ok(_)) => None,
        };

        let status = tokio::select! {
            _ = cancel.cancelled() => None,
            s = child.wait() => Some(s),
        };
        let Some(status) = status else {
            let _ = child.kill().await;
            return Err(TranscodeError::Cancelled);
        };
        let status = status.map_err(|e| TranscodeError::Io(e.to_string()))?;

        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let tail = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(TranscodeError::Exit(if tail.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, tail)
            }));
        }
        // a clean exit on part of the input still left the output incomplete
        if let Some(fed) = closed_early {
            return Err(TranscodeError::Exit(format!(
                "input closed early after {} of {} bytes",
                fed, job.source_size
            )));
        }

        Ok(job.output_dir.join(PLAYLIST))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEnd {
    /// Every source byte was written
    Complete,
    /// The process stopped reading after `fed` bytes; its exit status tells why
    ProcessClosed { fed: u64 },
}

/// Copy the first `source_size` bytes of `source` into `sink`.
///
/// `source` may block while the bytes are still being downloaded; a read that
/// yields nothing for `stall_timeout` fails the feed. Progress is bytes fed
/// over `source_size`, capped below 100.
pub async fn feed<R, W>(
    mut source: R,
    mut sink: W,
    source_size: u64,
    progress: &watch::Sender<f64>,
    stall_timeout: Duration,
) -> Result<FeedEnd, TranscodeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; FEED_CHUNK];
    let mut fed = 0u64;

    while fed < source_size {
        let want = (source_size - fed).min(buf.len() as u64) as usize;
        let n = match timeout(stall_timeout, source.read(&mut buf[..want])).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(TranscodeError::SourceUnreadable(e.to_string())),
            Err(_) => return Err(TranscodeError::SourceStalled(stall_timeout.as_secs())),
        };
        if n == 0 {
            return Err(TranscodeError::SourceUnreadable(format!(
                "source ended at {} of {} bytes",
                fed, source_size
            )));
        }

        match sink.write_all(&buf[..n]).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                return Ok(FeedEnd::ProcessClosed { fed });
            }
            Err(e) => return Err(TranscodeError::Io(e.to_string())),
        }
        fed += n as u64;
        progress.send_replace((fed as f64 / source_size as f64 * 100.0).min(99.9));
    }

    match sink.shutdown().await {
        Ok(()) => Ok(FeedEnd::Complete),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(FeedEnd::ProcessClosed { fed }),
        Err(e) => Err(TranscodeError::Io(e.to_string())),
    }
}

/// What the coordinator reports for one movie's transcodes
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeEvent {
    Progress(TranscodeSample),
    Finished { quality: Quality, playlist: PathBuf },
    Failed { quality: Quality, error: TranscodeError },
}

#[derive(Clone)]
pub struct TranscodeRequest {
    pub source: Arc<dyn SourceOpener>,
    pub source_size: u64,
    pub primary: Quality,
    /// Lower qualities produced alongside the primary one
    pub extra: Vec<Quality>,
}

impl TranscodeRequest {
    /// Primary first, then distinct extras below it, highest first
    pub fn qualities(&self) -> Vec<Quality> {
        let mut extra: Vec<Quality> = self
            .extra
            .iter()
            .copied()
            .filter(|q| *q < self.primary)
            .collect();
        extra.sort_unstable_by(|a, b| b.cmp(a));
        extra.dedup();
        std::iter::once(self.primary).chain(extra).collect()
    }
}

/// Runs the transcodes of every movie, at most one set per movie at a time
pub struct TranscodeCoordinator {
    transcoder: Arc<dyn Transcoder>,
    video_dir: PathBuf,
    active: Mutex<HashMap<CatalogId, CancellationToken>>,
}

impl TranscodeCoordinator {
    pub fn new(transcoder: Arc<dyn Transcoder>, video_dir: PathBuf) -> Self {
        Self {
            transcoder,
            video_dir,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Folder owned by one movie's transcoded output
    pub fn output_dir(&self, movie: &CatalogId) -> PathBuf {
        self.video_dir.join(movie.dir_name())
    }

    pub fn is_active(&self, movie: &CatalogId) -> bool {
        self.active.lock().contains_key(movie)
    }

    /// Launch every quality of `request`. Returns the qualities started, empty
    /// when transcodes are already running for the movie or `parent` was
    /// cancelled in the meantime.
    pub async fn start<E>(
        &self,
        movie: &CatalogId,
        request: TranscodeRequest,
        tx: mpsc::Sender<E>,
        parent: &CancellationToken,
    ) -> Result<Vec<Quality>, AcquisitionError>
    where
        E: From<TranscodeEvent> + Send + 'static,
    {
        if self.is_active(movie) {
            debug!(catalog_id = %movie, "transcode already running");
            return Ok(Vec::new());
        }

        if request.source_size == 0 {
            return Err(AcquisitionError::TranscodeStart(
                "source video is empty".to_string(),
            ));
        }

        let qualities = request.qualities();
        let mut sources = Vec::with_capacity(qualities.len());
        for _ in &qualities {
            let source = request
                .source
                .open()
                .await
                .map_err(|e| AcquisitionError::TranscodeStart(e.to_string()))?;
            sources.push(source);
        }

        let token = {
            let mut active = self.active.lock();
            // the attempt may have been removed while the sources opened
            if parent.is_cancelled() || active.contains_key(movie) {
                return Ok(Vec::new());
            }
            let token = parent.child_token();
            active.insert(movie.clone(), token.clone());
            token
        };

        let base = self.output_dir(movie);
        for (quality, source) in qualities.iter().zip(sources) {
            let job = TranscodeJob {
                movie: movie.clone(),
                quality: *quality,
                source,
                source_size: request.source_size,
                output_dir: base.join(quality.label()),
            };
            tokio::spawn(run_one(
                self.transcoder.clone(),
                job,
                tx.clone(),
                token.clone(),
            ));
        }

        info!(catalog_id = %movie, ?qualities, "transcode started");
        Ok(qualities)
    }

    /// Stop running transcodes for the movie
    pub fn cancel(&self, movie: &CatalogId) {
        if let Some(token) = self.active.lock().remove(movie) {
            token.cancel();
            debug!(catalog_id = %movie, "transcode cancelled");
        }
    }

    /// Forget a movie whose transcodes all ended
    pub fn release(&self, movie: &CatalogId) {
        self.active.lock().remove(movie);
    }

    /// Forget the movie's transcodes only if they were cancelled, leaving a
    /// newer attempt's entry alone
    pub fn release_cancelled(&self, movie: &CatalogId) {
        let mut active = self.active.lock();
        if active.get(movie).is_some_and(|token| token.is_cancelled()) {
            active.remove(movie);
        }
    }

    /// Delete transcoded output, e.g. partial output of a failed attempt
    pub async fn discard_output(&self, movie: &CatalogId) {
        let dir = self.output_dir(movie);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(catalog_id = %movie, dir = %dir.display(), "transcoded output removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(catalog_id = %movie, error = %e, "failed to remove transcoded output"),
        }
    }
}

async fn run_one<E>(
    transcoder: Arc<dyn Transcoder>,
    job: TranscodeJob,
    tx: mpsc::Sender<E>,
    cancel: CancellationToken,
) where
    E: From<TranscodeEvent> + Send,
{
    let quality = job.quality;
    let (progress_tx, mut progress_rx) = watch::channel(0.0f64);
    let run = transcoder.transcode(job, progress_tx, cancel);
    tokio::pin!(run);

    let outcome = loop {
        tokio::select! {
            result = &mut run => break result,
            Ok(()) = progress_rx.changed() => {
                let percent = *progress_rx.borrow_and_update();
                let event = TranscodeEvent::Progress(TranscodeSample { quality, percent });
                if tx.send(E::from(event)).await.is_err() {
                    return;
                }
            }
        }
    };

    let event = match outcome {
        Ok(playlist) => TranscodeEvent::Finished { quality, playlist },
        Err(TranscodeError::Cancelled) => return,
        Err(error) => TranscodeEvent::Failed { quality, error },
    };
    let _ = tx.send(E::from(event)).await;
}
