//! Acquisition pipeline.
//!
//! Every acquisition gets a driver task that owns the movie's event loop: the
//! download observer and the transcode runners push events into one channel,
//! the driver folds them into the record through the aggregator and the state
//! machine. Movies never share a driver or a lock beyond the store's lookup.

use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::TorrentCatalog;
use crate::config::Config;
use crate::daemon::DownloadDaemon;
use crate::download::{DownloadController, DownloadEvent, PollPolicy};
use crate::error::AcquisitionError;
use crate::movie::{CatalogId, JobId, Movie, MovieStatus, Quality, select_torrent};
use crate::progress::{ProgressAggregator, ProgressSample, TranscodeTrigger};
use crate::readiness::ReadinessPolicy;
use crate::store::MovieStore;
use crate::transcode::{
    PLAYLIST, TranscodeCoordinator, TranscodeEvent, TranscodeRequest, Transcoder,
};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionRequest {
    pub catalog_id: CatalogId,
    pub quality: Option<Quality>,
}

impl AcquisitionRequest {
    pub fn new(catalog_id: impl Into<CatalogId>, quality: Option<Quality>) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            quality,
        }
    }
}

/// Where a player can read one quality of a movie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playback {
    pub quality: Quality,
    pub playlist: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub default_quality: Quality,
    pub extra_qualities: Vec<Quality>,
    pub trigger: TranscodeTrigger,
    pub readiness: ReadinessPolicy,
    pub poll: PollPolicy,
    pub download_dir: PathBuf,
    pub video_dir: PathBuf,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_quality: config.pipeline.default_quality,
            extra_qualities: config.transcode.extra_qualities.clone(),
            trigger: config.pipeline.trigger(),
            readiness: config.readiness.clone(),
            poll: config.pipeline.poll_policy(),
            download_dir: config.storage.download_dir(),
            video_dir: config.storage.video_dir(),
        }
    }
}

#[derive(Debug)]
enum DriverEvent {
    Download(DownloadEvent),
    Transcode(TranscodeEvent),
}

impl From<DownloadEvent> for DriverEvent {
    fn from(event: DownloadEvent) -> Self {
        DriverEvent::Download(event)
    }
}

impl From<TranscodeEvent> for DriverEvent {
    fn from(event: TranscodeEvent) -> Self {
        DriverEvent::Transcode(event)
    }
}

/// Movies with an acquisition in flight. A claim is taken before any external
/// job starts and dropped when the attempt ends, fails or is removed.
#[derive(Debug, Default)]
struct Claims {
    next: AtomicU64,
    active: Mutex<HashMap<CatalogId, (u64, CancellationToken)>>,
}

impl Claims {
    fn try_claim(&self, id: &CatalogId) -> Option<(u64, CancellationToken)> {
        let mut active = self.active.lock();
        if active.contains_key(id) {
            return None;
        }
        let generation = self.next.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        active.insert(id.clone(), (generation, token.clone()));
        Some((generation, token))
    }

    /// Drop the claim if it still belongs to `generation`
    fn release(&self, id: &CatalogId, generation: u64) {
        let mut active = self.active.lock();
        if active.get(id).is_some_and(|(g, _)| *g == generation) {
            active.remove(id);
        }
    }

    fn revoke(&self, id: &CatalogId) -> Option<CancellationToken> {
        self.active.lock().remove(id).map(|(_, token)| token)
    }

    fn contains(&self, id: &CatalogId) -> bool {
        self.active.lock().contains_key(id)
    }

    fn revoke_all(&self) -> Vec<CancellationToken> {
        self.active
            .lock()
            .drain()
            .map(|(_, (_, token))| token)
            .collect()
    }
}

struct Inner {
    settings: PipelineSettings,
    store: MovieStore,
    catalog: Arc<dyn TorrentCatalog>,
    downloads: DownloadController,
    transcodes: TranscodeCoordinator,
    claims: Claims,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        store: MovieStore,
        catalog: Arc<dyn TorrentCatalog>,
        daemon: Arc<dyn DownloadDaemon>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let downloads = DownloadController::new(
            daemon,
            settings.download_dir.clone(),
            settings.poll.clone(),
        );
        let transcodes = TranscodeCoordinator::new(transcoder, settings.video_dir.clone());
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                catalog,
                downloads,
                transcodes,
                claims: Claims::default(),
            }),
        }
    }

    /// Release daemon jobs of attempts a restart interrupted. Their files stay
    /// so a retry can resume them.
    pub async fn recover(&self) {
        for (id, job) in self.inner.store.take_interrupted() {
            info!(catalog_id = %id, %job, "releasing job of interrupted attempt");
            self.inner.downloads.remove_job(&id, &job, false).await;
        }
    }

    /// Snapshot of one movie
    pub fn snapshot(&self, id: &CatalogId) -> Option<Movie> {
        self.inner.store.get(id)
    }

    /// Snapshots of every movie
    pub fn list(&self) -> Vec<Movie> {
        self.inner.store.list()
    }

    /// Whether an acquisition attempt is running for the movie
    pub fn is_active(&self, id: &CatalogId) -> bool {
        self.inner.claims.contains(id)
    }

    /// Start acquiring a movie, or return the existing record when it is already
    /// being acquired, ready, or failed (failed records need `retry`).
    ///
    /// Only catalog failures and `NoTorrentForQuality` are returned as errors;
    /// everything else shows up in the returned record.
    pub async fn acquire(&self, request: AcquisitionRequest) -> Result<Movie, AcquisitionError> {
        let id = request.catalog_id;
        if let Some(movie) = self.inner.store.get(&id)
            && (movie.status != MovieStatus::Requested || self.is_active(&id))
        {
            debug!(catalog_id = %id, status = %movie.status, "acquisition already exists");
            return Ok(movie);
        }
        self.start(id, request.quality).await
    }

    /// Restart a failed acquisition from `requested`. A no-op for movies that
    /// have not failed.
    pub async fn retry(&self, request: AcquisitionRequest) -> Result<Movie, AcquisitionError> {
        let id = request.catalog_id.clone();
        match self.inner.store.update(&id, |m| m.retry()) {
            None => return self.acquire(request).await,
            Some(Err(e)) => {
                debug!(catalog_id = %id, error = %e, "retry ignored");
                return Ok(self.snapshot_or_new(&id));
            }
            Some(Ok(())) => {
                self.inner.transcodes.discard_output(&id).await;
                self.inner.store.persist_or_log().await;
            }
        }
        self.start(id, request.quality).await
    }

    /// Cancel whatever runs for the movie and delete its files. The record is
    /// dropped, or reset to an idle `requested` record while watch history still
    /// references it.
    pub async fn remove(&self, id: &CatalogId) -> Option<Movie> {
        let existing = self.inner.store.get(id)?;

        if let Some(token) = self.inner.claims.revoke(id) {
            token.cancel();
        }
        self.inner.transcodes.cancel(id);
        if self.inner.downloads.cancel(id, true).await.is_none()
            && let Some(job) = existing
                .download_job_id
                .clone()
                .or_else(|| self.inner.store.take_interrupted_job(id))
        {
            self.inner.downloads.remove_job(id, &job, true).await;
        }

        let download_dir = self.inner.downloads.output_dir(id);
        match tokio::fs::remove_dir_all(&download_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(catalog_id = %id, error = %e, "failed to remove download folder"),
        }
        self.inner.transcodes.discard_output(id).await;

        let result = if existing.is_referenced() {
            self.inner.store.update(id, |m| {
                m.reset();
                m.clone()
            })
        } else {
            self.inner.store.remove(id)
        };
        self.inner.store.persist_or_log().await;
        info!(catalog_id = %id, "movie removed");
        result
    }

    /// Playlist for `quality` (default: the selected one) when it can be served.
    /// The selected quality is served as soon as `can_stream` holds; others once
    /// fully transcoded.
    pub fn playback(&self, id: &CatalogId, quality: Option<Quality>) -> Option<Playback> {
        let movie = self.inner.store.get(id)?;
        let primary = movie.selected_quality?;
        let quality = quality.unwrap_or(primary);

        let streaming = quality == primary
            && movie.can_stream
            && matches!(
                movie.status,
                MovieStatus::Transcoding | MovieStatus::Ready
            );
        if !streaming && !movie.available_qualities.contains(&quality) {
            return None;
        }

        Some(Playback {
            quality,
            playlist: self
                .inner
                .transcodes
                .output_dir(id)
                .join(quality.label())
                .join(PLAYLIST),
        })
    }

    /// Stop every running acquisition without touching records or files
    pub fn shutdown(&self) {
        for token in self.inner.claims.revoke_all() {
            token.cancel();
        }
    }

    fn snapshot_or_new(&self, id: &CatalogId) -> Movie {
        self.inner
            .store
            .get(id)
            .unwrap_or_else(|| Movie::new(id.clone()))
    }

    async fn start(
        &self,
        id: CatalogId,
        quality: Option<Quality>,
    ) -> Result<Movie, AcquisitionError> {
        let inner = &self.inner;
        let wanted = quality.unwrap_or(inner.settings.default_quality);

        let options = inner
            .catalog
            .torrents(&id)
            .await
            .map_err(|e| AcquisitionError::Catalog(e.to_string()))?;
        let (selected, option) = select_torrent(&options, wanted)?;
        let magnet_url = option
            .torrent_url()
            .ok_or(AcquisitionError::NoTorrentForQuality(wanted))?;
        if selected != wanted {
            info!(catalog_id = %id, %wanted, %selected, "requested quality unavailable, falling back");
        }

        let (movie, created) = inner.store.get_or_create(&id);
        if created {
            inner.store.persist_or_log().await;
        }
        if movie.status != MovieStatus::Requested {
            return Ok(movie);
        }

        let Some((generation, cancel)) = inner.claims.try_claim(&id) else {
            debug!(catalog_id = %id, "acquisition start already in flight");
            return Ok(self.snapshot_or_new(&id));
        };
        // the record may have moved on while the claim was taken
        if self.snapshot_or_new(&id).status != MovieStatus::Requested {
            inner.claims.release(&id, generation);
            return Ok(self.snapshot_or_new(&id));
        }

        let job = match inner.downloads.start(&id, &magnet_url).await {
            Ok(job) => job,
            Err(e) => {
                inner.store.update(&id, |m| m.fail(e.to_string()));
                inner.claims.release(&id, generation);
                inner.store.persist_or_log().await;
                return Ok(self.snapshot_or_new(&id));
            }
        };

        let begun = inner
            .store
            .update(&id, |m| m.begin_download(job.clone(), magnet_url, selected));
        if !matches!(begun, Some(Ok(()))) || cancel.is_cancelled() {
            warn!(catalog_id = %id, "movie changed while the download started, releasing job");
            inner.downloads.cancel(&id, true).await;
            inner.claims.release(&id, generation);
            return Ok(self.snapshot_or_new(&id));
        }
        inner.store.persist_or_log().await;

        self.spawn_driver(id.clone(), job, selected, generation, cancel);
        Ok(self.snapshot_or_new(&id))
    }

    fn spawn_driver(
        &self,
        id: CatalogId,
        job: JobId,
        primary: Quality,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel::<DriverEvent>(EVENT_BUFFER);

        let observer = self.clone();
        let (observer_id, observer_job, observer_tx, observer_cancel) =
            (id.clone(), job.clone(), tx.clone(), cancel.clone());
        tokio::spawn(async move {
            observer
                .inner
                .downloads
                .observe(observer_id, observer_job, observer_tx, observer_cancel)
                .await;
        });

        let driver = Driver {
            pipeline: self.clone(),
            aggregator: ProgressAggregator::new(
                self.inner.settings.trigger.clone(),
                self.inner.settings.readiness.clone(),
            ),
            id,
            job,
            generation,
            cancel,
            tx,
            primary,
            source: None,
            pending: BTreeSet::new(),
            download_done: false,
        };
        tokio::spawn(driver.run(rx));
    }
}

enum Flow {
    Continue,
    Done,
}

/// Event loop of one acquisition attempt
struct Driver {
    pipeline: Pipeline,
    aggregator: ProgressAggregator,
    id: CatalogId,
    job: JobId,
    generation: u64,
    cancel: CancellationToken,
    tx: mpsc::Sender<DriverEvent>,
    primary: Quality,
    /// Daemon file index and size of the main video file, once resolved
    source: Option<(usize, u64)>,
    /// Qualities whose transcode has not ended yet
    pending: BTreeSet<Quality>,
    download_done: bool,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::Receiver<DriverEvent>) {
        debug!(catalog_id = %self.id, "driver started");
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(catalog_id = %self.id, "driver cancelled");
                    self.pipeline.inner.transcodes.release_cancelled(&self.id);
                    return;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            let flow = match event {
                DriverEvent::Download(e) => self.on_download(e).await,
                DriverEvent::Transcode(e) => self.on_transcode(e).await,
            };
            if let Flow::Done = flow {
                return;
            }
        }
    }

    fn store(&self) -> &MovieStore {
        &self.pipeline.inner.store
    }

    fn status(&self) -> Option<MovieStatus> {
        self.store().get(&self.id).map(|m| m.status)
    }

    async fn on_download(&mut self, event: DownloadEvent) -> Flow {
        match event {
            DownloadEvent::FileResolved { path, index, size } => {
                self.store().update(&self.id, |m| {
                    if m.download_path.is_none() {
                        m.download_path = Some(path);
                    }
                    m.total_size.get_or_insert(size);
                });
                self.source = Some((index, size));
                Flow::Continue
            }
            DownloadEvent::Progress(sample) => {
                let aggregator = &mut self.aggregator;
                let applied = self.pipeline.inner.store.update(&self.id, |m| {
                    aggregator.apply(m, &ProgressSample::Download(sample))
                });
                let Some(applied) = applied else {
                    return Flow::Done;
                };
                if applied.became_streamable {
                    info!(catalog_id = %self.id, "movie can stream");
                }
                if applied.trigger_transcode {
                    return self.begin_transcode().await;
                }
                Flow::Continue
            }
            DownloadEvent::Finished => {
                info!(catalog_id = %self.id, "download finished");
                self.download_done = true;
                match self.status() {
                    Some(MovieStatus::Downloading) => self.begin_transcode().await,
                    Some(MovieStatus::Ready) if self.pending.is_empty() => self.complete(),
                    _ => Flow::Continue,
                }
            }
            DownloadEvent::Failed(error) => {
                if self.status() == Some(MovieStatus::Ready) {
                    warn!(catalog_id = %self.id, %error, "download fault after ready, ignored");
                    self.download_done = true;
                    return if self.pending.is_empty() {
                        self.complete()
                    } else {
                        Flow::Continue
                    };
                }
                self.fail(error).await
            }
        }
    }

    async fn on_transcode(&mut self, event: TranscodeEvent) -> Flow {
        match event {
            TranscodeEvent::Progress(sample) => {
                let aggregator = &mut self.aggregator;
                let applied = self.pipeline.inner.store.update(&self.id, |m| {
                    aggregator.apply(m, &ProgressSample::Transcode(sample))
                });
                if applied.is_some_and(|a| a.became_streamable) {
                    info!(catalog_id = %self.id, "movie can stream");
                }
                Flow::Continue
            }
            TranscodeEvent::Finished { quality, playlist } => {
                self.pending.remove(&quality);
                if quality == self.primary {
                    let ready = self
                        .store()
                        .update(&self.id, |m| m.mark_ready(playlist));
                    if let Some(Err(e)) = ready {
                        warn!(catalog_id = %self.id, error = %e, "primary transcode finished out of state");
                    }
                } else {
                    self.store()
                        .update(&self.id, |m| m.add_available_quality(quality));
                }
                self.pipeline.inner.store.persist_or_log().await;

                if self.pending.is_empty() && self.download_done {
                    self.complete()
                } else {
                    Flow::Continue
                }
            }
            TranscodeEvent::Failed { quality, error } => {
                self.pending.remove(&quality);
                if quality == self.primary {
                    return self
                        .fail(AcquisitionError::TranscodeFailure {
                            quality,
                            reason: error.to_string(),
                        })
                        .await;
                }
                warn!(catalog_id = %self.id, %quality, %error, "extra quality failed, skipped");
                if self.pending.is_empty()
                    && self.download_done
                    && self.status() == Some(MovieStatus::Ready)
                {
                    self.complete()
                } else {
                    Flow::Continue
                }
            }
        }
    }

    async fn begin_transcode(&mut self) -> Flow {
        let Some((index, size)) = self.source else {
            debug!(catalog_id = %self.id, "transcode trigger reached before the video file is known");
            return Flow::Continue;
        };

        match self.store().update(&self.id, |m| m.begin_transcode()) {
            Some(Ok(())) => {}
            Some(Err(_)) => return Flow::Continue,
            None => return Flow::Done,
        }

        let inner = &self.pipeline.inner;
        let request = TranscodeRequest {
            source: Arc::new(inner.downloads.source(self.job.clone(), index)),
            source_size: size,
            primary: self.primary,
            extra: inner.settings.extra_qualities.clone(),
        };
        let started = inner
            .transcodes
            .start(&self.id, request, self.tx.clone(), &self.cancel)
            .await;

        match started {
            Ok(qualities) if qualities.is_empty() => {
                if self.cancel.is_cancelled() {
                    return Flow::Done;
                }
                self.fail(AcquisitionError::TranscodeStart(
                    "transcodes already running for this movie".to_string(),
                ))
                .await
            }
            Ok(qualities) => {
                self.pending.extend(qualities);
                self.pipeline.inner.store.persist_or_log().await;
                Flow::Continue
            }
            Err(e) => self.fail(e).await,
        }
    }

    /// Everything for this attempt ended well. The download job stays
    /// registered until the movie is removed.
    fn complete(&mut self) -> Flow {
        info!(catalog_id = %self.id, "acquisition complete");
        let inner = &self.pipeline.inner;
        inner.transcodes.release(&self.id);
        inner.claims.release(&self.id, self.generation);
        Flow::Done
    }

    /// Tear the attempt down and record the failure. The downloaded source is
    /// kept so a retry can resume it; transcoded output is not.
    async fn fail(&mut self, error: AcquisitionError) -> Flow {
        if self.cancel.is_cancelled() {
            return Flow::Done;
        }
        let inner = &self.pipeline.inner;
        self.cancel.cancel();
        inner.transcodes.cancel(&self.id);
        inner.downloads.cancel(&self.id, false).await;
        inner.transcodes.discard_output(&self.id).await;

        inner.claims.release(&self.id, self.generation);
        inner.store.update(&self.id, |m| m.fail(error.to_string()));
        inner.store.persist_or_log().await;
        Flow::Done
    }
}
