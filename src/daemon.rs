use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use librqbit::api::Api;
use librqbit::http_api::{HttpApi, HttpApiOptions};
use librqbit::{Session, SessionOptions};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::movie::JobId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaemonError {
    #[error("daemon unreachable: {0}")]
    Unreachable(String),

    #[error("daemon rejected request: {0}")]
    Rejected(String),

    #[error("job {0} not found in daemon")]
    JobNotFound(JobId),

    #[error("invalid daemon response: {0}")]
    InvalidResponse(String),

    #[error("failed to create daemon session: {0}")]
    Session(String),
}

impl DaemonError {
    /// Worth retrying with the same request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaemonError::Unreachable(_) | DaemonError::InvalidResponse(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initializing,
    Live,
    Paused,
    Finished,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub downloaded_size: u64,
    /// Unknown until the torrent metadata arrived
    pub total_size: Option<u64>,
    /// Bytes per second
    pub download_rate: Option<u64>,
    /// Completed bytes per file, indexed like the daemon's file list
    pub file_progress: Vec<u64>,
    pub error: Option<String>,
}

/// A file inside a job, relative to the job's output folder
#[derive(Debug, Clone, PartialEq)]
pub struct JobFile {
    /// Position in the daemon's file list
    pub index: usize,
    pub relative_path: PathBuf,
    pub size: u64,
}

/// Sequential bytes of one file of a job. Reads wait until the next piece is
/// downloaded, so everything read is real file content.
pub type FileStream = Pin<Box<dyn AsyncRead + Send>>;

/// RPC surface of the download daemon. One instance is shared by every movie;
/// implementations must allow concurrent calls.
#[async_trait]
pub trait DownloadDaemon: Send + Sync {
    /// Add a magnet link (or .torrent URL) downloading into `output_dir`
    async fn add_by_magnet(&self, magnet_url: &str, output_dir: &Path)
    -> Result<JobId, DaemonError>;

    async fn status(&self, job: &JobId) -> Result<JobStatus, DaemonError>;

    /// Files of the job, `None` while metadata is still being fetched
    async fn files(&self, job: &JobId) -> Result<Option<Vec<JobFile>>, DaemonError>;

    /// Read file `file_index` of the job from its first byte
    async fn open_stream(&self, job: &JobId, file_index: usize) -> Result<FileStream, DaemonError>;

    async fn remove(&self, job: &JobId, delete_files: bool) -> Result<(), DaemonError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), DaemonError>;
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    files: Option<Vec<DetailsFile>>,
}

#[derive(Debug, Deserialize)]
struct DetailsFile {
    name: String,
    #[serde(default)]
    components: Vec<String>,
    length: u64,
    #[serde(default = "default_included")]
    included: bool,
}

fn default_included() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    progress_bytes: u64,
    #[serde(default)]
    total_bytes: u64,
    #[serde(default)]
    finished: bool,
    #[serde(default)]
    file_progress: Vec<u64>,
    #[serde(default)]
    live: Option<LiveStats>,
}

#[derive(Debug, Deserialize)]
struct LiveStats {
    #[serde(default)]
    download_speed: Option<Speed>,
}

#[derive(Debug, Deserialize)]
struct Speed {
    /// librqbit reports MiB/s under this name
    mbps: f64,
}

impl From<StatsResponse> for JobStatus {
    fn from(stats: StatsResponse) -> Self {
        let state = match stats.state.as_str() {
            _ if stats.finished => JobState::Finished,
            "live" => JobState::Live,
            "paused" => JobState::Paused,
            "error" => JobState::Error,
            _ => JobState::Initializing,
        };
        let download_rate = stats
            .live
            .and_then(|l| l.download_speed)
            .map(|s| (s.mbps * 1024.0 * 1024.0) as u64);

        JobStatus {
            state,
            downloaded_size: stats.progress_bytes,
            total_size: Some(stats.total_bytes).filter(|t| *t > 0),
            download_rate,
            file_progress: stats.file_progress,
            error: stats.error,
        }
    }
}

/// librqbit spoken to over its HTTP API, either a remote daemon or an
/// embedded session serving the API on loopback.
#[derive(Clone)]
pub struct RqbitDaemon {
    base_url: String,
    http_client: Client,
    request_timeout: Duration,
    _session: Option<Arc<Session>>,
}

impl RqbitDaemon {
    pub fn connect(base_url: &str, request_timeout: Duration) -> Result<Self, DaemonError> {
        let http_client = Client::builder()
            .build()
            .map_err(|e| DaemonError::Session(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            request_timeout,
            _session: None,
        })
    }

    /// Start an in-process librqbit session and serve its HTTP API on a free
    /// loopback port
    pub async fn embedded(
        download_dir: PathBuf,
        request_timeout: Duration,
    ) -> Result<Self, DaemonError> {
        tokio::fs::create_dir_all(&download_dir)
            .await
            .map_err(|e| DaemonError::Session(e.to_string()))?;

        debug!("creating librqbit session");
        let session_future = Session::new_with_opts(
            download_dir,
            SessionOptions {
                // DHT is needed for magnet resolution
                disable_dht: false,
                disable_dht_persistence: true,
                ..Default::default()
            },
        );

        let session = timeout(Duration::from_secs(30), session_future)
            .await
            .map_err(|_| DaemonError::Session("timeout creating session (30s)".to_string()))?
            .map_err(|e| DaemonError::Session(e.to_string()))?;

        let api = Api::new(session.clone(), None, None);

        // port 0 picks any free port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| DaemonError::Session(e.to_string()))?;
        let http_addr: SocketAddr = listener
            .local_addr()
            .map_err(|e| DaemonError::Session(e.to_string()))?;

        let http_api = HttpApi::new(
            api,
            Some(HttpApiOptions {
                read_only: false,
                ..Default::default()
            }),
        );

        tokio::spawn(async move {
            let _ = http_api.make_http_api_and_run(listener, None).await;
        });

        info!(%http_addr, "embedded daemon listening");

        let mut daemon = Self::connect(&format!("http://{}", http_addr), request_timeout)?;
        daemon._session = Some(session);
        Ok(daemon)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, DaemonError> {
        timeout(self.request_timeout, request.send())
            .await
            .map_err(|_| {
                DaemonError::Unreachable(format!(
                    "timeout after {}s",
                    self.request_timeout.as_secs()
                ))
            })?
            .map_err(|e| DaemonError::Unreachable(e.to_string()))
    }

    async fn check(&self, response: Response, job: Option<&JobId>) -> Result<Response, DaemonError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match (status, job) {
            (StatusCode::NOT_FOUND, Some(job)) => Err(DaemonError::JobNotFound(job.clone())),
            _ if status.is_server_error() => {
                Err(DaemonError::Unreachable(format!("HTTP {} - {}", status, body)))
            }
            _ => Err(DaemonError::Rejected(format!("HTTP {} - {}", status, body))),
        }
    }
}

#[async_trait]
impl DownloadDaemon for RqbitDaemon {
    async fn add_by_magnet(
        &self,
        magnet_url: &str,
        output_dir: &Path,
    ) -> Result<JobId, DaemonError> {
        debug!(magnet = %magnet_url.get(..60).unwrap_or(magnet_url), "adding torrent via HTTP API");

        let url = format!("{}/torrents", self.base_url);
        let output_folder = output_dir.to_string_lossy().to_string();
        let request = self
            .http_client
            .post(&url)
            // overwrite lets a retried attempt resume over existing files
            .query(&[("overwrite", "true"), ("output_folder", output_folder.as_str())])
            .body(magnet_url.to_string());

        let response = self.check(self.send(request).await?, None).await?;
        let body: AddResponse = response
            .json()
            .await
            .map_err(|e| DaemonError::InvalidResponse(e.to_string()))?;

        let id = body
            .id
            .ok_or_else(|| DaemonError::InvalidResponse("no id in response".to_string()))?;

        info!(id, "torrent added");
        Ok(JobId::new(id.to_string()))
    }

    async fn status(&self, job: &JobId) -> Result<JobStatus, DaemonError> {
        let url = format!("{}/torrents/{}/stats/v1", self.base_url, job);
        let response = self
            .check(self.send(self.http_client.get(&url)).await?, Some(job))
            .await?;

        let stats: StatsResponse = response
            .json()
            .await
            .map_err(|e| DaemonError::InvalidResponse(e.to_string()))?;
        Ok(stats.into())
    }

    async fn files(&self, job: &JobId) -> Result<Option<Vec<JobFile>>, DaemonError> {
        let url = format!("{}/torrents/{}", self.base_url, job);
        let response = self
            .check(self.send(self.http_client.get(&url)).await?, Some(job))
            .await?;

        let details: DetailsResponse = response
            .json()
            .await
            .map_err(|e| DaemonError::InvalidResponse(e.to_string()))?;

        Ok(details
            .files
            .filter(|files| !files.is_empty())
            .map(|files| {
                files
                    .into_iter()
                    .enumerate()
                    .filter(|(_, f)| f.included)
                    .map(|(index, f)| JobFile {
                        index,
                        relative_path: if f.components.is_empty() {
                            PathBuf::from(f.name)
                        } else {
                            f.components.iter().collect()
                        },
                        size: f.length,
                    })
                    .collect()
            }))
    }

    async fn open_stream(&self, job: &JobId, file_index: usize) -> Result<FileStream, DaemonError> {
        // the daemon prioritises the pieces a stream reader waits on
        let url = format!("{}/torrents/{}/stream/{}", self.base_url, job, file_index);
        let request = self.http_client.get(&url).header("Range", "bytes=0-");
        let response = self.check(self.send(request).await?, Some(job)).await?;
        debug!(%job, file_index, "file stream opened");

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }

    async fn remove(&self, job: &JobId, delete_files: bool) -> Result<(), DaemonError> {
        let action = if delete_files { "delete" } else { "forget" };
        let url = format!("{}/torrents/{}/{}", self.base_url, job, action);
        self.check(self.send(self.http_client.post(&url)).await?, Some(job))
            .await?;
        debug!(%job, action, "torrent removed");
        Ok(())
    }

    async fn ping(&self) -> Result<(), DaemonError> {
        let url = format!("{}/", self.base_url);
        self.check(self.send(self.http_client.get(&url)).await?, None)
            .await?;
        Ok(())
    }
}
