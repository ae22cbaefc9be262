use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hypertube::catalog::StaticCatalog;
use hypertube::config::{Config, ConfigError};
use hypertube::daemon::{DownloadDaemon, RqbitDaemon};
use hypertube::store::MovieStore;
use hypertube::transcode::FfmpegTranscoder;
use hypertube::{
    AcquisitionRequest, CatalogId, Movie, MovieStatus, Pipeline, PipelineSettings, Quality,
};

#[derive(Parser)]
#[command(name = "hypertube")]
#[command(about = "Download movies over BitTorrent and transcode them for streaming")]
struct Cli {
    /// Config file (default: the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire a movie and follow it until it is ready
    Acquire {
        catalog_id: String,
        quality: Option<Quality>,
        /// JSON file mapping catalog ids to torrent releases
        #[arg(long)]
        torrents: PathBuf,
        /// Restart a failed acquisition
        #[arg(long)]
        retry: bool,
    },
    /// Show every known movie
    List,
    /// Delete a movie's files and record
    Remove { catalog_id: String },
    /// Check daemon, ffmpeg and storage
    Doctor,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Doctor => {
            let results = hypertube::doctor::run_checks(&config).await;
            hypertube::doctor::print_results(&results);
            Ok(())
        }
        Command::List => list(&config),
        Command::Remove { catalog_id } => remove(&config, catalog_id).await,
        Command::Acquire {
            catalog_id,
            quality,
            torrents,
            retry,
        } => acquire(&config, catalog_id, quality, &torrents, retry).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let log_path = std::env::temp_dir().join("hypertube.log");

    if let Ok(file) = File::create(&log_path) {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,librqbit=warn")),
            )
            .with_target(false)
            .with_ansi(false)
            .with_writer(file)
            .init();
    } else {
        // fallback to stderr if the log file can't be created
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("warn,librqbit=off")),
            )
            .with_target(false)
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let loaded = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    match loaded {
        Err(ConfigError::NotFound(path)) => {
            warn!(path = %path.display(), "no config file, using defaults");
            Ok(Config::default())
        }
        other => other,
    }
}

async fn build_pipeline(
    config: &Config,
    catalog: StaticCatalog,
) -> Result<Pipeline, Box<dyn std::error::Error>> {
    let settings = PipelineSettings::from_config(config);

    let daemon: Arc<dyn DownloadDaemon> = match &config.daemon.url {
        Some(url) => Arc::new(RqbitDaemon::connect(url, config.daemon.request_timeout())?),
        None => Arc::new(
            RqbitDaemon::embedded(settings.download_dir.clone(), config.daemon.request_timeout())
                .await?,
        ),
    };
    let transcoder = Arc::new(FfmpegTranscoder::new(
        &config.transcode.ffmpeg,
        &config.transcode.preset,
        config.transcode.segment_secs,
        Duration::from_secs(config.pipeline.stall_timeout_secs),
    ));
    let store = MovieStore::open(config.storage.state_file())?;

    let pipeline = Pipeline::new(settings, store, Arc::new(catalog), daemon, transcoder);
    pipeline.recover().await;
    Ok(pipeline)
}

async fn acquire(
    config: &Config,
    catalog_id: String,
    quality: Option<Quality>,
    torrents: &Path,
    retry: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = StaticCatalog::load_from(torrents)?;
    let pipeline = build_pipeline(config, catalog).await?;
    let id = CatalogId::new(catalog_id);
    let request = AcquisitionRequest::new(id.clone(), quality);

    let movie = if retry {
        pipeline.retry(request).await?
    } else {
        pipeline.acquire(request).await?
    };
    print_movie(&movie);
    if movie.status == MovieStatus::Error {
        println!("Acquisition failed, rerun with --retry to start over");
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping acquisition");
                pipeline.shutdown();
                println!("\nStopped. Rerun with --retry to resume.");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let Some(movie) = pipeline.snapshot(&id) else {
            return Ok(());
        };
        print_movie(&movie);

        match movie.status {
            MovieStatus::Ready if !pipeline.is_active(&id) => {
                for quality in &movie.available_qualities {
                    if let Some(playback) = pipeline.playback(&id, Some(*quality)) {
                        println!("  {} -> {}", playback.quality, playback.playlist.display());
                    }
                }
                return Ok(());
            }
            MovieStatus::Error => return Ok(()),
            _ => {}
        }
    }
}

fn list(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = MovieStore::open(config.storage.state_file())?;
    if store.is_empty() {
        println!("No movies.");
    }
    for movie in store.list() {
        print_movie(&movie);
    }
    Ok(())
}

async fn remove(config: &Config, catalog_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = build_pipeline(config, StaticCatalog::new()).await?;
    match pipeline.remove(&CatalogId::new(catalog_id.clone())).await {
        Some(_) => println!("Removed {}", catalog_id),
        None => println!("{} is not known", catalog_id),
    }
    Ok(())
}

fn print_movie(movie: &Movie) {
    let quality = movie
        .selected_quality
        .map(|q| q.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{} [{}] {} download {:.1}% transcode {:.1}%",
        movie.catalog_id,
        quality,
        movie.status,
        movie.download_progress,
        movie.transcode_progress
    );
    if movie.can_stream {
        line.push_str(" (streamable)");
    }
    if let Some(error) = &movie.error_message {
        line.push_str(&format!(" error: {}", error));
    }
    println!("{}", line);
}
