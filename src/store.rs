use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::movie::{CatalogId, JobId, Movie};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access store file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize store: {0}")]
    Serde(#[from] serde_json::Error),
}

/// On-disk layout, one entry per catalog id
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    movies: Vec<Movie>,
}

/// Movie records keyed by catalog id.
///
/// Each record has its own lock so movies never wait on each other; the map lock
/// is only held to look records up.
#[derive(Debug, Default)]
pub struct MovieStore {
    records: RwLock<HashMap<CatalogId, Arc<Mutex<Movie>>>>,
    path: Option<PathBuf>,
    write_lock: tokio::sync::Mutex<()>,
    /// Daemon jobs of attempts cut short by a restart, not yet released
    interrupted: Mutex<Vec<(CatalogId, JobId)>>,
}

impl MovieStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load records from `path` (missing file = empty store).
    ///
    /// Attempts that were downloading or transcoding when the process stopped
    /// have lost their driver; they come back as `error` so they can be
    /// retried. Their daemon jobs are kept aside for `take_interrupted`.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut movies = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str::<StoreFile>(&contents)?.movies
        } else {
            Vec::new()
        };

        let mut interrupted = Vec::new();
        for movie in &mut movies {
            if movie.status.is_active() {
                if let Some(job) = movie.download_job_id.clone() {
                    interrupted.push((movie.catalog_id.clone(), job));
                }
                movie.fail("acquisition interrupted by restart");
            }
        }
        debug!(count = movies.len(), path = %path.display(), "loaded movie store");

        let records = movies
            .into_iter()
            .map(|m| (m.catalog_id.clone(), Arc::new(Mutex::new(m))))
            .collect();
        Ok(Self {
            records: RwLock::new(records),
            path: Some(path),
            write_lock: tokio::sync::Mutex::new(()),
            interrupted: Mutex::new(interrupted),
        })
    }

    /// Jobs of interrupted attempts, each handed out once
    pub fn take_interrupted(&self) -> Vec<(CatalogId, JobId)> {
        std::mem::take(&mut *self.interrupted.lock())
    }

    /// The interrupted job of one movie, if it was not handed out yet
    pub fn take_interrupted_job(&self, id: &CatalogId) -> Option<JobId> {
        let mut interrupted = self.interrupted.lock();
        let pos = interrupted.iter().position(|(movie, _)| movie == id)?;
        Some(interrupted.remove(pos).1)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn record(&self, id: &CatalogId) -> Option<Arc<Mutex<Movie>>> {
        self.records.read().get(id).cloned()
    }

    /// Snapshot of one record
    pub fn get(&self, id: &CatalogId) -> Option<Movie> {
        self.record(id).map(|r| r.lock().clone())
    }

    /// Snapshots of every record, ordered by catalog id
    pub fn list(&self) -> Vec<Movie> {
        let records: Vec<_> = self.records.read().values().cloned().collect();
        let mut movies: Vec<Movie> = records.iter().map(|r| r.lock().clone()).collect();
        movies.sort_by(|a, b| a.catalog_id.cmp(&b.catalog_id));
        movies
    }

    /// Snapshot of the record, creating a `requested` one if absent.
    /// The flag tells whether it was created.
    pub fn get_or_create(&self, id: &CatalogId) -> (Movie, bool) {
        if let Some(record) = self.record(id) {
            return (record.lock().clone(), false);
        }
        let mut records = self.records.write();
        let mut created = false;
        let record = records
            .entry(id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(Movie::new(id.clone())))
            })
            .clone();
        drop(records);
        let movie = record.lock().clone();
        (movie, created)
    }

    /// Run `f` on the record under its lock
    pub fn update<R>(&self, id: &CatalogId, f: impl FnOnce(&mut Movie) -> R) -> Option<R> {
        let record = self.record(id)?;
        let mut movie = record.lock();
        Some(f(&mut movie))
    }

    /// Insert or replace a whole record
    pub fn insert(&self, movie: Movie) {
        let id = movie.catalog_id.clone();
        self.records.write().insert(id, Arc::new(Mutex::new(movie)));
    }

    pub fn remove(&self, id: &CatalogId) -> Option<Movie> {
        let record = self.records.write().remove(id)?;
        let movie = record.lock().clone();
        Some(movie)
    }

    /// Write every record to the store file, if there is one
    pub async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        // snapshot under the write lock so concurrent persists land in order
        let _guard = self.write_lock.lock().await;
        let contents = serde_json::to_string_pretty(&StoreFile {
            movies: self.list(),
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// `persist`, logging instead of failing
    pub async fn persist_or_log(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to persist movie store");
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movie::{JobId, MovieStatus, Quality};

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = MovieStore::in_memory();
        let id = CatalogId::from("tt0000001");
        let (movie, created) = store.get_or_create(&id);
        assert!(created);
        assert_eq!(movie.status, MovieStatus::Requested);

        let (_, created) = store.get_or_create(&id);
        assert!(!created);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_returns_none_for_unknown() {
        let store = MovieStore::in_memory();
        assert!(store.update(&"tt1".into(), |m| m.status).is_none());
    }

    #[tokio::test]
    async fn test_persist_and_reopen_recovers_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movies.json");
        let store = MovieStore::open(path.clone()).unwrap();

        let mut downloading = Movie::new("tt1".into());
        downloading
            .begin_download(JobId::new("3"), "magnet:?a".into(), Quality::P720)
            .unwrap();
        store.insert(downloading);

        let mut ready = Movie::new("tt2".into());
        ready.status = MovieStatus::Ready;
        ready.available_qualities.insert(Quality::P1080);
        store.insert(ready);

        store.insert(Movie::new("tt3".into()));
        store.persist().await.unwrap();
        drop(store);

        let reopened = MovieStore::open(path).unwrap();
        let tt1 = reopened.get(&"tt1".into()).unwrap();
        assert_eq!(tt1.status, MovieStatus::Error);
        assert_eq!(
            tt1.error_message.as_deref(),
            Some("acquisition interrupted by restart")
        );
        assert!(tt1.download_job_id.is_none());
        assert_eq!(
            reopened.take_interrupted(),
            vec![(CatalogId::from("tt1"), JobId::new("3"))]
        );
        assert!(reopened.take_interrupted().is_empty());

        let tt2 = reopened.get(&"tt2".into()).unwrap();
        assert_eq!(tt2.status, MovieStatus::Ready);
        assert!(tt2.available_qualities.contains(&Quality::P1080));

        assert_eq!(
            reopened.get(&"tt3".into()).unwrap().status,
            MovieStatus::Requested
        );
    }

    #[test]
    fn test_list_is_sorted() {
        let store = MovieStore::in_memory();
        store.insert(Movie::new("tt3".into()));
        store.insert(Movie::new("tt1".into()));
        let ids: Vec<_> = store
            .list()
            .into_iter()
            .map(|m| m.catalog_id.to_string())
            .collect();
        assert_eq!(ids, vec!["tt1", "tt3"]);
    }
}
