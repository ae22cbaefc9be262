use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::movie::{CatalogId, TorrentOption};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("no releases known for {0}")]
    UnknownTitle(CatalogId),
    #[error("failed to read catalog: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse catalog: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Lookup of downloadable releases for a title. Backed by an external
/// metadata provider in production.
#[async_trait]
pub trait TorrentCatalog: Send + Sync {
    async fn torrents(&self, id: &CatalogId) -> Result<Vec<TorrentOption>, CatalogError>;
}

/// Fixed release lists, loaded from JSON: `{ "tt0000001": [ { "title": ..., ... } ] }`
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: HashMap<CatalogId, Vec<TorrentOption>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<CatalogId>, options: Vec<TorrentOption>) -> Self {
        self.entries.insert(id.into(), options);
        self
    }

    pub fn load_from(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path)?;
        let entries: HashMap<CatalogId, Vec<TorrentOption>> = serde_json::from_str(&contents)?;
        Ok(Self { entries })
    }
}

#[async_trait]
impl TorrentCatalog for StaticCatalog {
    async fn torrents(&self, id: &CatalogId) -> Result<Vec<TorrentOption>, CatalogError> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownTitle(id.clone()))
    }
}
