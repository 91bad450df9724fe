use parking_lot::RwLock;
use serde::Serialize;

use crate::disk;
use crate::state::{self, CacheState};

/// Mutable part of a cache entry; written by the engine, read by everyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryStatus {
    pub state: CacheState,
    pub cache_size: u64,
    pub cache_files: u64,
    pub source_size: u64,
    pub source_files: u64,
}

/// One cached content item: a source tree and the local directory mirroring it.
#[derive(Debug)]
pub struct CacheEntry {
    pub id: String,
    pub source_dir: std::path::PathBuf,
    pub cache_dir: std::path::PathBuf,
    status: RwLock<EntryStatus>,
}

impl CacheEntry {
    pub fn new(
        id: impl Into<String>,
        source_dir: impl Into<std::path::PathBuf>,
        cache_dir: impl Into<std::path::PathBuf>,
        status: EntryStatus,
    ) -> Self {
        Self {
            id: id.into(),
            source_dir: source_dir.into(),
            cache_dir: cache_dir.into(),
            status: RwLock::new(status),
        }
    }

    /// Builds an entry from what is on disk: source totals, cache totals and the cache marker.
    pub async fn scan(
        id: impl Into<String>,
        source_dir: impl Into<std::path::PathBuf>,
        cache_dir: impl Into<std::path::PathBuf>,
    ) -> anyhow::Result<Self> {
        let source_dir = source_dir.into();
        let cache_dir = cache_dir.into();
        let source = disk::dir_size(&source_dir).await?;
        let cache = disk::dir_size(&cache_dir).await?;
        let state = state::read_marker(&cache_dir).await?;
        Ok(Self::new(
            id,
            source_dir,
            cache_dir,
            EntryStatus {
                state,
                cache_size: cache.bytes,
                cache_files: cache.files,
                source_size: source.bytes,
                source_files: source.files,
            },
        ))
    }

    pub fn status(&self) -> EntryStatus {
        *self.status.read()
    }

    pub fn state(&self) -> CacheState {
        self.status.read().state
    }

    pub fn set_state(&self, state: CacheState) {
        self.status.write().state = state;
    }

    pub fn cache_size(&self) -> u64 {
        self.status.read().cache_size
    }

    pub fn set_cache_usage(&self, usage: disk::Usage) {
        let mut status = self.status.write();
        status.cache_size = usage.bytes;
        status.cache_files = usage.files;
    }

    pub fn source_size(&self) -> u64 {
        self.status.read().source_size
    }

    pub fn source_files(&self) -> u64 {
        self.status.read().source_files
    }

    /// Bytes still missing from the cache, assuming everything present is useful.
    pub fn missing_bytes(&self) -> u64 {
        let status = self.status.read();
        status.source_size.saturating_sub(status.cache_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;

    #[tokio::test]
    async fn scan_reads_disk() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_source_tree().await?;
        let entry = CacheEntry::scan("game", tmp_dir.join("source"), tmp_dir.join("cache")).await?;
        let status = entry.status();
        assert_eq!(status.state, CacheState::Empty);
        assert_eq!(status.source_files, 3);
        assert_eq!(status.source_size, 5 + 10 + 20);
        assert_eq!(status.cache_size, 0);
        assert_eq!(entry.missing_bytes(), 35);
        entry.set_cache_usage(disk::Usage {
            bytes: 40,
            files: 4,
        });
        assert_eq!(entry.missing_bytes(), 0);
        Ok(())
    }
}
