//! Volume and directory-tree measurements
use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use async_recursion::async_recursion;

use crate::state;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub bytes: u64,
    pub files: u64,
}

impl std::ops::Add for Usage {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes: self.bytes + other.bytes,
            files: self.files + other.files,
        }
    }
}

/// Total size and number of regular files under `path`; marker files are not counted and a
/// missing path measures zero.
#[async_recursion]
pub async fn dir_size(path: &std::path::Path) -> Result<Usage> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Usage::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading metadata from {:?}", path));
        }
    };
    if metadata.is_file() {
        return Ok(Usage {
            bytes: metadata.len(),
            files: 1,
        });
    }
    if !metadata.is_dir() {
        return Ok(Usage::default());
    }
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", path))?;
    let mut usage = Usage::default();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", path))?
    {
        if state::is_marker_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        usage = usage + dir_size(&entry.path()).await?;
    }
    Ok(usage)
}

fn existing_ancestor(path: &std::path::Path) -> &std::path::Path {
    path.ancestors()
        .find(|candidate| candidate.exists())
        .unwrap_or(std::path::Path::new("/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub total: u64,
    pub available: u64,
}

impl VolumeStats {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.available)
    }
}

/// Capacity of the volume holding `path` (or its nearest existing ancestor).
#[allow(clippy::unnecessary_cast)] // statvfs field widths are platform dependent
pub fn volume_stats(path: &std::path::Path) -> Result<VolumeStats> {
    let existing = existing_ancestor(path);
    let stat = nix::sys::statvfs::statvfs(existing)
        .with_context(|| format!("failed reading volume statistics for {:?}", existing))?;
    let fragment = stat.fragment_size() as u64;
    Ok(VolumeStats {
        total: (stat.blocks() as u64).saturating_mul(fragment),
        available: (stat.blocks_available() as u64).saturating_mul(fragment),
    })
}

pub fn free_space(path: &std::path::Path) -> Result<u64> {
    Ok(volume_stats(path)?.available)
}

/// Identifies the storage device holding `path`, used to group transfer-rate samples.
pub fn device_key(path: &std::path::Path) -> u64 {
    std::fs::metadata(existing_ancestor(path))
        .map(|metadata| metadata.dev())
        .unwrap_or_default()
}
