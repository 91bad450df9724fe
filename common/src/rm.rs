use anyhow::{Context, Result};
use async_recursion::async_recursion;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub files_removed: u64,
    pub directories_removed: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_removed: self.files_removed + other.files_removed,
            directories_removed: self.directories_removed + other.directories_removed,
        }
    }
}

/// Removes `path` recursively, directory entries in parallel. A missing path is not an error.
#[tracing::instrument]
#[async_recursion]
pub async fn rm(path: &std::path::Path) -> Result<Summary> {
    tracing::debug!("remove: {:?}", path);
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Summary::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading metadata from {:?}", &path));
        }
    };
    if !metadata.is_dir() {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed removing {:?}", &path))?;
        return Ok(Summary {
            files_removed: 1,
            ..Default::default()
        });
    }
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", path))?;
    let mut join_set = tokio::task::JoinSet::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &path))?
    {
        let entry_path = entry.path();
        let do_rm = || async move { rm(&entry_path).await };
        join_set.spawn(do_rm());
    }
    // ReadDir holds a file descriptor, release it before waiting on the children
    drop(entries);
    let mut summary = Summary::default();
    let mut errors = vec![];
    while let Some(res) = join_set.join_next().await {
        match res? {
            Ok(entry_summary) => summary = summary + entry_summary,
            Err(error) => errors.push(error),
        }
    }
    if !errors.is_empty() {
        tracing::debug!("remove: {:?} failed with: {:?}", path, &errors);
        return Err(anyhow::anyhow!("{:?}", &errors));
    }
    tokio::fs::remove_dir(path)
        .await
        .with_context(|| format!("failed removing directory {:?}", &path))?;
    tracing::debug!("remove: {:?} succeeded!", path);
    summary.directories_removed += 1;
    Ok(summary)
}
